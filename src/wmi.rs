//! WMI operations over WS-Transfer and WS-Enumeration.
//!
//! Each transfer operation is a single envelope round trip; the
//! enumeration-shaped ones (all/select/associations/associated/wql) hand a
//! dialect filter to the enumeration engine. Class names go through
//! resource addressing, so callers can say `Win32_Service` and mean it.

use tracing::debug;

use crate::client::WinRm;
use crate::enumerate::Enumeration;
use crate::envelope::{self, OptionSet, Reference, SelectorSet, WmiObject, WmiValue};
use crate::error::{self, Error, Result};
use crate::resource::{self, NS_CIM, NS_TRANSFER, NS_XSI};
use crate::xml::{escape, Element};

const ACTION_GET: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Get";
const ACTION_PUT: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Put";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";

const DIALECT_WQL: &str = "http://schemas.microsoft.com/wbem/wsman/1/WQL";
const DIALECT_SELECTOR: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman/SelectorFilter";
const DIALECT_ASSOCIATION: &str =
    "http://schemas.dmtf.org/wbem/wsman/1/cimbinding/associationFilter";

impl WinRm {
    /// WS-Transfer Get: fetch the one instance addressed by the selectors.
    ///
    /// Fails with [`Error::ObjectNotFound`] if WMI reports no match.
    pub fn get(&self, cls: &str, selectors: &SelectorSet) -> Result<WmiObject> {
        debug!(%cls, ?selectors, "get");
        let uri = resource::resolve(cls)?;
        let response = self.act(&uri, ACTION_GET, "", selectors, &OptionSet::empty(), None)?;
        single_object_from_body(&uri, &response)
    }

    /// WS-Transfer Put: update an instance. Partial-update semantics are
    /// provider-defined; fields pass through unchanged.
    pub fn put(
        &self,
        cls: &str,
        selectors: &SelectorSet,
        new_properties: &WmiObject,
    ) -> Result<WmiObject> {
        debug!(%cls, ?selectors, ?new_properties, "put");
        let uri = resource::resolve(cls)?;
        let body = instance_xml(&uri, new_properties);
        let response = self.act(&uri, ACTION_PUT, &body, selectors, &OptionSet::empty(), None)?;
        single_object_from_body(&uri, &response)
    }

    /// WS-Transfer Create: create an instance and return its reference.
    ///
    /// An existing instance surfaces as [`Error::WmiError`] with code
    /// [`crate::error::wmi_status::ALREADY_EXISTS`].
    pub fn create(&self, cls: &str, properties: &WmiObject) -> Result<Reference> {
        debug!(%cls, ?properties, "create");
        let uri = resource::resolve(cls)?;
        let body = instance_xml(&uri, properties);
        let response = self.act(
            &uri,
            ACTION_CREATE,
            &body,
            &SelectorSet::new(),
            &OptionSet::empty(),
            None,
        )?;
        let created = response
            .child(NS_TRANSFER, "ResourceCreated")
            .ok_or_else(|| Error::protocol("no ResourceCreated in response"))?;
        let reference = envelope::parse_reference(created)?;
        if !reference.uri.eq_ignore_ascii_case(&uri) {
            return Err(Error::protocol("created URI is not the requested"));
        }
        Ok(reference)
    }

    /// WS-Transfer Delete: delete the instance addressed by the selectors.
    pub fn delete(&self, cls: &str, selectors: &SelectorSet) -> Result<()> {
        debug!(%cls, ?selectors, "delete");
        let uri = resource::resolve(cls)?;
        self.act(&uri, ACTION_DELETE, "", selectors, &OptionSet::empty(), None)?;
        Ok(())
    }

    /// Invoke a method of a WMI object.
    ///
    /// `params` may be empty if the method has no parameters; it is still
    /// passed explicitly, like a call with empty parentheses. Returns
    /// `None` when the method defines no output, which is a valid success
    /// outcome distinct from failure. A `ReturnValue` other than `0` or
    /// absent raises [`Error::InvokeFailed`].
    pub fn invoke(
        &self,
        cls: &str,
        selectors: &SelectorSet,
        method: &str,
        params: &WmiObject,
        timeout_sec: Option<f64>,
    ) -> Result<Option<WmiObject>> {
        debug!(%cls, %method, ?params, ?selectors, "invoke");
        let uri = resource::resolve(cls)?;
        let action = format!("{uri}/{method}");
        let fields: String = params
            .iter()
            .map(|(name, value)| envelope::property_xml("p", name, value))
            .collect();
        let body = format!(
            r#"<p:{method}_INPUT xmlns:p="{uri}" xmlns:cim="{NS_CIM}" xmlns:xsi="{NS_XSI}">{fields}</p:{method}_INPUT>"#,
            uri = escape(&uri),
        );
        let response = self.act(&uri, &action, &body, selectors, &OptionSet::empty(), timeout_sec)?;

        let (namespace, _) = resource::xml_bits(&uri);
        let output_tag = format!("{method}_OUTPUT");
        let output = response
            .children
            .iter()
            .find(|child| {
                child.name.eq_ignore_ascii_case(&output_tag)
                    && child.namespace.eq_ignore_ascii_case(&namespace)
            })
            .ok_or_else(|| Error::protocol(format!("cannot find {output_tag} in response")))?;

        // Some methods return no output. MSFT_NetFirewallRule.Disable is of
        // this kind, although, according to documentation, it returns uint32.
        if output.attr("nil") == Some("true")
            || (output.children.is_empty() && output.text.is_empty())
        {
            return Ok(None);
        }

        let method_output = envelope::format_object(&output.namespace, output)?;
        match method_output.get("ReturnValue") {
            None | Some(WmiValue::Null) => {}
            Some(WmiValue::Str(value)) if value == "0" => {}
            Some(WmiValue::Str(value)) => {
                let code = value.parse::<u32>().map_err(|_| {
                    Error::protocol(format!("non-numeric ReturnValue {value}"))
                })?;
                return Err(error::invoke_failed(
                    cls,
                    selectors,
                    method,
                    params,
                    code,
                    Some(&method_output),
                ));
            }
            Some(other) => {
                return Err(Error::protocol(format!("unexpected ReturnValue {other:?}")))
            }
        }
        Ok(Some(method_output))
    }

    /// Enumerate every instance of a class, unfiltered.
    pub fn all(&self, cls: &str) -> Result<Enumeration<'_>> {
        let uri = resource::resolve(cls)?;
        Ok(self.enumerate(uri, ""))
    }

    /// Enumerate instances matching a selector filter.
    pub fn select(&self, cls: &str, selectors: &SelectorSet) -> Result<Enumeration<'_>> {
        let uri = resource::resolve(cls)?;
        let filter = format!(
            r#"<w:Filter Dialect="{DIALECT_SELECTOR}">{}</w:Filter>"#,
            envelope::selector_set_xml(selectors)
        );
        Ok(self.enumerate(uri, filter))
    }

    /// Enumerate the association instances that relate to one object:
    /// the edges of the WMI relationship graph.
    pub fn associations(
        &self,
        cls: &str,
        selectors: &SelectorSet,
        association_cls_name: Option<&str>,
        source_role: Option<&str>,
    ) -> Result<Enumeration<'_>> {
        let uri = resource::resolve(cls)?;
        let object = Reference::new(uri.clone(), selectors.clone());
        let filter = format!(
            r#"<w:Filter Dialect="{DIALECT_ASSOCIATION}"><b:AssociationInstances><b:Object>{}</b:Object>{}{}</b:AssociationInstances></w:Filter>"#,
            envelope::endpoint_reference_xml(&object),
            optional_element("b:ResultClassName", association_cls_name),
            optional_element("b:Role", source_role),
        );
        Ok(self.enumerate(namespace_wildcard(&uri), filter))
    }

    /// Enumerate the instances associated with one object (e.g. walk
    /// disk → partition → volume).
    pub fn associated(
        &self,
        cls: &str,
        selectors: &SelectorSet,
        association_cls_name: Option<&str>,
        result_cls_name: Option<&str>,
        source_role: Option<&str>,
        destination_role: Option<&str>,
    ) -> Result<Enumeration<'_>> {
        let uri = resource::resolve(cls)?;
        let object = Reference::new(uri.clone(), selectors.clone());
        let filter = format!(
            r#"<w:Filter Dialect="{DIALECT_ASSOCIATION}"><b:AssociatedInstances><b:Object>{}</b:Object>{}{}{}{}</b:AssociatedInstances></w:Filter>"#,
            envelope::endpoint_reference_xml(&object),
            optional_element("b:AssociationClassName", association_cls_name),
            optional_element("b:ResultClassName", result_cls_name),
            optional_element("b:Role", source_role),
            optional_element("b:ResultRole", destination_role),
        );
        Ok(self.enumerate(namespace_wildcard(&uri), filter))
    }

    /// Enumerate with a WQL query filter.
    pub fn wql(&self, short_all_classes_uri: &str, query: &str) -> Result<Enumeration<'_>> {
        let all_classes_uri = resource::resolve(short_all_classes_uri)?;
        // DSP0227 1.0.0, 6.2: the WQL dialect addresses all classes of a
        // namespace.
        if !all_classes_uri.ends_with("/*") {
            return Err(Error::protocol(format!(
                "WQL resource URI must end with /*: {all_classes_uri}"
            )));
        }
        let filter = format!(
            r#"<w:Filter Dialect="{DIALECT_WQL}">{}</w:Filter>"#,
            escape(query)
        );
        Ok(self.enumerate(all_classes_uri, filter))
    }
}

/// Render an instance body: the class element carrying the resource URI as
/// its default namespace, children inheriting it.
fn instance_xml(uri: &str, properties: &WmiObject) -> String {
    let tag = class_name(uri);
    let fields: String = properties
        .iter()
        .map(|(name, value)| envelope::property_xml("", name, value))
        .collect();
    format!(r#"<{tag} xmlns="{}">{fields}</{tag}>"#, escape(uri))
}

fn class_name(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

/// `…/Namespace/Class` → `…/Namespace/*`, the URI association filters are
/// enumerated against.
fn namespace_wildcard(uri: &str) -> String {
    match uri.rsplit_once('/') {
        Some((directory, _)) => format!("{directory}/*"),
        None => format!("{uri}/*"),
    }
}

fn optional_element(tag: &str, value: Option<&str>) -> String {
    match value {
        Some(value) => format!("<{tag}>{}</{tag}>", escape(value)),
        None => format!("<{tag}/>"),
    }
}

/// Find the single object element in a Get/Put response body and decode
/// its fields against its own namespace.
fn single_object_from_body(uri: &str, body: &Element) -> Result<WmiObject> {
    let tag = class_name(uri);
    let element = body
        .children
        .iter()
        .find(|child| child.name.eq_ignore_ascii_case(tag))
        .ok_or_else(|| Error::protocol(format!("cannot find {tag} in response")))?;
    envelope::format_object(&element.namespace, element)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn instance_body_uses_the_default_namespace() {
        let uri = "http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/Win32_Environment";
        let properties = WmiObject::from([
            ("Name".to_owned(), "PATH".into()),
            ("SystemVariable".to_owned(), "TRUE".into()),
        ]);
        assert_eq!(
            instance_xml(uri, &properties),
            format!(
                r#"<Win32_Environment xmlns="{uri}"><Name>PATH</Name><SystemVariable>TRUE</SystemVariable></Win32_Environment>"#
            )
        );
    }

    #[test]
    fn namespace_wildcard_replaces_the_class_segment() {
        assert_eq!(
            namespace_wildcard("http://example.com/wmi/root/cimv2/Win32_DiskDrive"),
            "http://example.com/wmi/root/cimv2/*"
        );
    }

    #[test]
    fn absent_filter_fields_render_as_empty_elements() {
        assert_eq!(optional_element("b:Role", None), "<b:Role/>");
        assert_eq!(
            optional_element("b:Role", Some("Antecedent")),
            "<b:Role>Antecedent</b:Role>"
        );
    }
}

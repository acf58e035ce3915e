//! SOAP envelope codec: the typed data model of WS-Man addressing and the
//! build/parse halves of one request/response pair.
//!
//! Requests are rendered as `format!` templates with escaped
//! interpolations; responses are parsed into an element tree and decoded
//! through the narrow typed surface here, so list-vs-scalar and
//! nil-vs-empty questions are answered once, at this boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::resource::{self, NS_ADDRESSING, NS_CIM, NS_ENV, NS_WSMAN};
use crate::xml::{escape, Element};

/// The WS-Addressing anonymous role; WinRM requires it as the reply-to.
pub(crate) const ANONYMOUS_ADDRESS: &str =
    "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

/// Default `w:OperationTimeout` when the caller does not pass one.
pub(crate) const DEFAULT_OPERATION_TIMEOUT_SEC: f64 = 120.0;

/// Large enough for multi-megabyte enumerations and stream chunks.
const MAX_ENVELOPE_SIZE: usize = 64 * 1024 * 1024;

// ============================================================================
// Data model
// ============================================================================

/// The address of one remote object instance: a resource URI plus the
/// selector set that pins the instance down.
///
/// Two references are equal iff their URIs compare equal case-insensitively
/// and their selector maps are equal, recursively. Never persisted;
/// rebuilt per call.
#[derive(Debug, Clone)]
pub struct Reference {
    pub uri: String,
    pub selectors: SelectorSet,
}

impl Reference {
    pub fn new(uri: impl Into<String>, selectors: SelectorSet) -> Self {
        Reference {
            uri: uri.into(),
            selectors,
        }
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        self.uri.eq_ignore_ascii_case(&other.uri) && self.selectors == other.selectors
    }
}

impl Eq for Reference {}

/// One selector value: a string, a wildcard/absent marker, or the address
/// of another object (a selector may be keyed by a whole reference).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorValue {
    Str(String),
    Null,
    Ref(Reference),
}

impl From<&str> for SelectorValue {
    fn from(value: &str) -> Self {
        SelectorValue::Str(value.to_owned())
    }
}

impl From<String> for SelectorValue {
    fn from(value: String) -> Self {
        SelectorValue::Str(value)
    }
}

impl From<Reference> for SelectorValue {
    fn from(value: Reference) -> Self {
        SelectorValue::Ref(value)
    }
}

/// The key/value address of one CIM instance.
pub type SelectorSet = BTreeMap<String, SelectorValue>;

/// Value of one CIM property or method parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum WmiValue {
    Str(String),
    Null,
    DateTime(DateTime<Utc>),
    Ref(Reference),
}

impl From<&str> for WmiValue {
    fn from(value: &str) -> Self {
        WmiValue::Str(value.to_owned())
    }
}

impl From<String> for WmiValue {
    fn from(value: String) -> Self {
        WmiValue::Str(value)
    }
}

impl From<DateTime<Utc>> for WmiValue {
    fn from(value: DateTime<Utc>) -> Self {
        WmiValue::DateTime(value)
    }
}

/// The decoded fields of one instance or method output.
pub type WmiObject = BTreeMap<String, WmiValue>;

/// Ordered name → value list attached to a request header.
/// Immutable once constructed; rarely non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionSet {
    entries: Vec<(String, String)>,
}

impl OptionSet {
    pub fn empty() -> Self {
        OptionSet::default()
    }

    pub fn from_pairs<N, V>(pairs: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        OptionSet {
            entries: pairs
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Building
// ============================================================================

/// A rendered request envelope and the message id baked into it.
pub(crate) struct Envelope {
    pub message_id: String,
    pub xml: String,
}

/// Construct a request envelope for one WS-Man action.
pub(crate) fn build(
    resource_uri: &str,
    action: &str,
    body: &str,
    selectors: &SelectorSet,
    options: &OptionSet,
    timeout_sec: Option<f64>,
) -> Envelope {
    let message_id = format!("uuid:{}", Uuid::new_v4());
    let timeout = timeout_sec.unwrap_or(DEFAULT_OPERATION_TIMEOUT_SEC);
    let xmlns: String = resource::NAMESPACE_ALIASES
        .iter()
        .map(|(uri, alias)| format!(" xmlns:{alias}=\"{uri}\""))
        .collect();
    let option_set = if options.is_empty() {
        String::new()
    } else {
        option_set_xml(options)
    };
    let selector_set = if selectors.is_empty() {
        String::new()
    } else {
        selector_set_xml(selectors)
    };

    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<env:Envelope{xmlns}>
  <env:Header>
    <a:To>http://windows-host:5985/wsman</a:To>
    <a:ReplyTo>
      <a:Address>{ANONYMOUS_ADDRESS}</a:Address>
    </a:ReplyTo>
    <a:MessageID>{message_id}</a:MessageID>
    <w:ResourceURI env:mustUnderstand="true">{resource_uri}</w:ResourceURI>
    <a:Action env:mustUnderstand="true">{action}</a:Action>
    <w:MaxEnvelopeSize env:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>PT{timeout:06.3}S</w:OperationTimeout>
    <w:Locale env:mustUnderstand="false" xml:lang="en-US"/>
    <p:DataLocale env:mustUnderstand="false" xml:lang="en-US"/>
    {option_set}
    {selector_set}
  </env:Header>
  <env:Body>{body}</env:Body>
</env:Envelope>"#,
        resource_uri = escape(resource_uri),
        action = escape(action),
    );

    Envelope { message_id, xml }
}

/// Render a selector map as a `w:SelectorSet` element.
pub(crate) fn selector_set_xml(selectors: &SelectorSet) -> String {
    let entries: String = selectors
        .iter()
        .map(|(name, value)| match value {
            SelectorValue::Str(text) => format!(
                r#"<w:Selector Name="{}">{}</w:Selector>"#,
                escape(name),
                escape(text)
            ),
            SelectorValue::Null => format!(r#"<w:Selector Name="{}"/>"#, escape(name)),
            SelectorValue::Ref(reference) => format!(
                r#"<w:Selector Name="{}"><a:EndpointReference>{}</a:EndpointReference></w:Selector>"#,
                escape(name),
                endpoint_reference_xml(reference)
            ),
        })
        .collect();
    format!("<w:SelectorSet>{entries}</w:SelectorSet>")
}

/// Render the inner content of an endpoint reference (address plus
/// reference parameters), reused by selectors and association filters.
pub(crate) fn endpoint_reference_xml(reference: &Reference) -> String {
    format!(
        "<a:Address>{ANONYMOUS_ADDRESS}</a:Address>\
         <a:ReferenceParameters><w:ResourceURI>{}</w:ResourceURI>{}</a:ReferenceParameters>",
        escape(&reference.uri),
        selector_set_xml(&reference.selectors)
    )
}

fn option_set_xml(options: &OptionSet) -> String {
    let entries: String = options
        .entries
        .iter()
        .map(|(name, value)| {
            format!(
                r#"<w:Option Name="{}">{}</w:Option>"#,
                escape(name),
                escape(value)
            )
        })
        .collect();
    format!("<w:OptionSet>{entries}</w:OptionSet>")
}

/// Render one property or method parameter element.
pub(crate) fn property_xml(prefix: &str, name: &str, value: &WmiValue) -> String {
    let tag = if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}:{name}")
    };
    match value {
        WmiValue::Null => format!(r#"<{tag} xsi:nil="true"/>"#),
        WmiValue::Str(text) if text.is_empty() => format!("<{tag}/>"),
        WmiValue::Str(text) => format!("<{tag}>{}</{tag}>", escape(text)),
        WmiValue::DateTime(datetime) => format!(
            "<{tag}><cim:Datetime>{}</cim:Datetime></{tag}>",
            datetime.format("%Y-%m-%dT%H:%M:%S%.6fZ")
        ),
        WmiValue::Ref(reference) => {
            format!("<{tag}>{}</{tag}>", endpoint_reference_xml(reference))
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse a response envelope, assert that it relates to the request, and
/// return its body element.
pub(crate) fn parse_body(message_id: &str, content: &str) -> Result<Element> {
    let envelope = Element::parse(content)?;
    let header = envelope
        .child(NS_ENV, "Header")
        .ok_or_else(|| Error::protocol("response has no Header"))?;
    let relates_to = header
        .child(NS_ADDRESSING, "RelatesTo")
        .ok_or_else(|| Error::protocol("response has no RelatesTo"))?;
    if relates_to.text != message_id {
        return Err(Error::protocol(format!(
            "unexpected RelatesTo {}: for MessageID {}",
            relates_to.text, message_id
        )));
    }
    envelope
        .child(NS_ENV, "Body")
        .cloned()
        .ok_or_else(|| Error::protocol("response has no Body"))
}

/// Parse an endpoint-reference-shaped element into a [`Reference`].
pub(crate) fn parse_reference(element: &Element) -> Result<Reference> {
    let parameters = element
        .child(NS_ADDRESSING, "ReferenceParameters")
        .ok_or_else(|| Error::protocol("endpoint reference has no ReferenceParameters"))?;
    let uri = parameters
        .child(NS_WSMAN, "ResourceURI")
        .ok_or_else(|| Error::protocol("endpoint reference has no ResourceURI"))?
        .text
        .clone();
    // SelectorSet isn't always present, e.g. with Win32_OperatingSystem.
    let selectors = match parameters.child(NS_WSMAN, "SelectorSet") {
        Some(set) => parse_selector_set(set)?,
        None => SelectorSet::new(),
    };
    Ok(Reference { uri, selectors })
}

/// Parse a `w:SelectorSet` element back into a selector map.
pub(crate) fn parse_selector_set(element: &Element) -> Result<SelectorSet> {
    let mut selectors = SelectorSet::new();
    for selector in element.children_named(NS_WSMAN, "Selector") {
        let name = selector
            .attr("Name")
            .ok_or_else(|| Error::protocol("selector without a Name"))?;
        let value = if let Some(epr) = selector.child(NS_ADDRESSING, "EndpointReference") {
            SelectorValue::Ref(parse_reference(epr)?)
        } else if !selector.text.is_empty() {
            SelectorValue::Str(selector.text.clone())
        } else if selector.children.is_empty() {
            SelectorValue::Null
        } else {
            return Err(Error::protocol(format!(
                "cannot understand selector {name}"
            )));
        };
        selectors.insert(name.to_owned(), value);
    }
    Ok(selectors)
}

/// Decode one property element into a typed value.
pub(crate) fn parse_value(element: &Element) -> Result<WmiValue> {
    if element.attr("nil") == Some("true") {
        return Ok(WmiValue::Null);
    }
    if let Some(datetime) = element.child(NS_CIM, "Datetime") {
        return parse_cim_datetime(&datetime.text).map(WmiValue::DateTime);
    }
    if element.child(NS_ADDRESSING, "ReferenceParameters").is_some() {
        return parse_reference(element).map(WmiValue::Ref);
    }
    Ok(WmiValue::Str(element.text.clone()))
}

fn parse_cim_datetime(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|datetime| datetime.with_timezone(&Utc))
        .map_err(|e| Error::protocol(format!("cannot parse datetime {raw}: {e}")))
}

/// Decode the fields of one instance or method output. Every field must
/// live in the response's own namespace; attributes like `@xsi:type` were
/// already stripped at parse time.
pub(crate) fn format_object(namespace: &str, element: &Element) -> Result<WmiObject> {
    let mut object = WmiObject::new();
    for child in &element.children {
        if !child.namespace.eq_ignore_ascii_case(namespace) {
            return Err(Error::protocol(format!(
                "field {} in unexpected namespace {} (expected {})",
                child.name, child.namespace, namespace
            )));
        }
        object.insert(child.name.clone(), parse_value(child)?);
    }
    Ok(object)
}

//! The Enumerate/Pull session state machine.
//!
//! Objects are yielded as pulled, not buffered up front. Each call to
//! [`WinRm::enumerate`] creates a new session; at most one Pull is
//! outstanding per session. An empty first page is NOT end-of-sequence —
//! only the explicit marker ends the loop (the Enumerate response may
//! legally carry zero items even when more exist).

use std::collections::VecDeque;

use tracing::debug;

use crate::client::WinRm;
use crate::envelope::{self, OptionSet, Reference, SelectorSet, WmiObject};
use crate::error::{Error, Result};
use crate::resource::{self, NS_ADDRESSING, NS_ENUM, NS_WSMAN};
use crate::xml::{escape, Element};

const ACTION_ENUMERATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Enumerate";
const ACTION_PULL: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Pull";

/// Page size cap sent with Enumerate and Pull.
pub const DEFAULT_MAX_ELEMENTS: u32 = 32_000;

impl WinRm {
    /// Lazily enumerate instances addressed by `resource_uri`.
    ///
    /// `filter_xml` is a pre-rendered `w:Filter` fragment (or empty for an
    /// unfiltered enumeration); the WMI facade builds the WQL, selector,
    /// and association dialects. The enumeration mode is
    /// `EnumerateObjectAndEPR`, so every item carries both its fields and
    /// its addressable reference and methods can be invoked on the result.
    /// See: paragraph 8.7 in
    /// https://www.dmtf.org/sites/default/files/standards/documents/DSP0226_1.0.0.pdf
    pub fn enumerate(
        &self,
        resource_uri: impl Into<String>,
        filter_xml: impl Into<String>,
    ) -> Enumeration<'_> {
        Enumeration {
            client: self,
            resource_uri: resource_uri.into(),
            filter_xml: filter_xml.into(),
            max_elements: DEFAULT_MAX_ELEMENTS,
            context: None,
            started: false,
            ended: false,
            failed: false,
            buffer: VecDeque::new(),
        }
    }
}

/// One enumeration session: a finite, lazy sequence of
/// `(Reference, WmiObject)` pairs.
pub struct Enumeration<'a> {
    client: &'a WinRm,
    resource_uri: String,
    filter_xml: String,
    max_elements: u32,
    context: Option<String>,
    started: bool,
    ended: bool,
    failed: bool,
    buffer: VecDeque<(Reference, WmiObject)>,
}

impl Enumeration<'_> {
    /// Cap the number of items requested per page. Must be called before
    /// the first item is pulled.
    pub fn max_elements(mut self, max_elements: u32) -> Self {
        self.max_elements = max_elements;
        self
    }

    fn start(&mut self) -> Result<()> {
        debug!(uri = %self.resource_uri, filter = %self.filter_xml, "start enumerating");
        self.started = true;
        let body = format!(
            "<n:Enumerate>\
               <w:OptimizeEnumeration/>\
               <w:MaxElements>{}</w:MaxElements>\
               <w:EnumerationMode>EnumerateObjectAndEPR</w:EnumerationMode>\
               {}\
             </n:Enumerate>",
            self.max_elements, self.filter_xml
        );
        let response = self.client.act(
            &self.resource_uri,
            ACTION_ENUMERATE,
            &body,
            &SelectorSet::new(),
            &OptionSet::empty(),
            None,
        )?;
        let enumerate_response = response
            .child(NS_ENUM, "EnumerateResponse")
            .ok_or_else(|| Error::protocol("no EnumerateResponse in response"))?;

        self.ended = enumerate_response.child(NS_WSMAN, "EndOfSequence").is_some();
        self.context = enumerate_response
            .child(NS_ENUM, "EnumerationContext")
            .map(|e| e.text.clone());
        if !self.ended && self.context.is_none() {
            return Err(Error::protocol("Enumerate response carries no context"));
        }

        // The Enumerate response may or may not contain Items. See:
        // https://docs.microsoft.com/en-us/openspecs/windows_protocols/ms-wsmv/b79bcdd9-125c-49e0-8a4f-bac4ce878592
        if let Some(items) = enumerate_response.child(NS_WSMAN, "Items") {
            self.buffer_items(items)?;
        }
        Ok(())
    }

    fn pull(&mut self) -> Result<()> {
        debug!(uri = %self.resource_uri, "continue enumerating");
        let context = self
            .context
            .clone()
            .ok_or_else(|| Error::protocol("pull without an enumeration context"))?;
        let body = format!(
            "<n:Pull>\
               <n:EnumerationContext>{}</n:EnumerationContext>\
               <n:MaxElements>{}</n:MaxElements>\
             </n:Pull>",
            escape(&context),
            self.max_elements
        );
        let response = self.client.act(
            &self.resource_uri,
            ACTION_PULL,
            &body,
            &SelectorSet::new(),
            &OptionSet::empty(),
            None,
        )?;
        let pull_response = response
            .child(NS_ENUM, "PullResponse")
            .ok_or_else(|| Error::protocol("no PullResponse in response"))?;

        self.ended = pull_response.child(NS_ENUM, "EndOfSequence").is_some();
        if self.ended {
            self.context = None;
        } else {
            self.context = Some(
                pull_response
                    .child(NS_ENUM, "EnumerationContext")
                    .ok_or_else(|| Error::protocol("Pull response carries no context"))?
                    .text
                    .clone(),
            );
        }

        if let Some(items) = pull_response.child(NS_ENUM, "Items") {
            self.buffer_items(items)?;
        }
        Ok(())
    }

    fn buffer_items(&mut self, items: &Element) -> Result<()> {
        for item in items.children_named(NS_WSMAN, "Item") {
            self.buffer.push_back(unpack_item(item)?);
        }
        Ok(())
    }
}

/// Split one `w:Item` into its endpoint reference and its decoded fields.
/// The data element is located by the reference URI: it may be named by
/// the base class rather than by the enumerated one.
fn unpack_item(item: &Element) -> Result<(Reference, WmiObject)> {
    let epr = item
        .child(NS_ADDRESSING, "EndpointReference")
        .ok_or_else(|| Error::protocol("enumeration item without EndpointReference"))?;
    let reference = envelope::parse_reference(epr)?;
    let (namespace, tag) = resource::xml_bits(&reference.uri);
    let data = item
        .children
        .iter()
        .find(|child| {
            child.name.eq_ignore_ascii_case(&tag)
                && child.namespace.eq_ignore_ascii_case(&namespace)
        })
        .ok_or_else(|| Error::protocol(format!("cannot find {tag} in enumeration item")))?;
    let object = envelope::format_object(&data.namespace, data)?;
    Ok((reference, object))
}

impl Iterator for Enumeration<'_> {
    type Item = Result<(Reference, WmiObject)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.buffer.pop_front() {
                return Some(Ok(pair));
            }
            if self.failed || (self.started && self.ended) {
                return None;
            }
            let step = if self.started { self.pull() } else { self.start() };
            if let Err(error) = step {
                self.failed = true;
                return Some(Err(error));
            }
        }
    }
}

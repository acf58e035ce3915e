//! Namespace-resolving XML element tree for SOAP responses.
//!
//! Requests are rendered with `format!` templates; only responses are
//! parsed. Prefixes are resolved to namespace URIs at parse time, so every
//! lookup is by (namespace URI, local name) and is immune to whatever
//! prefixes the server happened to pick. Namespace comparison is
//! case-insensitive: servers echo resource URIs back in inconsistent
//! letter case.

use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;

use crate::error::{Error, Result};

/// One parsed XML element: resolved namespace, local name, attributes
/// (prefix-stripped), concatenated text, and child elements.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Element {
    pub name: String,
    pub namespace: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    /// Parse a full document and return its root element.
    pub fn parse(text: &str) -> Result<Element> {
        let mut reader = NsReader::from_str(text);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let (resolve, event) = reader
                .read_resolved_event()
                .map_err(|e| Error::protocol(format!("can't decode WinRM message: {e}")))?;
            match event {
                Event::Start(start) => {
                    let element = element_from_start(&resolve, &start)?;
                    stack.push(element);
                }
                Event::Empty(start) => {
                    let element = element_from_start(&resolve, &start)?;
                    attach(&mut stack, &mut root, element);
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| Error::protocol("unbalanced closing tag"))?;
                    attach(&mut stack, &mut root, element);
                }
                Event::Text(text) => {
                    if let Some(open) = stack.last_mut() {
                        let chunk = text
                            .unescape()
                            .map_err(|e| Error::protocol(format!("bad text content: {e}")))?;
                        // Indentation between child elements is not content.
                        if !chunk.trim().is_empty() {
                            open.text.push_str(&chunk);
                        }
                    }
                }
                Event::CData(data) => {
                    if let Some(open) = stack.last_mut() {
                        open.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        root.ok_or_else(|| Error::protocol("empty XML document"))
    }

    /// Attribute value by (prefix-stripped) name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First direct child matching namespace and local name.
    pub fn child(&self, namespace: &str, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.matches(namespace, name))
    }

    /// All direct children matching namespace and local name.
    pub fn children_named<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.matches(namespace, name))
    }

    /// Descend through a chain of (namespace, name) child steps.
    pub fn find(&self, path: &[(&str, &str)]) -> Option<&Element> {
        let mut current = self;
        for &(namespace, name) in path {
            current = current.child(namespace, name)?;
        }
        Some(current)
    }

    /// Concatenated text of this element and all its descendants,
    /// in document order within each level.
    pub fn deep_text(&self) -> String {
        let mut out = self.text.clone();
        for child in &self.children {
            out.push_str(&child.deep_text());
        }
        out
    }

    fn matches(&self, namespace: &str, name: &str) -> bool {
        self.name == name && self.namespace.eq_ignore_ascii_case(namespace)
    }
}

fn element_from_start(
    resolve: &ResolveResult,
    start: &quick_xml::events::BytesStart<'_>,
) -> Result<Element> {
    let namespace = match resolve {
        ResolveResult::Bound(ns) => String::from_utf8_lossy(ns.0).into_owned(),
        _ => String::new(),
    };
    let name = String::from_utf8_lossy(start.local_name().into_inner()).into_owned();

    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute =
            attribute.map_err(|e| Error::protocol(format!("bad attribute: {e}")))?;
        if attribute.key.as_ref().starts_with(b"xmlns") {
            continue;
        }
        let key = String::from_utf8_lossy(attribute.key.local_name().into_inner()).into_owned();
        let value = attribute
            .unescape_value()
            .map_err(|e| Error::protocol(format!("bad attribute value: {e}")))?
            .into_owned();
        attributes.push((key, value));
    }

    Ok(Element {
        name,
        namespace,
        attributes,
        text: String::new(),
        children: Vec::new(),
    })
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(element);
    } else if root.is_none() {
        *root = Some(element);
    }
}

/// Escape special characters for XML text and attribute content.
pub(crate) fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

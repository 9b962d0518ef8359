//! Minimal XML element tree for vim25 SOAP payloads.
//!
//! vim25 responses are element-only documents (no mixed content), so an
//! element here carries its local name, raw attributes, concatenated text and
//! child elements. The tree can be written back out, which is how the opaque
//! import spec travels from `CreateImportSpec` into `ImportVApp`.

use std::str;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{ImportError, ImportResult};

/// One XML element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    /// Local name, namespace prefix stripped
    pub name: String,
    /// Attributes as written, e.g. `("xsi:type", "VirtualMachineImportSpec")`
    pub attrs: Vec<(String, String)>,
    /// Text content
    pub text: String,
    /// Child elements in document order
    pub children: Vec<Element>,
}

impl Element {
    /// Create an empty element with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a document and return its root element.
    pub fn parse(xml: &str) -> ImportResult<Element> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        loop {
            match reader.read_event()? {
                Event::Start(ref e) => stack.push(start_element(e)?),
                Event::Empty(ref e) => {
                    let elem = start_element(e)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(elem),
                        None => return Ok(elem),
                    }
                }
                Event::Text(t) => {
                    if let Some(cur) = stack.last_mut() {
                        cur.text.push_str(&t.unescape()?);
                    }
                }
                Event::CData(c) => {
                    if let Some(cur) = stack.last_mut() {
                        let raw = c.into_inner();
                        let s = str::from_utf8(&raw)
                            .map_err(|_| ImportError::Protocol("invalid UTF-8 in CDATA".into()))?;
                        cur.text.push_str(s);
                    }
                }
                Event::End(_) => {
                    let Some(done) = stack.pop() else {
                        return Err(ImportError::Protocol("unbalanced closing tag".into()));
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => return Ok(done),
                    }
                }
                Event::Eof => {
                    return Err(ImportError::Protocol(
                        "unexpected end of XML document".into(),
                    ))
                }
                _ => {}
            }
        }
    }

    /// First child with the given local name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given local name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Text of the first child with the given local name.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// Follow a path of child names.
    pub fn path(&self, names: &[&str]) -> Option<&Element> {
        names.iter().try_fold(self, |cur, n| cur.child(n))
    }

    /// Depth-first search for the first descendant (or self) with this name.
    pub fn find(&self, name: &str) -> Option<&Element> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Attribute value by its written key.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The `xsi:type` of this element, if any.
    pub fn xsi_type(&self) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.ends_with(":type"))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize this element, renaming it to `name` and prepending `attrs`.
    pub fn write_as(&self, name: &str, extra_attrs: &[(&str, &str)], out: &mut String) {
        out.push('<');
        out.push_str(name);
        for (k, v) in extra_attrs {
            push_attr(out, k, v);
        }
        for (k, v) in &self.attrs {
            if extra_attrs.iter().any(|(ek, _)| ek == k) {
                continue;
            }
            push_attr(out, k, v);
        }
        if self.text.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(self.text.as_str()));
        for c in &self.children {
            c.write_as(&c.name, &[], out);
        }
        out.push_str("</");
        out.push_str(name);
        out.push('>');
    }

    /// Serialize this element as-is.
    #[cfg(test)]
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_as(&self.name, &[], &mut out);
        out
    }
}

fn push_attr(out: &mut String, k: &str, v: &str) {
    out.push(' ');
    out.push_str(k);
    out.push_str("=\"");
    out.push_str(&escape(v));
    out.push('"');
}

fn start_element(e: &BytesStart) -> ImportResult<Element> {
    let name = str::from_utf8(e.local_name().as_ref())
        .map_err(|_| ImportError::Protocol("invalid UTF-8 in tag name".into()))?
        .to_string();
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = str::from_utf8(attr.key.as_ref())
            .map_err(|_| ImportError::Protocol("invalid UTF-8 in attribute name".into()))?;
        // Namespace declarations are re-established by the outgoing envelope
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let value = attr.unescape_value()?;
        attrs.push((key.to_string(), value.into_owned()));
    }
    Ok(Element {
        attrs,
        ..Element::new(name)
    })
}

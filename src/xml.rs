//! Owned XML trees.
//!
//! Message bodies, datastore contents and NACM rule trees are all XML documents.
//! This module parses them into an owned [`XmlNode`] tree that the rest of the
//! crate queries with slash-separated paths (for example `groups/group`),
//! serializes back to text and builds programmatically.
//!
//! # Document Root
//!
//! [`XmlNode::parse`] always returns a synthetic root with an empty name whose
//! children are the top-level elements of the document. An empty document is
//! a root without children, so `parse("")` is valid.
//!
//! # Names
//!
//! Element and attribute names are stored as written (including any namespace
//! prefix). Path queries compare the local part only, so `<nacm:rule>` is found
//! by the path `rule`.
use std::{borrow::Cow, fmt};

use quick_xml::{
    Reader,
    events::{BytesStart, Event},
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XmlError {
    #[error("xml parse error at byte {position}: {reason}")]
    Parse { position: u64, reason: String },

    #[error("unexpected end of document, element '{0}' is not closed")]
    Unclosed(String),
}

/// Escapes text so it can be embedded as element content or an attribute value.
pub fn escape(text: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(text)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    name: String,
    attributes: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parses `input` into a tree under a synthetic, unnamed root.
    pub fn parse(input: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(input);
        reader.config_mut().trim_text(true);

        let mut stack = vec![XmlNode::default()];
        loop {
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(e) => {
                    return Err(XmlError::Parse {
                        position: reader.buffer_position() as u64,
                        reason: e.to_string(),
                    });
                }
            };

            match event {
                Event::Start(start) => stack.push(element(&start, &reader)?),
                Event::Empty(start) => {
                    let node = element(&start, &reader)?;
                    attach(&mut stack, node);
                }
                Event::End(_) => {
                    if stack.len() < 2 {
                        return Err(XmlError::Parse {
                            position: reader.buffer_position() as u64,
                            reason: "unmatched end tag".to_string(),
                        });
                    }
                    if let Some(node) = stack.pop() {
                        attach(&mut stack, node);
                    }
                }
                Event::Text(text) => {
                    let text = text.unescape().map_err(|e| XmlError::Parse {
                        position: reader.buffer_position() as u64,
                        reason: e.to_string(),
                    })?;
                    append_text(&mut stack, &text);
                }
                Event::CData(data) => {
                    let raw = data.into_inner();
                    append_text(&mut stack, &String::from_utf8_lossy(&raw));
                }
                Event::Eof => break,
                // Declarations, comments, processing instructions and doctypes
                // carry nothing the tree needs.
                _ => {}
            }
        }

        if stack.len() > 1 {
            let open = stack.pop().map(|n| n.name).unwrap_or_default();
            return Err(XmlError::Unclosed(open));
        }
        Ok(stack.pop().unwrap_or_default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Element name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        match self.name.split_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    pub fn is_root(&self) -> bool {
        self.name.is_empty()
    }

    /// Text content of this element, if it has any.
    pub fn body(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn children(&self) -> &[XmlNode] {
        &self.children
    }

    pub fn first_child(&self) -> Option<&XmlNode> {
        self.children.first()
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.local_name() == name)
    }

    pub fn children_named<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a XmlNode> + use<'a, 'n> {
        self.children.iter().filter(move |c| c.local_name() == name)
    }

    /// Body of the first child called `name`.
    pub fn find_body(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(XmlNode::body)
    }

    /// First node reached by `path`, in document order.
    pub fn find(&self, path: &str) -> Option<&XmlNode> {
        self.find_all(path).into_iter().next()
    }

    /// Every node reached by `path`, in document order. An empty path yields `self`.
    pub fn find_all(&self, path: &str) -> Vec<&XmlNode> {
        let mut current = vec![self];
        for segment in segments(path) {
            current = current
                .into_iter()
                .flat_map(|node| node.children_named(segment))
                .collect();
        }
        current
    }

    /// Copy of this tree keeping only the branches that lead to `path`.
    ///
    /// Matched nodes are kept whole. When nothing matches the result is this
    /// node with no children.
    pub fn select(&self, path: &str) -> XmlNode {
        let segments: Vec<&str> = segments(path).collect();
        prune(self, &segments).unwrap_or_else(|| self.shallow())
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(key, value);
        self
    }

    pub fn with_child(mut self, child: XmlNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn push_child(&mut self, child: XmlNode) {
        self.children.push(child);
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut XmlNode> {
        self.children.iter_mut().find(|c| c.local_name() == name)
    }

    fn shallow(&self) -> XmlNode {
        XmlNode {
            name: self.name.clone(),
            attributes: self.attributes.clone(),
            text: self.text.clone(),
            children: Vec::new(),
        }
    }
}

impl fmt::Display for XmlNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            for child in &self.children {
                write!(f, "{child}")?;
            }
            return Ok(());
        }

        write!(f, "<{}", self.name)?;
        for (key, value) in &self.attributes {
            write!(f, " {key}=\"{}\"", escape(value))?;
        }
        if self.text.is_none() && self.children.is_empty() {
            return write!(f, "/>");
        }
        write!(f, ">")?;
        if let Some(text) = &self.text {
            write!(f, "{}", escape(text))?;
        }
        for child in &self.children {
            write!(f, "{child}")?;
        }
        write!(f, "</{}>", self.name)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty() && *s != ".")
}

fn prune(node: &XmlNode, segments: &[&str]) -> Option<XmlNode> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(node.clone());
    };

    let children: Vec<XmlNode> = node
        .children_named(first)
        .filter_map(|child| prune(child, rest))
        .collect();
    if children.is_empty() {
        return None;
    }

    let mut kept = node.shallow();
    kept.children = children;
    Some(kept)
}

fn element(start: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<XmlNode, XmlError> {
    let mut node = XmlNode::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Parse {
            position: reader.buffer_position() as u64,
            reason: e.to_string(),
        })?;
        let value = attr.unescape_value().map_err(|e| XmlError::Parse {
            position: reader.buffer_position() as u64,
            reason: e.to_string(),
        })?;
        node.attributes.push((
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            value.into_owned(),
        ));
    }
    Ok(node)
}

fn attach(stack: &mut [XmlNode], node: XmlNode) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    }
}

fn append_text(stack: &mut [XmlNode], text: &str) {
    if let Some(node) = stack.last_mut() {
        node.text.get_or_insert_with(String::new).push_str(text);
    }
}

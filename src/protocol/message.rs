//! Length-prefixed backend messages.
//!
//! A [`Message`] is the unit exchanged between front-ends and the backend:
//!
//! ```text
//! offset 0       : total_length (u32, network byte order, header + body)
//! offset 4..N-1  : body (usually a NUL-terminated XML document)
//! ```
//!
//! There is no checksum or version field; a reader that has consumed
//! `total_length` bytes holds exactly one message.
//!
//! Bodies are never produced from format strings. Callers either hand over a
//! finished document to [`Message::encode`] or assemble one with
//! [`BodyBuilder`], which escapes every text value it is given.
use std::fmt;

use log::{Level, log_enabled, trace};
use thiserror::Error;

use crate::xml::{XmlNode, escape};

/// Size of the `total_length` header.
pub const HEADER_LEN: usize = size_of::<u32>();

const DUMP_LINE: usize = 32;
const DUMP_GROUP: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("failed to allocate {0} bytes for message")]
    Encoding(usize),

    #[error("message of {0} bytes does not fit the 32-bit length header")]
    TooLarge(usize),

    #[error("malformed message body: {0}")]
    MalformedBody(String),
}

/// An encoded message: header followed by body, immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    bytes: Vec<u8>,
}

impl Message {
    /// Encodes a document body, appending the NUL terminator.
    pub fn encode(body: &str) -> Result<Self, MessageError> {
        Self::with_body(body.as_bytes(), true)
    }

    /// Wraps `data` verbatim as a message body, without a terminator.
    pub fn from_body(data: &[u8]) -> Result<Self, MessageError> {
        Self::with_body(data, false)
    }

    fn with_body(data: &[u8], terminate: bool) -> Result<Self, MessageError> {
        let len = HEADER_LEN + data.len() + usize::from(terminate);
        let total = u32::try_from(len).map_err(|_| MessageError::TooLarge(len))?;

        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| MessageError::Encoding(len))?;
        bytes.extend_from_slice(&total.to_be_bytes());
        bytes.extend_from_slice(data);
        if terminate {
            bytes.push(0);
        }
        Ok(Self { bytes })
    }

    /// Reassembles a message read off the wire. `body` must already hold
    /// `total_length - HEADER_LEN` bytes.
    pub(crate) fn from_wire(header: [u8; HEADER_LEN], body: Vec<u8>) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(&header);
        bytes.extend(body);
        Self { bytes }
    }

    /// The `total_length` header value.
    pub fn total_len(&self) -> u32 {
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.bytes[..HEADER_LEN]);
        u32::from_be_bytes(header)
    }

    /// The full encoded message, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn body(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    /// Body text up to the first NUL byte.
    pub fn body_str(&self) -> Result<&str, MessageError> {
        let body = self.body();
        let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
        std::str::from_utf8(&body[..end]).map_err(|e| MessageError::MalformedBody(e.to_string()))
    }

    /// Parses the body as an XML document.
    ///
    /// A failure here concerns this message only; the channel it came from
    /// is still in sync.
    pub fn decode(&self) -> Result<XmlNode, MessageError> {
        let body = self.body_str()?;
        trace!("decoding body: {body}");
        XmlNode::parse(body).map_err(|e| MessageError::MalformedBody(e.to_string()))
    }

    /// Hex rendering of the encoded bytes, 32 bytes per line in groups of four.
    pub fn hex_dump(&self) -> Vec<String> {
        self.bytes
            .chunks(DUMP_LINE)
            .map(|line| {
                line.chunks(DUMP_GROUP)
                    .map(|group| group.iter().map(|b| format!("{b:02x}")).collect::<String>())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }

    pub(crate) fn dump(&self, direction: &str) {
        if log_enabled!(Level::Trace) {
            for line in self.hex_dump() {
                trace!("{direction}: {line}");
            }
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("total_len", &self.total_len())
            .field("body", &String::from_utf8_lossy(self.body()))
            .finish()
    }
}

/// Assembles a message body element by element.
///
/// Text and attribute values are escaped. [`BodyBuilder::raw`] is the only way
/// to insert markup and expects a fragment that is already well formed.
#[derive(Debug, Default, Clone)]
pub struct BodyBuilder {
    body: String,
    open: Vec<String>,
}

impl BodyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(self, tag: &str) -> Self {
        self.open_with(tag, &[])
    }

    pub fn open_with(mut self, tag: &str, attributes: &[(&str, &str)]) -> Self {
        self.body.push('<');
        self.body.push_str(tag);
        push_attributes(&mut self.body, attributes);
        self.body.push('>');
        self.open.push(tag.to_string());
        self
    }

    /// Closes the innermost open element.
    pub fn close(mut self) -> Self {
        if let Some(tag) = self.open.pop() {
            self.body.push_str("</");
            self.body.push_str(&tag);
            self.body.push('>');
        }
        self
    }

    pub fn text(mut self, value: &str) -> Self {
        self.body.push_str(&escape(value));
        self
    }

    pub fn raw(mut self, fragment: &str) -> Self {
        self.body.push_str(fragment);
        self
    }

    /// `<tag>value</tag>` with `value` escaped.
    pub fn element(self, tag: &str, value: &str) -> Self {
        self.open(tag).text(value).close()
    }

    pub fn empty(mut self, tag: &str) -> Self {
        self.body.push('<');
        self.body.push_str(tag);
        self.body.push_str("/>");
        self
    }

    /// Closes every element still open and returns the document.
    pub fn finish(mut self) -> String {
        while !self.open.is_empty() {
            self = self.close();
        }
        self.body
    }

    pub fn build(self) -> Result<Message, MessageError> {
        Message::encode(&self.finish())
    }
}

fn push_attributes(body: &mut String, attributes: &[(&str, &str)]) {
    for (key, value) in attributes {
        body.push(' ');
        body.push_str(key);
        body.push_str("=\"");
        body.push_str(&escape(value));
        body.push('"');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_counts_header_body_and_terminator() {
        let body = "<rpc><get-config/></rpc>";
        let msg = Message::encode(body).unwrap();

        assert_eq!(msg.total_len() as usize, HEADER_LEN + body.len() + 1);
        assert_eq!(msg.as_bytes().len(), msg.total_len() as usize);
        assert_eq!(&msg.as_bytes()[..HEADER_LEN], &msg.total_len().to_be_bytes());
        assert_eq!(msg.body().last(), Some(&0));
    }

    #[test]
    fn percent_signs_are_not_interpreted() {
        let body = "<event>100%s %d %n</event>";
        let msg = Message::encode(body).unwrap();

        assert_eq!(msg.body_str().unwrap(), body);
        assert_eq!(msg.decode().unwrap(), XmlNode::parse(body).unwrap());
    }

    #[test]
    fn empty_body_decodes_to_empty_document() {
        let msg = Message::encode("").unwrap();

        assert_eq!(msg.total_len() as usize, HEADER_LEN + 1);
        assert_eq!(msg.decode().unwrap(), XmlNode::parse("").unwrap());
    }

    #[test]
    fn large_body_round_trip() {
        let payload = "x".repeat(100 * 1024);
        let body = format!("<data>{payload}</data>");
        let msg = Message::encode(&body).unwrap();

        assert_eq!(msg.total_len() as usize, HEADER_LEN + body.len() + 1);
        assert_eq!(msg.decode().unwrap().find_body("data"), Some(payload.as_str()));
    }

    #[test]
    fn from_body_has_no_terminator() {
        let msg = Message::from_body(b"<ok/>").unwrap();

        assert_eq!(msg.total_len() as usize, HEADER_LEN + 5);
        assert_eq!(msg.body(), b"<ok/>");
        assert_eq!(msg.body_str().unwrap(), "<ok/>");
    }

    #[test]
    fn body_str_stops_at_first_nul() {
        let msg = Message::from_body(b"<a/>\0garbage").unwrap();
        assert_eq!(msg.body_str().unwrap(), "<a/>");
    }

    #[test]
    fn malformed_body_is_reported() {
        let msg = Message::encode("<rpc><get-config></rpc>").unwrap();
        assert!(matches!(msg.decode(), Err(MessageError::MalformedBody(_))));

        let msg = Message::from_body(&[0xff, 0xfe]).unwrap();
        assert!(matches!(msg.decode(), Err(MessageError::MalformedBody(_))));
    }

    #[test]
    fn builder_escapes_values_and_closes_tags() {
        let body = BodyBuilder::new()
            .open_with("rpc", &[("username", "a\"b")])
            .open("edit")
            .element("value", "<script>&")
            .empty("ok")
            .finish();

        assert_eq!(
            body,
            r#"<rpc username="a&quot;b"><edit><value>&lt;script&gt;&amp;</value><ok/></edit></rpc>"#
        );
    }

    #[test]
    fn builder_raw_inserts_fragment_verbatim() {
        let msg = BodyBuilder::new()
            .open("data")
            .raw("<nacm><enable-nacm>true</enable-nacm></nacm>")
            .build()
            .unwrap();

        let doc = msg.decode().unwrap();
        assert_eq!(
            doc.find("data/nacm").and_then(|n| n.find_body("enable-nacm")),
            Some("true")
        );
    }

    #[test]
    fn hex_dump_groups_bytes() {
        let msg = Message::from_body(&[0xab; 40]).unwrap();
        let lines = msg.hex_dump();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000002c abababab"));
        assert_eq!(lines[0].split(' ').count(), 8);
        assert_eq!(lines[1], "abababab abababab abababab");
    }

    #[test]
    fn wire_reassembly_matches_encoding() {
        let msg = Message::encode("<ok/>").unwrap();
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&msg.as_bytes()[..HEADER_LEN]);

        let rebuilt = Message::from_wire(header, msg.body().to_vec());
        assert_eq!(rebuilt, msg);
    }
}

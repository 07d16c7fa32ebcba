//! Front-end message framing.
//!
//! The backend channel is length-prefixed, but NETCONF front-ends speak to
//! their own clients over SSH (messages end with `]]>]]>`) or SOAP (messages
//! sit inside an envelope). [`Framing`] selects one of these at configuration
//! time and offers symmetric wrap/unwrap operations for it.
use std::str::FromStr;

use crate::xml::escape;

/// RFC 4742 end-of-message marker.
pub const END_OF_MESSAGE: &str = "]]>]]>";

const SOAP_PREAMBLE: &str = "\n<soapenv:Envelope\n xmlns:soapenv=\"http://www.w3.org/2003/05/soap-envelope\">\n<soapenv:Body>";
const SOAP_POSTAMBLE: &str = "\n</soapenv:Body></soapenv:Envelope>";
const SOAP_FAULT_OPEN: &str = "<soapenv:Envelope xmlns:soapenv=\"http://www.w3.org/2003/05/soap-envelope\" xmlns:xml=\"http://www.w3.org/XML/1998/namespace\"><soapenv:Body><soapenv:Fault><soapenv:Code><soapenv:Value>env:Receiver</soapenv:Value></soapenv:Code><soapenv:Reason><soapenv:Text xml:lang=\"en\">";
const SOAP_FAULT_DETAIL: &str = "</soapenv:Text></soapenv:Reason><detail>";
const SOAP_FAULT_CLOSE: &str = "</detail></soapenv:Fault>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Ssh,
    Soap,
}

impl Framing {
    pub fn wrap(self, body: &str) -> String {
        match self {
            Framing::Ssh => format!("{body}{END_OF_MESSAGE}"),
            Framing::Soap => format!("{SOAP_PREAMBLE}{body}{SOAP_POSTAMBLE}"),
        }
    }

    /// Strips what [`Framing::wrap`] added. `None` if `frame` is not framed this way.
    pub fn unwrap(self, frame: &str) -> Option<&str> {
        match self {
            Framing::Ssh => frame.strip_suffix(END_OF_MESSAGE),
            Framing::Soap => frame
                .strip_prefix(SOAP_PREAMBLE)
                .and_then(|f| f.strip_suffix(SOAP_POSTAMBLE)),
        }
    }

    /// Wraps an error reply. SOAP turns it into a fault carrying `reason`.
    pub fn wrap_error(self, body: &str, reason: &str) -> String {
        match self {
            Framing::Ssh => self.wrap(body),
            Framing::Soap => format!(
                "{SOAP_FAULT_OPEN}{}{SOAP_FAULT_DETAIL}{body}{SOAP_FAULT_CLOSE}{SOAP_POSTAMBLE}",
                escape(reason)
            ),
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssh" => Ok(Framing::Ssh),
            "soap" => Ok(Framing::Soap),
            other => Err(format!("unknown framing '{other}', expected ssh or soap")),
        }
    }
}

/// Detects a fixed byte pattern in a stream fed one byte at a time.
#[derive(Debug, Clone)]
pub struct EndTagDetector<'a> {
    tag: &'a [u8],
    matched: usize,
}

impl<'a> EndTagDetector<'a> {
    pub fn new(tag: &'a str) -> Self {
        Self {
            tag: tag.as_bytes(),
            matched: 0,
        }
    }

    /// Returns `true` when `byte` completes the tag.
    pub fn feed(&mut self, byte: u8) -> bool {
        if self.tag.is_empty() {
            return false;
        }

        if self.tag[self.matched] == byte {
            self.matched += 1;
        } else {
            // Longest tag prefix that still ends at this byte.
            let mut seen = self.tag[..self.matched].to_vec();
            seen.push(byte);
            self.matched = (0..=self.matched)
                .rev()
                .find(|&k| seen.ends_with(&self.tag[..k]))
                .unwrap_or(0);
        }

        if self.matched == self.tag.len() {
            self.matched = 0;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.matched = 0;
    }
}

/// Splits an SSH-framed byte stream into messages.
#[derive(Debug, Clone)]
pub struct FrameAccumulator {
    buf: Vec<u8>,
    detector: EndTagDetector<'static>,
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            detector: EndTagDetector::new(END_OF_MESSAGE),
        }
    }
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one byte; returns the message it completes, marker removed.
    pub fn push(&mut self, byte: u8) -> Option<String> {
        self.buf.push(byte);
        if !self.detector.feed(byte) {
            return None;
        }
        self.buf.truncate(self.buf.len() - END_OF_MESSAGE.len());
        let frame = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        Some(frame)
    }

    pub fn extend(&mut self, bytes: &[u8]) -> Vec<String> {
        bytes.iter().filter_map(|b| self.push(*b)).collect()
    }

    /// Bytes received since the last complete message.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

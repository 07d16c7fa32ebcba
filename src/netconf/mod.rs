//! NETCONF helpers shared by the backend and front-ends.
//!
//! - [`RpcError`]: `rpc-error` replies (access-denied and friends).
//! - [`Target`]: picking the datastore an operation names in `<source>`/`<target>`.
//! - [`framing`]: how a NETCONF front-end delimits messages on its own transport.
pub mod framing;

use std::fmt;

use crate::{
    protocol::{BodyBuilder, Message, MessageError},
    xml::XmlNode,
};

pub use framing::{EndTagDetector, FrameAccumulator, Framing};

/// `error-type` of an `rpc-error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Transport,
    Rpc,
    Protocol,
    Application,
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorType::Transport => "transport",
            ErrorType::Rpc => "rpc",
            ErrorType::Protocol => "protocol",
            ErrorType::Application => "application",
        })
    }
}

/// `error-tag` of an `rpc-error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTag {
    AccessDenied,
    OperationNotSupported,
    OperationFailed,
    MalformedMessage,
}

impl fmt::Display for ErrorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorTag::AccessDenied => "access-denied",
            ErrorTag::OperationNotSupported => "operation-not-supported",
            ErrorTag::OperationFailed => "operation-failed",
            ErrorTag::MalformedMessage => "malformed-message",
        })
    }
}

/// A structured NETCONF error, always with severity `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub error_type: ErrorType,
    pub tag: ErrorTag,
    pub message: String,
}

impl RpcError {
    pub fn access_denied(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self::new(error_type, ErrorTag::AccessDenied, message)
    }

    pub fn operation_not_supported(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self::new(error_type, ErrorTag::OperationNotSupported, message)
    }

    pub fn operation_failed(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self::new(error_type, ErrorTag::OperationFailed, message)
    }

    pub fn malformed_message(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Rpc, ErrorTag::MalformedMessage, message)
    }

    fn new(error_type: ErrorType, tag: ErrorTag, message: impl Into<String>) -> Self {
        Self {
            error_type,
            tag,
            message: message.into(),
        }
    }

    /// The `<rpc-reply>` document carrying this error.
    pub fn to_xml(&self) -> String {
        BodyBuilder::new()
            .open("rpc-reply")
            .open("rpc-error")
            .element("error-type", &self.error_type.to_string())
            .element("error-tag", &self.tag.to_string())
            .element("error-severity", "error")
            .element("error-message", &self.message)
            .finish()
    }

    pub fn to_message(&self) -> Result<Message, MessageError> {
        Message::encode(&self.to_xml())
    }

    /// Reads the first `rpc-error` out of a reply, if there is one.
    pub fn from_reply(reply: &XmlNode) -> Option<Self> {
        let error = reply.find("rpc-reply/rpc-error")?;
        let error_type = match error.find_body("error-type")? {
            "transport" => ErrorType::Transport,
            "rpc" => ErrorType::Rpc,
            "protocol" => ErrorType::Protocol,
            "application" => ErrorType::Application,
            _ => return None,
        };
        let tag = match error.find_body("error-tag")? {
            "access-denied" => ErrorTag::AccessDenied,
            "operation-not-supported" => ErrorTag::OperationNotSupported,
            "operation-failed" => ErrorTag::OperationFailed,
            "malformed-message" => ErrorTag::MalformedMessage,
            _ => return None,
        };
        let message = error.find_body("error-message").unwrap_or_default();
        Some(Self::new(error_type, tag, message))
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.error_type, self.tag, self.message)
    }
}

/// `<rpc-reply><ok/></rpc-reply>`
pub fn ok_reply() -> String {
    BodyBuilder::new().open("rpc-reply").empty("ok").finish()
}

/// A configuration datastore an operation can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Candidate,
    Running,
    Startup,
}

impl Target {
    pub fn as_str(self) -> &'static str {
        match self {
            Target::Candidate => "candidate",
            Target::Running => "running",
            Target::Startup => "startup",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Datastore named under `path` (usually `source` or `target`) of an operation.
///
/// When several are present, candidate wins over running, running over startup.
pub fn target_datastore(operation: &XmlNode, path: &str) -> Option<Target> {
    let node = operation.find(path)?;
    [Target::Candidate, Target::Running, Target::Startup]
        .into_iter()
        .find(|t| node.child(t.as_str()).is_some())
}

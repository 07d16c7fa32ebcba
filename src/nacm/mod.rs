//! NETCONF access control (RFC 8341) for incoming protocol operations.
//!
//! The backend asks [`Nacm::access`] before executing any operation. The rule
//! tree is fetched afresh on every call, either from the `running` datastore
//! or from a tree handed over at startup, and evaluated in a fixed order:
//!
//! 1. NACM disabled or not configured: permit.
//! 2. `close-session`: always permitted.
//! 3. The user's groups select rule-lists; the first rule matching the
//!    operation decides.
//! 4. With no matching rule, `kill-session` and `delete-config` are denied,
//!    everything else follows `exec-default` (permit when unset).
//!
//! Only protocol-operation (`exec`) rules with module name `"*"` are evaluated.
//! Failing to load the rules is an error, never a decision. So is a malformed
//! leaf the check actually reaches; rules after the deciding one, and lists
//! for other groups, are never read.
pub mod rules;

use std::{fmt, str::FromStr, sync::Arc};

use log::debug;
use thiserror::Error;

use crate::{
    datastore::{Datastore, DatastoreError},
    netconf::{ErrorType, RpcError},
    xml::XmlNode,
};

pub use rules::{Action, Rule, RuleConfig, RuleList, RuleMatch};

/// Operations that are denied when no rule explicitly permits them.
const DENIED_BY_DEFAULT: [&str; 2] = ["kill-session", "delete-config"];

#[derive(Debug, Error)]
pub enum NacmError {
    #[error("failed to read nacm rules: {0}")]
    Datastore(#[from] DatastoreError),

    #[error("nacm {node} has no {leaf}")]
    MissingLeaf {
        node: &'static str,
        leaf: &'static str,
    },

    #[error("invalid nacm {leaf} '{value}'")]
    InvalidValue { leaf: &'static str, value: String },

    #[error("unknown nacm mode '{0}', expected internal or external")]
    InvalidMode(String),

    #[error("external nacm mode needs a rule tree")]
    NoExternalTree,
}

/// Where the rule tree comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NacmMode {
    /// The `nacm` subtree of the running datastore.
    #[default]
    Internal,
    /// A tree supplied by the embedding application.
    External,
}

impl FromStr for NacmMode {
    type Err = NacmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(NacmMode::Internal),
            "external" => Ok(NacmMode::External),
            other => Err(NacmError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for NacmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NacmMode::Internal => "internal",
            NacmMode::External => "external",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Permit,
    Deny(RpcError),
}

impl Decision {
    pub fn is_permit(&self) -> bool {
        matches!(self, Decision::Permit)
    }

    fn deny(message: &str) -> Self {
        Decision::Deny(RpcError::access_denied(ErrorType::Protocol, message))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthzRequest<'a> {
    pub username: Option<&'a str>,
    pub operation: &'a str,
}

impl<'a> AuthzRequest<'a> {
    pub fn new(username: Option<&'a str>, operation: &'a str) -> Self {
        Self {
            username,
            operation,
        }
    }
}

#[derive(Clone)]
pub enum RuleSource {
    Running(Arc<dyn Datastore>),
    External(XmlNode),
}

impl fmt::Debug for RuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleSource::Running(_) => f.write_str("Running"),
            RuleSource::External(_) => f.write_str("External"),
        }
    }
}

/// Access control engine. Holds no state between checks.
#[derive(Debug, Clone)]
pub struct Nacm {
    source: RuleSource,
}

impl Nacm {
    pub fn internal(datastore: Arc<dyn Datastore>) -> Self {
        Self {
            source: RuleSource::Running(datastore),
        }
    }

    /// `tree` is a document whose top level holds the `nacm` node.
    pub fn external(tree: XmlNode) -> Self {
        Self {
            source: RuleSource::External(tree),
        }
    }

    pub fn from_mode(
        mode: NacmMode,
        datastore: Arc<dyn Datastore>,
        external: Option<XmlNode>,
    ) -> Result<Self, NacmError> {
        match (mode, external) {
            (NacmMode::Internal, _) => Ok(Self::internal(datastore)),
            (NacmMode::External, Some(tree)) => Ok(Self::external(tree)),
            (NacmMode::External, None) => Err(NacmError::NoExternalTree),
        }
    }

    pub fn mode(&self) -> NacmMode {
        match self.source {
            RuleSource::Running(_) => NacmMode::Internal,
            RuleSource::External(_) => NacmMode::External,
        }
    }

    /// Loads the current rule configuration. `None` when no `nacm` node exists.
    pub fn load(&self) -> Result<Option<RuleConfig>, NacmError> {
        match &self.source {
            RuleSource::Running(datastore) => {
                let tree = datastore.get("running", "nacm")?;
                RuleConfig::from_tree(&tree)
            }
            RuleSource::External(tree) => RuleConfig::from_tree(tree),
        }
    }

    pub fn access(&self, request: &AuthzRequest) -> Result<Decision, NacmError> {
        let config = match self.load()? {
            Some(config) if config.enabled => config,
            _ => {
                debug!("nacm disabled, permitting '{}'", request.operation);
                return Ok(Decision::Permit);
            }
        };
        evaluate(&config, request)
    }
}

/// Decision for `request` under an enabled `config`.
pub fn evaluate(config: &RuleConfig, request: &AuthzRequest) -> Result<Decision, NacmError> {
    let operation = request.operation;
    if operation == "close-session" {
        debug!("close-session is always permitted");
        return Ok(Decision::Permit);
    }

    if let Some(username) = request.username {
        let groups = config.groups_of(username)?;
        if !groups.is_empty() {
            for list in config.rule_lists().filter(|l| l.applies_to(&groups)) {
                for rule in list.rules() {
                    let rule = rule?;
                    match rule.evaluate(operation) {
                        RuleMatch::NoMatch => continue,
                        RuleMatch::Permit => {
                            debug!(
                                "rule {:?} in {:?} permits '{operation}' for {username}",
                                rule.name,
                                list.name()
                            );
                            return Ok(Decision::Permit);
                        }
                        RuleMatch::Deny => {
                            debug!(
                                "rule {:?} in {:?} denies '{operation}' for {username}",
                                rule.name,
                                list.name()
                            );
                            return Ok(Decision::deny("access denied"));
                        }
                    }
                }
            }
        } else {
            debug!("{username} is in no nacm group");
        }
    }

    if DENIED_BY_DEFAULT.contains(&operation) {
        debug!("no rule matched, '{operation}' is denied by default");
        return Ok(Decision::deny("default deny"));
    }
    match config.exec_default()? {
        None | Some(Action::Permit) => {
            debug!("no rule matched, exec-default permits '{operation}'");
            Ok(Decision::Permit)
        }
        Some(Action::Deny) => {
            debug!("no rule matched, exec-default denies '{operation}'");
            Ok(Decision::deny("default deny"))
        }
    }
}

//! Typed view of the `nacm` configuration subtree.
//!
//! ```text
//! nacm
//!   enable-nacm: "true" | "false"
//!   exec-default: "permit" | "deny"
//!   groups
//!     group* { name, user-name* }
//!   rule-list*
//!     group*
//!     rule*  { module-name, rpc-name?, access-operations, action }
//! ```
//!
//! Group, rule-list and rule order is kept exactly as found in the tree.
//! Leaves are read when a check reaches them, so a malformed rule only
//! fails the checks that would have looked at it.
use std::str::FromStr;

use crate::xml::XmlNode;

use super::NacmError;

/// Access operation that protocol-operation rules are matched on.
pub const EXEC: &str = "exec";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Permit,
    Deny,
}

impl FromStr for Action {
    type Err = NacmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permit" => Ok(Action::Permit),
            "deny" => Ok(Action::Deny),
            other => Err(NacmError::InvalidValue {
                leaf: "action",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: Option<String>,
    pub module_name: Option<String>,
    pub rpc_name: Option<String>,
    pub access_operations: Option<String>,
    pub action: Action,
}

/// Outcome of testing one rule against a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleMatch {
    Permit,
    Deny,
    NoMatch,
}

impl Rule {
    /// Whether this rule covers executing `operation`.
    ///
    /// Only module name `"*"` is recognised; an absent rpc-name matches every
    /// operation.
    pub fn matches_exec(&self, operation: &str) -> bool {
        self.module_name.as_deref() == Some("*")
            && allows(self.access_operations.as_deref(), EXEC)
            && match self.rpc_name.as_deref() {
                None | Some("*") => true,
                Some(name) => name == operation,
            }
    }

    pub fn evaluate(&self, operation: &str) -> RuleMatch {
        if !self.matches_exec(operation) {
            return RuleMatch::NoMatch;
        }
        match self.action {
            Action::Permit => RuleMatch::Permit,
            Action::Deny => RuleMatch::Deny,
        }
    }
}

/// `access-operations` is `"*"` or a space-separated set of operation names.
fn allows(access_operations: Option<&str>, operation: &str) -> bool {
    match access_operations {
        None => false,
        Some("*") => true,
        Some(ops) => ops.split_whitespace().any(|op| op == operation),
    }
}

impl TryFrom<&XmlNode> for Rule {
    type Error = NacmError;

    fn try_from(node: &XmlNode) -> Result<Self, Self::Error> {
        let action = node
            .find_body("action")
            .ok_or(NacmError::MissingLeaf {
                node: "rule",
                leaf: "action",
            })?
            .parse()?;
        Ok(Rule {
            name: node.find_body("name").map(str::to_string),
            module_name: node.find_body("module-name").map(str::to_string),
            rpc_name: node.find_body("rpc-name").map(str::to_string),
            access_operations: node.find_body("access-operations").map(str::to_string),
            action,
        })
    }
}

/// One `rule-list` entry, borrowed from the configuration tree.
#[derive(Debug, Clone, Copy)]
pub struct RuleList<'a> {
    node: &'a XmlNode,
}

impl<'a> RuleList<'a> {
    pub fn name(&self) -> Option<&'a str> {
        self.node.find_body("name")
    }

    pub fn groups(&self) -> impl Iterator<Item = &'a str> + use<'a> {
        self.node.children_named("group").filter_map(XmlNode::body)
    }

    pub fn applies_to(&self, groups: &[&str]) -> bool {
        self.groups().any(|g| groups.contains(&g))
    }

    /// Rules in order, each parsed as it is reached.
    pub fn rules(&self) -> impl Iterator<Item = Result<Rule, NacmError>> + use<'a> {
        self.node.children_named("rule").map(Rule::try_from)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleConfig {
    pub enabled: bool,
    nacm: XmlNode,
}

impl RuleConfig {
    /// Reads the `nacm` child of `root`. `Ok(None)` when there is none.
    ///
    /// Only `enable-nacm` is checked here; a disabled configuration is never
    /// looked at any further.
    pub fn from_tree(root: &XmlNode) -> Result<Option<Self>, NacmError> {
        let Some(nacm) = root.child("nacm") else {
            return Ok(None);
        };

        let enabled = match nacm.find_body("enable-nacm") {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(NacmError::InvalidValue {
                    leaf: "enable-nacm",
                    value: other.to_string(),
                });
            }
        };
        Ok(Some(Self {
            enabled,
            nacm: nacm.clone(),
        }))
    }

    pub fn exec_default(&self) -> Result<Option<Action>, NacmError> {
        self.nacm
            .find_body("exec-default")
            .map(|value| {
                value.parse().map_err(|_| NacmError::InvalidValue {
                    leaf: "exec-default",
                    value: value.to_string(),
                })
            })
            .transpose()
    }

    /// Names of the groups listing `username` as a member.
    ///
    /// Groups the user is not in are skipped unread.
    pub fn groups_of(&self, username: &str) -> Result<Vec<&str>, NacmError> {
        self.nacm
            .find_all("groups/group")
            .into_iter()
            .filter(|g| g.children_named("user-name").any(|u| u.body() == Some(username)))
            .map(|g| {
                g.find_body("name").ok_or(NacmError::MissingLeaf {
                    node: "group",
                    leaf: "name",
                })
            })
            .collect()
    }

    pub fn rule_lists(&self) -> impl Iterator<Item = RuleList<'_>> {
        self.nacm
            .children_named("rule-list")
            .map(|node| RuleList { node })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(rpc_name: Option<&str>, access: &str, action: Action) -> Rule {
        Rule {
            name: None,
            module_name: Some("*".to_string()),
            rpc_name: rpc_name.map(str::to_string),
            access_operations: Some(access.to_string()),
            action,
        }
    }

    #[test]
    fn rule_matching() {
        assert!(rule(None, "exec", Action::Permit).matches_exec("get-config"));
        assert!(rule(Some("*"), "*", Action::Permit).matches_exec("get-config"));
        assert!(rule(Some("get-config"), "read exec", Action::Permit).matches_exec("get-config"));
        assert!(!rule(Some("edit-config"), "exec", Action::Permit).matches_exec("get-config"));
        assert!(!rule(None, "read update", Action::Permit).matches_exec("get-config"));
    }

    #[test]
    fn module_name_must_be_wildcard() {
        let mut r = rule(None, "exec", Action::Deny);
        r.module_name = Some("ietf-netconf".to_string());
        assert_eq!(r.evaluate("get-config"), RuleMatch::NoMatch);

        r.module_name = None;
        assert_eq!(r.evaluate("get-config"), RuleMatch::NoMatch);

        r.module_name = Some("*".to_string());
        assert_eq!(r.evaluate("get-config"), RuleMatch::Deny);
    }

    fn config(xml: &str) -> RuleConfig {
        RuleConfig::from_tree(&XmlNode::parse(xml).unwrap())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn parse_full_tree() {
        let config = config(
            "<nacm>
               <enable-nacm>true</enable-nacm>
               <exec-default>deny</exec-default>
               <groups>
                 <group><name>admins</name><user-name>admin</user-name><user-name>root</user-name></group>
               </groups>
               <rule-list>
                 <name>admin-acl</name>
                 <group>admins</group>
                 <rule><name>a</name><module-name>*</module-name><access-operations>exec</access-operations><action>permit</action></rule>
                 <rule><name>b</name><module-name>*</module-name><rpc-name>kill-session</rpc-name><access-operations>*</access-operations><action>deny</action></rule>
               </rule-list>
             </nacm>",
        );

        assert!(config.enabled);
        assert_eq!(config.exec_default().unwrap(), Some(Action::Deny));
        assert_eq!(config.groups_of("root").unwrap(), vec!["admins"]);
        assert!(config.groups_of("guest").unwrap().is_empty());

        let list = config.rule_lists().next().unwrap();
        assert_eq!(list.name(), Some("admin-acl"));
        assert!(list.applies_to(&["admins"]));
        let rules: Vec<Rule> = list.rules().collect::<Result<_, _>>().unwrap();
        let names: Vec<_> = rules.iter().filter_map(|r| r.name.as_deref()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(rules[1].rpc_name.as_deref(), Some("kill-session"));
    }

    #[test]
    fn absent_nacm_node() {
        let root = XmlNode::parse("<interfaces/>").unwrap();
        assert_eq!(RuleConfig::from_tree(&root).unwrap(), None);
    }

    #[test]
    fn disabled_config_is_not_read() {
        let config = config(
            "<nacm><enable-nacm>false</enable-nacm><exec-default>maybe</exec-default>\
             <rule-list><rule><module-name>*</module-name></rule></rule-list></nacm>",
        );
        assert!(!config.enabled);
    }

    #[test]
    fn invalid_values_are_errors() {
        let bad_enable = XmlNode::parse("<nacm><enable-nacm>yes</enable-nacm></nacm>").unwrap();
        assert!(matches!(
            RuleConfig::from_tree(&bad_enable),
            Err(NacmError::InvalidValue {
                leaf: "enable-nacm",
                ..
            })
        ));

        let bad_default = config("<nacm><enable-nacm>true</enable-nacm><exec-default>maybe</exec-default></nacm>");
        assert!(matches!(
            bad_default.exec_default(),
            Err(NacmError::InvalidValue {
                leaf: "exec-default",
                ..
            })
        ));

        let no_action = config(
            "<nacm><enable-nacm>true</enable-nacm><rule-list><rule><module-name>*</module-name></rule></rule-list></nacm>",
        );
        let list = no_action.rule_lists().next().unwrap();
        assert!(matches!(
            list.rules().next(),
            Some(Err(NacmError::MissingLeaf { leaf: "action", .. }))
        ));
    }

    #[test]
    fn unnamed_group_only_fails_its_members() {
        let config = config(
            "<nacm><enable-nacm>true</enable-nacm><groups>\
             <group><user-name>guest</user-name></group>\
             <group><name>admins</name><user-name>admin</user-name></group>\
             </groups></nacm>",
        );

        assert_eq!(config.groups_of("admin").unwrap(), vec!["admins"]);
        assert!(matches!(
            config.groups_of("guest"),
            Err(NacmError::MissingLeaf { node: "group", leaf: "name" })
        ));
    }
}

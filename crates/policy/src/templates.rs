//! Built-in role-pair policy templates.
//!
//! Templates give admins one-call setup of the common intents (app
//! tier to database, ops SSH, monitoring scrapes) without hand-writing
//! the rule fields.

use nw_domain::model::{DstRole, NodeRole, Protocol, RuleAction};
use nw_registry::store::NewAclPolicy;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PolicyTemplate {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub src_role: NodeRole,
    pub dst_role: DstRole,
    pub port: Option<u16>,
    pub protocol: Protocol,
}

impl PolicyTemplate {
    /// Materialize the template as a creatable rule.
    pub fn instantiate(&self) -> NewAclPolicy {
        NewAclPolicy {
            name: self.name.to_string(),
            src_role: self.src_role,
            dst_role: self.dst_role,
            port: self.port,
            protocol: self.protocol,
            action: RuleAction::Allow,
            priority: 100,
            enabled: true,
        }
    }
}

/// The built-in template catalogue.
pub fn builtin() -> Vec<PolicyTemplate> {
    vec![
        PolicyTemplate {
            key: "app-to-db",
            name: "app tier to database",
            description: "Application nodes may reach PostgreSQL on database nodes",
            src_role: NodeRole::App,
            dst_role: DstRole::Role(NodeRole::Db),
            port: Some(5432),
            protocol: Protocol::Tcp,
        },
        PolicyTemplate {
            key: "ops-ssh",
            name: "ops SSH everywhere",
            description: "Operations nodes may SSH to every node",
            src_role: NodeRole::Ops,
            dst_role: DstRole::Any,
            port: Some(22),
            protocol: Protocol::Tcp,
        },
        PolicyTemplate {
            key: "monitoring-scrape",
            name: "monitoring scrapes",
            description: "Monitor nodes may scrape the node exporter everywhere",
            src_role: NodeRole::Monitor,
            dst_role: DstRole::Any,
            port: Some(9100),
            protocol: Protocol::Tcp,
        },
    ]
}

/// Look up a template by key.
pub fn find(key: &str) -> Option<PolicyTemplate> {
    builtin().into_iter().find(|t| t.key == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_keys_are_unique() {
        let templates = builtin();
        let mut keys: Vec<_> = templates.iter().map(|t| t.key).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), templates.len());
    }

    #[test]
    fn instantiated_template_is_valid_rule_input() {
        let rule = find("app-to-db").unwrap().instantiate();
        assert_eq!(rule.src_role, NodeRole::App);
        assert_eq!(rule.dst_role, DstRole::Role(NodeRole::Db));
        assert_eq!(rule.port, Some(5432));
        assert!(rule.enabled);
        assert!((1..=1000).contains(&rule.priority));
    }

    #[test]
    fn unknown_key_finds_nothing() {
        assert!(find("everything-open").is_none());
    }
}

//! Entity model for the NetWarden registry.
//!
//! Nodes are VPS hosts joined to the overlay; users/groups/policies form
//! the declarative access model the policy compiler consumes. All types
//! serialize to the JSON shapes used both on disk and over the wire.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Nodes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Functional classification of a node inside the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Hub,
    App,
    Db,
    Ops,
    Monitor,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Hub => "hub",
            NodeRole::App => "app",
            NodeRole::Db => "db",
            NodeRole::Ops => "ops",
            NodeRole::Monitor => "monitor",
        }
    }

    pub fn parse(s: &str) -> Option<NodeRole> {
        match s {
            "hub" => Some(NodeRole::Hub),
            "app" => Some(NodeRole::App),
            "db" => Some(NodeRole::Db),
            "ops" => Some(NodeRole::Ops),
            "monitor" => Some(NodeRole::Monitor),
            _ => None,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node lifecycle status.
///
/// Registration creates a `Pending` node; admins move it to `Active`,
/// back and forth to `Suspended`, and finally to `Revoked`. Revoked
/// nodes keep their IP lease until deletion but never appear in the
/// hub peer set or as an ACL source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Active,
    Suspended,
    Revoked,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Active => "active",
            NodeStatus::Suspended => "suspended",
            NodeStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One VPS joined to the overlay network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    /// Stable identity; unique across the registry.
    pub hostname: String,
    /// Tunnel identity; unique across the registry.
    pub public_key: String,
    /// Address inside the overlay /24. Assigned at registration and
    /// immutable while the node lives.
    pub overlay_ip: Ipv4Addr,
    /// Public address observed on the most recent heartbeat.
    #[serde(default)]
    pub real_ip: Option<String>,
    pub role: NodeRole,
    pub status: NodeStatus,
    /// Admin-blessed expected agent digest.
    #[serde(default)]
    pub agent_hash: Option<String>,
    /// Most recent digest reported by the agent.
    #[serde(default)]
    pub last_reported_hash: Option<String>,
    #[serde(default)]
    pub hash_verified: bool,
    /// Consecutive mismatches; reset on a matching report or admin
    /// approval.
    #[serde(default)]
    pub hash_mismatch_count: u32,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub os_info: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Node {
    /// Redundant with `status == Active`; kept for API responses.
    pub fn is_approved(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Legacy role-pair ACL rules
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Destination side of a role-pair rule: a concrete role or `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DstRole {
    Any,
    Role(NodeRole),
}

impl DstRole {
    pub fn matches(&self, role: NodeRole) -> bool {
        match self {
            DstRole::Any => true,
            DstRole::Role(r) => *r == role,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DstRole::Any => "*",
            DstRole::Role(r) => r.as_str(),
        }
    }
}

impl Serialize for DstRole {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DstRole {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == "*" {
            return Ok(DstRole::Any);
        }
        NodeRole::parse(&s)
            .map(DstRole::Role)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown role: {s}")))
    }
}

/// Transport protocol for ACL rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Any => "any",
        }
    }
}

/// Allow or deny; ACL rules and the wire shape share this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// Legacy role-pair firewall rule: "src_role may reach dst_role on
/// port/protocol". The per-node ACL compiler expands these against the
/// set of active nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclPolicy {
    pub id: u64,
    pub name: String,
    pub src_role: NodeRole,
    pub dst_role: DstRole,
    #[serde(default)]
    pub port: Option<u16>,
    pub protocol: Protocol,
    pub action: RuleAction,
    /// 1–1000, lower wins.
    pub priority: u16,
    pub enabled: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Users, groups, memberships
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: u64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Groups may nest via `parent_group_id`; the graph must stay acyclic.
/// Policy evaluation treats a user as a member of every ancestor group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub group_id: u64,
    pub name: String,
    #[serde(default)]
    pub parent_group_id: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Member,
    Admin,
    Owner,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: u64,
    pub group_id: u64,
    pub role: MemberRole,
    pub added_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rich access policies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Subject {
    All,
    User { id: u64 },
    Group { id: u64 },
}

/// What a policy protects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Resource {
    /// Suffix match; a leading `*` wildcard matches any subdomain.
    Domain(String),
    /// CIDR containment.
    IpRange(String),
    /// Literal equality.
    Zone(String),
    /// Literal equality.
    Service(String),
    /// Glob match.
    UrlPattern(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Deny,
    RequireMfa,
}

/// Recurring validity window: a weekday set plus an HH:MM range.
/// Days are 0 = Monday … 6 = Sunday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub days: Vec<u8>,
    /// Inclusive, "HH:MM".
    pub start: String,
    /// Exclusive, "HH:MM".
    pub end: String,
}

/// Optional guards evaluated against the access context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConditions {
    #[serde(default)]
    pub device_types: Vec<String>,
    #[serde(default)]
    pub time_windows: Vec<TimeWindow>,
    #[serde(default)]
    pub client_cidrs: Vec<Ipv4Net>,
    #[serde(default)]
    pub require_vpn: bool,
}

impl PolicyConditions {
    pub fn is_empty(&self) -> bool {
        self.device_types.is_empty()
            && self.time_windows.is_empty()
            && self.client_cidrs.is_empty()
            && !self.require_vpn
    }
}

/// Declarative access rule of the rich user/group model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPolicy {
    pub id: u64,
    pub name: String,
    pub subject: Subject,
    pub resource: Resource,
    pub action: PolicyAction,
    #[serde(default)]
    pub conditions: PolicyConditions,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    /// 1–1000, lower wins.
    pub priority: u16,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Runtime facts about one access attempt, matched against policy
/// conditions during evaluation.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    pub device_type: Option<String>,
    pub client_ip: Option<Ipv4Addr>,
    pub via_vpn: bool,
    /// Evaluation instant; `None` means "now".
    pub timestamp: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

/// One append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub action: String,
    pub actor_type: String,
    pub actor_id: String,
    pub target_type: String,
    pub target_id: String,
    pub details: String,
    pub severity: AuditSeverity,
    #[serde(default)]
    pub source_ip: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// System-actor audit record with `Info` severity.
    pub fn system(action: &str, target_type: &str, target_id: impl ToString, details: impl Into<String>) -> Self {
        AuditRecord {
            action: action.to_string(),
            actor_type: "system".to_string(),
            actor_id: "control-plane".to_string(),
            target_type: target_type.to_string(),
            target_id: target_id.to_string(),
            details: details.into(),
            severity: AuditSeverity::Info,
            source_ip: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_actor(mut self, actor_type: &str, actor_id: impl ToString) -> Self {
        self.actor_type = actor_type.to_string();
        self.actor_id = actor_id.to_string();
        self
    }

    pub fn with_source_ip(mut self, ip: Option<String>) -> Self {
        self.source_ip = ip;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_role_round_trips_through_str() {
        for role in [NodeRole::Hub, NodeRole::App, NodeRole::Db, NodeRole::Ops, NodeRole::Monitor] {
            assert_eq!(NodeRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(NodeRole::parse("router"), None);
    }

    #[test]
    fn dst_role_serializes_wildcard() {
        let json = serde_json::to_string(&DstRole::Any).unwrap();
        assert_eq!(json, "\"*\"");
        let back: DstRole = serde_json::from_str("\"*\"").unwrap();
        assert_eq!(back, DstRole::Any);

        let role: DstRole = serde_json::from_str("\"db\"").unwrap();
        assert_eq!(role, DstRole::Role(NodeRole::Db));
        assert!(serde_json::from_str::<DstRole>("\"bogus\"").is_err());
    }

    #[test]
    fn dst_role_wildcard_matches_everything() {
        assert!(DstRole::Any.matches(NodeRole::App));
        assert!(DstRole::Any.matches(NodeRole::Hub));
        assert!(DstRole::Role(NodeRole::Db).matches(NodeRole::Db));
        assert!(!DstRole::Role(NodeRole::Db).matches(NodeRole::App));
    }

    #[test]
    fn subject_json_shape() {
        let all = serde_json::to_value(Subject::All).unwrap();
        assert_eq!(all, serde_json::json!({"type": "all"}));
        let user = serde_json::to_value(Subject::User { id: 7 }).unwrap();
        assert_eq!(user, serde_json::json!({"type": "user", "id": 7}));
    }

    #[test]
    fn resource_json_shape() {
        let r = serde_json::to_value(Resource::Domain("*.internal.example".into())).unwrap();
        assert_eq!(
            r,
            serde_json::json!({"type": "domain", "value": "*.internal.example"})
        );
    }
}

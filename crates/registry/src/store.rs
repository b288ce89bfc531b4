//! The registry store.
//!
//! Thin CRUD over the entity model with referential-integrity checks.
//! Every successful write runs under the single write lock, appends one
//! audit row, persists the touched collection, and returns the domain
//! events for the caller to publish once the write has committed.
//! Heartbeat-driven liveness updates are the one exception: they persist
//! but neither audit nor emit.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::Utc;
use ipnet::Ipv4Net;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use nw_domain::model::{
    AccessPolicy, AclPolicy, AuditRecord, DstRole, Group, MemberRole, Membership, Node, NodeRole,
    NodeStatus, PolicyAction, PolicyConditions, Protocol, Resource, RuleAction, Subject,
    TimeWindow, User,
};
use nw_domain::{Error, Result};
use nw_events::{event_type, Event};

use crate::audit::AuditLog;
use crate::event_store::EventStore;
use crate::ipam::{IpAllocator, IpOwner};
use crate::snapshot::RegistrySnapshot;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registration input for a new node.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub hostname: String,
    pub role: NodeRole,
    pub public_key: String,
    pub os_info: Option<String>,
    pub agent_version: Option<String>,
}

/// Result of a (possibly idempotent) registration.
pub struct RegisterOutcome {
    pub node: Node,
    /// False when the same (hostname, public_key) pair was already
    /// registered and the existing row was returned.
    pub created: bool,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserUpdate {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewGroup {
    pub name: String,
    #[serde(default)]
    pub parent_group_id: Option<u64>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupUpdate {
    #[serde(default)]
    pub name: Option<String>,
    /// `Some(None)` clears the parent; `None` leaves it untouched.
    #[serde(default, with = "double_option")]
    pub parent_group_id: Option<Option<u64>>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Serde helper distinguishing "absent" from "null" for optional
/// nullable fields.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(de).map(Some)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAccessPolicy {
    pub name: String,
    pub subject: Subject,
    pub resource: Resource,
    pub action: PolicyAction,
    #[serde(default)]
    pub conditions: PolicyConditions,
    #[serde(default)]
    pub valid_from: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<chrono::DateTime<Utc>>,
    pub priority: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAclPolicy {
    pub name: String,
    pub src_role: NodeRole,
    pub dst_role: DstRole,
    #[serde(default)]
    pub port: Option<u16>,
    pub protocol: Protocol,
    pub action: RuleAction,
    #[serde(default = "default_priority")]
    pub priority: u16,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> u16 {
    100
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted tables
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Serialize, Deserialize)]
struct Table<T> {
    next_id: u64,
    rows: Vec<T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Table { next_id: 0, rows: Vec::new() }
    }
}

impl<T> Table<T> {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default, Serialize, Deserialize)]
struct VersionFile {
    config_version: u64,
}

struct State {
    nodes: Table<Node>,
    users: Table<User>,
    groups: Table<Group>,
    memberships: Vec<Membership>,
    policies: Table<AccessPolicy>,
    acl_policies: Table<AclPolicy>,
    config_version: u64,
    ipam: IpAllocator,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The single writer of record for all NetWarden entities.
pub struct Registry {
    state_path: PathBuf,
    state: RwLock<State>,
    audit: AuditLog,
    events: EventStore,
}

impl Registry {
    /// Load or create the registry under `state_path`. The IP lease
    /// table is rebuilt from the node rows.
    pub fn open(state_path: &Path, overlay: Ipv4Net, low_threshold: usize) -> Result<Self> {
        std::fs::create_dir_all(state_path)?;

        let nodes: Table<Node> = load_json(state_path, "nodes.json")?;
        let users: Table<User> = load_json(state_path, "users.json")?;
        let groups: Table<Group> = load_json(state_path, "groups.json")?;
        let memberships: Vec<Membership> = load_json(state_path, "memberships.json")?;
        let policies: Table<AccessPolicy> = load_json(state_path, "policies.json")?;
        let acl_policies: Table<AclPolicy> = load_json(state_path, "acl_policies.json")?;
        let version: VersionFile = load_json(state_path, "version.json")?;

        let mut ipam = IpAllocator::new(overlay, low_threshold);
        for node in &nodes.rows {
            ipam.adopt(node.overlay_ip, IpOwner::Node(node.id));
        }

        tracing::info!(
            nodes = nodes.rows.len(),
            users = users.rows.len(),
            groups = groups.rows.len(),
            policies = policies.rows.len(),
            acl_policies = acl_policies.rows.len(),
            config_version = version.config_version,
            path = %state_path.display(),
            "registry loaded"
        );

        Ok(Registry {
            state_path: state_path.to_path_buf(),
            state: RwLock::new(State {
                nodes,
                users,
                groups,
                memberships,
                policies,
                acl_policies,
                config_version: version.config_version,
                ipam,
            }),
            audit: AuditLog::new(state_path)?,
            events: EventStore::new(state_path)?,
        })
    }

    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    pub fn event_store(&self) -> &EventStore {
        &self.events
    }

    pub fn config_version(&self) -> u64 {
        self.state.read().config_version
    }

    /// Immutable snapshot for the policy compiler.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read();
        RegistrySnapshot {
            nodes: state.nodes.rows.clone(),
            users: state.users.rows.clone(),
            groups: state.groups.rows.clone(),
            memberships: state.memberships.clone(),
            policies: state.policies.rows.clone(),
            acl_policies: state.acl_policies.rows.clone(),
            config_version: state.config_version,
        }
    }

    /// Current IP leases, for the admin allocations listing.
    pub fn ip_allocations(&self) -> Vec<(Ipv4Addr, IpOwner)> {
        self.state.read().ipam.allocations().collect()
    }

    pub fn ip_pool_available(&self) -> usize {
        self.state.read().ipam.available()
    }

    // ── Nodes ────────────────────────────────────────────────────────

    pub fn list_nodes(&self) -> Vec<Node> {
        self.state.read().nodes.rows.clone()
    }

    pub fn node(&self, id: u64) -> Result<Node> {
        self.state
            .read()
            .nodes
            .rows
            .iter()
            .find(|n| n.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node {id}")))
    }

    pub fn node_by_hostname(&self, hostname: &str) -> Result<Node> {
        self.state
            .read()
            .nodes
            .rows
            .iter()
            .find(|n| n.hostname == hostname)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node {hostname}")))
    }

    /// Register a node, idempotently on `(hostname, public_key)`.
    ///
    /// A hostname or key colliding with a *different* pairing is a
    /// conflict; an exact match returns the existing row unchanged.
    pub fn register_node(&self, new: NewNode) -> Result<RegisterOutcome> {
        let mut state = self.state.write();

        if let Some(existing) = state
            .nodes
            .rows
            .iter()
            .find(|n| n.hostname == new.hostname || n.public_key == new.public_key)
        {
            if existing.hostname == new.hostname && existing.public_key == new.public_key {
                return Ok(RegisterOutcome {
                    node: existing.clone(),
                    created: false,
                    events: Vec::new(),
                });
            }
            return Err(Error::Conflict(format!(
                "hostname or public key already registered (node {})",
                existing.id
            )));
        }

        let id = state.nodes.allocate_id();
        let overlay_ip = state.ipam.allocate(IpOwner::Node(id))?;
        let now = Utc::now();
        let node = Node {
            id,
            hostname: new.hostname,
            public_key: new.public_key,
            overlay_ip,
            real_ip: None,
            role: new.role,
            status: NodeStatus::Pending,
            agent_hash: None,
            last_reported_hash: None,
            hash_verified: false,
            hash_mismatch_count: 0,
            agent_version: new.agent_version,
            os_info: new.os_info,
            last_seen: now,
            created_at: now,
        };
        state.nodes.rows.push(node.clone());

        self.audit.append(&AuditRecord::system(
            "NODE_REGISTERED",
            "node",
            id,
            format!("{} ({}) -> {}", node.hostname, node.role, overlay_ip),
        ))?;
        self.save_nodes(&state)?;

        let mut events = vec![
            Event::new(
                event_type::NODE_REGISTERED,
                json!({
                    "node_id": id,
                    "hostname": node.hostname,
                    "role": node.role,
                    "public_key": node.public_key,
                    "overlay_ip": overlay_ip.to_string(),
                    "status": node.status,
                }),
            ),
            Event::new(
                event_type::IP_ALLOCATED,
                json!({"ip": overlay_ip.to_string(), "node_id": id}),
            ),
        ];
        if state.ipam.is_low() {
            events.push(Event::new(
                event_type::IP_POOL_LOW,
                json!({"available": state.ipam.available()}),
            ));
        }

        Ok(RegisterOutcome { node, created: true, events })
    }

    /// Admin approval: pending → active.
    ///
    /// Emits `NodeRegistered` with `status: "active"` (the hub peer
    /// handler keys on that payload) plus the version bump.
    pub fn approve_node(&self, id: u64, actor: &str) -> Result<(Node, Vec<Event>)> {
        self.transition_node(id, actor, NodeStatus::Active, "NODE_APPROVED", |status| {
            matches!(status, NodeStatus::Pending)
        })
    }

    pub fn suspend_node(&self, id: u64, actor: &str) -> Result<(Node, Vec<Event>)> {
        self.transition_node(id, actor, NodeStatus::Suspended, "NODE_SUSPENDED", |status| {
            matches!(status, NodeStatus::Active)
        })
    }

    pub fn resume_node(&self, id: u64, actor: &str) -> Result<(Node, Vec<Event>)> {
        self.transition_node(id, actor, NodeStatus::Active, "NODE_RESUMED", |status| {
            matches!(status, NodeStatus::Suspended)
        })
    }

    pub fn revoke_node(&self, id: u64, actor: &str) -> Result<(Node, Vec<Event>)> {
        self.transition_node(id, actor, NodeStatus::Revoked, "NODE_REVOKED", |status| {
            !matches!(status, NodeStatus::Revoked)
        })
    }

    fn transition_node(
        &self,
        id: u64,
        actor: &str,
        to: NodeStatus,
        audit_action: &str,
        allowed_from: impl Fn(NodeStatus) -> bool,
    ) -> Result<(Node, Vec<Event>)> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .rows
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;

        let from = node.status;
        if !allowed_from(from) {
            return Err(Error::Invalid(format!(
                "cannot transition node {id} from {from} to {to}"
            )));
        }
        node.status = to;
        let node = node.clone();

        // Compiled output only changes when the active set changes.
        let observable = from == NodeStatus::Active || to == NodeStatus::Active;
        let mut events = Vec::new();
        if observable {
            state.config_version += 1;
        }

        self.audit.append(
            &AuditRecord::system(
                audit_action,
                "node",
                id,
                format!("{} {from} -> {to}", node.hostname),
            )
            .with_actor("admin", actor),
        )?;
        self.save_nodes(&state)?;
        if observable {
            self.save_version(&state)?;
        }

        let (lifecycle, payload) = match to {
            // Approval and resume both re-announce the node as active.
            NodeStatus::Active if from == NodeStatus::Pending => (
                event_type::NODE_REGISTERED,
                json!({
                    "node_id": id,
                    "hostname": node.hostname,
                    "role": node.role,
                    "public_key": node.public_key,
                    "overlay_ip": node.overlay_ip.to_string(),
                    "status": node.status,
                }),
            ),
            NodeStatus::Active => (
                event_type::NODE_RESUMED,
                json!({
                    "node_id": id,
                    "hostname": node.hostname,
                    "public_key": node.public_key,
                    "overlay_ip": node.overlay_ip.to_string(),
                    "status": node.status,
                }),
            ),
            NodeStatus::Suspended => (
                event_type::NODE_SUSPENDED,
                json!({
                    "node_id": id,
                    "hostname": node.hostname,
                    "public_key": node.public_key,
                    "status": node.status,
                }),
            ),
            NodeStatus::Revoked => (
                event_type::NODE_REVOKED,
                json!({
                    "node_id": id,
                    "hostname": node.hostname,
                    "public_key": node.public_key,
                    "status": node.status,
                }),
            ),
            NodeStatus::Pending => unreachable!("no transition targets pending"),
        };
        events.push(Event::new(lifecycle, payload));
        if observable {
            events.push(Event::new(
                event_type::CONFIG_VERSION_BUMPED,
                json!({"version": state.config_version}),
            ));
        }

        Ok((node, events))
    }

    /// Delete a node and release its IP lease.
    pub fn delete_node(&self, id: u64, actor: &str) -> Result<Vec<Event>> {
        let mut state = self.state.write();
        let idx = state
            .nodes
            .rows
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        let node = state.nodes.rows.remove(idx);
        state.ipam.release(node.overlay_ip);

        let observable = node.status == NodeStatus::Active;
        if observable {
            state.config_version += 1;
        }

        self.audit.append(
            &AuditRecord::system(
                "NODE_DELETED",
                "node",
                id,
                format!("{} released {}", node.hostname, node.overlay_ip),
            )
            .with_actor("admin", actor),
        )?;
        self.save_nodes(&state)?;
        if observable {
            self.save_version(&state)?;
        }

        let mut events = vec![
            Event::new(
                event_type::NODE_DELETED,
                json!({
                    "node_id": id,
                    "hostname": node.hostname,
                    "public_key": node.public_key,
                }),
            ),
            Event::new(
                event_type::IP_RELEASED,
                json!({"ip": node.overlay_ip.to_string(), "node_id": id}),
            ),
        ];
        if observable {
            events.push(Event::new(
                event_type::CONFIG_VERSION_BUMPED,
                json!({"version": state.config_version}),
            ));
        }
        Ok(events)
    }

    /// Heartbeat bookkeeping: refresh `last_seen` and the observed
    /// source address. Persists, but neither audits nor emits.
    pub fn touch_node(&self, hostname: &str, real_ip: Option<String>) -> Result<Node> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .rows
            .iter_mut()
            .find(|n| n.hostname == hostname)
            .ok_or_else(|| Error::NotFound(format!("node {hostname}")))?;
        node.last_seen = Utc::now();
        if real_ip.is_some() {
            node.real_ip = real_ip;
        }
        let node = node.clone();
        self.save_nodes(&state)?;
        Ok(node)
    }

    /// Admin: pin (or clear) the expected agent hash for a node.
    pub fn set_agent_hash(
        &self,
        id: u64,
        hash: Option<String>,
        actor: &str,
    ) -> Result<(Node, Vec<Event>)> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .rows
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::NotFound(format!("node {id}")))?;
        node.agent_hash = hash.clone();
        if hash.is_none() {
            node.hash_verified = false;
        }
        let node = node.clone();

        self.audit.append(
            &AuditRecord::system(
                "AGENT_HASH_SET",
                "node",
                id,
                match &hash {
                    Some(h) => format!("expected hash set to {}...", h.chars().take(16).collect::<String>()),
                    None => "expected hash cleared".to_string(),
                },
            )
            .with_actor("admin", actor),
        )?;
        self.save_nodes(&state)?;

        let events = vec![Event::new(
            event_type::NODE_UPDATED,
            json!({"node_id": id, "field": "agent_hash"}),
        )];
        Ok((node, events))
    }

    /// Persist a node whose integrity fields (and possibly status) were
    /// rewritten by the verifier, appending the verifier's audit trail.
    /// Returns lifecycle events for any status transition.
    pub fn apply_integrity(
        &self,
        updated: Node,
        audits: Vec<AuditRecord>,
    ) -> Result<Vec<Event>> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .rows
            .iter_mut()
            .find(|n| n.id == updated.id)
            .ok_or_else(|| Error::NotFound(format!("node {}", updated.id)))?;

        let from = node.status;
        let to = updated.status;
        let node_id = updated.id;
        let hostname = node.hostname.clone();
        let public_key = node.public_key.clone();
        *node = updated;

        let observable = from != to && (from == NodeStatus::Active || to == NodeStatus::Active);
        if observable {
            state.config_version += 1;
        }

        for record in &audits {
            self.audit.append(record)?;
        }
        self.save_nodes(&state)?;
        if observable {
            self.save_version(&state)?;
        }

        let mut events = Vec::new();
        if from != to {
            let lifecycle = match to {
                NodeStatus::Suspended => event_type::NODE_SUSPENDED,
                NodeStatus::Revoked => event_type::NODE_REVOKED,
                NodeStatus::Active => event_type::NODE_RESUMED,
                NodeStatus::Pending => event_type::NODE_UPDATED,
            };
            events.push(Event::new(
                lifecycle,
                json!({
                    "node_id": node_id,
                    "hostname": hostname,
                    "public_key": public_key,
                    "status": to,
                    "reason": "integrity",
                }),
            ));
            if observable {
                events.push(Event::new(
                    event_type::CONFIG_VERSION_BUMPED,
                    json!({"version": state.config_version}),
                ));
            }
        }
        Ok(events)
    }

    // ── Users ────────────────────────────────────────────────────────

    pub fn list_users(&self) -> Vec<User> {
        self.state.read().users.rows.clone()
    }

    pub fn user(&self, id: u64) -> Result<User> {
        self.state
            .read()
            .users
            .rows
            .iter()
            .find(|u| u.user_id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("user {id}")))
    }

    pub fn create_user(&self, new: NewUser, actor: &str) -> Result<(User, Vec<Event>)> {
        let mut state = self.state.write();
        if state.users.rows.iter().any(|u| u.username == new.username) {
            return Err(Error::Conflict(format!("username {}", new.username)));
        }
        let id = state.users.allocate_id();
        let user = User {
            user_id: id,
            username: new.username,
            email: new.email,
            enabled: true,
            created_at: Utc::now(),
        };
        state.users.rows.push(user.clone());

        self.audit.append(
            &AuditRecord::system("USER_CREATED", "user", id, user.username.clone())
                .with_actor("admin", actor),
        )?;
        self.save_users(&state)?;

        let events = vec![Event::new(
            event_type::USER_CREATED,
            json!({"user_id": id, "username": user.username}),
        )];
        Ok((user, events))
    }

    pub fn update_user(&self, id: u64, update: UserUpdate, actor: &str) -> Result<(User, Vec<Event>)> {
        let mut state = self.state.write();
        let user = state
            .users
            .rows
            .iter_mut()
            .find(|u| u.user_id == id)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
        if let Some(email) = update.email {
            user.email = Some(email);
        }
        if let Some(enabled) = update.enabled {
            user.enabled = enabled;
        }
        let user = user.clone();

        self.audit.append(
            &AuditRecord::system("USER_UPDATED", "user", id, user.username.clone())
                .with_actor("admin", actor),
        )?;
        self.save_users(&state)?;

        let events = vec![Event::new(
            event_type::USER_UPDATED,
            json!({"user_id": id, "username": user.username}),
        )];
        Ok((user, events))
    }

    pub fn delete_user(&self, id: u64, actor: &str) -> Result<Vec<Event>> {
        let mut state = self.state.write();
        let idx = state
            .users
            .rows
            .iter()
            .position(|u| u.user_id == id)
            .ok_or_else(|| Error::NotFound(format!("user {id}")))?;

        if state
            .policies
            .rows
            .iter()
            .any(|p| p.subject == Subject::User { id })
        {
            return Err(Error::ReferentialViolation(format!(
                "user {id} is referenced by access policies"
            )));
        }

        let user = state.users.rows.remove(idx);
        state.memberships.retain(|m| m.user_id != id);

        self.audit.append(
            &AuditRecord::system("USER_DELETED", "user", id, user.username.clone())
                .with_actor("admin", actor),
        )?;
        self.save_users(&state)?;
        self.save_memberships(&state)?;

        Ok(vec![Event::new(
            event_type::USER_DELETED,
            json!({"user_id": id, "username": user.username}),
        )])
    }

    // ── Groups ───────────────────────────────────────────────────────

    pub fn list_groups(&self) -> Vec<Group> {
        self.state.read().groups.rows.clone()
    }

    pub fn group(&self, id: u64) -> Result<Group> {
        self.state
            .read()
            .groups
            .rows
            .iter()
            .find(|g| g.group_id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("group {id}")))
    }

    pub fn create_group(&self, new: NewGroup, actor: &str) -> Result<(Group, Vec<Event>)> {
        let mut state = self.state.write();
        if state.groups.rows.iter().any(|g| g.name == new.name) {
            return Err(Error::Conflict(format!("group {}", new.name)));
        }
        if let Some(parent) = new.parent_group_id {
            if !state.groups.rows.iter().any(|g| g.group_id == parent) {
                return Err(Error::ReferentialViolation(format!(
                    "parent group {parent} does not exist"
                )));
            }
        }
        let id = state.groups.allocate_id();
        let group = Group {
            group_id: id,
            name: new.name,
            parent_group_id: new.parent_group_id,
            description: new.description,
            created_at: Utc::now(),
        };
        state.groups.rows.push(group.clone());

        self.audit.append(
            &AuditRecord::system("GROUP_CREATED", "group", id, group.name.clone())
                .with_actor("admin", actor),
        )?;
        self.save_groups(&state)?;

        let events = vec![Event::new(
            event_type::GROUP_CREATED,
            json!({"group_id": id, "name": group.name}),
        )];
        Ok((group, events))
    }

    pub fn update_group(&self, id: u64, update: GroupUpdate, actor: &str) -> Result<(Group, Vec<Event>)> {
        let mut state = self.state.write();
        if !state.groups.rows.iter().any(|g| g.group_id == id) {
            return Err(Error::NotFound(format!("group {id}")));
        }
        if let Some(name) = &update.name {
            if state
                .groups
                .rows
                .iter()
                .any(|g| g.group_id != id && g.name == *name)
            {
                return Err(Error::Conflict(format!("group {name}")));
            }
        }
        if let Some(Some(parent)) = update.parent_group_id {
            if !state.groups.rows.iter().any(|g| g.group_id == parent) {
                return Err(Error::ReferentialViolation(format!(
                    "parent group {parent} does not exist"
                )));
            }
            ensure_acyclic(&state.groups.rows, id, parent)?;
        }

        let group = state
            .groups
            .rows
            .iter_mut()
            .find(|g| g.group_id == id)
            .expect("checked above");
        if let Some(name) = update.name {
            group.name = name;
        }
        if let Some(parent) = update.parent_group_id {
            group.parent_group_id = parent;
        }
        if let Some(description) = update.description {
            group.description = Some(description);
        }
        let group = group.clone();

        self.audit.append(
            &AuditRecord::system("GROUP_UPDATED", "group", id, group.name.clone())
                .with_actor("admin", actor),
        )?;
        self.save_groups(&state)?;

        let events = vec![Event::new(
            event_type::GROUP_UPDATED,
            json!({"group_id": id, "name": group.name}),
        )];
        Ok((group, events))
    }

    pub fn delete_group(&self, id: u64, actor: &str) -> Result<Vec<Event>> {
        let mut state = self.state.write();
        let idx = state
            .groups
            .rows
            .iter()
            .position(|g| g.group_id == id)
            .ok_or_else(|| Error::NotFound(format!("group {id}")))?;

        if state
            .groups
            .rows
            .iter()
            .any(|g| g.parent_group_id == Some(id))
        {
            return Err(Error::ReferentialViolation(format!(
                "group {id} has child groups"
            )));
        }
        if state
            .policies
            .rows
            .iter()
            .any(|p| p.subject == Subject::Group { id })
        {
            return Err(Error::ReferentialViolation(format!(
                "group {id} is referenced by access policies"
            )));
        }

        let group = state.groups.rows.remove(idx);
        state.memberships.retain(|m| m.group_id != id);

        self.audit.append(
            &AuditRecord::system("GROUP_DELETED", "group", id, group.name.clone())
                .with_actor("admin", actor),
        )?;
        self.save_groups(&state)?;
        self.save_memberships(&state)?;

        Ok(vec![Event::new(
            event_type::GROUP_DELETED,
            json!({"group_id": id, "name": group.name}),
        )])
    }

    // ── Memberships ──────────────────────────────────────────────────

    pub fn list_members(&self, group_id: u64) -> Result<Vec<Membership>> {
        let state = self.state.read();
        if !state.groups.rows.iter().any(|g| g.group_id == group_id) {
            return Err(Error::NotFound(format!("group {group_id}")));
        }
        Ok(state
            .memberships
            .iter()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect())
    }

    pub fn add_member(
        &self,
        group_id: u64,
        user_id: u64,
        role: MemberRole,
        actor: &str,
    ) -> Result<(Membership, Vec<Event>)> {
        let mut state = self.state.write();
        if !state.groups.rows.iter().any(|g| g.group_id == group_id) {
            return Err(Error::ReferentialViolation(format!("group {group_id} does not exist")));
        }
        if !state.users.rows.iter().any(|u| u.user_id == user_id) {
            return Err(Error::ReferentialViolation(format!("user {user_id} does not exist")));
        }
        if state
            .memberships
            .iter()
            .any(|m| m.group_id == group_id && m.user_id == user_id)
        {
            return Err(Error::Conflict(format!(
                "user {user_id} is already a member of group {group_id}"
            )));
        }

        let membership = Membership {
            user_id,
            group_id,
            role,
            added_at: Utc::now(),
        };
        state.memberships.push(membership.clone());

        self.audit.append(
            &AuditRecord::system(
                "MEMBER_ADDED",
                "group",
                group_id,
                format!("user {user_id} added as {role:?}"),
            )
            .with_actor("admin", actor),
        )?;
        self.save_memberships(&state)?;

        let events = vec![Event::new(
            event_type::MEMBER_ADDED,
            json!({"user_id": user_id, "group_id": group_id}),
        )];
        Ok((membership, events))
    }

    pub fn remove_member(&self, group_id: u64, user_id: u64, actor: &str) -> Result<Vec<Event>> {
        let mut state = self.state.write();
        let before = state.memberships.len();
        state
            .memberships
            .retain(|m| !(m.group_id == group_id && m.user_id == user_id));
        if state.memberships.len() == before {
            return Err(Error::NotFound(format!(
                "user {user_id} is not a member of group {group_id}"
            )));
        }

        self.audit.append(
            &AuditRecord::system(
                "MEMBER_REMOVED",
                "group",
                group_id,
                format!("user {user_id} removed"),
            )
            .with_actor("admin", actor),
        )?;
        self.save_memberships(&state)?;

        Ok(vec![Event::new(
            event_type::MEMBER_REMOVED,
            json!({"user_id": user_id, "group_id": group_id}),
        )])
    }

    // ── Access policies (rich model) ─────────────────────────────────

    pub fn list_policies(&self) -> Vec<AccessPolicy> {
        self.state.read().policies.rows.clone()
    }

    pub fn policy(&self, id: u64) -> Result<AccessPolicy> {
        self.state
            .read()
            .policies
            .rows
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("policy {id}")))
    }

    pub fn create_policy(&self, new: NewAccessPolicy, actor: &str) -> Result<(AccessPolicy, Vec<Event>)> {
        let mut state = self.state.write();
        validate_policy(&state, &new)?;

        let id = state.policies.allocate_id();
        let policy = AccessPolicy {
            id,
            name: new.name,
            subject: new.subject,
            resource: new.resource,
            action: new.action,
            conditions: new.conditions,
            valid_from: new.valid_from,
            valid_until: new.valid_until,
            priority: new.priority,
            enabled: new.enabled,
            created_at: Utc::now(),
        };
        state.policies.rows.push(policy.clone());
        state.config_version += 1;

        self.audit.append(
            &AuditRecord::system("POLICY_CREATED", "policy", id, policy.name.clone())
                .with_actor("admin", actor),
        )?;
        self.save_policies(&state)?;
        self.save_version(&state)?;

        let events = vec![
            Event::new(
                event_type::POLICY_CREATED,
                json!({"policy_id": id, "name": policy.name, "model": "access"}),
            ),
            Event::new(
                event_type::CONFIG_VERSION_BUMPED,
                json!({"version": state.config_version}),
            ),
        ];
        Ok((policy, events))
    }

    pub fn update_policy(
        &self,
        id: u64,
        new: NewAccessPolicy,
        actor: &str,
    ) -> Result<(AccessPolicy, Vec<Event>)> {
        let mut state = self.state.write();
        if !state.policies.rows.iter().any(|p| p.id == id) {
            return Err(Error::NotFound(format!("policy {id}")));
        }
        validate_policy(&state, &new)?;

        let policy = state
            .policies
            .rows
            .iter_mut()
            .find(|p| p.id == id)
            .expect("checked above");
        policy.name = new.name;
        policy.subject = new.subject;
        policy.resource = new.resource;
        policy.action = new.action;
        policy.conditions = new.conditions;
        policy.valid_from = new.valid_from;
        policy.valid_until = new.valid_until;
        policy.priority = new.priority;
        policy.enabled = new.enabled;
        let policy = policy.clone();
        state.config_version += 1;

        self.audit.append(
            &AuditRecord::system("POLICY_UPDATED", "policy", id, policy.name.clone())
                .with_actor("admin", actor),
        )?;
        self.save_policies(&state)?;
        self.save_version(&state)?;

        let events = vec![
            Event::new(
                event_type::POLICY_UPDATED,
                json!({"policy_id": id, "name": policy.name, "model": "access"}),
            ),
            Event::new(
                event_type::CONFIG_VERSION_BUMPED,
                json!({"version": state.config_version}),
            ),
        ];
        Ok((policy, events))
    }

    pub fn delete_policy(&self, id: u64, actor: &str) -> Result<Vec<Event>> {
        let mut state = self.state.write();
        let idx = state
            .policies
            .rows
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| Error::NotFound(format!("policy {id}")))?;
        let policy = state.policies.rows.remove(idx);
        state.config_version += 1;

        self.audit.append(
            &AuditRecord::system("POLICY_DELETED", "policy", id, policy.name.clone())
                .with_actor("admin", actor),
        )?;
        self.save_policies(&state)?;
        self.save_version(&state)?;

        Ok(vec![
            Event::new(
                event_type::POLICY_DELETED,
                json!({"policy_id": id, "name": policy.name, "model": "access"}),
            ),
            Event::new(
                event_type::CONFIG_VERSION_BUMPED,
                json!({"version": state.config_version}),
            ),
        ])
    }

    // ── ACL policies (legacy role-pair model) ────────────────────────

    pub fn list_acl_policies(&self) -> Vec<AclPolicy> {
        self.state.read().acl_policies.rows.clone()
    }

    pub fn acl_policy(&self, id: u64) -> Result<AclPolicy> {
        self.state
            .read()
            .acl_policies
            .rows
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("acl policy {id}")))
    }

    pub fn create_acl_policy(&self, new: NewAclPolicy, actor: &str) -> Result<(AclPolicy, Vec<Event>)> {
        if !(1..=1000).contains(&new.priority) {
            return Err(Error::Invalid("priority must be between 1 and 1000".into()));
        }
        let mut state = self.state.write();
        let id = state.acl_policies.allocate_id();
        let policy = AclPolicy {
            id,
            name: new.name,
            src_role: new.src_role,
            dst_role: new.dst_role,
            port: new.port,
            protocol: new.protocol,
            action: new.action,
            priority: new.priority,
            enabled: new.enabled,
        };
        state.acl_policies.rows.push(policy.clone());
        state.config_version += 1;

        self.audit.append(
            &AuditRecord::system(
                "ACL_POLICY_CREATED",
                "policy",
                id,
                format!(
                    "{}: {} -> {} port {:?}/{}",
                    policy.name,
                    policy.src_role,
                    policy.dst_role.as_str(),
                    policy.port,
                    policy.protocol.as_str()
                ),
            )
            .with_actor("admin", actor),
        )?;
        self.save_acl_policies(&state)?;
        self.save_version(&state)?;

        let events = vec![
            Event::new(
                event_type::POLICY_CREATED,
                json!({"policy_id": id, "name": policy.name, "model": "acl"}),
            ),
            Event::new(
                event_type::CONFIG_VERSION_BUMPED,
                json!({"version": state.config_version}),
            ),
        ];
        Ok((policy, events))
    }

    pub fn update_acl_policy(
        &self,
        id: u64,
        new: NewAclPolicy,
        actor: &str,
    ) -> Result<(AclPolicy, Vec<Event>)> {
        if !(1..=1000).contains(&new.priority) {
            return Err(Error::Invalid("priority must be between 1 and 1000".into()));
        }
        let mut state = self.state.write();
        let policy = state
            .acl_policies
            .rows
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::NotFound(format!("acl policy {id}")))?;
        policy.name = new.name;
        policy.src_role = new.src_role;
        policy.dst_role = new.dst_role;
        policy.port = new.port;
        policy.protocol = new.protocol;
        policy.action = new.action;
        policy.priority = new.priority;
        policy.enabled = new.enabled;
        let policy = policy.clone();
        state.config_version += 1;

        self.audit.append(
            &AuditRecord::system("ACL_POLICY_UPDATED", "policy", id, policy.name.clone())
                .with_actor("admin", actor),
        )?;
        self.save_acl_policies(&state)?;
        self.save_version(&state)?;

        let events = vec![
            Event::new(
                event_type::POLICY_UPDATED,
                json!({"policy_id": id, "name": policy.name, "model": "acl"}),
            ),
            Event::new(
                event_type::CONFIG_VERSION_BUMPED,
                json!({"version": state.config_version}),
            ),
        ];
        Ok((policy, events))
    }

    pub fn delete_acl_policy(&self, id: u64, actor: &str) -> Result<Vec<Event>> {
        let mut state = self.state.write();
        let idx = state
            .acl_policies
            .rows
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| Error::NotFound(format!("acl policy {id}")))?;
        let policy = state.acl_policies.rows.remove(idx);
        state.config_version += 1;

        self.audit.append(
            &AuditRecord::system("ACL_POLICY_DELETED", "policy", id, policy.name.clone())
                .with_actor("admin", actor),
        )?;
        self.save_acl_policies(&state)?;
        self.save_version(&state)?;

        Ok(vec![
            Event::new(
                event_type::POLICY_DELETED,
                json!({"policy_id": id, "name": policy.name, "model": "acl"}),
            ),
            Event::new(
                event_type::CONFIG_VERSION_BUMPED,
                json!({"version": state.config_version}),
            ),
        ])
    }

    // ── Persistence ──────────────────────────────────────────────────

    fn save_nodes(&self, state: &State) -> Result<()> {
        save_json(&self.state_path, "nodes.json", &state.nodes)
    }

    fn save_users(&self, state: &State) -> Result<()> {
        save_json(&self.state_path, "users.json", &state.users)
    }

    fn save_groups(&self, state: &State) -> Result<()> {
        save_json(&self.state_path, "groups.json", &state.groups)
    }

    fn save_memberships(&self, state: &State) -> Result<()> {
        save_json(&self.state_path, "memberships.json", &state.memberships)
    }

    fn save_policies(&self, state: &State) -> Result<()> {
        save_json(&self.state_path, "policies.json", &state.policies)
    }

    fn save_acl_policies(&self, state: &State) -> Result<()> {
        save_json(&self.state_path, "acl_policies.json", &state.acl_policies)
    }

    fn save_version(&self, state: &State) -> Result<()> {
        save_json(
            &self.state_path,
            "version.json",
            &VersionFile { config_version: state.config_version },
        )
    }
}

fn validate_policy(state: &State, new: &NewAccessPolicy) -> Result<()> {
    if !(1..=1000).contains(&new.priority) {
        return Err(Error::Invalid("priority must be between 1 and 1000".into()));
    }
    match new.subject {
        Subject::User { id } => {
            if !state.users.rows.iter().any(|u| u.user_id == id) {
                return Err(Error::ReferentialViolation(format!("user {id} does not exist")));
            }
        }
        Subject::Group { id } => {
            if !state.groups.rows.iter().any(|g| g.group_id == id) {
                return Err(Error::ReferentialViolation(format!("group {id} does not exist")));
            }
        }
        Subject::All => {}
    }
    if let Resource::IpRange(range) = &new.resource {
        range
            .parse::<Ipv4Net>()
            .map_err(|e| Error::Invalid(format!("ip_range \"{range}\": {e}")))?;
    }
    for window in &new.conditions.time_windows {
        validate_time_window(window)?;
    }
    Ok(())
}

fn validate_time_window(window: &TimeWindow) -> Result<()> {
    if window.days.iter().any(|d| *d > 6) {
        return Err(Error::Invalid("time window days must be 0-6 (Mon-Sun)".into()));
    }
    for value in [&window.start, &window.end] {
        parse_hhmm(value)
            .ok_or_else(|| Error::Invalid(format!("time \"{value}\" is not HH:MM")))?;
    }
    Ok(())
}

/// Parse "HH:MM" into minutes since midnight.
pub fn parse_hhmm(value: &str) -> Option<u16> {
    let (h, m) = value.split_once(':')?;
    let h: u16 = h.parse().ok()?;
    let m: u16 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Reject a parent assignment that would close a cycle: walk up from
/// `new_parent`; reaching `group_id` means `group_id` is an ancestor of
/// its own proposed parent.
fn ensure_acyclic(groups: &[Group], group_id: u64, new_parent: u64) -> Result<()> {
    if new_parent == group_id {
        return Err(Error::Invalid("group cannot be its own parent".into()));
    }
    let mut seen = std::collections::HashSet::new();
    let mut current = Some(new_parent);
    while let Some(id) = current {
        if id == group_id {
            return Err(Error::Invalid(format!(
                "parent {new_parent} would create a group cycle"
            )));
        }
        if !seen.insert(id) {
            break;
        }
        current = groups
            .iter()
            .find(|g| g.group_id == id)
            .and_then(|g| g.parent_group_id);
    }
    Ok(())
}

fn load_json<T: DeserializeOwned + Default>(dir: &Path, name: &str) -> Result<T> {
    let path = dir.join(name);
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn save_json<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<()> {
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&tmp, value)?;
    tmp.persist(dir.join(name))
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::open(dir.path(), "10.0.0.0/24".parse().unwrap(), 10).unwrap();
        (dir, reg)
    }

    fn new_node(hostname: &str, role: NodeRole, key: &str) -> NewNode {
        NewNode {
            hostname: hostname.into(),
            role,
            public_key: key.into(),
            os_info: None,
            agent_version: Some("1.0.0".into()),
        }
    }

    #[test]
    fn fresh_registration_gets_first_free_ip_and_pending_status() {
        let (_dir, reg) = registry();
        let outcome = reg.register_node(new_node("app-01", NodeRole::App, "K1")).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.node.id, 1);
        assert_eq!(outcome.node.overlay_ip.to_string(), "10.0.0.2");
        assert_eq!(outcome.node.status, NodeStatus::Pending);
        assert_eq!(outcome.events[0].event_type, event_type::NODE_REGISTERED);
        assert_eq!(outcome.events[0].payload["status"], "pending");
        assert_eq!(outcome.events[1].event_type, event_type::IP_ALLOCATED);
    }

    #[test]
    fn registration_is_idempotent_on_hostname_and_key() {
        let (_dir, reg) = registry();
        let first = reg.register_node(new_node("app-01", NodeRole::App, "K1")).unwrap();
        let second = reg.register_node(new_node("app-01", NodeRole::App, "K1")).unwrap();
        assert!(!second.created);
        assert_eq!(second.node.id, first.node.id);
        assert_eq!(second.node.overlay_ip, first.node.overlay_ip);
        assert!(second.events.is_empty());
    }

    #[test]
    fn conflicting_identity_is_rejected() {
        let (_dir, reg) = registry();
        reg.register_node(new_node("app-01", NodeRole::App, "K1")).unwrap();
        // Same hostname, different key.
        assert!(matches!(
            reg.register_node(new_node("app-01", NodeRole::App, "K2")),
            Err(Error::Conflict(_))
        ));
        // Same key, different hostname.
        assert!(matches!(
            reg.register_node(new_node("app-02", NodeRole::App, "K1")),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn approval_bumps_version_and_reannounces_active() {
        let (_dir, reg) = registry();
        let node = reg.register_node(new_node("app-01", NodeRole::App, "K1")).unwrap().node;
        assert_eq!(reg.config_version(), 0);

        let (approved, events) = reg.approve_node(node.id, "alice").unwrap();
        assert_eq!(approved.status, NodeStatus::Active);
        assert_eq!(reg.config_version(), 1);
        assert_eq!(events[0].event_type, event_type::NODE_REGISTERED);
        assert_eq!(events[0].payload["status"], "active");
        assert_eq!(events[1].event_type, event_type::CONFIG_VERSION_BUMPED);
        assert_eq!(events[1].payload["version"], 1);
    }

    #[test]
    fn only_pending_nodes_can_be_approved() {
        let (_dir, reg) = registry();
        let node = reg.register_node(new_node("app-01", NodeRole::App, "K1")).unwrap().node;
        reg.approve_node(node.id, "alice").unwrap();
        assert!(matches!(
            reg.approve_node(node.id, "alice"),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn suspend_resume_cycle() {
        let (_dir, reg) = registry();
        let node = reg.register_node(new_node("app-01", NodeRole::App, "K1")).unwrap().node;
        reg.approve_node(node.id, "alice").unwrap();

        let (suspended, events) = reg.suspend_node(node.id, "alice").unwrap();
        assert_eq!(suspended.status, NodeStatus::Suspended);
        assert_eq!(events[0].event_type, event_type::NODE_SUSPENDED);

        let (resumed, events) = reg.resume_node(node.id, "alice").unwrap();
        assert_eq!(resumed.status, NodeStatus::Active);
        assert_eq!(events[0].event_type, event_type::NODE_RESUMED);
        assert_eq!(reg.config_version(), 3);
    }

    #[test]
    fn revoking_pending_node_does_not_bump_version() {
        let (_dir, reg) = registry();
        let node = reg.register_node(new_node("app-01", NodeRole::App, "K1")).unwrap().node;
        let (revoked, events) = reg.revoke_node(node.id, "alice").unwrap();
        assert_eq!(revoked.status, NodeStatus::Revoked);
        assert_eq!(reg.config_version(), 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event_type::NODE_REVOKED);
    }

    #[test]
    fn delete_releases_ip_for_reuse() {
        let (_dir, reg) = registry();
        let a = reg.register_node(new_node("a", NodeRole::App, "KA")).unwrap().node;
        let _b = reg.register_node(new_node("b", NodeRole::App, "KB")).unwrap().node;
        let events = reg.delete_node(a.id, "alice").unwrap();
        assert!(events.iter().any(|e| e.event_type == event_type::IP_RELEASED));

        let c = reg.register_node(new_node("c", NodeRole::App, "KC")).unwrap().node;
        assert_eq!(c.overlay_ip, a.overlay_ip);
    }

    #[test]
    fn unique_overlay_ips_across_registrations() {
        let (_dir, reg) = registry();
        let mut seen = std::collections::HashSet::new();
        for i in 0..10 {
            let node = reg
                .register_node(new_node(&format!("n{i}"), NodeRole::App, &format!("K{i}")))
                .unwrap()
                .node;
            assert!(seen.insert(node.overlay_ip));
        }
    }

    #[test]
    fn touch_node_updates_liveness_without_events() {
        let (_dir, reg) = registry();
        reg.register_node(new_node("app-01", NodeRole::App, "K1")).unwrap();
        let node = reg.touch_node("app-01", Some("203.0.113.9".into())).unwrap();
        assert_eq!(node.real_ip.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn user_delete_blocked_by_policy_reference() {
        let (_dir, reg) = registry();
        let (user, _) = reg
            .create_user(NewUser { username: "alice".into(), email: None }, "root")
            .unwrap();
        reg.create_policy(
            NewAccessPolicy {
                name: "alice-db".into(),
                subject: Subject::User { id: user.user_id },
                resource: Resource::Service("postgres".into()),
                action: PolicyAction::Allow,
                conditions: PolicyConditions::default(),
                valid_from: None,
                valid_until: None,
                priority: 10,
                enabled: true,
            },
            "root",
        )
        .unwrap();

        assert!(matches!(
            reg.delete_user(user.user_id, "root"),
            Err(Error::ReferentialViolation(_))
        ));
    }

    #[test]
    fn group_cycle_is_rejected() {
        let (_dir, reg) = registry();
        let (a, _) = reg
            .create_group(NewGroup { name: "a".into(), parent_group_id: None, description: None }, "root")
            .unwrap();
        let (b, _) = reg
            .create_group(
                NewGroup { name: "b".into(), parent_group_id: Some(a.group_id), description: None },
                "root",
            )
            .unwrap();

        // a -> parent b while b -> parent a closes a cycle.
        let update = GroupUpdate {
            name: None,
            parent_group_id: Some(Some(b.group_id)),
            description: None,
        };
        assert!(matches!(
            reg.update_group(a.group_id, update, "root"),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn membership_requires_both_rows_and_is_unique() {
        let (_dir, reg) = registry();
        let (user, _) = reg
            .create_user(NewUser { username: "alice".into(), email: None }, "root")
            .unwrap();
        let (group, _) = reg
            .create_group(NewGroup { name: "ops".into(), parent_group_id: None, description: None }, "root")
            .unwrap();

        assert!(matches!(
            reg.add_member(999, user.user_id, MemberRole::Member, "root"),
            Err(Error::ReferentialViolation(_))
        ));

        reg.add_member(group.group_id, user.user_id, MemberRole::Member, "root").unwrap();
        assert!(matches!(
            reg.add_member(group.group_id, user.user_id, MemberRole::Member, "root"),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn policy_priority_must_be_in_range() {
        let (_dir, reg) = registry();
        let result = reg.create_policy(
            NewAccessPolicy {
                name: "bad".into(),
                subject: Subject::All,
                resource: Resource::Zone("dmz".into()),
                action: PolicyAction::Deny,
                conditions: PolicyConditions::default(),
                valid_from: None,
                valid_until: None,
                priority: 0,
                enabled: true,
            },
            "root",
        );
        assert!(matches!(result, Err(Error::Invalid(_))));
    }

    #[test]
    fn policy_subject_must_resolve() {
        let (_dir, reg) = registry();
        let result = reg.create_policy(
            NewAccessPolicy {
                name: "ghost".into(),
                subject: Subject::User { id: 42 },
                resource: Resource::Zone("dmz".into()),
                action: PolicyAction::Allow,
                conditions: PolicyConditions::default(),
                valid_from: None,
                valid_until: None,
                priority: 10,
                enabled: true,
            },
            "root",
        );
        assert!(matches!(result, Err(Error::ReferentialViolation(_))));
    }

    #[test]
    fn acl_policy_mutations_bump_version() {
        let (_dir, reg) = registry();
        let (policy, events) = reg
            .create_acl_policy(
                NewAclPolicy {
                    name: "app-to-db".into(),
                    src_role: NodeRole::App,
                    dst_role: DstRole::Role(NodeRole::Db),
                    port: Some(5432),
                    protocol: Protocol::Tcp,
                    action: RuleAction::Allow,
                    priority: 100,
                    enabled: true,
                },
                "root",
            )
            .unwrap();
        assert_eq!(reg.config_version(), 1);
        assert!(events
            .iter()
            .any(|e| e.event_type == event_type::CONFIG_VERSION_BUMPED));

        reg.delete_acl_policy(policy.id, "root").unwrap();
        assert_eq!(reg.config_version(), 2);
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let overlay: Ipv4Net = "10.0.0.0/24".parse().unwrap();
        {
            let reg = Registry::open(dir.path(), overlay, 10).unwrap();
            let node = reg.register_node(new_node("app-01", NodeRole::App, "K1")).unwrap().node;
            reg.approve_node(node.id, "alice").unwrap();
        }

        let reg = Registry::open(dir.path(), overlay, 10).unwrap();
        let node = reg.node_by_hostname("app-01").unwrap();
        assert_eq!(node.status, NodeStatus::Active);
        assert_eq!(reg.config_version(), 1);

        // The lease table was rebuilt: the next registration must not
        // collide with app-01's address.
        let next = reg.register_node(new_node("app-02", NodeRole::App, "K2")).unwrap().node;
        assert_eq!(next.overlay_ip.to_string(), "10.0.0.3");
    }

    #[test]
    fn hhmm_parsing() {
        assert_eq!(parse_hhmm("00:00"), Some(0));
        assert_eq!(parse_hhmm("09:30"), Some(570));
        assert_eq!(parse_hhmm("23:59"), Some(1439));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("9h30"), None);
    }
}

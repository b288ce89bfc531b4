//! Immutable registry snapshot handed to the policy compiler.
//!
//! Compilation is a pure function of one of these plus a target, which
//! keeps the compiler trivially testable and free of store locking.

use std::collections::HashSet;

use nw_domain::model::{AccessPolicy, AclPolicy, Group, Membership, Node, NodeStatus, User};

#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub nodes: Vec<Node>,
    pub users: Vec<User>,
    pub groups: Vec<Group>,
    pub memberships: Vec<Membership>,
    pub policies: Vec<AccessPolicy>,
    pub acl_policies: Vec<AclPolicy>,
    pub config_version: u64,
}

impl RegistrySnapshot {
    pub fn active_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.status == NodeStatus::Active)
    }

    pub fn node_by_hostname(&self, hostname: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.hostname == hostname)
    }

    pub fn user(&self, user_id: u64) -> Option<&User> {
        self.users.iter().find(|u| u.user_id == user_id)
    }

    pub fn group(&self, group_id: u64) -> Option<&Group> {
        self.groups.iter().find(|g| g.group_id == group_id)
    }

    /// Every group the user belongs to, directly or through group
    /// nesting. Bounded BFS over `parent_group_id`: a visited set stops
    /// the walk even if a cycle slipped past the write-time check.
    pub fn user_groups_transitive(&self, user_id: u64) -> HashSet<u64> {
        let mut result: HashSet<u64> = HashSet::new();
        let mut frontier: Vec<u64> = self
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id)
            .map(|m| m.group_id)
            .collect();

        while let Some(group_id) = frontier.pop() {
            if !result.insert(group_id) {
                continue;
            }
            if let Some(parent) = self.group(group_id).and_then(|g| g.parent_group_id) {
                frontier.push(parent);
            }
        }
        result
    }
}

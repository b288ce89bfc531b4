//! The policy compiler.
//!
//! Three pure compilations over a registry snapshot:
//!
//! - per-node ACL lists from the legacy role-pair rules ([`acl`]),
//! - user × resource access evaluation over the rich policy model
//!   ([`access`]),
//! - the hub tunnel peer set ([`peers`]).
//!
//! The two policy models stay separate on purpose: only the role-pair
//! rules feed agent firewall config, because the rich model's subjects
//! are users, which have no source address a packet filter could match.

pub mod access;
pub mod acl;
pub mod peers;
pub mod templates;

pub use access::{evaluate_access, AccessDecision, ResourceQuery};
pub use acl::compile_node_acl;
pub use peers::compile_peer_set;

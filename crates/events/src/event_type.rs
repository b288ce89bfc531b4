//! The fixed event-type vocabulary.
//!
//! Handlers subscribe against these strings; payload keys are documented
//! next to the publishers.

// Node lifecycle. Approval re-emits `NodeRegistered` with
// `status: "active"` in the payload; the hub peer handler keys on that.
pub const NODE_REGISTERED: &str = "NodeRegistered";
pub const NODE_UPDATED: &str = "NodeUpdated";
pub const NODE_SUSPENDED: &str = "NodeSuspended";
pub const NODE_RESUMED: &str = "NodeResumed";
pub const NODE_REVOKED: &str = "NodeRevoked";
pub const NODE_DELETED: &str = "NodeDeleted";

// Client device lifecycle
pub const CLIENT_CREATED: &str = "ClientCreated";
pub const CLIENT_UPDATED: &str = "ClientUpdated";
pub const CLIENT_DELETED: &str = "ClientDeleted";

// Users, groups, memberships
pub const USER_CREATED: &str = "UserCreated";
pub const USER_UPDATED: &str = "UserUpdated";
pub const USER_DELETED: &str = "UserDeleted";
pub const GROUP_CREATED: &str = "GroupCreated";
pub const GROUP_UPDATED: &str = "GroupUpdated";
pub const GROUP_DELETED: &str = "GroupDeleted";
pub const MEMBER_ADDED: &str = "MemberAdded";
pub const MEMBER_REMOVED: &str = "MemberRemoved";

// Policies (both the rich and the legacy role-pair model)
pub const POLICY_CREATED: &str = "PolicyCreated";
pub const POLICY_UPDATED: &str = "PolicyUpdated";
pub const POLICY_DELETED: &str = "PolicyDeleted";

// IP pool
pub const IP_ALLOCATED: &str = "IPAllocated";
pub const IP_RELEASED: &str = "IPReleased";
pub const IP_POOL_LOW: &str = "IPPoolLow";
pub const IP_POOL_EXHAUSTED: &str = "IPPoolExhausted";

// Config versioning
pub const CONFIG_VERSION_BUMPED: &str = "ConfigVersionBumped";

// Hub peer mutations
pub const PEER_ADDED: &str = "PeerAdded";
pub const PEER_REMOVED: &str = "PeerRemoved";
pub const PEERS_SYNCED: &str = "PeersSynced";

// Trust & security
pub const INTEGRITY_VERIFIED: &str = "IntegrityVerified";
pub const INTEGRITY_MISMATCH: &str = "IntegrityMismatch";
pub const TRUST_PENALTY_APPLIED: &str = "TrustPenaltyApplied";
pub const SECURITY_ALERT: &str = "SecurityAlert";

/// Every type in the vocabulary; the persistence subscriber registers
/// against each of these at startup.
pub fn all() -> &'static [&'static str] {
    &[
        NODE_REGISTERED,
        NODE_UPDATED,
        NODE_SUSPENDED,
        NODE_RESUMED,
        NODE_REVOKED,
        NODE_DELETED,
        CLIENT_CREATED,
        CLIENT_UPDATED,
        CLIENT_DELETED,
        USER_CREATED,
        USER_UPDATED,
        USER_DELETED,
        GROUP_CREATED,
        GROUP_UPDATED,
        GROUP_DELETED,
        MEMBER_ADDED,
        MEMBER_REMOVED,
        POLICY_CREATED,
        POLICY_UPDATED,
        POLICY_DELETED,
        IP_ALLOCATED,
        IP_RELEASED,
        IP_POOL_LOW,
        IP_POOL_EXHAUSTED,
        CONFIG_VERSION_BUMPED,
        PEER_ADDED,
        PEER_REMOVED,
        PEERS_SYNCED,
        INTEGRITY_VERIFIED,
        INTEGRITY_MISMATCH,
        TRUST_PENALTY_APPLIED,
        SECURITY_ALERT,
    ]
}

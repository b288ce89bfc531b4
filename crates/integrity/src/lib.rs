//! Agent integrity verification.
//!
//! Admins bless an expected digest of the agent's code (per node, per
//! version, or globally); agents report their current digest on every
//! heartbeat. Repeated mismatches walk a progressive-penalty ladder:
//! warn, suspend, revoke.
//!
//! The verifier mutates the node it is handed and returns an outcome
//! carrying the audit trail; persisting the node and emitting lifecycle
//! events is the registry's job, which keeps this state machine free of
//! storage concerns.

use std::collections::HashMap;

use parking_lot::RwLock;

use nw_domain::model::{AuditRecord, AuditSeverity, Node, NodeStatus};
use nw_domain::{Error, Result};

/// Mismatch counts at which each penalty applies.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub warn: u32,
    pub suspend: u32,
    pub revoke: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds { warn: 1, suspend: 3, revoke: 5 }
    }
}

/// Trust deducted per consecutive mismatch.
pub const TRUST_PENALTY_STEP: f64 = 0.3;
/// Penalty ceiling.
pub const TRUST_PENALTY_MAX: f64 = 0.9;

/// What `verify` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyAction {
    NoExpectedHash,
    Verified,
    MismatchWarning,
    Suspended,
    Revoked,
}

impl VerifyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerifyAction::NoExpectedHash => "no_expected_hash",
            VerifyAction::Verified => "verified",
            VerifyAction::MismatchWarning => "mismatch_warning",
            VerifyAction::Suspended => "suspended",
            VerifyAction::Revoked => "revoked",
        }
    }
}

/// Outcome of one verification or approval.
#[derive(Debug)]
pub struct VerifyOutcome {
    pub valid: bool,
    pub action: VerifyAction,
    /// Audit rows produced by this transition, for the registry to
    /// append inside the persisting write.
    pub audits: Vec<AuditRecord>,
    pub status_changed: bool,
}

/// The per-node hash state machine.
pub struct IntegrityVerifier {
    thresholds: Thresholds,
    /// Fallback expected hash for every agent.
    global_expected_hash: RwLock<Option<String>>,
    /// Known-good hashes keyed by agent version.
    known_good: RwLock<HashMap<String, String>>,
}

impl Default for IntegrityVerifier {
    fn default() -> Self {
        Self::new(Thresholds::default())
    }
}

impl IntegrityVerifier {
    pub fn new(thresholds: Thresholds) -> Self {
        IntegrityVerifier {
            thresholds,
            global_expected_hash: RwLock::new(None),
            known_good: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_global_expected_hash(&self, hash: impl Into<String>) {
        let hash = hash.into();
        tracing::info!(hash = %truncated(&hash), "global agent hash set");
        *self.global_expected_hash.write() = Some(hash);
    }

    pub fn global_expected_hash(&self) -> Option<String> {
        self.global_expected_hash.read().clone()
    }

    pub fn register_known_hash(&self, version: impl Into<String>, hash: impl Into<String>) {
        let version = version.into();
        let hash = hash.into();
        tracing::info!(version = %version, hash = %truncated(&hash), "registered known-good agent hash");
        self.known_good.write().insert(version, hash);
    }

    pub fn known_hashes(&self) -> HashMap<String, String> {
        self.known_good.read().clone()
    }

    /// Expected hash for a node: node-specific pin, then the known-good
    /// hash for its agent version, then the global fallback.
    pub fn expected_hash(&self, node: &Node) -> Option<String> {
        if let Some(hash) = &node.agent_hash {
            return Some(hash.clone());
        }
        if let Some(version) = &node.agent_version {
            if let Some(hash) = self.known_good.read().get(version) {
                return Some(hash.clone());
            }
        }
        self.global_expected_hash.read().clone()
    }

    /// Run one reported hash through the state machine.
    ///
    /// Mutates `node` (reported hash, verified flag, mismatch count and
    /// possibly status); the caller persists it and emits the lifecycle
    /// event for any status change.
    pub fn verify(&self, node: &mut Node, reported_hash: &str) -> VerifyOutcome {
        let expected = self.expected_hash(node);
        let mut audits = Vec::new();

        // First report ever from this node: record it for admin review.
        let first_report = node.agent_hash.is_none() && node.last_reported_hash.is_none();

        node.last_reported_hash = Some(reported_hash.to_string());

        let Some(expected) = expected else {
            if first_report {
                tracing::info!(
                    hostname = %node.hostname,
                    hash = %truncated(reported_hash),
                    "first hash report, awaiting admin approval"
                );
                audits.push(
                    AuditRecord::system(
                        "INTEGRITY_FIRST_REPORT",
                        "node",
                        node.id,
                        format!("hash={}", truncated(reported_hash)),
                    )
                    .with_actor("system", "integrity")
                    .with_source_ip(node.real_ip.clone()),
                );
            }
            node.hash_verified = false;
            return VerifyOutcome {
                valid: true,
                action: VerifyAction::NoExpectedHash,
                audits,
                status_changed: false,
            };
        };

        if reported_hash == expected {
            if !node.hash_verified || node.hash_mismatch_count > 0 {
                tracing::info!(hostname = %node.hostname, "agent integrity verified");
                audits.push(
                    AuditRecord::system(
                        "INTEGRITY_VERIFIED",
                        "node",
                        node.id,
                        format!("hash={}", truncated(reported_hash)),
                    )
                    .with_actor("system", "integrity")
                    .with_source_ip(node.real_ip.clone()),
                );
            }
            node.hash_verified = true;
            node.hash_mismatch_count = 0;
            return VerifyOutcome {
                valid: true,
                action: VerifyAction::Verified,
                audits,
                status_changed: false,
            };
        }

        // Mismatch.
        node.hash_verified = false;
        node.hash_mismatch_count += 1;
        let count = node.hash_mismatch_count;

        tracing::warn!(
            hostname = %node.hostname,
            expected = %truncated(&expected),
            reported = %truncated(reported_hash),
            count,
            "agent integrity mismatch"
        );

        let severity = if count < self.thresholds.suspend {
            AuditSeverity::Warning
        } else {
            AuditSeverity::Critical
        };
        audits.push(
            AuditRecord::system(
                "INTEGRITY_MISMATCH",
                "node",
                node.id,
                format!(
                    "expected={}, got={}, count={count}",
                    truncated(&expected),
                    truncated(reported_hash)
                ),
            )
            .with_actor("system", "integrity")
            .with_severity(severity)
            .with_source_ip(node.real_ip.clone()),
        );

        let (action, status_changed) = if count >= self.thresholds.revoke {
            node.status = NodeStatus::Revoked;
            tracing::error!(hostname = %node.hostname, "node revoked for persistent integrity mismatch");
            (VerifyAction::Revoked, true)
        } else if count >= self.thresholds.suspend {
            node.status = NodeStatus::Suspended;
            tracing::error!(hostname = %node.hostname, "node suspended for integrity mismatch");
            (VerifyAction::Suspended, true)
        } else {
            (VerifyAction::MismatchWarning, false)
        };

        VerifyOutcome { valid: false, action, audits, status_changed }
    }

    /// Trust deduction for unverified nodes: 0.3 per mismatch, capped
    /// at 0.9; zero when verified or clean.
    pub fn trust_penalty(&self, node: &Node) -> f64 {
        if node.hash_verified || node.hash_mismatch_count == 0 {
            return 0.0;
        }
        (TRUST_PENALTY_STEP * node.hash_mismatch_count as f64).min(TRUST_PENALTY_MAX)
    }

    /// Admin action: bless the most recent reported hash as the
    /// expected one. Fails if the agent has never reported.
    pub fn approve(&self, node: &mut Node) -> Result<VerifyOutcome> {
        let reported = node
            .last_reported_hash
            .clone()
            .ok_or_else(|| Error::Invalid(format!("no reported hash for {}", node.hostname)))?;

        node.agent_hash = Some(reported.clone());
        node.hash_verified = true;
        node.hash_mismatch_count = 0;

        tracing::info!(hostname = %node.hostname, hash = %truncated(&reported), "approved agent hash");

        Ok(VerifyOutcome {
            valid: true,
            action: VerifyAction::Verified,
            audits: vec![
                AuditRecord::system(
                    "INTEGRITY_APPROVED",
                    "node",
                    node.id,
                    format!("hash={}", truncated(&reported)),
                )
                .with_actor("admin", "integrity")
                .with_source_ip(node.real_ip.clone()),
            ],
            status_changed: false,
        })
    }
}

fn truncated(hash: &str) -> String {
    let head: String = hash.chars().take(16).collect();
    format!("{head}...")
}

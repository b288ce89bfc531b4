//! Agent-side library: the node reconciler, the hub command executor,
//! and their shared plumbing (HTTP client, push channel, reconnect
//! policy, integrity self-reporting, host metrics).
//!
//! Tunnel and firewall manipulation live behind the [`executor`]
//! traits; everything on this side of that boundary is pure
//! reconciliation logic and stays testable without touching the
//! kernel.

pub mod backoff;
pub mod client;
pub mod executor;
pub mod hub;
pub mod integrity;
pub mod metrics;
pub mod push;
pub mod reconciler;

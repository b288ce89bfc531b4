//! The NetWarden control plane daemon.
//!
//! Reconciles the declared registry (nodes, users, groups, policies)
//! with the runtime state of the hub tunnel and per-node packet
//! filters: the admin API mutates the registry, the event bus fans the
//! mutation out, and the two agent channels carry peer commands to the
//! hub and config invalidations to the node agents.

pub mod api;
pub mod channels;
pub mod handlers;
pub mod service;
pub mod state;

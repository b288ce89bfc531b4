//! The durable registry: entity store, IP allocation, audit log and
//! event store.
//!
//! The registry is the single writer of record. Every successful
//! mutation runs under one write lock ("the transaction"), appends an
//! audit row, persists the touched collection, and hands back the
//! domain events for the caller to publish *after* commit.

pub mod audit;
pub mod event_store;
pub mod ipam;
pub mod snapshot;
pub mod store;

pub use audit::AuditLog;
pub use event_store::EventStore;
pub use ipam::{IpAllocator, IpOwner};
pub use snapshot::RegistrySnapshot;
pub use store::Registry;

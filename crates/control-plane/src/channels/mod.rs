//! Long-lived agent transports: the hub command channel and the node
//! push channels, plus their axum WebSocket endpoints.

pub mod agents;
pub mod hub;
pub mod ws;

//! Shared domain types for NetWarden: the entity model, configuration,
//! and the error taxonomy used across all crates.

pub mod config;
pub mod error;
pub mod model;

pub use error::{Error, Result};

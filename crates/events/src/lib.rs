//! In-process event bus with priority-ordered delivery.
//!
//! Publishers emit domain events without knowing their consumers;
//! subscribers register per event type with a priority and a retry
//! budget. Delivery is at-least-once within a handler (failed handlers
//! are retried), so handlers must be idempotent. A handler exhausting
//! its retries is logged and swallowed; it never poisons later handlers
//! or the mutation that published the event.
//!
//! The bus is an ordinary value constructed at startup and passed
//! through the application wiring; tests build isolated instances.

mod bus;
pub mod event_type;

pub use bus::{Event, EventBus, Priority};

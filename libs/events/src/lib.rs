//! # fleet-events
//!
//! Wire types for everything that crosses the orchestrator's boundary
//! with node agents, plus the notification event-type constants.
//!
//! ## Design Principles
//!
//! - Inbound agent data is untrusted; decoding is the validation boundary.
//!   A payload that decodes is well-formed; everything else is rejected as
//!   `INVALID_REQUEST` before any state machine sees it.
//! - "Exactly one of running | done" is a parse-time guarantee: worker
//!   events are a sum type, never a struct of optionals.
//! - Events and commands are serde-serializable records; the work queue
//!   carries them as JSON with at-least-once, unordered delivery.

mod commands;
mod envelope;
mod error;
mod types;

pub use commands::*;
pub use envelope::*;
pub use error::EventError;
pub use types::*;

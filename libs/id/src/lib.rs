//! # fleet-id
//!
//! Stable ID types, parsing, and validation for the fuzzfleet orchestrator.
//!
//! ## Design Principles
//!
//! - IDs are stable and system-generated; names are user-controlled labels
//! - All IDs have a canonical string representation with strict parsing
//! - IDs support roundtrip serialization (parse → format → parse)
//! - IDs are typed to prevent mixing different resource types
//!
//! ## ID Format
//!
//! All resource IDs are UUIDs, serialized as the plain hyphenated string.
//! Agents identify themselves on the wire by a bare `machine_id` UUID, so
//! every ID type shares that representation rather than a typed prefix.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;

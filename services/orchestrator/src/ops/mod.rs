//! Operations surface.
//!
//! The CRUD and query calls the (external) HTTP API layer consumes. Each
//! function validates its inputs against live entity state and returns an
//! [`crate::error::ApiError`] with a stable code on failure. The HTTP skin,
//! authentication, and serialization of responses all live outside this
//! crate.

pub mod events;
pub mod jobs;
pub mod nodes;
pub mod pools;
pub mod scalesets;
pub mod tasks;

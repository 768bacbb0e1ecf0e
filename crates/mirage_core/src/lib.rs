//! Foundational types for the Mirage scene mirror.
//!
//! - [`Incarnation`]: version stamps used for pull-based staleness detection
//! - [`handles`]: node handles, DAL links and kind enums shared by all crates
//! - [`errors`]: the crate-wide error type

pub mod errors;
pub mod handles;
pub mod incarnation;

pub use errors::{BackendError, MirageError, Result};
pub use handles::{CreatorId, DalKey, DalKind, DalLink, NodeHandle, ResourceKind};
pub use incarnation::{Incarnation, IncarnationGuard};

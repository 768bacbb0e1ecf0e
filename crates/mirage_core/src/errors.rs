//! Error Types
//!
//! [`MirageError`] covers every failure the mirror surfaces to callers:
//! - backend construction or update failures during a rebuild
//! - invalid scene edits (cycles, bad child indices, wrong node kind)
//! - inconsistent skin tables
//!
//! Bookkeeping misses (releasing an entry twice, looking up a link whose
//! entry is gone) are not errors; they are absorbed as no-ops where they occur.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mirage_core::errors::{MirageError, Result};
//!
//! fn rebuild() -> Result<()> {
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use crate::handles::{NodeHandle, ResourceKind};

/// Failures reported by a backend execution service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not create the object.
    #[error("failed to create {kind:?}: {reason}")]
    CreationFailed { kind: ResourceKind, reason: String },

    /// The backend rejected an in-place update.
    #[error("failed to update {kind:?}: {reason}")]
    UpdateFailed { kind: ResourceKind, reason: String },

    /// The handle does not name a live backend object.
    #[error("unknown backend handle {0}")]
    UnknownHandle(u64),

    /// The backend does not support the operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// The main error type for the Mirage mirror.
#[derive(Error, Debug)]
pub enum MirageError {
    // ========================================================================
    // Backend Errors
    // ========================================================================
    /// Building or updating the backend form of a node failed. The subtree
    /// rooted at `node` is not published for this pass.
    #[error("backend failure on {kind:?} for node {node:?}: {source}")]
    Backend {
        kind: ResourceKind,
        node: NodeHandle,
        #[source]
        source: BackendError,
    },

    // ========================================================================
    // Scene Errors
    // ========================================================================
    /// The node does not exist (anymore).
    #[error("node not found: {0:?}")]
    NodeNotFound(NodeHandle),

    /// Adding the edge would make `parent` its own descendant.
    #[error("attaching {child:?} under {parent:?} would create a cycle")]
    CycleDetected { parent: NodeHandle, child: NodeHandle },

    /// A child index was outside the child list.
    #[error("child index {index} out of range for {node:?} ({len} children)")]
    ChildIndexOutOfRange {
        node: NodeHandle,
        index: usize,
        len: usize,
    },

    /// Type-checked node access failed.
    #[error("node {node:?} is not a {expected}")]
    KindMismatch {
        node: NodeHandle,
        expected: &'static str,
    },

    // ========================================================================
    // Skinning Errors
    // ========================================================================
    /// The skin does not exist (anymore).
    #[error("skin not found")]
    SkinNotFound,

    /// Skin tables disagree with each other or with their target geometry.
    #[error("invalid skin: {0}")]
    InvalidSkin(String),
}

impl MirageError {
    /// Wraps a backend error with the resource kind and scene node it concerns.
    #[must_use]
    pub fn backend(kind: ResourceKind, node: NodeHandle, source: BackendError) -> Self {
        MirageError::Backend { kind, node, source }
    }
}

/// Alias for `Result<T, MirageError>`.
pub type Result<T> = std::result::Result<T, MirageError>;

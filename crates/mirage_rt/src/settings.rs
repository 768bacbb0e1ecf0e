//! Mirror Settings
//!
//! ```rust,ignore
//! use mirage_rt::MirrorSettings;
//!
//! // Always replace handles and keep billboard instances forever
//! let settings = MirrorSettings {
//!     update_in_place: false,
//!     prune_instances: false,
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};

use mirage_scene::BuildHints;

/// Configuration of an [`RtTraverser`](crate::RtTraverser).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorSettings {
    /// Hints OR'd into every geometry group's own hints.
    pub default_build_hints: BuildHints,

    /// Rebuild stale entries through `RtBackend::update` when the backend
    /// supports it. When `false`, stale entries always get a new handle.
    pub update_in_place: bool,

    /// Destroy billboard instances whose path was not visited recently.
    pub prune_instances: bool,

    /// Passes an instance may go unvisited before it is pruned.
    pub instance_ttl_passes: u64,

    /// Record a `(node, kind, state)` event for every validity check.
    pub record_trace: bool,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            default_build_hints: BuildHints::empty(),
            update_in_place: true,
            prune_instances: true,
            instance_ttl_passes: 3,
            record_trace: false,
        }
    }
}

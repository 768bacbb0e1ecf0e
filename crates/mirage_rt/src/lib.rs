//! Ray-tracing mirror of a Mirage scene.
//!
//! Each scene node gets at most one cache entry per [`DalCreator`]. Entries
//! remember the node incarnations they were built from; [`RtTraverser`]
//! compares those snapshots against the live scene every pass and rebuilds
//! only what moved.
//!
//! # Modules
//!
//! - [`backend`]: the [`RtBackend`] seam plus an in-memory [`HeadlessBackend`]
//! - [`cache`]: per-node cache entries
//! - [`validity`]: staleness rules per entry kind
//! - [`instance`]: interned instance paths for billboards under shared parents
//! - [`creator`]: entry pools owned by one backend context
//! - [`traverser`]: the per-pass sync and launch

pub mod backend;
pub mod cache;
pub mod creator;
pub mod instance;
pub mod settings;
pub mod traverser;
pub mod validity;

pub use backend::{
    BackendCall, BackendCounters, BackendResult, GeometryInstance, HeadlessBackend, HeadlessObject,
    ResourceDesc, RtBackend, RtHandle,
};
pub use cache::{CachePayload, DalData, InstanceTransform, MaterialOwnership, PathVariant};
pub use creator::DalCreator;
pub use instance::{InstanceId, InstanceKeyMap, InstancePath};
pub use settings::MirrorSettings;
pub use traverser::{PublishedScene, RtTraverser, SyncStats, TraceEvent};
pub use validity::{CacheState, StaleFlags};

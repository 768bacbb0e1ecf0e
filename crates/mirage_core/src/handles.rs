//! Handles shared between the scene and the backend mirror.
//!
//! The scene never stores pointers into a creator. A node's DAL slot holds a
//! [`DalLink`]: the creator that owns the entry, the entry kind and a
//! generational [`DalKey`] into that creator's per-kind arena. A link that
//! outlives its entry simply fails to resolve.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use slotmap::new_key_type;

new_key_type! {
    /// Identifies a node in a scene.
    pub struct NodeHandle;
    /// Identifies a cache entry inside one per-kind arena of a creator.
    pub struct DalKey;
}

static NEXT_CREATOR_ID: AtomicU32 = AtomicU32::new(1);

/// Identity of one resource creator (one backend context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CreatorId(u32);

impl CreatorId {
    /// Allocates a process-unique creator id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CREATOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CreatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "creator#{}", self.0)
    }
}

/// Kinds of cache entries a creator registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DalKind {
    Buffer,
    Geometry,
    GeometryGroup,
    Group,
    Material,
    Effect,
    Selector,
    Transform,
    Billboard,
    TextureSampler,
}

impl DalKind {
    pub const COUNT: usize = 10;

    pub const ALL: [DalKind; Self::COUNT] = [
        DalKind::Buffer,
        DalKind::Geometry,
        DalKind::GeometryGroup,
        DalKind::Group,
        DalKind::Material,
        DalKind::Effect,
        DalKind::Selector,
        DalKind::Transform,
        DalKind::Billboard,
        DalKind::TextureSampler,
    ];

    /// Dense index, used to address per-kind arenas.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Kinds of backend objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Buffer,
    Geometry,
    GeometryGroup,
    Group,
    Material,
    Program,
    Selector,
    Transform,
    TextureSampler,
}

/// What a node's DAL slot stores for one creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DalLink {
    pub creator: CreatorId,
    pub kind: DalKind,
    pub key: DalKey,
}

impl DalLink {
    #[must_use]
    pub fn new(creator: CreatorId, kind: DalKind, key: DalKey) -> Self {
        Self { creator, kind, key }
    }
}

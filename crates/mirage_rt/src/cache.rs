//! Cache entry family
//!
//! A [`DalData`] is the backend mirror of one scene node inside one creator.
//! The common part holds the source node, the incarnation snapshot taken at
//! the last build, the primary backend handle and the dependency handles the
//! object was linked against. [`CachePayload`] carries the per-kind extras.

use glam::Affine3A;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use mirage_core::{DalKind, Incarnation, NodeHandle};
use mirage_scene::{BuildHints, NodeIncarnations, NodeKind, ProgramDomain};

use crate::backend::RtHandle;
use crate::instance::InstanceId;

/// Whether a material entry owns its backend material or borrows the
/// creator's shared default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialOwnership {
    Owned,
    Borrowed,
}

/// Per-path transform of a billboard instance.
#[derive(Debug, Clone, Copy)]
pub struct InstanceTransform {
    pub handle: RtHandle,
    pub placement: Affine3A,
    /// Own incarnation of the billboard when the placement was written.
    pub own: Incarnation,
    /// Children group the transform points at.
    pub child: RtHandle,
    pub last_seen: u64,
}

/// Backend object of a shared container for one instance path whose
/// subtree resolved to other handles than the primary object links.
#[derive(Debug, Clone)]
pub struct PathVariant {
    pub handle: RtHandle,
    pub linked: SmallVec<[RtHandle; 8]>,
    pub snapshot: NodeIncarnations,
    pub last_seen: u64,
}

#[derive(Debug, Clone)]
pub enum CachePayload {
    Buffer,
    /// The geometry handle is primary; the vertex buffer is owned alongside it.
    Geometry {
        vertices: RtHandle,
    },
    /// Build hints the acceleration structure was built with.
    GeometryGroup {
        hints: BuildHints,
    },
    Group,
    Selector {
        selection: Incarnation,
    },
    Transform,
    /// The primary handle groups the children; each instance path gets its
    /// own transform on top.
    Billboard {
        instances: FxHashMap<InstanceId, InstanceTransform>,
    },
    Material {
        ownership: MaterialOwnership,
        /// Program incarnation of the effect at build time.
        program: Incarnation,
    },
    /// One program per domain, sorted by domain.
    Effect {
        programs: SmallVec<[(ProgramDomain, RtHandle); 4]>,
        program: Incarnation,
    },
    TextureSampler,
}

impl CachePayload {
    #[must_use]
    pub fn kind(&self) -> DalKind {
        match self {
            CachePayload::Buffer => DalKind::Buffer,
            CachePayload::Geometry { .. } => DalKind::Geometry,
            CachePayload::GeometryGroup { .. } => DalKind::GeometryGroup,
            CachePayload::Group => DalKind::Group,
            CachePayload::Selector { .. } => DalKind::Selector,
            CachePayload::Transform => DalKind::Transform,
            CachePayload::Billboard { .. } => DalKind::Billboard,
            CachePayload::Material { .. } => DalKind::Material,
            CachePayload::Effect { .. } => DalKind::Effect,
            CachePayload::TextureSampler => DalKind::TextureSampler,
        }
    }
}

/// Backend mirror of one scene node.
#[derive(Debug, Clone)]
pub struct DalData {
    pub(crate) source: NodeHandle,
    pub(crate) snapshot: NodeIncarnations,
    pub(crate) handle: Option<RtHandle>,
    pub(crate) linked: SmallVec<[RtHandle; 8]>,
    pub(crate) payload: CachePayload,
    /// Per-path objects of a container reached through several paths.
    pub(crate) variants: FxHashMap<InstanceId, PathVariant>,
    pub(crate) last_visited: u64,
}

impl DalData {
    #[must_use]
    pub fn new(
        source: NodeHandle,
        snapshot: NodeIncarnations,
        handle: Option<RtHandle>,
        payload: CachePayload,
    ) -> Self {
        Self {
            source,
            snapshot,
            handle,
            linked: SmallVec::new(),
            payload,
            variants: FxHashMap::default(),
            last_visited: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn source(&self) -> NodeHandle {
        self.source
    }

    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> NodeIncarnations {
        self.snapshot
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> Option<RtHandle> {
        self.handle
    }

    #[inline]
    #[must_use]
    pub fn linked(&self) -> &[RtHandle] {
        &self.linked
    }

    #[inline]
    #[must_use]
    pub fn payload(&self) -> &CachePayload {
        &self.payload
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> DalKind {
        self.payload.kind()
    }

    /// `false` only for materials borrowing the shared default.
    #[must_use]
    pub fn owns_handle(&self) -> bool {
        !matches!(
            self.payload,
            CachePayload::Material {
                ownership: MaterialOwnership::Borrowed,
                ..
            }
        )
    }

    /// Billboard instances, if this is a billboard entry.
    #[must_use]
    pub fn instances(&self) -> Option<&FxHashMap<InstanceId, InstanceTransform>> {
        match &self.payload {
            CachePayload::Billboard { instances } => Some(instances),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn variants(&self) -> &FxHashMap<InstanceId, PathVariant> {
        &self.variants
    }

    /// Effect programs, if this is an effect entry.
    #[must_use]
    pub fn programs(&self) -> Option<&[(ProgramDomain, RtHandle)]> {
        match &self.payload {
            CachePayload::Effect { programs, .. } => Some(programs),
            _ => None,
        }
    }

    /// Every backend handle this entry is responsible for destroying.
    #[must_use]
    pub fn owned_handles(&self) -> SmallVec<[RtHandle; 4]> {
        let mut out = SmallVec::new();
        if self.owns_handle()
            && let Some(h) = self.handle
        {
            out.push(h);
        }
        match &self.payload {
            CachePayload::Geometry { vertices } => out.push(*vertices),
            CachePayload::Billboard { instances } => {
                out.extend(instances.values().map(|i| i.handle));
            }
            CachePayload::Effect { programs, .. } => {
                out.extend(programs.iter().map(|(_, h)| *h));
            }
            _ => {}
        }
        out.extend(self.variants.values().map(|v| v.handle));
        out
    }
}

/// Entry kind used to mirror a node of the given kind.
#[must_use]
pub fn dal_kind_of(kind: &NodeKind) -> DalKind {
    match kind {
        NodeKind::Group => DalKind::Group,
        NodeKind::Transform(_) => DalKind::Transform,
        NodeKind::Billboard(_) => DalKind::Billboard,
        NodeKind::Switch(_) => DalKind::Selector,
        NodeKind::GeoNode(_) => DalKind::GeometryGroup,
        NodeKind::Geometry(_) => DalKind::Geometry,
        NodeKind::Material(_) => DalKind::Material,
        NodeKind::Effect(_) => DalKind::Effect,
        NodeKind::Buffer(_) => DalKind::Buffer,
        NodeKind::Sampler(_) => DalKind::TextureSampler,
    }
}

//! Backend execution service
//!
//! The mirror talks to a ray-tracing runtime only through [`RtBackend`]:
//! create, update, mark-dirty, destroy and launch. Objects are described by
//! a borrowed [`ResourceDesc`] and named by opaque [`RtHandle`]s.

mod headless;

pub use headless::{BackendCall, BackendCounters, HeadlessBackend, HeadlessObject};

use glam::Affine3A;

use mirage_core::{BackendError, ResourceKind};
use mirage_scene::{BuildHints, MaterialParams, ProgramDomain, SamplerParams};

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a backend object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RtHandle(pub(crate) u64);

impl RtHandle {
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// One geometry/material pair inside a geometry group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryInstance {
    pub geometry: RtHandle,
    pub material: RtHandle,
}

/// Description of a backend object, borrowed from scene data for the
/// duration of a create or update call.
#[derive(Debug, Clone)]
pub enum ResourceDesc<'a> {
    Buffer {
        bytes: &'a [u8],
        stride: u32,
    },
    Geometry {
        vertices: RtHandle,
        primitive_count: u32,
    },
    GeometryGroup {
        instances: &'a [GeometryInstance],
        hints: BuildHints,
    },
    Group {
        children: &'a [RtHandle],
    },
    /// Only the currently selected children.
    Selector {
        children: &'a [RtHandle],
    },
    Transform {
        matrix: Affine3A,
        children: &'a [RtHandle],
    },
    Material {
        programs: &'a [RtHandle],
        samplers: &'a [RtHandle],
        params: MaterialParams,
    },
    Program {
        domain: ProgramDomain,
        entry_point: &'a str,
        source: &'a str,
    },
    TextureSampler {
        buffer: Option<RtHandle>,
        params: SamplerParams,
    },
}

impl ResourceDesc<'_> {
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceDesc::Buffer { .. } => ResourceKind::Buffer,
            ResourceDesc::Geometry { .. } => ResourceKind::Geometry,
            ResourceDesc::GeometryGroup { .. } => ResourceKind::GeometryGroup,
            ResourceDesc::Group { .. } => ResourceKind::Group,
            ResourceDesc::Selector { .. } => ResourceKind::Selector,
            ResourceDesc::Transform { .. } => ResourceKind::Transform,
            ResourceDesc::Material { .. } => ResourceKind::Material,
            ResourceDesc::Program { .. } => ResourceKind::Program,
            ResourceDesc::TextureSampler { .. } => ResourceKind::TextureSampler,
        }
    }

    /// Every handle the described object points at.
    #[must_use]
    pub fn references(&self) -> Vec<RtHandle> {
        match self {
            ResourceDesc::Buffer { .. } | ResourceDesc::Program { .. } => Vec::new(),
            ResourceDesc::Geometry { vertices, .. } => vec![*vertices],
            ResourceDesc::GeometryGroup { instances, .. } => instances
                .iter()
                .flat_map(|i| [i.geometry, i.material])
                .collect(),
            ResourceDesc::Group { children }
            | ResourceDesc::Selector { children }
            | ResourceDesc::Transform { children, .. } => children.to_vec(),
            ResourceDesc::Material {
                programs, samplers, ..
            } => programs.iter().chain(samplers.iter()).copied().collect(),
            ResourceDesc::TextureSampler { buffer, .. } => buffer.iter().copied().collect(),
        }
    }
}

/// Resource-lifecycle service of one ray-tracing context.
pub trait RtBackend {
    fn create(&mut self, desc: &ResourceDesc<'_>) -> BackendResult<RtHandle>;

    /// Whether objects of `kind` can be rebuilt in place through [`RtBackend::update`].
    fn supports_update(&self, kind: ResourceKind) -> bool;

    fn update(&mut self, handle: RtHandle, desc: &ResourceDesc<'_>) -> BackendResult<()>;

    /// Requests an acceleration-structure refit on the next launch.
    fn mark_dirty(&mut self, handle: RtHandle) -> BackendResult<()>;

    fn destroy(&mut self, handle: RtHandle);

    fn launch(
        &mut self,
        ray_generation: RtHandle,
        root: RtHandle,
        width: u32,
        height: u32,
    ) -> BackendResult<()>;
}

//! # Mirage
//!
//! Incarnation-versioned mirroring of a mutable scene graph into ray-tracing
//! backend resources.
//!
//! A [`Scene`] stamps every node with own/tree/bounding incarnations. The
//! mirror ([`RtTraverser`]) keeps one cache entry per node and backend
//! context, compares the stamps it built from with the live ones each pass,
//! and rebuilds only what moved. [`MirageEngine`] runs a whole frame:
//! animation and skinning first, then the mirror pass, then the launch.
//!
//! ```rust,ignore
//! use mirage::prelude::*;
//!
//! let mut scene = Scene::new();
//! let root = scene.create_group();
//! scene.set_root(Some(root))?;
//!
//! let mut engine = MirageEngine::new(HeadlessBackend::new(), EngineSettings::default());
//! let report = engine.render_frame(&mut scene, &ViewState::default(), 0, 640, 480)?;
//! ```

pub mod engine;
pub mod settings;

pub use mirage_animation as animation;
pub use mirage_rt as rt;
pub use mirage_scene as scene;

pub use engine::{FrameReport, MirageEngine, SharedScene, shared_scene};
pub use settings::EngineSettings;

pub use mirage_animation::{AnimationSettings, AppFrameReport, AppTraverser, FramedTransformAnimation};
pub use mirage_core::{
    BackendError, CreatorId, DalKind, DalLink, Incarnation, MirageError, NodeHandle, ResourceKind,
    Result,
};
pub use mirage_rt::{
    CacheState, HeadlessBackend, MirrorSettings, PublishedScene, RtBackend, RtHandle, RtTraverser,
    SyncStats,
};
pub use mirage_scene::{BillboardAlignment, BuildHints, NodeKind, Scene, ViewState};

pub mod prelude {
    pub use crate::engine::{FrameReport, MirageEngine, SharedScene, shared_scene};
    pub use crate::settings::EngineSettings;
    pub use mirage_animation::{FramedTransformAnimation, SkinningProcessorKind};
    pub use mirage_core::{MirageError, NodeHandle, Result};
    pub use mirage_rt::{HeadlessBackend, RtBackend, RtHandle};
    pub use mirage_scene::{
        BillboardAlignment, BuildHints, MaterialParams, ProgramDomain, ProgramSource, Scene, Skin,
        ViewState,
    };
}

//! Frame driver
//!
//! [`MirageEngine`] owns one application traverser and one scene mirror and
//! runs a frame in three steps:
//!
//! 1. [`AppTraverser::apply`]: animation and batched skinning
//! 2. [`RtTraverser::sync`]: bring every reachable cache entry up to date
//! 3. [`RtTraverser::launch`]: trace with the published root
//!
//! The engine is backend-agnostic. Tests and the demo drive it with the
//! [`HeadlessBackend`](mirage_rt::HeadlessBackend).
//!
//! # Example
//!
//! ```rust,ignore
//! let mut engine = MirageEngine::new(HeadlessBackend::new(), EngineSettings::default());
//! for tick in 0..60 {
//!     let report = engine.render_frame(&mut scene, &view, tick, 640, 480)?;
//!     log::info!("{:?}", report.sync);
//! }
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use mirage_animation::{AppFrameReport, AppTraverser};
use mirage_core::Result;
use mirage_rt::{PublishedScene, RtBackend, RtTraverser, SyncStats};
use mirage_scene::{Scene, ViewState};

use crate::settings::EngineSettings;

/// A scene shared between an editing thread and the frame driver.
///
/// Mutation and the mirror pass must not overlap; [`MirageEngine::render_shared`]
/// holds the write lock for the whole frame.
pub type SharedScene = Arc<RwLock<Scene>>;

#[must_use]
pub fn shared_scene(scene: Scene) -> SharedScene {
    Arc::new(RwLock::new(scene))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameReport {
    pub frame: u64,
    pub app: AppFrameReport,
    pub sync: SyncStats,
    pub launched: bool,
}

pub struct MirageEngine<B: RtBackend> {
    app: AppTraverser,
    mirror: RtTraverser<B>,
    published: Option<PublishedScene>,
    frame_count: u64,
}

impl<B: RtBackend> MirageEngine<B> {
    #[must_use]
    pub fn new(backend: B, settings: EngineSettings) -> Self {
        Self {
            app: AppTraverser::new(settings.animation),
            mirror: RtTraverser::new(backend, settings.mirror),
            published: None,
            frame_count: 0,
        }
    }

    #[inline]
    pub fn app(&self) -> &AppTraverser {
        &self.app
    }

    #[inline]
    pub fn app_mut(&mut self) -> &mut AppTraverser {
        &mut self.app
    }

    #[inline]
    pub fn mirror(&self) -> &RtTraverser<B> {
        &self.mirror
    }

    #[inline]
    pub fn mirror_mut(&mut self) -> &mut RtTraverser<B> {
        &mut self.mirror
    }

    #[inline]
    pub fn backend(&self) -> &B {
        self.mirror.backend()
    }

    /// Handles published by the last successful pass.
    #[inline]
    pub fn published(&self) -> Option<&PublishedScene> {
        self.published.as_ref()
    }

    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn render_frame(
        &mut self,
        scene: &mut Scene,
        view: &ViewState,
        tick: u64,
        width: u32,
        height: u32,
    ) -> Result<FrameReport> {
        self.frame_count += 1;
        let frame = self.frame_count;

        let app = self
            .app
            .apply(scene, view, tick)
            .inspect_err(|e| log::error!("Frame {frame}: app traversal failed: {e}"))?;
        let published = self
            .mirror
            .sync(scene, view)
            .inspect_err(|e| log::error!("Frame {frame}: mirror pass failed: {e}"))?;
        let launched = self
            .mirror
            .launch(&published, width, height)
            .inspect_err(|e| log::error!("Frame {frame}: launch failed: {e}"))?;
        self.published = Some(published);

        Ok(FrameReport {
            frame,
            app,
            sync: self.mirror.stats(),
            launched,
        })
    }

    /// [`render_frame`](Self::render_frame) under the scene's write lock.
    pub fn render_shared(
        &mut self,
        scene: &SharedScene,
        view: &ViewState,
        tick: u64,
        width: u32,
        height: u32,
    ) -> Result<FrameReport> {
        let mut guard = scene.write();
        self.render_frame(&mut guard, view, tick, width, height)
    }

    /// Releases every backend object. Returns the number of released entries.
    pub fn shutdown(&mut self) -> usize {
        self.app.shutdown();
        self.published = None;
        self.mirror.shutdown()
    }
}

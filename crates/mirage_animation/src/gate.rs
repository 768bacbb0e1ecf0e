//! Frame-level dirty gate.
//!
//! Before any per-node work, the application traversal asks whether anything
//! it depends on moved since the last traversal: the root (identity and
//! incarnations), the view (identity and incarnation) or the animation tick.

use mirage_core::{Incarnation, NodeHandle};
use mirage_scene::{NodeIncarnations, Scene, ViewState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ViewStamp {
    id: u64,
    incarnation: Incarnation,
}

#[derive(Debug, Default)]
pub struct FrameGate {
    root: Option<(NodeHandle, NodeIncarnations)>,
    view: Option<ViewStamp>,
    tick: Option<u64>,
    forced: bool,
    traversals: u64,
}

impl FrameGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next check pass regardless of recorded state.
    pub fn force_traversal(&mut self) {
        self.forced = true;
    }

    #[inline]
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// Number of traversals recorded so far.
    #[inline]
    #[must_use]
    pub fn traversals(&self) -> u64 {
        self.traversals
    }

    #[must_use]
    pub fn needs_traversal(&self, scene: &Scene, view: &ViewState, tick: u64) -> bool {
        if self.forced || self.tick != Some(tick) {
            return true;
        }
        if self.view != Some(stamp(view)) {
            return true;
        }
        self.root != root_stamp(scene)
    }

    /// Remembers the state a traversal just left behind. Call after the
    /// traversal so its own writes do not trigger the next one.
    pub fn record(&mut self, scene: &Scene, view: &ViewState, tick: u64) {
        self.root = root_stamp(scene);
        self.view = Some(stamp(view));
        self.tick = Some(tick);
        self.forced = false;
        self.traversals += 1;
    }

    pub fn reset(&mut self) {
        *self = Self {
            traversals: self.traversals,
            ..Self::default()
        };
    }
}

fn stamp(view: &ViewState) -> ViewStamp {
    ViewStamp {
        id: view.id(),
        incarnation: view.incarnation(),
    }
}

fn root_stamp(scene: &Scene) -> Option<(NodeHandle, NodeIncarnations)> {
    let root = scene.root()?;
    Some((root, scene.incarnations(root)?))
}

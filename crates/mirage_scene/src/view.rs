//! Viewer state
//!
//! A [`ViewState`] is the camera a frame is produced for. Billboard
//! placement depends on it, and the application traverser compares its
//! identity and incarnation to decide whether a frame needs work.

use std::sync::atomic::{AtomicU64, Ordering};

use glam::{Affine3A, Vec3};

use mirage_core::Incarnation;

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct ViewState {
    id: u64,
    /// Camera-to-world transform.
    camera: Affine3A,
    incarnation: Incarnation,
}

impl ViewState {
    #[must_use]
    pub fn new(camera: Affine3A) -> Self {
        Self {
            id: NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed),
            camera,
            incarnation: Incarnation::new(),
        }
    }

    #[must_use]
    pub fn looking_at(eye: Vec3, target: Vec3, up: Vec3) -> Self {
        Self::new(Affine3A::look_at_rh(eye, target, up).inverse())
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn camera(&self) -> &Affine3A {
        &self.camera
    }

    #[inline]
    #[must_use]
    pub fn camera_position(&self) -> Vec3 {
        self.camera.translation.into()
    }

    #[inline]
    #[must_use]
    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    /// Moves the camera. Setting an identical transform is not a change.
    pub fn set_camera(&mut self, camera: Affine3A) {
        if self.camera != camera {
            self.camera = camera;
            self.incarnation.increment();
        }
    }
}

impl Default for ViewState {
    fn default() -> Self {
        Self::new(Affine3A::IDENTITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_camera_keeps_incarnation() {
        let mut view = ViewState::default();
        let before = view.incarnation();
        view.set_camera(Affine3A::IDENTITY);
        assert_eq!(view.incarnation(), before);

        view.set_camera(Affine3A::from_translation(Vec3::X));
        assert_ne!(view.incarnation(), before);
        assert_eq!(view.camera_position(), Vec3::X);
    }

    #[test]
    fn views_get_distinct_ids() {
        assert_ne!(ViewState::default().id(), ViewState::default().id());
    }
}

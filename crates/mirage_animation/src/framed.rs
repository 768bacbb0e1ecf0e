use glam::Affine3A;

use mirage_core::{MirageError, NodeHandle, Result};
use mirage_scene::Scene;

/// Transform animation with one matrix per tick.
#[derive(Debug, Clone)]
pub struct FramedTransformAnimation {
    pub name: String,
    target: NodeHandle,
    frames: Vec<Affine3A>,
}

impl FramedTransformAnimation {
    #[must_use]
    pub fn new(name: &str, target: NodeHandle, frames: Vec<Affine3A>) -> Self {
        Self {
            name: name.to_string(),
            target,
            frames,
        }
    }

    #[inline]
    #[must_use]
    pub fn target(&self) -> NodeHandle {
        self.target
    }

    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Frame shown at `tick`. Past the end it wraps when `looping`, and holds
    /// the last frame otherwise.
    #[must_use]
    pub fn frame_at(&self, tick: u64, looping: bool) -> Option<Affine3A> {
        let len = self.frames.len() as u64;
        if len == 0 {
            return None;
        }
        let index = if looping { tick % len } else { tick.min(len - 1) };
        self.frames.get(index as usize).copied()
    }

    /// Writes the frame for `tick` to the target transform. Returns whether
    /// the node changed; writing the value it already holds is skipped so a
    /// held frame does not bump incarnations.
    pub fn apply(&self, scene: &mut Scene, tick: u64, looping: bool) -> Result<bool> {
        let Some(frame) = self.frame_at(tick, looping) else {
            return Ok(false);
        };
        let current = scene
            .get_node(self.target)?
            .transform()
            .copied()
            .ok_or(MirageError::KindMismatch {
                node: self.target,
                expected: "Transform",
            })?;
        if current == frame {
            return Ok(false);
        }
        scene.set_transform(self.target, frame)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn frames() -> Vec<Affine3A> {
        (0..3)
            .map(|i| Affine3A::from_translation(Vec3::X * i as f32))
            .collect()
    }

    #[test]
    fn looping_wraps_and_clamping_holds() {
        let mut scene = Scene::new();
        let xf = scene.create_transform(Affine3A::IDENTITY);
        let anim = FramedTransformAnimation::new("slide", xf, frames());

        assert_eq!(anim.frame_at(4, true), Some(Affine3A::from_translation(Vec3::X)));
        assert_eq!(
            anim.frame_at(4, false),
            Some(Affine3A::from_translation(Vec3::X * 2.0))
        );
    }

    #[test]
    fn held_frame_does_not_bump() {
        let mut scene = Scene::new();
        let xf = scene.create_transform(Affine3A::IDENTITY);
        let anim = FramedTransformAnimation::new("slide", xf, frames());

        assert!(anim.apply(&mut scene, 2, false).unwrap());
        let after_first = scene.incarnations(xf).unwrap();
        assert!(!anim.apply(&mut scene, 9, false).unwrap());
        assert_eq!(scene.incarnations(xf).unwrap(), after_first);
    }

    #[test]
    fn non_transform_target_is_rejected() {
        let mut scene = Scene::new();
        let group = scene.create_group();
        let anim = FramedTransformAnimation::new("bad", group, frames());
        assert!(matches!(
            anim.apply(&mut scene, 1, true),
            Err(MirageError::KindMismatch { .. })
        ));
    }
}

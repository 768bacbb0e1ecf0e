//! Skinning processors
//!
//! The application traversal only collects joints and skins; a processor
//! does the numeric work in one batched [`SkinningProcessor::process`] call
//! per frame. Processors are interchangeable through the trait.

use glam::{Affine3A, Vec3};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;
use smallvec::SmallVec;

use mirage_core::{NodeHandle, Result};
use mirage_scene::{Scene, Skin, SkinKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SkinningProcessorKind {
    /// Skins are left in their bind pose.
    None,
    #[default]
    Cpu,
    /// A user-supplied processor.
    Custom,
}

pub trait SkinningProcessor: Send {
    fn kind(&self) -> SkinningProcessorKind;

    /// Clears what was collected for the previous frame.
    fn begin_frame(&mut self);

    fn add_joint(&mut self, joint: NodeHandle, model_to_world: Affine3A);

    fn add_skin(&mut self, skin: SkinKey);

    /// Deforms every collected skin. With `require_processing` unset a
    /// processor may skip skins whose joints did not move. Returns the
    /// number of skins written.
    fn process(&mut self, scene: &mut Scene, require_processing: bool) -> Result<usize>;

    fn shutdown(&mut self) {}
}

#[must_use]
pub fn create_skinning_processor(kind: SkinningProcessorKind) -> Box<dyn SkinningProcessor> {
    match kind {
        SkinningProcessorKind::Cpu => Box::new(CpuSkinningProcessor::new()),
        SkinningProcessorKind::None => Box::new(DisabledSkinningProcessor),
        SkinningProcessorKind::Custom => {
            log::warn!("Custom skinning processors must be installed explicitly; skinning disabled");
            Box::new(DisabledSkinningProcessor)
        }
    }
}

// ============================================================================
// CPU
// ============================================================================

/// Linear-blend skinning on the CPU, writing positions back through
/// [`Scene::set_positions`].
#[derive(Debug, Default)]
pub struct CpuSkinningProcessor {
    joints: FxHashMap<NodeHandle, Affine3A>,
    skins: Vec<SkinKey>,
    /// Joint transforms each skin was last blended with.
    blended: SecondaryMap<SkinKey, Vec<Affine3A>>,
}

impl CpuSkinningProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SkinningProcessor for CpuSkinningProcessor {
    fn kind(&self) -> SkinningProcessorKind {
        SkinningProcessorKind::Cpu
    }

    fn begin_frame(&mut self) {
        self.joints.clear();
        self.skins.clear();
    }

    fn add_joint(&mut self, joint: NodeHandle, model_to_world: Affine3A) {
        self.joints.insert(joint, model_to_world);
    }

    fn add_skin(&mut self, skin: SkinKey) {
        self.skins.push(skin);
    }

    fn process(&mut self, scene: &mut Scene, require_processing: bool) -> Result<usize> {
        let mut written = 0;
        for key in std::mem::take(&mut self.skins) {
            let Some(skin) = scene.skin(key) else {
                log::warn!("Skin {key:?} vanished before processing");
                self.blended.remove(key);
                continue;
            };

            let joints: Vec<Affine3A> = skin
                .joints
                .iter()
                .map(|j| {
                    self.joints
                        .get(j)
                        .copied()
                        .unwrap_or_else(|| scene.world_transform(*j))
                })
                .collect();
            if !require_processing && self.blended.get(key) == Some(&joints) {
                continue;
            }

            let mesh_to_world = scene.world_transform(skin.target);
            let positions = blend(skin, &joints, &mesh_to_world);
            let target = skin.target;
            scene.set_positions(target, &positions)?;
            self.blended.insert(key, joints);
            written += 1;
        }
        if written > 0 {
            log::debug!("CPU skinning wrote {written} skin(s)");
        }
        Ok(written)
    }

    fn shutdown(&mut self) {
        self.joints.clear();
        self.skins.clear();
        self.blended.clear();
    }
}

/// Linear-blend skinning of the bind pose into mesh space.
///
/// Joint matrix: `mesh_to_world⁻¹ · joint_world · inverse_bind · bind_shape`.
/// Weights are normalized; vertices without influences keep their bind
/// position.
#[must_use]
pub fn blend(skin: &Skin, joint_worlds: &[Affine3A], mesh_to_world: &Affine3A) -> Vec<Vec3> {
    let world_to_mesh = mesh_to_world.inverse();
    let bind_shape = Affine3A::from_mat4(skin.bind_shape_matrix);
    let joint_matrices: SmallVec<[Affine3A; 32]> = joint_worlds
        .iter()
        .zip(&skin.inverse_bind_matrices)
        .map(|(world, ibm)| world_to_mesh * *world * Affine3A::from_mat4(*ibm) * bind_shape)
        .collect();

    skin.bind_pose
        .iter()
        .enumerate()
        .map(|(vertex, &position)| {
            let Some(influences) = skin.influences.get(vertex) else {
                return position;
            };
            let mut blended = Vec3::ZERO;
            let mut total = 0.0;
            for influence in influences {
                if let Some(m) = joint_matrices.get(influence.joint as usize) {
                    blended += m.transform_point3(position) * influence.weight;
                    total += influence.weight;
                }
            }
            if total > 0.0 { blended / total } else { position }
        })
        .collect()
}

// ============================================================================
// Disabled
// ============================================================================

#[derive(Debug, Default)]
pub struct DisabledSkinningProcessor;

impl SkinningProcessor for DisabledSkinningProcessor {
    fn kind(&self) -> SkinningProcessorKind {
        SkinningProcessorKind::None
    }

    fn begin_frame(&mut self) {}

    fn add_joint(&mut self, _joint: NodeHandle, _model_to_world: Affine3A) {}

    fn add_skin(&mut self, _skin: SkinKey) {}

    fn process(&mut self, _scene: &mut Scene, _require_processing: bool) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Mat4;

    fn skinned_scene() -> (Scene, NodeHandle, NodeHandle, SkinKey) {
        let mut scene = Scene::new();
        let joint = scene.create_transform(Affine3A::IDENTITY);
        let bind_pose = vec![Vec3::ZERO, Vec3::X, Vec3::Y];
        let geometry = scene.create_geometry(bind_pose.clone(), vec![0, 1, 2]);

        let mut skin = Skin::new("strip", geometry, bind_pose);
        let j = skin.add_joint(joint, Mat4::IDENTITY);
        skin.set_influences(0, &[(j, 1.0)]);
        skin.set_influences(1, &[(j, 0.5)]);
        let key = scene.add_skin(skin).unwrap();
        (scene, joint, geometry, key)
    }

    fn positions(scene: &Scene, geometry: NodeHandle) -> Vec<Vec3> {
        scene.node(geometry).unwrap().geometry().unwrap().positions.clone()
    }

    #[test]
    fn blend_follows_joint_and_keeps_unweighted_vertices() {
        let (mut scene, joint, geometry, key) = skinned_scene();
        let mut processor = CpuSkinningProcessor::new();

        processor.begin_frame();
        processor.add_joint(joint, Affine3A::from_translation(Vec3::Z));
        processor.add_skin(key);
        assert_eq!(processor.process(&mut scene, false).unwrap(), 1);

        let p = positions(&scene, geometry);
        assert!(p[0].abs_diff_eq(Vec3::Z, 1e-6));
        assert!(p[1].abs_diff_eq(Vec3::X + Vec3::Z, 1e-6));
        assert!(p[2].abs_diff_eq(Vec3::Y, 1e-6));
    }

    #[test]
    fn unchanged_joints_are_skipped_unless_required() {
        let (mut scene, joint, geometry, key) = skinned_scene();
        let mut processor = CpuSkinningProcessor::new();
        let frame = |p: &mut CpuSkinningProcessor| {
            p.begin_frame();
            p.add_joint(joint, Affine3A::from_translation(Vec3::Z));
            p.add_skin(key);
        };

        frame(&mut processor);
        processor.process(&mut scene, false).unwrap();
        let inc = scene.incarnations(geometry).unwrap();

        frame(&mut processor);
        assert_eq!(processor.process(&mut scene, false).unwrap(), 0);
        assert_eq!(scene.incarnations(geometry).unwrap(), inc);

        frame(&mut processor);
        assert_eq!(processor.process(&mut scene, true).unwrap(), 1);
    }

    #[test]
    fn factory_maps_kinds() {
        assert_eq!(
            create_skinning_processor(SkinningProcessorKind::Cpu).kind(),
            SkinningProcessorKind::Cpu
        );
        assert_eq!(
            create_skinning_processor(SkinningProcessorKind::None).kind(),
            SkinningProcessorKind::None
        );
        assert_eq!(
            create_skinning_processor(SkinningProcessorKind::Custom).kind(),
            SkinningProcessorKind::None
        );
    }
}

use glam::{Mat4, Vec3};
use slotmap::new_key_type;
use smallvec::SmallVec;

use mirage_core::{MirageError, NodeHandle, Result};

new_key_type! {
    pub struct SkinKey;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointInfluence {
    /// Index into [`Skin::joints`].
    pub joint: u32,
    pub weight: f32,
}

/// Linear-blend skinning tables for one geometry.
///
/// `joints[i]` pairs with `inverse_bind_matrices[i]`. `bind_pose` and
/// `influences` are per vertex of the target geometry.
#[derive(Debug, Clone)]
pub struct Skin {
    pub name: String,
    pub target: NodeHandle,
    pub joints: Vec<NodeHandle>,
    pub inverse_bind_matrices: Vec<Mat4>,
    pub bind_shape_matrix: Mat4,
    pub bind_pose: Vec<Vec3>,
    pub influences: Vec<SmallVec<[JointInfluence; 4]>>,
}

impl Skin {
    #[must_use]
    pub fn new(name: &str, target: NodeHandle, bind_pose: Vec<Vec3>) -> Self {
        let vertex_count = bind_pose.len();
        Self {
            name: name.to_string(),
            target,
            joints: Vec::new(),
            inverse_bind_matrices: Vec::new(),
            bind_shape_matrix: Mat4::IDENTITY,
            bind_pose,
            influences: vec![SmallVec::new(); vertex_count],
        }
    }

    /// Appends a joint and returns its index.
    pub fn add_joint(&mut self, joint: NodeHandle, inverse_bind: Mat4) -> u32 {
        self.joints.push(joint);
        self.inverse_bind_matrices.push(inverse_bind);
        (self.joints.len() - 1) as u32
    }

    /// Replaces the influences of one vertex. Out-of-range vertices are ignored.
    pub fn set_influences(&mut self, vertex: usize, influences: &[(u32, f32)]) {
        if let Some(slot) = self.influences.get_mut(vertex) {
            *slot = influences
                .iter()
                .map(|&(joint, weight)| JointInfluence { joint, weight })
                .collect();
        }
    }

    #[inline]
    #[must_use]
    pub fn joint_count(&self) -> usize {
        self.joints.len()
    }

    #[inline]
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.bind_pose.len()
    }

    /// Checks that the tables agree with each other.
    pub fn validate(&self) -> Result<()> {
        if self.inverse_bind_matrices.len() != self.joints.len() {
            return Err(MirageError::InvalidSkin(format!(
                "'{}' has {} joints but {} inverse bind matrices",
                self.name,
                self.joints.len(),
                self.inverse_bind_matrices.len()
            )));
        }
        if self.influences.len() != self.bind_pose.len() {
            return Err(MirageError::InvalidSkin(format!(
                "'{}' has {} bind pose vertices but {} influence rows",
                self.name,
                self.bind_pose.len(),
                self.influences.len()
            )));
        }
        for (vertex, row) in self.influences.iter().enumerate() {
            for influence in row {
                if influence.joint as usize >= self.joints.len() {
                    return Err(MirageError::InvalidSkin(format!(
                        "'{}' vertex {vertex} references joint {} of {}",
                        self.name,
                        influence.joint,
                        self.joints.len()
                    )));
                }
                if !influence.weight.is_finite() || influence.weight < 0.0 {
                    return Err(MirageError::InvalidSkin(format!(
                        "'{}' vertex {vertex} has weight {}",
                        self.name, influence.weight
                    )));
                }
            }
        }
        Ok(())
    }
}

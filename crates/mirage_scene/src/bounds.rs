use glam::{Affine3A, Vec3};

/// Axis-aligned box in some local space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    /// Smallest box around `points`; `None` for an empty slice.
    #[must_use]
    pub fn from_points(points: &[Vec3]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let mut min = *first;
        let mut max = *first;
        for p in rest {
            min = min.min(*p);
            max = max.max(*p);
        }
        Some(Self { min, max })
    }

    #[inline]
    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    #[must_use]
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Box around the eight transformed corners.
    #[must_use]
    pub fn transform(&self, matrix: &Affine3A) -> Self {
        let corners = [
            Vec3::new(self.min.x, self.min.y, self.min.z),
            Vec3::new(self.min.x, self.min.y, self.max.z),
            Vec3::new(self.min.x, self.max.y, self.min.z),
            Vec3::new(self.min.x, self.max.y, self.max.z),
            Vec3::new(self.max.x, self.min.y, self.min.z),
            Vec3::new(self.max.x, self.min.y, self.max.z),
            Vec3::new(self.max.x, self.max.y, self.min.z),
            Vec3::new(self.max.x, self.max.y, self.max.z),
        ];

        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        for corner in corners {
            let p = matrix.transform_point3(corner);
            min = min.min(p);
            max = max.max(p);
        }
        Self { min, max }
    }

    /// Box that contains this one under any rotation about the origin.
    ///
    /// Used for billboards, whose orientation depends on the viewer.
    #[must_use]
    pub fn rotation_invariant(&self) -> Self {
        let radius = self.min.length().max(self.max.length());
        Self {
            min: Vec3::splat(-radius),
            max: Vec3::splat(radius),
        }
    }
}

/// Union over an iterator of optional boxes.
pub(crate) fn union_all(boxes: impl IntoIterator<Item = Option<BoundingBox>>) -> Option<BoundingBox> {
    boxes
        .into_iter()
        .flatten()
        .reduce(|acc, b| acc.union(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_translates_box() {
        let b = BoundingBox {
            min: Vec3::ZERO,
            max: Vec3::ONE,
        };
        let moved = b.transform(&Affine3A::from_translation(Vec3::new(2.0, 0.0, 0.0)));
        assert_eq!(moved.min, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(moved.max, Vec3::new(3.0, 1.0, 1.0));
    }

    #[test]
    fn union_skips_missing_boxes() {
        let a = BoundingBox::from_points(&[Vec3::ZERO]);
        let b = BoundingBox::from_points(&[Vec3::splat(2.0)]);
        let u = union_all([a, None, b]).unwrap();
        assert_eq!(u.min, Vec3::ZERO);
        assert_eq!(u.max, Vec3::splat(2.0));
        assert!(union_all([None, None]).is_none());
    }
}

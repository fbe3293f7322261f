//! Math utilities and types
//!
//! Provides fundamental math types for 3D graphics. All matrices are
//! column-major (nalgebra convention) and compose right-to-left, so
//! `parent * child` applies `child` first.

pub use nalgebra::{
    Vector2, Vector3, Vector4,
    Matrix3, Matrix4,
    Quaternion,
    Unit,
};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// 3D point type
pub type Point3 = nalgebra::Point3<f32>;

/// Quaternion type for rotations
pub type Quat = Unit<Quaternion<f32>>;

/// Translation matrix
pub fn translation(x: f32, y: f32, z: f32) -> Mat4 {
    Mat4::new_translation(&Vec3::new(x, y, z))
}

/// Uniform scaling matrix
pub fn uniform_scale(factor: f32) -> Mat4 {
    Mat4::new_scaling(factor)
}

/// Transform representing position, rotation, and scale
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    /// Position in 3D space
    pub position: Vec3,

    /// Rotation quaternion
    pub rotation: Quat,

    /// Scale factors
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Quat::identity(),
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    /// Create a new identity transform
    pub fn identity() -> Self {
        Self::default()
    }

    /// Create a transform with only position
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Convert to a transformation matrix (T * R * S)
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::new_translation(&self.position)
            * self.rotation.to_homogeneous()
            * Mat4::new_nonuniform_scaling(&self.scale)
    }
}

/// Axis-aligned bounding box in some local space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// Minimum corner of the bounding box
    pub min: Vec3,
    /// Maximum corner of the bounding box
    pub max: Vec3,
}

impl BoundingBox {
    /// Create a new box from min and max points
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Smallest box enclosing all `points`, or `None` for an empty slice
    pub fn from_points(points: &[Vec3]) -> Option<Self> {
        let (first, rest) = points.split_first()?;
        let mut bounds = Self::new(*first, *first);
        for p in rest {
            bounds.min = bounds.min.inf(p);
            bounds.max = bounds.max.sup(p);
        }
        Some(bounds)
    }

    /// Get the center of the box
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Get the extents (half-size) of the box
    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    /// Box enclosing this box after transforming its eight corners
    pub fn transformed(&self, matrix: &Mat4) -> Self {
        let corners: Vec<Vec3> = (0..8)
            .map(|i| {
                let corner = Point3::new(
                    if i & 1 == 0 { self.min.x } else { self.max.x },
                    if i & 2 == 0 { self.min.y } else { self.max.y },
                    if i & 4 == 0 { self.min.z } else { self.max.z },
                );
                matrix.transform_point(&corner).coords
            })
            .collect();
        // eight corners, never empty
        Self::from_points(&corners).unwrap_or(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_composition_order() {
        let m = uniform_scale(2.0) * translation(1.0, 0.0, 0.0);
        let p = m.transform_point(&Point3::origin());
        assert_relative_eq!(p.coords, Vec3::new(2.0, 0.0, 0.0), epsilon = 1e-6);

        let m = translation(1.0, 0.0, 0.0) * uniform_scale(2.0);
        let p = m.transform_point(&Point3::origin());
        assert_relative_eq!(p.coords, Vec3::new(1.0, 0.0, 0.0), epsilon = 1e-6);
    }

    #[test]
    fn test_bounds_from_points() {
        assert!(BoundingBox::from_points(&[]).is_none());

        let bounds = BoundingBox::from_points(&[
            Vec3::new(1.0, -2.0, 0.5),
            Vec3::new(-1.0, 3.0, 0.0),
        ]).unwrap();
        assert_eq!(bounds.min, Vec3::new(-1.0, -2.0, 0.0));
        assert_eq!(bounds.max, Vec3::new(1.0, 3.0, 0.5));
        assert_relative_eq!(bounds.center(), Vec3::new(0.0, 0.5, 0.25), epsilon = 1e-6);
    }

    #[test]
    fn test_bounds_transformed() {
        let bounds = BoundingBox::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0));
        let moved = bounds.transformed(&translation(5.0, 0.0, 0.0));
        assert_relative_eq!(moved.min, Vec3::new(4.0, -1.0, -1.0), epsilon = 1e-6);
        assert_relative_eq!(moved.max, Vec3::new(6.0, 1.0, 1.0), epsilon = 1e-6);
    }
}

//! Typed per-node property attachments
//!
//! A node can carry several properties at once (a mesh node usually also
//! carries the bounding box derived from that mesh). Properties form a closed
//! set of variants; each variant maps to exactly one [`NodeKind`] and the
//! matching bit in [`NodeTypeFlags`].

use std::collections::HashMap;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::foundation::math::{BoundingBox, Mat4, Vec3};

bitflags! {
    /// Which property kinds are attached to a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct NodeTypeFlags: u32 {
        /// Renderable mesh
        const MESH = 1;
        /// Light source
        const LIGHT = 2;
        /// View camera
        const CAMERA = 4;
        /// Camera used to render shadow maps
        const SHADOW_CAMERA = 8;
        /// Axis-aligned bounding box
        const AABB = 16;
        /// Bounding sphere
        const SPHERE = 32;
        /// Skeleton joint
        const BONE = 64;
    }
}

/// Property kind, used as the key of a node's property slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    /// Renderable mesh
    Mesh,
    /// Light source
    Light,
    /// View camera
    Camera,
    /// Shadow map camera
    ShadowCamera,
    /// Axis-aligned bounding box
    Aabb,
    /// Bounding sphere
    Sphere,
    /// Skeleton joint
    Bone,
}

impl NodeKind {
    /// Every kind, in flag order
    pub const ALL: [NodeKind; 7] = [
        NodeKind::Mesh,
        NodeKind::Light,
        NodeKind::Camera,
        NodeKind::ShadowCamera,
        NodeKind::Aabb,
        NodeKind::Sphere,
        NodeKind::Bone,
    ];

    /// The flag bit for this kind
    pub fn flag(self) -> NodeTypeFlags {
        match self {
            NodeKind::Mesh => NodeTypeFlags::MESH,
            NodeKind::Light => NodeTypeFlags::LIGHT,
            NodeKind::Camera => NodeTypeFlags::CAMERA,
            NodeKind::ShadowCamera => NodeTypeFlags::SHADOW_CAMERA,
            NodeKind::Aabb => NodeTypeFlags::AABB,
            NodeKind::Sphere => NodeTypeFlags::SPHERE,
            NodeKind::Bone => NodeTypeFlags::BONE,
        }
    }
}

/// Mesh reference carried by a node
#[derive(Debug, Clone, PartialEq)]
pub struct MeshNode {
    /// Index into the owning scene's (or importer's) mesh list
    pub mesh_index: u32,
    /// Index into the scene's material list
    pub material_index: u32,
    /// Bounds of the mesh vertices in node-local space
    pub local_bounds: BoundingBox,
}

/// Kind of light source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LightType {
    /// Parallel rays along the node's -Z axis
    Directional,
    /// Omnidirectional point light
    Point,
    /// Cone light along the node's -Z axis
    Spot,
}

/// Light source parameters
#[derive(Debug, Clone, PartialEq)]
pub struct LightNode {
    /// Light type
    pub light_type: LightType,
    /// Linear RGB color
    pub color: Vec3,
    /// Intensity multiplier
    pub intensity: f32,
    /// Falloff range for point and spot lights
    pub range: f32,
}

/// Projection parameters for view and shadow cameras
#[derive(Debug, Clone, PartialEq)]
pub struct CameraNode {
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Width / height
    pub aspect: f32,
    /// Near clip distance
    pub near: f32,
    /// Far clip distance
    pub far: f32,
}

impl CameraNode {
    /// Perspective projection for Vulkan clip space (y down, depth 0..1)
    pub fn projection(&self) -> Mat4 {
        let mut proj = nalgebra::Perspective3::new(self.aspect, self.fov_y, self.near, self.far)
            .to_homogeneous();
        // OpenGL depth -1..1 to Vulkan 0..1, then flip y
        let correction = Mat4::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, -1.0, 0.0, 0.0,
            0.0, 0.0, 0.5, 0.5,
            0.0, 0.0, 0.0, 1.0,
        );
        proj = correction * proj;
        proj
    }
}

/// Axis-aligned box in node-local space
#[derive(Debug, Clone, PartialEq)]
pub struct AabbNode {
    /// Local bounds
    pub bounds: BoundingBox,
}

/// Bounding sphere in node-local space
#[derive(Debug, Clone, PartialEq)]
pub struct SphereNode {
    /// Sphere center
    pub center: Vec3,
    /// Sphere radius
    pub radius: f32,
}

/// Skeleton joint
#[derive(Debug, Clone, PartialEq)]
pub struct BoneNode {
    /// Joint index within the skin
    pub joint_index: u32,
    /// Mesh-space to joint-space matrix
    pub inverse_bind: Mat4,
}

/// A property attached to a scene node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeProperty {
    /// Renderable mesh
    Mesh(MeshNode),
    /// Light source
    Light(LightNode),
    /// View camera
    Camera(CameraNode),
    /// Shadow map camera
    ShadowCamera(CameraNode),
    /// Axis-aligned bounding box
    Aabb(AabbNode),
    /// Bounding sphere
    Sphere(SphereNode),
    /// Skeleton joint
    Bone(BoneNode),
}

impl NodeProperty {
    /// The kind this property is stored under
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeProperty::Mesh(_) => NodeKind::Mesh,
            NodeProperty::Light(_) => NodeKind::Light,
            NodeProperty::Camera(_) => NodeKind::Camera,
            NodeProperty::ShadowCamera(_) => NodeKind::ShadowCamera,
            NodeProperty::Aabb(_) => NodeKind::Aabb,
            NodeProperty::Sphere(_) => NodeKind::Sphere,
            NodeProperty::Bone(_) => NodeKind::Bone,
        }
    }

    /// The flag bit for this property
    pub fn node_type(&self) -> NodeTypeFlags {
        self.kind().flag()
    }
}

/// All properties attached to one node, at most one per kind
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertySlot {
    entries: HashMap<NodeKind, NodeProperty>,
}

impl PropertySlot {
    /// Insert or overwrite the entry for the property's kind
    pub fn insert(&mut self, property: NodeProperty) -> Option<NodeProperty> {
        self.entries.insert(property.kind(), property)
    }

    /// Entry for `kind`
    pub fn get(&self, kind: NodeKind) -> Option<&NodeProperty> {
        self.entries.get(&kind)
    }

    /// Mutable entry for `kind`
    pub fn get_mut(&mut self, kind: NodeKind) -> Option<&mut NodeProperty> {
        self.entries.get_mut(&kind)
    }

    /// Remove the entry for `kind`
    pub fn remove(&mut self, kind: NodeKind) -> Option<NodeProperty> {
        self.entries.remove(&kind)
    }

    /// Union of the flags of every entry
    pub fn flags(&self) -> NodeTypeFlags {
        self.entries
            .keys()
            .fold(NodeTypeFlags::empty(), |acc, kind| acc | kind.flag())
    }

    /// Iterate entries
    pub fn iter(&self) -> impl Iterator<Item = &NodeProperty> {
        self.entries.values()
    }

    /// Iterate entries mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeProperty> {
        self.entries.values_mut()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the slot holds nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aabb() -> NodeProperty {
        NodeProperty::Aabb(AabbNode {
            bounds: BoundingBox::new(Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0)),
        })
    }

    #[test]
    fn test_kind_flags_are_distinct() {
        let combined = NodeKind::ALL
            .iter()
            .fold(NodeTypeFlags::empty(), |acc, kind| acc | kind.flag());
        assert_eq!(combined, NodeTypeFlags::all());
        assert_eq!(NodeKind::ShadowCamera.flag().bits(), 8);
        assert_eq!(NodeKind::Bone.flag().bits(), 64);
    }

    #[test]
    fn test_slot_holds_one_entry_per_kind() {
        let mut slot = PropertySlot::default();
        assert!(slot.insert(aabb()).is_none());
        assert!(slot.insert(NodeProperty::Sphere(SphereNode { center: Vec3::zeros(), radius: 2.0 })).is_none());
        assert_eq!(slot.len(), 2);
        assert_eq!(slot.flags(), NodeTypeFlags::AABB | NodeTypeFlags::SPHERE);

        // overwriting keeps the count
        assert!(slot.insert(aabb()).is_some());
        assert_eq!(slot.len(), 2);

        slot.remove(NodeKind::Aabb);
        assert_eq!(slot.flags(), NodeTypeFlags::SPHERE);
    }

    #[test]
    fn test_camera_projection_depth_range() {
        let camera = CameraNode { fov_y: 1.0, aspect: 1.5, near: 0.1, far: 100.0 };
        let proj = camera.projection();
        let near = proj.transform_point(&nalgebra::Point3::new(0.0, 0.0, -0.1));
        let far = proj.transform_point(&nalgebra::Point3::new(0.0, 0.0, -100.0));
        approx::assert_relative_eq!(near.z, 0.0, epsilon = 1e-4);
        approx::assert_relative_eq!(far.z, 1.0, epsilon = 1e-4);
    }
}

//! Scene graph: hierarchical transforms, typed node properties, and
//! structural edits (deletion with renumbering, merging)

pub mod merge;
pub mod node;
pub mod properties;
pub mod scene_graph;

pub use merge::MERGED_ROOT_NAME;
pub use node::{SceneNode, SceneNodeMut};
pub use properties::{
    AabbNode, BoneNode, CameraNode, LightNode, LightType, MeshNode, NodeKind, NodeProperty, NodeTypeFlags,
    PropertySlot, SphereNode,
};
pub use scene_graph::{
    Children, Hierarchy, NameIndex, NodeIndex, PropertyIndex, Scene, SceneError, SceneResult, MAX_NODE_LEVEL,
    ROOT_NODE,
};

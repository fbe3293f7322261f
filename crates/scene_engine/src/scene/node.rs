//! Borrowed views over single scene nodes

use super::properties::{NodeKind, NodeProperty, NodeTypeFlags};
use super::scene_graph::{Hierarchy, NodeIndex, PropertyIndex, Scene, SceneResult};
use crate::foundation::math::Mat4;

/// Read-only handle to a node that is known to exist
#[derive(Clone, Copy)]
pub struct SceneNode<'a> {
    scene: &'a Scene,
    index: NodeIndex,
}

impl<'a> SceneNode<'a> {
    pub(crate) fn new(scene: &'a Scene, index: NodeIndex) -> Self {
        Self { scene, index }
    }

    /// Node index
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// Tree links
    pub fn hierarchy(&self) -> &'a Hierarchy {
        &self.scene.hierarchy[self.index]
    }

    /// Depth from the root
    pub fn level(&self) -> usize {
        self.hierarchy().level
    }

    /// Parent view, `None` for the root
    pub fn parent(&self) -> Option<SceneNode<'a>> {
        self.hierarchy().parent.map(|p| SceneNode::new(self.scene, p))
    }

    /// Child views, most recently added first
    pub fn children(&self) -> impl Iterator<Item = SceneNode<'a>> + 'a {
        let scene = self.scene;
        let mut next = self.hierarchy().first_child;
        std::iter::from_fn(move || {
            let current = next?;
            next = scene.hierarchy[current].next_sibling;
            Some(SceneNode::new(scene, current))
        })
    }

    /// Node name, if any
    pub fn name(&self) -> Option<&'a str> {
        self.scene
            .node_name_map
            .get(&self.index)
            .and_then(|&n| self.scene.node_names.get(n))
            .map(String::as_str)
    }

    /// Local transform
    pub fn local_transform(&self) -> &'a Mat4 {
        &self.scene.local_transforms[self.index]
    }

    /// Global transform as of the last recompute
    pub fn global_transform(&self) -> &'a Mat4 {
        &self.scene.global_transforms[self.index]
    }

    /// Attached property of `kind`
    pub fn property(&self, kind: NodeKind) -> Option<&'a NodeProperty> {
        let slot = *self.scene.node_property_map.get(&self.index)?;
        self.scene.properties[slot].get(kind)
    }

    /// Attached kinds
    pub fn flags(&self) -> NodeTypeFlags {
        self.scene
            .node_type_flags_map
            .get(&self.index)
            .copied()
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for SceneNode<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneNode")
            .field("index", &self.index)
            .field("name", &self.name())
            .field("level", &self.level())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Mutating handle to a node that is known to exist
pub struct SceneNodeMut<'a> {
    scene: &'a mut Scene,
    index: NodeIndex,
}

impl<'a> SceneNodeMut<'a> {
    pub(crate) fn new(scene: &'a mut Scene, index: NodeIndex) -> Self {
        Self { scene, index }
    }

    /// Node index
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    /// Reborrow as a read-only view
    pub fn as_node(&self) -> SceneNode<'_> {
        SceneNode::new(self.scene, self.index)
    }

    /// Replace the local transform and queue the subtree for recalculation
    pub fn set_local_transform(&mut self, transform: Mat4) -> SceneResult<()> {
        self.scene.set_node_local_transform(self.index, transform)
    }

    /// Rename the node
    pub fn set_name(&mut self, name: impl Into<String>) -> SceneResult<()> {
        self.scene.set_node_name(self.index, name)
    }

    /// Attach a property, replacing one of the same kind
    pub fn add_property(&mut self, property: NodeProperty) -> SceneResult<PropertyIndex> {
        self.scene.add_property(self.index, property)
    }

    /// Add a child and return its index
    pub fn add_child(&mut self) -> SceneResult<NodeIndex> {
        self.scene.add_node(self.index)
    }

    /// Add a child and move the view onto it
    pub fn into_child(self) -> SceneResult<SceneNodeMut<'a>> {
        let child = self.scene.add_node(self.index)?;
        Ok(SceneNodeMut::new(self.scene, child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{translation, Vec3};
    use crate::scene::properties::SphereNode;
    use crate::scene::scene_graph::ROOT_NODE;

    #[test]
    fn test_views_follow_the_tree() {
        let mut scene = Scene::new();
        {
            let mut root = scene.node_mut(ROOT_NODE).unwrap();
            root.set_name("root").unwrap();
            root.add_child().unwrap();
            assert_eq!(root.as_node().children().count(), 1);
        }
        let mut leaf = scene.node_mut(ROOT_NODE).unwrap().into_child().unwrap().into_child().unwrap();
        leaf.set_name("leaf").unwrap();
        leaf.set_local_transform(translation(0.0, 1.0, 0.0)).unwrap();
        leaf.add_property(NodeProperty::Sphere(SphereNode { center: Vec3::zeros(), radius: 1.0 }))
            .unwrap();
        let leaf_index = leaf.index();
        scene.recalculate_global_transforms();

        let leaf = scene.node(leaf_index).unwrap();
        assert_eq!(leaf.name(), Some("leaf"));
        assert_eq!(leaf.level(), 2);
        assert_eq!(leaf.flags(), NodeTypeFlags::SPHERE);
        assert!(leaf.property(NodeKind::Sphere).is_some());
        assert_eq!(*leaf.global_transform(), translation(0.0, 1.0, 0.0));

        let root = leaf.parent().and_then(|p| p.parent()).unwrap();
        assert_eq!(root.index(), ROOT_NODE);
        assert_eq!(root.name(), Some("root"));
        assert_eq!(root.children().count(), 2);
        assert!(root.parent().is_none());
    }
}

//! Structure-of-arrays scene graph
//!
//! Every node is a dense [`NodeIndex`] into parallel arrays (local transform,
//! global transform, hierarchy record). Children of a node form an intrusive
//! singly linked list through `next_sibling`; new children are prepended.
//! Index 0 is the root.
//!
//! Global transforms are recomputed lazily. Any transform change queues the
//! changed node and its whole subtree into per-level dirty lists, and
//! [`Scene::recalculate_global_transforms`] flushes the lists in ascending
//! level order so a parent is always current before its children are
//! recomputed.
//!
//! Optional data (names, property slots, type flags) lives in sparse maps
//! keyed by node index; structural edits ([`Scene::delete_scene_nodes`],
//! [`Scene::merge_scenes`]) rewrite those keys along with the hierarchy.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::core::config::SceneConfig;
use crate::foundation::math::Mat4;
use super::node::{SceneNode, SceneNodeMut};
use super::properties::{AabbNode, MeshNode, NodeKind, NodeProperty, NodeTypeFlags, PropertySlot};

/// Dense handle identifying a node within one scene
pub type NodeIndex = usize;

/// Index into a scene's property slot list
pub type PropertyIndex = usize;

/// Index into a scene's name list
pub type NameIndex = usize;

/// The root node of every scene
pub const ROOT_NODE: NodeIndex = 0;

/// Number of hierarchy levels; valid levels are `0..MAX_NODE_LEVEL`
pub const MAX_NODE_LEVEL: usize = 16;

/// Scene graph errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    /// Node index outside the scene's arrays
    #[error("Invalid node index {index} (scene has {node_count} nodes)")]
    InvalidNodeIndex {
        /// The offending index
        index: NodeIndex,
        /// Number of nodes in the scene
        node_count: usize,
    },

    /// Adding a node would exceed the fixed level count
    #[error("Node under parent {parent} would be at level {level}, limit is {max}", max = MAX_NODE_LEVEL - 1)]
    MaxDepthExceeded {
        /// Parent the node was requested under
        parent: NodeIndex,
        /// Level the new node would have had
        level: usize,
    },

    /// A required property is not attached
    #[error("Node {index} has no {kind:?} property")]
    PropertyNotFound {
        /// Node that was queried
        index: NodeIndex,
        /// Missing kind
        kind: NodeKind,
    },

    /// The root cannot be removed from its own scene
    #[error("The root node cannot be deleted")]
    RootDeletion,

    /// Merge inputs have inconsistent lengths
    #[error("Merge argument mismatch: {reason}")]
    MergeArgumentMismatch {
        /// What did not line up
        reason: String,
    },

    /// A mesh or material index no longer fits in `u32`
    #[error("{kind} index does not fit in u32")]
    IndexOverflow {
        /// `"mesh"` or `"material"`
        kind: &'static str,
    },
}

/// Result type for scene operations
pub type SceneResult<T> = Result<T, SceneError>;

/// `count` as the next `u32` index of `kind`
pub(crate) fn checked_index(kind: &'static str, count: usize) -> SceneResult<u32> {
    u32::try_from(count).map_err(|_| SceneError::IndexOverflow { kind })
}

/// `index + offset` without wrapping
pub(crate) fn offset_index(kind: &'static str, index: u32, offset: u32) -> SceneResult<u32> {
    index.checked_add(offset).ok_or(SceneError::IndexOverflow { kind })
}

/// Intrusive tree links of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hierarchy {
    /// Parent node, `None` only for the root
    pub parent: Option<NodeIndex>,
    /// Head of the child list
    pub first_child: Option<NodeIndex>,
    /// Next node in the parent's child list
    pub next_sibling: Option<NodeIndex>,
    /// Depth from the root (root = 0)
    pub level: usize,
}

/// Hierarchical transform tree with typed per-node properties
#[derive(Debug, Clone)]
pub struct Scene {
    pub(crate) local_transforms: Vec<Mat4>,
    pub(crate) global_transforms: Vec<Mat4>,
    pub(crate) hierarchy: Vec<Hierarchy>,

    pub(crate) dirty_at_level: Vec<Vec<NodeIndex>>,
    pub(crate) queued: Vec<bool>,
    pub(crate) deduplicate_dirty: bool,

    pub(crate) node_name_map: HashMap<NodeIndex, NameIndex>,
    pub(crate) node_names: Vec<String>,
    pub(crate) material_names: Vec<String>,

    pub(crate) node_type_flags_map: HashMap<NodeIndex, NodeTypeFlags>,
    pub(crate) node_property_map: HashMap<NodeIndex, PropertyIndex>,
    pub(crate) properties: Vec<PropertySlot>,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    /// Create a scene holding only the root, with identity transforms
    pub fn new() -> Self {
        Self::with_config(&SceneConfig::default())
    }

    /// Create a scene using `config`
    pub fn with_config(config: &SceneConfig) -> Self {
        let mut scene = Self::empty(config.deduplicate_dirty);
        scene.local_transforms.reserve(config.initial_capacity);
        scene.global_transforms.reserve(config.initial_capacity);
        scene.hierarchy.reserve(config.initial_capacity);
        scene.queued.reserve(config.initial_capacity);

        scene.local_transforms.push(Mat4::identity());
        scene.global_transforms.push(Mat4::identity());
        scene.hierarchy.push(Hierarchy::default());
        scene.queued.push(false);
        scene
    }

    /// Scene with no nodes at all; callers must push a root
    pub(crate) fn empty(deduplicate_dirty: bool) -> Self {
        Self {
            local_transforms: Vec::new(),
            global_transforms: Vec::new(),
            hierarchy: Vec::new(),
            dirty_at_level: vec![Vec::new(); MAX_NODE_LEVEL],
            queued: Vec::new(),
            deduplicate_dirty,
            node_name_map: HashMap::new(),
            node_names: Vec::new(),
            material_names: Vec::new(),
            node_type_flags_map: HashMap::new(),
            node_property_map: HashMap::new(),
            properties: Vec::new(),
        }
    }

    /// Number of nodes, including the root
    pub fn node_count(&self) -> usize {
        self.hierarchy.len()
    }

    pub(crate) fn check_index(&self, index: NodeIndex) -> SceneResult<()> {
        if index < self.hierarchy.len() {
            Ok(())
        } else {
            Err(SceneError::InvalidNodeIndex {
                index,
                node_count: self.hierarchy.len(),
            })
        }
    }

    /// Append a node as the first child of `parent`
    ///
    /// The new node starts with identity local transform and is queued for
    /// recomputation so it inherits the parent's global transform.
    pub fn add_node(&mut self, parent: NodeIndex) -> SceneResult<NodeIndex> {
        self.check_index(parent)?;

        let level = self.hierarchy[parent].level + 1;
        if level >= MAX_NODE_LEVEL {
            return Err(SceneError::MaxDepthExceeded { parent, level });
        }

        let node = self.hierarchy.len();
        self.local_transforms.push(Mat4::identity());
        self.global_transforms.push(Mat4::identity());
        self.queued.push(false);
        self.hierarchy.push(Hierarchy {
            parent: Some(parent),
            first_child: None,
            next_sibling: self.hierarchy[parent].first_child,
            level,
        });
        self.hierarchy[parent].first_child = Some(node);

        self.mark_as_changed(node)?;
        Ok(node)
    }

    /// [`Scene::add_node`] followed by [`Scene::set_node_name`]
    pub fn add_node_named(&mut self, parent: NodeIndex, name: impl Into<String>) -> SceneResult<NodeIndex> {
        let node = self.add_node(parent)?;
        self.set_node_name(node, name)?;
        Ok(node)
    }

    /// Overwrite a node's local transform and queue its subtree
    ///
    /// Setting the root's transform updates the root's global transform
    /// directly since the root is never queued.
    pub fn set_node_local_transform(&mut self, index: NodeIndex, transform: Mat4) -> SceneResult<()> {
        self.check_index(index)?;
        self.local_transforms[index] = transform;
        if index == ROOT_NODE {
            self.global_transforms[ROOT_NODE] = transform;
        }
        self.mark_as_changed(index)
    }

    /// Queue `index` and every node below it for global transform recomputation
    ///
    /// The root itself is never queued; marking it queues all of its children.
    pub fn mark_as_changed(&mut self, index: NodeIndex) -> SceneResult<()> {
        self.check_index(index)?;

        let mut stack = vec![index];
        while let Some(node) = stack.pop() {
            let Hierarchy { first_child, level, .. } = self.hierarchy[node];
            debug_assert!(level < MAX_NODE_LEVEL, "node {node} at level {level}, hierarchy has a cycle?");

            if node != ROOT_NODE && !(self.deduplicate_dirty && self.queued[node]) {
                self.dirty_at_level[level].push(node);
                self.queued[node] = true;
            }

            let mut child = first_child;
            while let Some(c) = child {
                stack.push(c);
                child = self.hierarchy[c].next_sibling;
            }
        }
        Ok(())
    }

    /// Flush the dirty lists, parents before children
    ///
    /// Returns whether any node was recomputed.
    pub fn recalculate_global_transforms(&mut self) -> bool {
        let mut changed = false;

        for level in 1..MAX_NODE_LEVEL {
            let mut dirty = std::mem::take(&mut self.dirty_at_level[level]);
            changed |= !dirty.is_empty();

            for &node in &dirty {
                // level >= 1 always has a parent
                if let Some(parent) = self.hierarchy[node].parent {
                    self.global_transforms[node] = self.global_transforms[parent] * self.local_transforms[node];
                }
                self.queued[node] = false;
            }

            dirty.clear();
            self.dirty_at_level[level] = dirty;
        }

        changed
    }

    /// Number of queued dirty entries across every level
    pub fn pending_dirty_count(&self) -> usize {
        self.dirty_at_level.iter().map(Vec::len).sum()
    }

    /// Hierarchy record of a node
    pub fn node_hierarchy(&self, index: NodeIndex) -> SceneResult<&Hierarchy> {
        self.check_index(index)?;
        Ok(&self.hierarchy[index])
    }

    /// Local transform of a node
    pub fn node_local_transform(&self, index: NodeIndex) -> SceneResult<&Mat4> {
        self.check_index(index)?;
        Ok(&self.local_transforms[index])
    }

    /// Global transform of a node, as of the last recompute
    pub fn node_global_transform(&self, index: NodeIndex) -> SceneResult<&Mat4> {
        self.check_index(index)?;
        Ok(&self.global_transforms[index])
    }

    /// Children of a node, most recently added first
    pub fn children(&self, index: NodeIndex) -> SceneResult<Children<'_>> {
        self.check_index(index)?;
        Ok(Children {
            hierarchy: &self.hierarchy,
            next: self.hierarchy[index].first_child,
        })
    }

    /// Visit `start` and its descendants, every parent before its children
    pub fn traverse_depth_first<F>(&self, start: NodeIndex, mut visit: F) -> SceneResult<()>
    where
        F: FnMut(NodeIndex, &Hierarchy),
    {
        self.check_index(start)?;
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            visit(node, &self.hierarchy[node]);
            let mut child = self.hierarchy[node].first_child;
            while let Some(c) = child {
                stack.push(c);
                child = self.hierarchy[c].next_sibling;
            }
        }
        Ok(())
    }

    /// Read-only view of a node
    pub fn node(&self, index: NodeIndex) -> SceneResult<SceneNode<'_>> {
        self.check_index(index)?;
        Ok(SceneNode::new(self, index))
    }

    /// Mutating view of a node
    pub fn node_mut(&mut self, index: NodeIndex) -> SceneResult<SceneNodeMut<'_>> {
        self.check_index(index)?;
        Ok(SceneNodeMut::new(self, index))
    }

    // -- Names --

    /// Assign a name to a node, replacing any previous name
    pub fn set_node_name(&mut self, index: NodeIndex, name: impl Into<String>) -> SceneResult<()> {
        self.check_index(index)?;
        let name_index = self.node_names.len();
        self.node_names.push(name.into());
        self.node_name_map.insert(index, name_index);
        Ok(())
    }

    /// Name of a node, if it has one
    pub fn node_name(&self, index: NodeIndex) -> SceneResult<Option<&str>> {
        self.check_index(index)?;
        Ok(self
            .node_name_map
            .get(&index)
            .and_then(|&n| self.node_names.get(n))
            .map(String::as_str))
    }

    /// Lowest node index carrying `name`
    pub fn find_node_by_name(&self, name: &str) -> Option<NodeIndex> {
        self.node_name_map
            .iter()
            .filter(|(_, &n)| self.node_names.get(n).is_some_and(|s| s == name))
            .map(|(&node, _)| node)
            .min()
    }

    /// Register a material name, returning its index
    pub fn add_material(&mut self, name: impl Into<String>) -> SceneResult<u32> {
        let index = checked_index("material", self.material_names.len())?;
        self.material_names.push(name.into());
        Ok(index)
    }

    /// Registered material names
    pub fn material_names(&self) -> &[String] {
        &self.material_names
    }

    // -- Properties --

    /// Attach `property` to `index`, keyed by its own kind
    ///
    /// Allocates a property slot on first use; an existing entry of the same
    /// kind is overwritten. Returns the node's slot index.
    pub fn add_property(&mut self, index: NodeIndex, property: NodeProperty) -> SceneResult<PropertyIndex> {
        self.check_index(index)?;

        let flag = property.node_type();
        let slot = match self.node_property_map.get(&index) {
            Some(&slot) => slot,
            None => {
                self.properties.push(PropertySlot::default());
                let slot = self.properties.len() - 1;
                self.node_property_map.insert(index, slot);
                slot
            }
        };

        self.properties[slot].insert(property);
        *self.node_type_flags_map.entry(index).or_default() |= flag;
        Ok(slot)
    }

    /// Attach a mesh together with the bounding box derived from its bounds
    pub fn add_mesh(&mut self, index: NodeIndex, mesh: MeshNode) -> SceneResult<PropertyIndex> {
        let bounds = mesh.local_bounds;
        self.add_property(index, NodeProperty::Mesh(mesh))?;
        self.add_property(index, NodeProperty::Aabb(AabbNode { bounds }))
    }

    /// Detach the property of `kind` from `index`
    pub fn remove_property(&mut self, index: NodeIndex, kind: NodeKind) -> SceneResult<Option<NodeProperty>> {
        self.check_index(index)?;
        let Some(&slot) = self.node_property_map.get(&index) else {
            return Ok(None);
        };
        let removed = self.properties[slot].remove(kind);
        if let Some(flags) = self.node_type_flags_map.get_mut(&index) {
            flags.remove(kind.flag());
            if flags.is_empty() {
                self.node_type_flags_map.remove(&index);
            }
        }
        Ok(removed)
    }

    /// Property of `kind` attached to `index`
    pub fn property(&self, index: NodeIndex, kind: NodeKind) -> SceneResult<Option<&NodeProperty>> {
        self.check_index(index)?;
        Ok(self
            .node_property_map
            .get(&index)
            .and_then(|&slot| self.properties[slot].get(kind)))
    }

    /// Property of `kind` attached to `index`, failing when absent
    pub fn require_property(&self, index: NodeIndex, kind: NodeKind) -> SceneResult<&NodeProperty> {
        self.property(index, kind)?
            .ok_or(SceneError::PropertyNotFound { index, kind })
    }

    /// Mutable property of `kind` attached to `index`
    pub fn property_mut(&mut self, index: NodeIndex, kind: NodeKind) -> SceneResult<Option<&mut NodeProperty>> {
        self.check_index(index)?;
        match self.node_property_map.get(&index) {
            Some(&slot) => Ok(self.properties[slot].get_mut(kind)),
            None => Ok(None),
        }
    }

    /// Kinds attached to `index`
    pub fn node_type_flags(&self, index: NodeIndex) -> SceneResult<NodeTypeFlags> {
        self.check_index(index)?;
        Ok(self.node_type_flags_map.get(&index).copied().unwrap_or_default())
    }

    /// Every node carrying a property of `kind`, in index order
    pub fn nodes_with(&self, kind: NodeKind) -> Vec<NodeIndex> {
        let mut nodes: Vec<NodeIndex> = self
            .node_type_flags_map
            .iter()
            .filter(|(_, flags)| flags.contains(kind.flag()))
            .map(|(&node, _)| node)
            .collect();
        nodes.sort_unstable();
        nodes
    }

    // -- Deletion --

    /// Add `index` and its whole subtree to `out`
    pub fn collect_nodes_to_delete(&self, index: NodeIndex, out: &mut BTreeSet<NodeIndex>) -> SceneResult<()> {
        self.traverse_depth_first(index, |node, _| {
            out.insert(node);
        })
    }

    /// Delete `indices` and all of their descendants, renumbering the rest
    ///
    /// Surviving nodes keep their relative order. Links that pointed at a
    /// deleted node are redirected along the sibling chain to the next
    /// survivor. Sparse maps drop deleted keys and shift the others.
    /// Property slots and names of deleted nodes stay allocated but
    /// unreferenced.
    pub fn delete_scene_nodes(&mut self, indices: &[NodeIndex]) -> SceneResult<()> {
        // 1. subtree closure
        let mut to_delete = BTreeSet::new();
        for &index in indices {
            if index == ROOT_NODE {
                return Err(SceneError::RootDeletion);
            }
            self.collect_nodes_to_delete(index, &mut to_delete)?;
        }
        if to_delete.is_empty() {
            return Ok(());
        }

        // 2. stable partition into old -> new indices
        let count = self.hierarchy.len();
        let keep: Vec<bool> = (0..count).map(|i| !to_delete.contains(&i)).collect();
        let mut new_indices: Vec<Option<NodeIndex>> = vec![None; count];
        let mut next = 0;
        for (old, &kept) in keep.iter().enumerate() {
            if kept {
                new_indices[old] = Some(next);
                next += 1;
            }
        }

        // 3. rewrite links against the pre-compaction hierarchy
        let rewritten: Vec<Hierarchy> = self
            .hierarchy
            .iter()
            .map(|h| Hierarchy {
                parent: h.parent.and_then(|p| new_indices[p]),
                first_child: first_surviving_sibling(&self.hierarchy, &new_indices, h.first_child),
                next_sibling: first_surviving_sibling(&self.hierarchy, &new_indices, h.next_sibling),
                level: h.level,
            })
            .collect();

        // 4. compact the parallel arrays
        self.hierarchy = compact(rewritten, &keep);
        self.local_transforms = compact(std::mem::take(&mut self.local_transforms), &keep);
        self.global_transforms = compact(std::mem::take(&mut self.global_transforms), &keep);
        self.queued = compact(std::mem::take(&mut self.queued), &keep);
        for level in &mut self.dirty_at_level {
            level.retain_mut(|node| match new_indices[*node] {
                Some(new) => {
                    *node = new;
                    true
                }
                None => false,
            });
        }

        // 5. remap sparse maps
        self.node_type_flags_map = remap_keys(std::mem::take(&mut self.node_type_flags_map), &new_indices);
        self.node_property_map = remap_keys(std::mem::take(&mut self.node_property_map), &new_indices);
        self.node_name_map = remap_keys(std::mem::take(&mut self.node_name_map), &new_indices);

        log::debug!("Deleted {} scene nodes, {} remain", to_delete.len(), self.hierarchy.len());
        Ok(())
    }
}

/// Iterator over a node's child list
pub struct Children<'a> {
    hierarchy: &'a [Hierarchy],
    next: Option<NodeIndex>,
}

impl Iterator for Children<'_> {
    type Item = NodeIndex;

    fn next(&mut self) -> Option<NodeIndex> {
        let current = self.next?;
        self.next = self.hierarchy[current].next_sibling;
        Some(current)
    }
}

/// New index of the first survivor on the sibling chain starting at `start`
fn first_surviving_sibling(
    hierarchy: &[Hierarchy],
    new_indices: &[Option<NodeIndex>],
    start: Option<NodeIndex>,
) -> Option<NodeIndex> {
    let mut current = start;
    while let Some(node) = current {
        if let Some(new) = new_indices[node] {
            return Some(new);
        }
        current = hierarchy[node].next_sibling;
    }
    None
}

fn compact<T>(items: Vec<T>, keep: &[bool]) -> Vec<T> {
    items
        .into_iter()
        .zip(keep)
        .filter_map(|(item, &kept)| kept.then_some(item))
        .collect()
}

fn remap_keys<V>(map: HashMap<NodeIndex, V>, new_indices: &[Option<NodeIndex>]) -> HashMap<NodeIndex, V> {
    map.into_iter()
        .filter_map(|(old, value)| {
            new_indices
                .get(old)
                .copied()
                .flatten()
                .map(|new| (new, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{translation, uniform_scale, BoundingBox, Vec3};
    use approx::assert_relative_eq;

    fn mesh(mesh_index: u32) -> MeshNode {
        MeshNode {
            mesh_index,
            material_index: 0,
            local_bounds: BoundingBox::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0)),
        }
    }

    /// Every node's links agree with its parent's child list
    fn assert_consistent(scene: &Scene) {
        for node in 0..scene.node_count() {
            let h = scene.node_hierarchy(node).unwrap();
            for child in scene.children(node).unwrap() {
                assert!(child < scene.node_count());
                let ch = scene.node_hierarchy(child).unwrap();
                assert_eq!(ch.parent, Some(node));
                assert_eq!(ch.level, h.level + 1);
            }
            if let Some(parent) = h.parent {
                assert!(scene.children(parent).unwrap().any(|c| c == node));
            }
        }
    }

    #[test]
    fn test_new_scene_has_identity_root() {
        let scene = Scene::new();
        assert_eq!(scene.node_count(), 1);
        assert_eq!(*scene.node_hierarchy(ROOT_NODE).unwrap(), Hierarchy::default());
        assert_eq!(*scene.node_global_transform(ROOT_NODE).unwrap(), Mat4::identity());
    }

    #[test]
    fn test_add_node_prepends_children() {
        let mut scene = Scene::new();
        let a = scene.add_node(ROOT_NODE).unwrap();
        let b = scene.add_node(ROOT_NODE).unwrap();
        let c = scene.add_node(ROOT_NODE).unwrap();

        let children: Vec<_> = scene.children(ROOT_NODE).unwrap().collect();
        assert_eq!(children, vec![c, b, a]);
        assert_eq!(scene.node_hierarchy(a).unwrap().level, 1);
        assert_consistent(&scene);
    }

    #[test]
    fn test_invalid_indices_are_errors() {
        let mut scene = Scene::new();
        let err = SceneError::InvalidNodeIndex { index: 5, node_count: 1 };
        assert_eq!(scene.add_node(5), Err(err.clone()));
        assert_eq!(scene.node_global_transform(5).unwrap_err(), err);
        assert_eq!(scene.set_node_local_transform(5, Mat4::identity()), Err(err.clone()));
        assert_eq!(scene.mark_as_changed(5), Err(err));
        assert!(scene.delete_scene_nodes(&[7]).is_err());
    }

    #[test]
    fn test_child_of_root_global_transform() {
        let mut scene = Scene::new();
        let child = scene.add_node(ROOT_NODE).unwrap();
        scene.set_node_local_transform(child, translation(1.0, 0.0, 0.0)).unwrap();
        assert!(scene.recalculate_global_transforms());
        assert_relative_eq!(*scene.node_global_transform(child).unwrap(), translation(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_parent_applies_after_child() {
        let mut scene = Scene::new();
        let a = scene.add_node(ROOT_NODE).unwrap();
        let b = scene.add_node(a).unwrap();
        scene.set_node_local_transform(a, uniform_scale(2.0)).unwrap();
        scene.set_node_local_transform(b, translation(1.0, 0.0, 0.0)).unwrap();
        scene.recalculate_global_transforms();

        let expected = uniform_scale(2.0) * translation(1.0, 0.0, 0.0);
        assert_relative_eq!(*scene.node_global_transform(b).unwrap(), expected);
        assert!((scene.node_global_transform(b).unwrap() - translation(1.0, 0.0, 0.0) * uniform_scale(2.0)).norm() > 0.5);
    }

    #[test]
    fn test_recalculate_is_idempotent() {
        let mut scene = Scene::new();
        let a = scene.add_node(ROOT_NODE).unwrap();
        scene.set_node_local_transform(a, translation(0.0, 3.0, 0.0)).unwrap();
        assert!(scene.recalculate_global_transforms());
        let before = *scene.node_global_transform(a).unwrap();
        assert!(!scene.recalculate_global_transforms());
        assert_eq!(*scene.node_global_transform(a).unwrap(), before);
        assert_eq!(scene.pending_dirty_count(), 0);
    }

    #[test]
    fn test_new_node_inherits_parent_global() {
        let mut scene = Scene::new();
        let a = scene.add_node(ROOT_NODE).unwrap();
        scene.set_node_local_transform(a, translation(2.0, 0.0, 0.0)).unwrap();
        scene.recalculate_global_transforms();

        let b = scene.add_node(a).unwrap();
        scene.recalculate_global_transforms();
        assert_relative_eq!(*scene.node_global_transform(b).unwrap(), translation(2.0, 0.0, 0.0));
    }

    #[test]
    fn test_root_transform_reaches_descendants() {
        let mut scene = Scene::new();
        let a = scene.add_node(ROOT_NODE).unwrap();
        let b = scene.add_node(a).unwrap();
        scene.recalculate_global_transforms();

        scene.set_node_local_transform(ROOT_NODE, translation(0.0, 0.0, 5.0)).unwrap();
        assert_eq!(*scene.node_global_transform(ROOT_NODE).unwrap(), translation(0.0, 0.0, 5.0));
        scene.recalculate_global_transforms();
        assert_relative_eq!(*scene.node_global_transform(b).unwrap(), translation(0.0, 0.0, 5.0));
    }

    #[test]
    fn test_dirty_entries_are_deduplicated() {
        let mut scene = Scene::new();
        let a = scene.add_node(ROOT_NODE).unwrap();
        let _b = scene.add_node(a).unwrap();
        scene.recalculate_global_transforms();

        scene.mark_as_changed(a).unwrap();
        scene.mark_as_changed(a).unwrap();
        scene.mark_as_changed(a).unwrap();
        assert_eq!(scene.pending_dirty_count(), 2);
    }

    #[test]
    fn test_dirty_entries_without_deduplication() {
        let config = SceneConfig { deduplicate_dirty: false, ..SceneConfig::default() };
        let mut scene = Scene::with_config(&config);
        let a = scene.add_node(ROOT_NODE).unwrap();
        let b = scene.add_node(a).unwrap();
        scene.recalculate_global_transforms();

        scene.set_node_local_transform(a, translation(1.0, 0.0, 0.0)).unwrap();
        scene.mark_as_changed(a).unwrap();
        assert_eq!(scene.pending_dirty_count(), 4);

        // duplicates recompute to the same result
        scene.recalculate_global_transforms();
        assert_relative_eq!(*scene.node_global_transform(b).unwrap(), translation(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_depth_limit() {
        let mut scene = Scene::new();
        let mut node = ROOT_NODE;
        for _ in 1..MAX_NODE_LEVEL {
            node = scene.add_node(node).unwrap();
        }
        assert_eq!(scene.node_hierarchy(node).unwrap().level, MAX_NODE_LEVEL - 1);
        assert_eq!(
            scene.add_node(node),
            Err(SceneError::MaxDepthExceeded { parent: node, level: MAX_NODE_LEVEL })
        );

        for i in 1..scene.node_count() {
            scene.set_node_local_transform(i, translation(1.0, 0.0, 0.0)).unwrap();
        }
        scene.recalculate_global_transforms();
        let deepest = scene.node_global_transform(node).unwrap();
        assert_relative_eq!(deepest[(0, 3)], (MAX_NODE_LEVEL - 1) as f32);
    }

    #[test]
    fn test_names() {
        let mut scene = Scene::new();
        let a = scene.add_node_named(ROOT_NODE, "arm").unwrap();
        let b = scene.add_node(a).unwrap();
        scene.set_node_name(b, "hand").unwrap();

        assert_eq!(scene.node_name(a).unwrap(), Some("arm"));
        assert_eq!(scene.node_name(ROOT_NODE).unwrap(), None);
        assert_eq!(scene.find_node_by_name("hand"), Some(b));
        assert_eq!(scene.find_node_by_name("foot"), None);

        scene.set_node_name(b, "claw").unwrap();
        assert_eq!(scene.node_name(b).unwrap(), Some("claw"));
    }

    #[test]
    fn test_properties_coexist() {
        let mut scene = Scene::new();
        let a = scene.add_node(ROOT_NODE).unwrap();
        let slot = scene.add_mesh(a, mesh(3)).unwrap();
        assert_eq!(scene.node_type_flags(a).unwrap(), NodeTypeFlags::MESH | NodeTypeFlags::AABB);
        assert_eq!(scene.nodes_with(NodeKind::Aabb), vec![a]);

        let slot_again = scene
            .add_property(a, NodeProperty::Mesh(mesh(4)))
            .unwrap();
        assert_eq!(slot, slot_again);
        match scene.property(a, NodeKind::Mesh).unwrap() {
            Some(NodeProperty::Mesh(m)) => assert_eq!(m.mesh_index, 4),
            other => panic!("unexpected property {other:?}"),
        }

        scene.remove_property(a, NodeKind::Mesh).unwrap();
        assert_eq!(scene.node_type_flags(a).unwrap(), NodeTypeFlags::AABB);
        assert!(scene.property(a, NodeKind::Mesh).unwrap().is_none());
        assert_eq!(
            scene.require_property(a, NodeKind::Mesh),
            Err(SceneError::PropertyNotFound { index: a, kind: NodeKind::Mesh })
        );
    }

    #[test]
    fn test_delete_subtree_relinks_siblings() {
        let mut scene = Scene::new();
        let a = scene.add_node_named(ROOT_NODE, "a").unwrap();
        let b = scene.add_node_named(a, "b").unwrap();
        let _c = scene.add_node_named(b, "c").unwrap();
        let d = scene.add_node_named(ROOT_NODE, "d").unwrap();
        scene.add_mesh(d, mesh(1)).unwrap();
        // root -> [d, a]; a -> [b]; b -> [c]
        scene.delete_scene_nodes(&[a]).unwrap();

        assert_eq!(scene.node_count(), 2);
        let d = scene.find_node_by_name("d").unwrap();
        assert_eq!(d, 1);
        assert!(scene.find_node_by_name("a").is_none());
        assert!(scene.find_node_by_name("c").is_none());
        assert_eq!(scene.node_hierarchy(ROOT_NODE).unwrap().first_child, Some(d));
        assert_eq!(scene.node_hierarchy(d).unwrap().next_sibling, None);
        assert_eq!(scene.nodes_with(NodeKind::Mesh), vec![d]);
        assert_consistent(&scene);
    }

    #[test]
    fn test_delete_follows_chain_of_deleted_siblings() {
        let mut scene = Scene::new();
        let keep_last = scene.add_node_named(ROOT_NODE, "keep_last").unwrap();
        let gone_1 = scene.add_node(ROOT_NODE).unwrap();
        let gone_2 = scene.add_node(ROOT_NODE).unwrap();
        let keep_first = scene.add_node_named(ROOT_NODE, "keep_first").unwrap();
        // root -> [keep_first, gone_2, gone_1, keep_last]
        scene.delete_scene_nodes(&[gone_1, gone_2]).unwrap();

        let keep_first = scene.find_node_by_name("keep_first").unwrap();
        let keep_last = scene.find_node_by_name("keep_last").unwrap();
        assert_eq!(scene.node_count(), 3);
        assert_eq!(scene.node_hierarchy(keep_first).unwrap().next_sibling, Some(keep_last));
        assert_consistent(&scene);
    }

    #[test]
    fn test_delete_first_children_chain() {
        let mut scene = Scene::new();
        let survivor = scene.add_node_named(ROOT_NODE, "survivor").unwrap();
        let x = scene.add_node(ROOT_NODE).unwrap();
        let y = scene.add_node(ROOT_NODE).unwrap();
        // root.first_child = y -> x -> survivor
        scene.delete_scene_nodes(&[y, x]).unwrap();
        let survivor = scene.find_node_by_name("survivor").unwrap();
        assert_eq!(scene.node_hierarchy(ROOT_NODE).unwrap().first_child, Some(survivor));
        assert_consistent(&scene);
    }

    #[test]
    fn test_delete_keeps_transforms_and_dirty_state() {
        let mut scene = Scene::new();
        let a = scene.add_node(ROOT_NODE).unwrap();
        let b = scene.add_node_named(ROOT_NODE, "b").unwrap();
        scene.set_node_local_transform(b, translation(0.0, 4.0, 0.0)).unwrap();
        // b still dirty while a is deleted
        scene.delete_scene_nodes(&[a]).unwrap();
        let b = scene.find_node_by_name("b").unwrap();
        assert!(scene.recalculate_global_transforms());
        assert_relative_eq!(*scene.node_global_transform(b).unwrap(), translation(0.0, 4.0, 0.0));
    }

    #[test]
    fn test_delete_root_rejected() {
        let mut scene = Scene::new();
        assert_eq!(scene.delete_scene_nodes(&[ROOT_NODE]), Err(SceneError::RootDeletion));
    }

    #[test]
    fn test_delete_then_readd_reproduces_shape() {
        let mut scene = Scene::new();
        let a = scene.add_node(ROOT_NODE).unwrap();
        let _other = scene.add_node(a).unwrap();
        let leaf = scene.add_node(a).unwrap();
        let before = scene.clone();

        scene.delete_scene_nodes(&[leaf]).unwrap();
        assert_eq!(scene.node_count(), before.node_count() - 1);
        let readded = scene.add_node(a).unwrap();

        assert_eq!(readded, leaf);
        assert_eq!(scene.hierarchy, before.hierarchy);
        assert_consistent(&scene);
    }
}

//! Combining several scenes under one new root

use super::properties::NodeProperty;
use super::scene_graph::{
    checked_index, offset_index, Hierarchy, NodeIndex, Scene, SceneError, SceneResult, MAX_NODE_LEVEL, ROOT_NODE,
};
use crate::foundation::math::Mat4;

/// Name given to the synthetic root of a merged scene
pub const MERGED_ROOT_NAME: &str = "NewRoot";

impl Scene {
    /// Merge `scenes` into a new scene under a synthetic root
    ///
    /// Nodes of scene `i` are appended in order, so node `n` of that scene
    /// becomes `1 + sum(len(scenes[..i])) + n`. Each old root becomes a child
    /// of the new root; old roots are chained through `next_sibling` in input
    /// order and every level grows by one.
    ///
    /// * `root_transforms`: empty, or one matrix per scene premultiplied onto
    ///   that scene's old root local transform.
    /// * `mesh_counts`: per-scene mesh counts; when `merge_meshes` is set the
    ///   mesh indices of scene `i` are offset by the sum of earlier counts.
    /// * `merge_materials`: when set, material names are concatenated and
    ///   material indices offset accordingly. Otherwise the merged scene
    ///   adopts the first scene's material list and indices are kept.
    ///
    /// Every node of the result is queued for global transform recomputation.
    pub fn merge_scenes(
        scenes: &[&Scene],
        root_transforms: &[Mat4],
        mesh_counts: &[u32],
        merge_meshes: bool,
        merge_materials: bool,
    ) -> SceneResult<Scene> {
        if !root_transforms.is_empty() && root_transforms.len() != scenes.len() {
            return Err(SceneError::MergeArgumentMismatch {
                reason: format!("{} root transforms for {} scenes", root_transforms.len(), scenes.len()),
            });
        }
        if merge_meshes && mesh_counts.len() != scenes.len() {
            return Err(SceneError::MergeArgumentMismatch {
                reason: format!("{} mesh counts for {} scenes", mesh_counts.len(), scenes.len()),
            });
        }

        let deduplicate = scenes.first().map_or(true, |s| s.deduplicate_dirty);
        let mut merged = Scene::empty(deduplicate);

        merged.local_transforms.push(Mat4::identity());
        merged.global_transforms.push(Mat4::identity());
        merged.queued.push(false);
        merged.hierarchy.push(Hierarchy {
            parent: None,
            first_child: (!scenes.is_empty()).then_some(1),
            next_sibling: None,
            level: 0,
        });
        merged.node_names.push(MERGED_ROOT_NAME.to_string());
        merged.node_name_map.insert(ROOT_NODE, 0);

        if !merge_materials {
            if let Some(first) = scenes.first() {
                merged.material_names = first.material_names.clone();
            }
        }

        let mut node_offset: NodeIndex = 1;
        let mut name_offset = merged.node_names.len();
        let mut property_offset = 0;
        let mut mesh_offset = 0u32;
        let mut material_offset = 0u32;

        for (i, scene) in scenes.iter().enumerate() {
            let shift = |index: NodeIndex| index + node_offset;

            merged.local_transforms.extend_from_slice(&scene.local_transforms);
            merged.global_transforms.extend_from_slice(&scene.global_transforms);
            merged.queued.extend(std::iter::repeat(false).take(scene.node_count()));
            merged.hierarchy.extend(scene.hierarchy.iter().map(|h| Hierarchy {
                parent: h.parent.map(shift),
                first_child: h.first_child.map(shift),
                next_sibling: h.next_sibling.map(shift),
                level: h.level,
            }));

            merged.node_names.extend(scene.node_names.iter().cloned());
            merged
                .node_name_map
                .extend(scene.node_name_map.iter().map(|(&node, &name)| (shift(node), name + name_offset)));
            merged
                .node_type_flags_map
                .extend(scene.node_type_flags_map.iter().map(|(&node, &flags)| (shift(node), flags)));
            merged
                .node_property_map
                .extend(scene.node_property_map.iter().map(|(&node, &slot)| (shift(node), slot + property_offset)));

            for slot in &scene.properties {
                let mut slot = slot.clone();
                for property in slot.iter_mut() {
                    if let NodeProperty::Mesh(mesh) = property {
                        if merge_meshes {
                            mesh.mesh_index = offset_index("mesh", mesh.mesh_index, mesh_offset)?;
                        }
                        if merge_materials {
                            mesh.material_index = offset_index("material", mesh.material_index, material_offset)?;
                        }
                    }
                }
                merged.properties.push(slot);
            }

            if merge_materials {
                merged.material_names.extend(scene.material_names.iter().cloned());
                material_offset = checked_index("material", merged.material_names.len())?;
            }
            if merge_meshes {
                mesh_offset = offset_index("mesh", mesh_offset, mesh_counts[i])?;
            }

            node_offset += scene.node_count();
            name_offset += scene.node_names.len();
            property_offset += scene.properties.len();
        }

        // hang the old roots off the new root, chained in input order
        let mut old_root: NodeIndex = 1;
        for (i, scene) in scenes.iter().enumerate() {
            let next_root = old_root + scene.node_count();
            let h = &mut merged.hierarchy[old_root];
            h.parent = Some(ROOT_NODE);
            h.next_sibling = (i + 1 < scenes.len()).then_some(next_root);
            if let Some(transform) = root_transforms.get(i) {
                merged.local_transforms[old_root] = transform * merged.local_transforms[old_root];
            }
            old_root = next_root;
        }

        for (node, h) in merged.hierarchy.iter_mut().enumerate().skip(1) {
            h.level += 1;
            if h.level >= MAX_NODE_LEVEL {
                return Err(SceneError::MaxDepthExceeded {
                    parent: h.parent.unwrap_or(ROOT_NODE),
                    level: h.level,
                });
            }
            debug_assert!(h.parent.is_some(), "merged node {node} lost its parent");
        }

        merged.mark_as_changed(ROOT_NODE)?;

        log::debug!(
            "Merged {} scenes into {} nodes ({} property slots)",
            scenes.len(),
            merged.node_count(),
            merged.properties.len()
        );
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::{translation, BoundingBox, Vec3};
    use crate::scene::properties::{MeshNode, NodeKind};
    use approx::assert_relative_eq;

    fn scene_with_mesh(name: &str, mesh_index: u32, material: &str) -> Scene {
        let mut scene = Scene::new();
        let material_index = scene.add_material(material).unwrap();
        let node = scene.add_node_named(ROOT_NODE, name).unwrap();
        scene
            .add_mesh(
                node,
                MeshNode {
                    mesh_index,
                    material_index,
                    local_bounds: BoundingBox::new(Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0)),
                },
            )
            .unwrap();
        scene.set_node_local_transform(node, translation(1.0, 0.0, 0.0)).unwrap();
        scene.recalculate_global_transforms();
        scene
    }

    fn mesh_of(scene: &Scene, node: NodeIndex) -> MeshNode {
        match scene.property(node, NodeKind::Mesh).unwrap() {
            Some(NodeProperty::Mesh(mesh)) => mesh.clone(),
            other => panic!("expected a mesh on node {node}, found {other:?}"),
        }
    }

    #[test]
    fn test_merge_two_scenes_layout() {
        let a = scene_with_mesh("a", 0, "red");
        let b = scene_with_mesh("b", 0, "blue");
        let merged = Scene::merge_scenes(&[&a, &b], &[], &[1, 1], true, true).unwrap();

        assert_eq!(merged.node_count(), 5);
        assert_eq!(merged.node_name(ROOT_NODE).unwrap(), Some(MERGED_ROOT_NAME));

        let root = merged.node_hierarchy(ROOT_NODE).unwrap();
        assert_eq!(root.first_child, Some(1));
        assert_eq!(merged.node_hierarchy(1).unwrap().next_sibling, Some(3));
        assert_eq!(merged.node_hierarchy(3).unwrap().next_sibling, None);
        assert_eq!(merged.node_hierarchy(1).unwrap().parent, Some(ROOT_NODE));
        assert_eq!(merged.node_hierarchy(1).unwrap().level, 1);
        assert_eq!(merged.node_hierarchy(2).unwrap().parent, Some(1));
        assert_eq!(merged.node_hierarchy(2).unwrap().level, 2);
        assert_eq!(merged.node_hierarchy(4).unwrap().parent, Some(3));

        assert_eq!(merged.find_node_by_name("a"), Some(2));
        assert_eq!(merged.find_node_by_name("b"), Some(4));
    }

    #[test]
    fn test_merge_offsets_meshes_and_materials() {
        let a = scene_with_mesh("a", 0, "red");
        let b = scene_with_mesh("b", 0, "blue");
        let merged = Scene::merge_scenes(&[&a, &b], &[], &[3, 2], true, true).unwrap();

        assert_eq!(mesh_of(&merged, 2).mesh_index, 0);
        assert_eq!(mesh_of(&merged, 4).mesh_index, 3);
        assert_eq!(mesh_of(&merged, 4).material_index, 1);
        assert_eq!(merged.material_names(), ["red".to_string(), "blue".to_string()]);
        assert_eq!(merged.nodes_with(NodeKind::Mesh), vec![2, 4]);
    }

    #[test]
    fn test_merge_without_mesh_merging_keeps_indices() {
        let a = scene_with_mesh("a", 0, "red");
        let b = scene_with_mesh("b", 5, "blue");
        let merged = Scene::merge_scenes(&[&a, &b], &[], &[], false, true).unwrap();

        assert_eq!(mesh_of(&merged, 4).mesh_index, 5);
        assert_eq!(mesh_of(&merged, 4).material_index, 1);
    }

    #[test]
    fn test_merge_without_material_merging_adopts_first_list() {
        let a = scene_with_mesh("a", 0, "red");
        let b = scene_with_mesh("b", 0, "blue");

        let merged = Scene::merge_scenes(&[&a, &b], &[], &[1, 1], true, false).unwrap();
        assert_eq!(merged.material_names(), ["red".to_string()]);
        assert_eq!(mesh_of(&merged, 4).material_index, 0);
        assert_eq!(mesh_of(&merged, 4).mesh_index, 1);

        let merged = Scene::merge_scenes(&[&a, &b], &[], &[], false, false).unwrap();
        assert_eq!(mesh_of(&merged, 4).mesh_index, 0);
        assert_eq!(mesh_of(&merged, 4).material_index, 0);
    }

    #[test]
    fn test_merge_root_transforms_apply_to_subtrees() {
        let a = scene_with_mesh("a", 0, "red");
        let b = scene_with_mesh("b", 0, "blue");
        let merged = Scene::merge_scenes(
            &[&a, &b],
            &[translation(0.0, 10.0, 0.0), translation(0.0, 0.0, -10.0)],
            &[],
            false,
            false,
        )
        .unwrap();

        let mut merged = merged;
        assert!(merged.pending_dirty_count() >= 4);
        assert!(merged.recalculate_global_transforms());
        assert_relative_eq!(*merged.node_global_transform(2).unwrap(), translation(1.0, 10.0, 0.0));
        assert_relative_eq!(*merged.node_global_transform(4).unwrap(), translation(1.0, 0.0, -10.0));
    }

    #[test]
    fn test_merge_argument_mismatch() {
        let a = Scene::new();
        let err = Scene::merge_scenes(&[&a], &[Mat4::identity(); 2], &[], false, false).unwrap_err();
        assert!(matches!(err, SceneError::MergeArgumentMismatch { .. }));

        let err = Scene::merge_scenes(&[&a], &[], &[], true, false).unwrap_err();
        assert!(matches!(err, SceneError::MergeArgumentMismatch { .. }));
    }

    #[test]
    fn test_merge_rejects_too_deep_input() {
        let mut deep = Scene::new();
        let mut node = ROOT_NODE;
        for _ in 1..MAX_NODE_LEVEL {
            node = deep.add_node(node).unwrap();
        }
        let err = Scene::merge_scenes(&[&deep], &[], &[], false, false).unwrap_err();
        assert!(matches!(err, SceneError::MaxDepthExceeded { level, .. } if level == MAX_NODE_LEVEL));
    }

    #[test]
    fn test_merge_rejects_mesh_offset_overflow() {
        let a = scene_with_mesh("a", 0, "red");
        let b = scene_with_mesh("b", 0, "red");
        let c = scene_with_mesh("c", 0, "red");

        let merged = Scene::merge_scenes(&[&a, &b], &[], &[u32::MAX - 1, 1], true, false).unwrap();
        assert_eq!(merged.node_count(), 5);

        let err = Scene::merge_scenes(&[&a, &b, &c], &[], &[u32::MAX, 1, 1], true, false).unwrap_err();
        assert!(matches!(err, SceneError::IndexOverflow { kind: "mesh" }));
    }

    #[test]
    fn test_index_conversions_are_checked() {
        assert_eq!(checked_index("material", 7).unwrap(), 7);
        assert_eq!(offset_index("material", u32::MAX - 1, 1).unwrap(), u32::MAX);
        assert!(matches!(
            offset_index("material", u32::MAX, 1),
            Err(SceneError::IndexOverflow { kind: "material" })
        ));
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            checked_index("material", u32::MAX as usize + 1),
            Err(SceneError::IndexOverflow { kind: "material" })
        ));
    }

    #[test]
    fn test_merge_empty_input() {
        let merged = Scene::merge_scenes(&[], &[], &[], false, false).unwrap();
        assert_eq!(merged.node_count(), 1);
        assert_eq!(merged.node_hierarchy(ROOT_NODE).unwrap().first_child, None);
    }
}

//! Scene graph behaviour through the public API
//!
//! Builds larger pseudo-random trees than the unit tests and checks the
//! structural invariants after every kind of edit.

use std::collections::BTreeSet;

use approx::assert_relative_eq;
use scene_engine::core::config::SceneConfig;
use scene_engine::foundation::math::{translation, uniform_scale, BoundingBox, Mat4, Vec3};
use scene_engine::scene::{
    MeshNode, NodeIndex, NodeKind, NodeProperty, Scene, SceneError, MAX_NODE_LEVEL, MERGED_ROOT_NAME, ROOT_NODE,
};

/// Small deterministic generator so failures reproduce
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }

    fn unit(&mut self) -> f32 {
        (self.next() % 1000) as f32 / 1000.0
    }
}

fn mesh(mesh_index: u32) -> NodeProperty {
    NodeProperty::Mesh(MeshNode {
        mesh_index,
        material_index: 0,
        local_bounds: BoundingBox::new(Vec3::repeat(-1.0), Vec3::repeat(1.0)),
    })
}

/// A tree of `count` nodes with varied transforms; every third node is named
fn random_scene(seed: u64, count: usize, deduplicate_dirty: bool) -> Scene {
    let mut rng = Lcg(seed);
    let mut scene = Scene::with_config(&SceneConfig {
        deduplicate_dirty,
        initial_capacity: count,
    });

    for i in 1..count {
        let mut parent = rng.below(scene.node_count());
        while scene.node_hierarchy(parent).unwrap().level + 1 >= MAX_NODE_LEVEL {
            parent = scene.node_hierarchy(parent).unwrap().parent.unwrap();
        }
        let node = scene.add_node(parent).unwrap();
        assert_eq!(node, i);

        let transform = translation(rng.unit() * 4.0 - 2.0, rng.unit(), rng.unit() * -3.0)
            * Mat4::new_rotation(Vec3::new(0.0, rng.unit() * 3.0, 0.0))
            * uniform_scale(0.5 + rng.unit());
        scene.set_node_local_transform(node, transform).unwrap();

        if i % 3 == 0 {
            scene.set_node_name(node, format!("node_{i}")).unwrap();
        }
        if i % 4 == 0 {
            scene.add_property(node, mesh(i as u32)).unwrap();
        }
    }
    scene
}

/// Links agree in both directions and levels follow parents
fn assert_links_consistent(scene: &Scene) {
    let count = scene.node_count();
    let mut seen_as_child = BTreeSet::new();

    for node in 0..count {
        let h = *scene.node_hierarchy(node).unwrap();
        if node == ROOT_NODE {
            assert_eq!(h.parent, None);
            assert_eq!(h.level, 0);
        }
        for child in scene.children(node).unwrap() {
            assert!(child < count, "child {child} of {node} out of range");
            assert!(seen_as_child.insert(child), "node {child} listed twice");
            let ch = scene.node_hierarchy(child).unwrap();
            assert_eq!(ch.parent, Some(node));
            assert_eq!(ch.level, h.level + 1);
        }
    }
    assert_eq!(seen_as_child.len(), count - 1, "every non-root node is some node's child");
}

/// `global[n] == global[parent(n)] * local[n]` and `global[0] == local[0]`
fn assert_globals_consistent(scene: &Scene) {
    for node in 0..scene.node_count() {
        let global = scene.node_global_transform(node).unwrap();
        let local = scene.node_local_transform(node).unwrap();
        let expected = match scene.node_hierarchy(node).unwrap().parent {
            Some(parent) => scene.node_global_transform(parent).unwrap() * local,
            None => *local,
        };
        assert_relative_eq!(*global, expected, epsilon = 1e-4);
    }
}

fn subtree(scene: &Scene, index: NodeIndex) -> BTreeSet<NodeIndex> {
    let mut nodes = BTreeSet::new();
    scene.collect_nodes_to_delete(index, &mut nodes).unwrap();
    nodes
}

#[test]
fn test_child_of_root_takes_its_local_transform() {
    let mut scene = Scene::new();
    let root_child = scene.add_node(ROOT_NODE).unwrap();
    scene.set_node_local_transform(root_child, translation(1.0, 0.0, 0.0)).unwrap();
    scene.recalculate_global_transforms();

    assert_relative_eq!(*scene.node_global_transform(ROOT_NODE).unwrap(), Mat4::identity());
    assert_relative_eq!(*scene.node_global_transform(root_child).unwrap(), translation(1.0, 0.0, 0.0));
}

#[test]
fn test_parent_transform_is_applied_on_the_left() {
    let mut scene = Scene::new();
    let a = scene.add_node(ROOT_NODE).unwrap();
    let b = scene.add_node(a).unwrap();
    scene.set_node_local_transform(a, uniform_scale(2.0)).unwrap();
    scene.set_node_local_transform(b, translation(1.0, 0.0, 0.0)).unwrap();
    scene.recalculate_global_transforms();

    let global = *scene.node_global_transform(b).unwrap();
    assert_relative_eq!(global, uniform_scale(2.0) * translation(1.0, 0.0, 0.0));
    assert_relative_eq!(global[(0, 3)], 2.0);
    assert!((global - translation(1.0, 0.0, 0.0) * uniform_scale(2.0)).norm() > 0.5);
}

#[test]
fn test_random_trees_hold_invariants() {
    for seed in 1..=8 {
        for deduplicate in [true, false] {
            let mut scene = random_scene(seed, 200, deduplicate);
            assert!(scene.recalculate_global_transforms());
            assert_eq!(scene.pending_dirty_count(), 0);
            assert_links_consistent(&scene);
            assert_globals_consistent(&scene);
        }
    }
}

#[test]
fn test_second_recalculate_changes_nothing() {
    let mut scene = random_scene(42, 120, false);
    assert!(scene.recalculate_global_transforms());
    let before: Vec<Mat4> = (0..scene.node_count())
        .map(|n| *scene.node_global_transform(n).unwrap())
        .collect();

    assert!(!scene.recalculate_global_transforms());
    for (node, global) in before.iter().enumerate() {
        assert_eq!(scene.node_global_transform(node).unwrap(), global);
    }
}

#[test]
fn test_deduplication_does_not_change_results() {
    let mut with = random_scene(7, 150, true);
    let mut without = random_scene(7, 150, false);
    assert!(without.pending_dirty_count() > with.pending_dirty_count());

    for scene in [&mut with, &mut without] {
        scene.set_node_local_transform(ROOT_NODE, translation(0.0, 5.0, 0.0)).unwrap();
        scene.mark_as_changed(3).unwrap();
        scene.recalculate_global_transforms();
    }
    for node in 0..with.node_count() {
        assert_relative_eq!(
            *with.node_global_transform(node).unwrap(),
            *without.node_global_transform(node).unwrap(),
            epsilon = 1e-5
        );
    }
}

#[test]
fn test_delete_removes_whole_subtree_and_relinks() {
    let mut scene = Scene::new();
    let keep_left = scene.add_node_named(ROOT_NODE, "left").unwrap();
    let a = scene.add_node_named(ROOT_NODE, "a").unwrap();
    let keep_right = scene.add_node_named(ROOT_NODE, "right").unwrap();
    let b = scene.add_node_named(a, "b").unwrap();
    scene.add_node_named(a, "c").unwrap();
    scene.add_node_named(b, "d").unwrap();
    let survivor = scene.add_node_named(keep_left, "survivor").unwrap();
    scene.add_property(survivor, mesh(9)).unwrap();

    scene.delete_scene_nodes(&[a]).unwrap();

    assert_eq!(scene.node_count(), 4);
    for gone in ["a", "b", "c", "d"] {
        assert_eq!(scene.find_node_by_name(gone), None);
    }
    assert_links_consistent(&scene);

    let left = scene.find_node_by_name("left").unwrap();
    let right = scene.find_node_by_name("right").unwrap();
    assert_eq!(left, keep_left);
    assert_eq!(right, keep_right - 1);
    assert_eq!(scene.children(ROOT_NODE).unwrap().collect::<Vec<_>>(), vec![right, left]);

    let survivor = scene.find_node_by_name("survivor").unwrap();
    assert_eq!(scene.node_hierarchy(survivor).unwrap().parent, Some(left));
    assert_eq!(scene.nodes_with(NodeKind::Mesh), vec![survivor]);
}

#[test]
fn test_random_deletions_keep_tree_valid() {
    let mut rng = Lcg(99);
    let mut scene = random_scene(99, 300, true);
    scene.recalculate_global_transforms();

    while scene.node_count() > 1 {
        let victims: Vec<NodeIndex> = (0..1 + rng.below(3))
            .map(|_| 1 + rng.below(scene.node_count() - 1))
            .collect();
        let mut expected_gone = BTreeSet::new();
        for &victim in &victims {
            expected_gone.extend(subtree(&scene, victim));
        }
        let before = scene.node_count();
        let named_survivors: Vec<String> = (0..before)
            .filter(|n| !expected_gone.contains(n))
            .filter_map(|n| scene.node_name(n).unwrap().map(str::to_owned))
            .collect();

        scene.delete_scene_nodes(&victims).unwrap();

        assert_eq!(scene.node_count(), before - expected_gone.len());
        assert_links_consistent(&scene);
        for name in &named_survivors {
            assert!(scene.find_node_by_name(name).is_some(), "{name} lost");
        }
        for mesh_node in scene.nodes_with(NodeKind::Mesh) {
            assert!(mesh_node < scene.node_count());
            assert!(scene.property(mesh_node, NodeKind::Mesh).unwrap().is_some());
        }

        scene.recalculate_global_transforms();
        assert_globals_consistent(&scene);
    }
}

#[test]
fn test_delete_leaf_then_readd_restores_shape() {
    let mut scene = random_scene(5, 40, true);
    let leaf = (1..scene.node_count())
        .find(|&n| scene.node_hierarchy(n).unwrap().first_child.is_none())
        .unwrap();
    let parent = scene.node_hierarchy(leaf).unwrap().parent.unwrap();
    let siblings_before = scene.children(parent).unwrap().count();
    let level_before = scene.node_hierarchy(leaf).unwrap().level;

    scene.delete_scene_nodes(&[leaf]).unwrap();
    let parent = if parent > leaf { parent - 1 } else { parent };
    assert_eq!(scene.children(parent).unwrap().count(), siblings_before - 1);

    let readded = scene.add_node(parent).unwrap();
    assert_eq!(scene.children(parent).unwrap().count(), siblings_before);
    assert_eq!(scene.children(parent).unwrap().next(), Some(readded));
    assert_eq!(scene.node_hierarchy(readded).unwrap().level, level_before);
    assert_links_consistent(&scene);
}

#[test]
fn test_invalid_indices_fail_fast() {
    let mut scene = Scene::new();
    let count = scene.node_count();
    let invalid = SceneError::InvalidNodeIndex { index: 5, node_count: count };

    assert_eq!(scene.add_node(5).unwrap_err(), invalid);
    assert_eq!(scene.node_global_transform(5).unwrap_err(), invalid);
    assert_eq!(scene.set_node_local_transform(5, Mat4::identity()).unwrap_err(), invalid);
    assert_eq!(scene.delete_scene_nodes(&[5]).unwrap_err(), invalid);
    assert_eq!(scene.delete_scene_nodes(&[ROOT_NODE]).unwrap_err(), SceneError::RootDeletion);
    assert_eq!(scene.node_count(), count);
}

#[test]
fn test_chain_stops_at_deepest_level() {
    let mut scene = Scene::new();
    let mut tip = ROOT_NODE;
    for _ in 1..MAX_NODE_LEVEL {
        tip = scene.add_node(tip).unwrap();
        scene.set_node_local_transform(tip, translation(1.0, 0.0, 0.0)).unwrap();
    }
    assert_eq!(scene.node_hierarchy(tip).unwrap().level, MAX_NODE_LEVEL - 1);

    let err = scene.add_node(tip).unwrap_err();
    assert_eq!(
        err,
        SceneError::MaxDepthExceeded {
            parent: tip,
            level: MAX_NODE_LEVEL
        }
    );
    assert_eq!(scene.node_count(), MAX_NODE_LEVEL);

    scene.recalculate_global_transforms();
    let global = scene.node_global_transform(tip).unwrap();
    assert_relative_eq!(global[(0, 3)], (MAX_NODE_LEVEL - 1) as f32);
}

#[test]
fn test_merged_scene_matches_inputs() {
    let mut first = random_scene(11, 60, true);
    let mut second = random_scene(12, 45, true);
    first.recalculate_global_transforms();
    second.recalculate_global_transforms();

    let lift = translation(0.0, 10.0, 0.0);
    let mut merged = Scene::merge_scenes(&[&first, &second], &[Mat4::identity(), lift], &[16, 12], true, true).unwrap();
    merged.recalculate_global_transforms();

    assert_eq!(merged.node_count(), 1 + 60 + 45);
    assert_eq!(merged.node_name(ROOT_NODE).unwrap(), Some(MERGED_ROOT_NAME));
    assert_links_consistent(&merged);
    assert_globals_consistent(&merged);

    let offset = 1 + first.node_count();
    for node in 0..second.node_count() {
        let original = second.node_hierarchy(node).unwrap();
        let copied = merged.node_hierarchy(offset + node).unwrap();
        assert_eq!(copied.level, original.level + 1);
        assert_relative_eq!(
            *merged.node_global_transform(offset + node).unwrap(),
            lift * second.node_global_transform(node).unwrap(),
            epsilon = 1e-4
        );
        assert_eq!(merged.node_name(offset + node).unwrap(), second.node_name(node).unwrap());
    }

    for node in second.nodes_with(NodeKind::Mesh) {
        let (Some(NodeProperty::Mesh(before)), Some(NodeProperty::Mesh(after))) = (
            second.property(node, NodeKind::Mesh).unwrap(),
            merged.property(offset + node, NodeKind::Mesh).unwrap(),
        ) else {
            panic!("mesh property missing on node {node}");
        };
        assert_eq!(after.mesh_index, before.mesh_index + 16);
    }
}

#[test]
fn test_merge_then_delete_one_input() {
    let first = random_scene(21, 30, true);
    let second = random_scene(22, 25, true);
    let mut merged = Scene::merge_scenes(&[&first, &second], &[], &[], false, false).unwrap();

    let old_roots: Vec<NodeIndex> = merged.children(ROOT_NODE).unwrap().collect();
    assert_eq!(old_roots, vec![1, 1 + first.node_count()]);

    merged.delete_scene_nodes(&[old_roots[0]]).unwrap();
    assert_eq!(merged.node_count(), 1 + second.node_count());
    assert_eq!(merged.children(ROOT_NODE).unwrap().collect::<Vec<_>>(), vec![1]);
    assert_links_consistent(&merged);

    merged.recalculate_global_transforms();
    assert_globals_consistent(&merged);
}

#[test]
fn test_merging_a_full_depth_scene_is_rejected() {
    let mut deep = Scene::new();
    let mut tip = ROOT_NODE;
    for _ in 1..MAX_NODE_LEVEL {
        tip = deep.add_node(tip).unwrap();
    }
    let err = Scene::merge_scenes(&[&deep], &[], &[], false, false).unwrap_err();
    assert!(matches!(err, SceneError::MaxDepthExceeded { .. }));
}

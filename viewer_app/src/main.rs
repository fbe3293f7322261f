//! Scene viewer
//!
//! Builds a ring of cubes under a spinning pivot and renders it.
//!
//! Controls: `Esc` quits, `Delete` removes the most recently added cube
//! together with its children, `M` merges a copy of the cube ring back in.

use std::time::Instant;

use glfw::Key;
use scene_engine::foundation::logging;
use scene_engine::prelude::*;

const CUBE_MESH: u32 = 0;
const RING_SIZE: usize = 6;

fn cube() -> (Vec<MeshVertex>, Vec<u32>) {
    let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
        ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ([0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u, v) in faces {
        let base = vertices.len() as u32;
        for (su, sv) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
            let position = [0, 1, 2].map(|i| normal[i] * 0.5 + u[i] * su + v[i] * sv);
            vertices.push(MeshVertex { position, normal });
        }
        indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

fn cube_property(material_index: u32) -> MeshNode {
    MeshNode {
        mesh_index: CUBE_MESH,
        material_index,
        local_bounds: BoundingBox::new(Vec3::repeat(-0.5), Vec3::repeat(0.5)),
    }
}

const PIVOT_NAME: &str = "pivot";

/// A ring of cubes around a pivot root, each carrying a smaller satellite cube
fn build_ring(config: &SceneConfig) -> SceneResult<Scene> {
    let mut ring = Scene::with_config(config);
    ring.set_node_name(ROOT_NODE, PIVOT_NAME)?;
    let material = ring.add_material("default")?;
    for i in 0..RING_SIZE {
        let angle = i as f32 / RING_SIZE as f32 * std::f32::consts::TAU;
        let cube = ring.add_node_named(ROOT_NODE, format!("cube_{i}"))?;
        ring.set_node_local_transform(cube, translation(3.0 * angle.cos(), 0.0, 3.0 * angle.sin()))?;
        ring.add_mesh(cube, cube_property(material))?;

        let satellite = ring.add_node_named(cube, format!("satellite_{i}"))?;
        ring.set_node_local_transform(satellite, translation(0.0, 1.0, 0.0) * uniform_scale(0.4))?;
        ring.add_mesh(satellite, cube_property(material))?;
    }
    Ok(ring)
}

struct Viewer {
    scene: Scene,
    pivots: Vec<NodeIndex>,
    config: ApplicationConfig,
}

impl Viewer {
    fn new(config: ApplicationConfig) -> SceneResult<Self> {
        let ring = build_ring(&config.scene)?;
        let mut scene = Scene::merge_scenes(&[&ring], &[], &[1], true, true)?;

        let camera = scene.add_node_named(ROOT_NODE, "camera")?;
        scene.set_node_local_transform(
            camera,
            translation(0.0, 4.0, 10.0) * Mat4::new_rotation(Vec3::new(-0.35, 0.0, 0.0)),
        )?;
        scene.add_property(
            camera,
            NodeProperty::Camera(CameraNode { fov_y: 0.8, aspect: 1.0, near: 0.1, far: 100.0 }),
        )?;

        let mut viewer = Self { scene, pivots: Vec::new(), config };
        viewer.find_pivots()?;
        Ok(viewer)
    }

    fn find_pivots(&mut self) -> SceneResult<()> {
        self.pivots.clear();
        for index in 0..self.scene.node_count() {
            if self.scene.node_name(index)? == Some(PIVOT_NAME) {
                self.pivots.push(index);
            }
        }
        Ok(())
    }

    fn spin(&mut self, seconds: f32) -> SceneResult<()> {
        for (i, &pivot) in self.pivots.iter().enumerate() {
            let direction = if i % 2 == 0 { 1.0 } else { -1.0 };
            self.scene
                .set_node_local_transform(pivot, Mat4::new_rotation(Vec3::new(0.0, direction * seconds * 0.5, 0.0)))?;
        }
        Ok(())
    }

    fn delete_newest_cube(&mut self) -> SceneResult<()> {
        let Some(&pivot) = self.pivots.first() else {
            return Ok(());
        };
        let Some(newest) = self.scene.children(pivot)?.next() else {
            log::info!("No cubes left to delete");
            return Ok(());
        };
        self.scene.delete_scene_nodes(&[newest])?;
        self.find_pivots()?;
        log::info!("Deleted node {newest}, {} nodes remain", self.scene.node_count());
        Ok(())
    }

    fn merge_ring(&mut self) -> SceneResult<()> {
        let ring = build_ring(&self.config.scene)?;
        let lifted = translation(0.0, 2.5 * self.pivots.len() as f32, 0.0);
        self.scene = Scene::merge_scenes(&[&self.scene, &ring], &[Mat4::identity(), lifted], &[], false, false)?;
        self.find_pivots()?;
        log::info!("Merged another ring, {} nodes", self.scene.node_count());
        Ok(())
    }
}

fn load_config() -> Result<ApplicationConfig, ConfigError> {
    let config = match std::env::args().nth(1) {
        Some(path) => ApplicationConfig::load_from_file(&path)?,
        None => ApplicationConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    logging::init_with_level(&config.engine.log_level);

    let (width, height) = config.renderer.window_size;
    let mut window = Window::new(&config.renderer.application_name, width, height)?;
    let mut renderer = Renderer::new(&mut window, &config)?;

    let (vertices, indices) = cube();
    renderer.add_mesh(CUBE_MESH, &vertices, &indices, &config.renderer.shaders)?;

    let mut viewer = Viewer::new(config)?;
    let start = Instant::now();
    let mut needs_recreate = false;

    while !window.should_close() {
        for event in window.poll_events() {
            match event {
                WindowEvent::KeyPressed(Key::Escape) | WindowEvent::CloseRequested => window.set_should_close(true),
                WindowEvent::KeyPressed(Key::Delete) => viewer.delete_newest_cube()?,
                WindowEvent::KeyPressed(Key::M) => {
                    if let Err(e) = viewer.merge_ring() {
                        log::warn!("Merge rejected: {e}");
                    }
                }
                WindowEvent::Resized(..) => needs_recreate = true,
                WindowEvent::KeyPressed(_) => {}
            }
        }

        if needs_recreate {
            renderer.recreate(&mut window)?;
            needs_recreate = false;
        }

        viewer.spin(start.elapsed().as_secs_f32())?;
        if renderer.render_frame(&mut viewer.scene)? == FrameStatus::NeedsRecreate {
            needs_recreate = true;
        }
    }

    renderer.wait_idle()?;
    log::info!("Viewer closed after {:.1}s", start.elapsed().as_secs_f32());
    Ok(())
}

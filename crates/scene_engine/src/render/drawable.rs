//! Things that record draw commands into a frame
//!
//! The renderer owns a [`DrawableSet`]; each frame it hands every drawable
//! the frame's command buffer, the render target and the scene. Drawables
//! begin their own render pass with the target's current load op, so the
//! first one clears and the rest draw on top. When nothing recorded a pass,
//! the set's clear pass runs instead so the image still reaches its
//! presentable layout.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use crate::core::config::ShaderConfig;
use crate::foundation::math::Mat4;
use crate::render::commands::CommandManager;
use crate::render::vulkan::buffer::DeviceLocalBuffer;
use crate::render::vulkan::command_device::VulkanCommandDevice;
use crate::render::vulkan::pipeline::{GraphicsPipeline, ShaderModule, VertexInput};
use crate::render::vulkan::render_target::RenderTarget;
use crate::render::vulkan::VulkanResult;
use crate::scene::{NodeKind, NodeProperty, Scene};

/// Records commands for one frame
pub trait Drawable {
    /// Record into `cmd` for the image `target` currently points at
    fn record(
        &mut self,
        cmd: vk::CommandBuffer,
        target: &dyn RenderTarget,
        frame_index: usize,
        scene: &Scene,
    ) -> VulkanResult<()>;

    /// Rebuild anything derived from the target's passes or framebuffers
    fn reset(&mut self, target: &dyn RenderTarget) -> VulkanResult<()>;
}

/// Ordered collection of drawables
#[derive(Default)]
pub struct DrawableSet {
    drawables: Vec<Box<dyn Drawable>>,
    clear_pass: Option<Box<dyn Drawable>>,
}

impl DrawableSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `clear_pass` on frames where no drawable recorded a pass
    pub fn with_clear_pass(mut self, clear_pass: Box<dyn Drawable>) -> Self {
        self.clear_pass = Some(clear_pass);
        self
    }

    /// Append a drawable; it records after the ones already present
    pub fn push(&mut self, drawable: Box<dyn Drawable>) {
        self.drawables.push(drawable);
    }

    /// Number of drawables
    pub fn len(&self) -> usize {
        self.drawables.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.drawables.is_empty()
    }

    /// Record every drawable in order, or the clear pass if none recorded
    pub fn record(
        &mut self,
        cmd: vk::CommandBuffer,
        target: &mut dyn RenderTarget,
        frame_index: usize,
        scene: &Scene,
    ) -> VulkanResult<()> {
        for drawable in &mut self.drawables {
            drawable.record(cmd, &*target, frame_index, scene)?;
            target.mark_pass_recorded();
        }
        if target.current_load_op() == vk::AttachmentLoadOp::CLEAR {
            if let Some(clear_pass) = &mut self.clear_pass {
                clear_pass.record(cmd, &*target, frame_index, scene)?;
                target.mark_pass_recorded();
            }
        }
        Ok(())
    }

    /// Notify every drawable that the target was rebuilt
    pub fn reset(&mut self, target: &dyn RenderTarget) -> VulkanResult<()> {
        self.drawables.iter_mut().try_for_each(|drawable| drawable.reset(target))?;
        match &mut self.clear_pass {
            Some(clear_pass) => clear_pass.reset(target),
            None => Ok(()),
        }
    }
}

/// Render pass with no draws, clearing the image to the target's clear color
pub struct ClearPass {
    device: ash::Device,
}

impl ClearPass {
    /// Clear pass recorded through `device`
    pub fn new(device: ash::Device) -> Self {
        Self { device }
    }
}

impl Drawable for ClearPass {
    fn record(
        &mut self,
        cmd: vk::CommandBuffer,
        target: &dyn RenderTarget,
        _frame_index: usize,
        _scene: &Scene,
    ) -> VulkanResult<()> {
        let clear_values = target.clear_values();
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(target.render_pass(target.current_load_op()))
            .framebuffer(target.framebuffer())
            .render_area(vk::Rect2D { offset: vk::Offset2D::default(), extent: target.viewport_extent() })
            .clear_values(&clear_values);
        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            self.device.cmd_end_render_pass(cmd);
        }
        Ok(())
    }

    fn reset(&mut self, _target: &dyn RenderTarget) -> VulkanResult<()> {
        Ok(())
    }
}

/// Vertex layout of [`MeshDrawable`]
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Object-space normal
    pub normal: [f32; 3],
}

impl MeshVertex {
    /// Vertex buffer binding
    pub fn bindings() -> [vk::VertexInputBindingDescription; 1] {
        [vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    /// Position at location 0, normal at location 1
    pub fn attributes() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 12,
            },
        ]
    }
}

/// Projection × view of the first camera node, or identity without one
///
/// The camera's aspect is replaced by the one of `extent`.
pub fn camera_view_projection(scene: &Scene, extent: vk::Extent2D) -> Mat4 {
    let camera = scene.nodes_with(NodeKind::Camera).into_iter().find_map(|index| {
        let global = scene.node_global_transform(index).ok()?;
        match scene.property(index, NodeKind::Camera).ok()?? {
            NodeProperty::Camera(camera) => Some((camera.clone(), *global)),
            _ => None,
        }
    });

    let Some((mut camera, global)) = camera else {
        return Mat4::identity();
    };
    if extent.height > 0 {
        camera.aspect = extent.width as f32 / extent.height as f32;
    }
    let view = global.try_inverse().unwrap_or_else(Mat4::identity);
    camera.projection() * view
}

/// Model-view-projection matrices of every node drawing `mesh_index`
pub fn mesh_instance_transforms(scene: &Scene, mesh_index: u32, view_projection: &Mat4) -> Vec<Mat4> {
    scene
        .nodes_with(NodeKind::Mesh)
        .into_iter()
        .filter_map(|index| match scene.property(index, NodeKind::Mesh).ok()?? {
            NodeProperty::Mesh(mesh) if mesh.mesh_index == mesh_index => {
                scene.node_global_transform(index).ok().map(|global| view_projection * global)
            }
            _ => None,
        })
        .collect()
}

/// Draws one mesh at every scene node that references it
pub struct MeshDrawable {
    device: ash::Device,
    mesh_index: u32,
    vertices: DeviceLocalBuffer,
    indices: DeviceLocalBuffer,
    vertex_shader: ShaderModule,
    fragment_shader: ShaderModule,
    pipeline: GraphicsPipeline,
}

impl MeshDrawable {
    /// Upload geometry and build the pipeline for `target`
    ///
    /// The uploads are left in flight on the transfer queue; wait on it
    /// before the first frame that records this drawable.
    pub fn new(
        commands: &CommandManager<VulkanCommandDevice>,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        mesh_index: u32,
        vertices: &[MeshVertex],
        indices: &[u32],
        shaders: &ShaderConfig,
        target: &dyn RenderTarget,
    ) -> VulkanResult<Self> {
        let device = commands.device().raw().clone();

        let vertex_shader = ShaderModule::from_file(device.clone(), &shaders.vertex_shader_path)?;
        let fragment_shader = ShaderModule::from_file(device.clone(), &shaders.fragment_shader_path)?;
        let pipeline = Self::build_pipeline(&device, target, &vertex_shader, &fragment_shader)?;

        let vertices =
            DeviceLocalBuffer::with_data(commands, memory_properties, vertices, vk::BufferUsageFlags::VERTEX_BUFFER)?;
        let indices =
            DeviceLocalBuffer::with_data(commands, memory_properties, indices, vk::BufferUsageFlags::INDEX_BUFFER)?;

        log::debug!(
            "Mesh {mesh_index} uploaded: {} vertices, {} indices",
            vertices.element_count(),
            indices.element_count()
        );

        Ok(Self {
            device,
            mesh_index,
            vertices,
            indices,
            vertex_shader,
            fragment_shader,
            pipeline,
        })
    }

    /// Mesh index this drawable matches against
    pub fn mesh_index(&self) -> u32 {
        self.mesh_index
    }

    fn build_pipeline(
        device: &ash::Device,
        target: &dyn RenderTarget,
        vertex_shader: &ShaderModule,
        fragment_shader: &ShaderModule,
    ) -> VulkanResult<GraphicsPipeline> {
        let bindings = MeshVertex::bindings();
        let attributes = MeshVertex::attributes();
        GraphicsPipeline::new(
            device.clone(),
            target.render_pass(vk::AttachmentLoadOp::CLEAR),
            vertex_shader,
            fragment_shader,
            VertexInput { bindings: &bindings, attributes: &attributes },
        )
    }
}

impl Drawable for MeshDrawable {
    fn record(
        &mut self,
        cmd: vk::CommandBuffer,
        target: &dyn RenderTarget,
        _frame_index: usize,
        scene: &Scene,
    ) -> VulkanResult<()> {
        let extent = target.viewport_extent();
        let load_op = target.current_load_op();
        let clear_values = target.clear_values();

        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(target.render_pass(load_op))
            .framebuffer(target.framebuffer())
            .render_area(vk::Rect2D { offset: vk::Offset2D::default(), extent })
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D { offset: vk::Offset2D::default(), extent };

        let view_projection = camera_view_projection(scene, extent);
        let instances = mesh_instance_transforms(scene, self.mesh_index, &view_projection);

        unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.handle());
            self.device.cmd_set_viewport(cmd, 0, &[viewport]);
            self.device.cmd_set_scissor(cmd, 0, &[scissor]);
            self.device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertices.handle()], &[0]);
            self.device
                .cmd_bind_index_buffer(cmd, self.indices.handle(), 0, vk::IndexType::UINT32);

            for mvp in &instances {
                self.device.cmd_push_constants(
                    cmd,
                    self.pipeline.layout(),
                    vk::ShaderStageFlags::VERTEX,
                    0,
                    bytemuck::cast_slice(mvp.as_slice()),
                );
                self.device
                    .cmd_draw_indexed(cmd, self.indices.element_count(), 1, 0, 0, 0);
            }

            self.device.cmd_end_render_pass(cmd);
        }
        Ok(())
    }

    fn reset(&mut self, target: &dyn RenderTarget) -> VulkanResult<()> {
        self.pipeline = Self::build_pipeline(&self.device, target, &self.vertex_shader, &self.fragment_shader)?;
        Ok(())
    }
}

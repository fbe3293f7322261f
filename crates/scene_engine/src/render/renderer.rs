//! Top-level frame loop
//!
//! One frame:
//!
//! ```text
//! recalculate global transforms
//!   -> wait frame fence -> acquire image -> restart graphics batch
//!   -> record drawables -> reset frame fence
//!   -> submit (wait image, signal finished + fence)
//!   -> present -> next frame slot
//! ```
//!
//! A frame that fails before its submission keeps its graphics batch for
//! the next restart and gets a fresh signalled fence and image semaphore.
//!
//! An out-of-date swapchain is reported as [`FrameStatus::NeedsRecreate`];
//! the caller responds with [`Renderer::recreate`].

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::config::ConfigError;
use crate::core::config::{ApplicationConfig, ShaderConfig};
use crate::render::commands::{CommandBatch, CommandDevice, CommandError, CommandManager, PoolType, WaitInfo};
use crate::render::drawable::{ClearPass, Drawable, DrawableSet, MeshDrawable, MeshVertex};
use crate::render::vulkan::{
    FrameSync, SwapchainTarget, VulkanCommandDevice, VulkanContext, VulkanError, Window,
};
use crate::scene::{Scene, SceneError};

/// Renderer errors
#[derive(Error, Debug)]
pub enum RenderError {
    /// Vulkan backend failure
    #[error(transparent)]
    Vulkan(#[from] VulkanError),

    /// Scene access failure
    #[error(transparent)]
    Scene(#[from] SceneError),

    /// Invalid renderer configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<CommandError> for RenderError {
    fn from(error: CommandError) -> Self {
        RenderError::Vulkan(VulkanError::Command(error))
    }
}

/// Result type for renderer operations
pub type RenderResult<T> = Result<T, RenderError>;

/// Outcome of [`Renderer::render_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame was submitted and presented
    Presented,
    /// The swapchain no longer matches the surface
    NeedsRecreate,
}

/// Scene renderer over a window's swapchain
pub struct Renderer {
    // drop order: GPU users first, device last
    drawables: DrawableSet,
    graphics_batches: Vec<Option<CommandBatch>>,
    frames: Vec<FrameSync>,
    target: SwapchainTarget,
    commands: CommandManager<VulkanCommandDevice>,
    context: VulkanContext,
    clear_color: [f32; 4],
    frame_index: usize,
}

impl Renderer {
    /// Create the Vulkan context, command manager, and swapchain target
    pub fn new(window: &mut Window, config: &ApplicationConfig) -> RenderResult<Self> {
        config.validate()?;
        let renderer_config = &config.renderer;

        let context = VulkanContext::new(
            window,
            &renderer_config.application_name,
            renderer_config.validation_enabled(),
        )?;
        let command_device = Arc::new(VulkanCommandDevice::new(&context.device)?);
        let commands = CommandManager::new(command_device, &config.commands)?;

        let (width, height) = window.framebuffer_size();
        let target = SwapchainTarget::new(
            &context,
            vk::Extent2D { width, height },
            renderer_config.clear_color,
            None,
        )?;

        let frames = (0..renderer_config.max_frames_in_flight)
            .map(|_| FrameSync::new(context.raw_device()))
            .collect::<Result<Vec<_>, _>>()?;
        let graphics_batches = frames.iter().map(|_| None).collect();

        log::info!(
            "Renderer ready: {} frames in flight, {} swapchain images",
            frames.len(),
            target.image_count()
        );

        Ok(Self {
            drawables: DrawableSet::new().with_clear_pass(Box::new(ClearPass::new(context.raw_device()))),
            graphics_batches,
            frames,
            target,
            commands,
            context,
            clear_color: renderer_config.clear_color,
            frame_index: 0,
        })
    }

    /// The command manager, for uploads issued outside the frame loop
    pub fn commands(&self) -> &CommandManager<VulkanCommandDevice> {
        &self.commands
    }

    /// The swapchain render target
    pub fn target(&self) -> &SwapchainTarget {
        &self.target
    }

    /// Number of drawables recorded each frame
    pub fn drawable_count(&self) -> usize {
        self.drawables.len()
    }

    /// Append a drawable
    pub fn add_drawable(&mut self, drawable: Box<dyn Drawable>) {
        self.drawables.push(drawable);
    }

    /// Upload a mesh and draw it at every node referencing `mesh_index`
    ///
    /// Blocks until the transfer queue is idle so the geometry is resident
    /// before the next frame.
    pub fn add_mesh(
        &mut self,
        mesh_index: u32,
        vertices: &[MeshVertex],
        indices: &[u32],
        shaders: &ShaderConfig,
    ) -> RenderResult<()> {
        let drawable = MeshDrawable::new(
            &self.commands,
            self.context.memory_properties(),
            mesh_index,
            vertices,
            indices,
            shaders,
            &self.target,
        )?;
        self.commands.wait(PoolType::Transfer)?;
        self.drawables.push(Box::new(drawable));
        Ok(())
    }

    /// Render and present one frame of `scene`
    pub fn render_frame(&mut self, scene: &mut Scene) -> RenderResult<FrameStatus> {
        scene.recalculate_global_transforms();

        let frame_index = self.frame_index;
        let frame = &self.frames[frame_index];
        frame.in_flight.wait(u64::MAX)?;

        if !self.target.acquire(frame.image_available.handle())? {
            log::warn!("Swapchain out of date on acquire");
            return Ok(FrameStatus::NeedsRecreate);
        }

        let recorded = record_frame_batch(
            &self.commands,
            &mut self.graphics_batches[frame_index],
            WaitInfo::none().with(
                frame.image_available.handle(),
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            ),
            |cmd| Ok(self.drawables.record(cmd, &mut self.target, frame_index, scene)?),
            || Ok(frame.in_flight.reset()?),
            &[frame.render_finished.handle()],
            frame.in_flight.handle(),
        );
        if let Err(e) = recorded {
            // nothing will wait on the acquire signal or signal a reset fence
            log::error!("Frame {frame_index} abandoned: {e}");
            self.context.wait_idle()?;
            self.frames[frame_index].rearm()?;
            return Err(e);
        }
        let frame = &self.frames[frame_index];

        let present_queue = self.context.device.queue(self.context.queue_families().present)?;
        let stale = self
            .target
            .present(&present_queue, frame.render_finished.handle())?;

        self.frame_index = (self.frame_index + 1) % self.frames.len();

        if stale {
            log::warn!("Swapchain out of date on present");
            Ok(FrameStatus::NeedsRecreate)
        } else {
            Ok(FrameStatus::Presented)
        }
    }

    /// Rebuild the render target for the window's current size
    ///
    /// Blocks while the window is minimized. Every drawable is reset before
    /// the next frame is recorded.
    pub fn recreate(&mut self, window: &mut Window) -> RenderResult<()> {
        let (mut width, mut height) = window.framebuffer_size();
        while width == 0 || height == 0 {
            window.wait_events();
            (width, height) = window.framebuffer_size();
        }

        self.context.wait_idle()?;
        let target = SwapchainTarget::new(
            &self.context,
            vk::Extent2D { width, height },
            self.clear_color,
            Some(&self.target),
        )?;
        self.target = target;
        self.drawables.reset(&self.target)?;

        log::debug!("Render target recreated at {width}x{height}");
        Ok(())
    }

    /// Block until the device has finished all submitted work
    pub fn wait_idle(&self) -> RenderResult<()> {
        self.context.wait_idle()?;
        Ok(())
    }
}

/// Restart or allocate the batch of a frame slot, record it, and submit it
///
/// The slot keeps its batch when restarting or recording fails, so the next
/// frame restarts it. `before_submit` runs only after recording succeeded.
/// A failed submission frees the batch and the slot allocates a new one.
fn record_frame_batch<D: CommandDevice>(
    commands: &CommandManager<D>,
    slot: &mut Option<CommandBatch>,
    wait_info: WaitInfo,
    record: impl FnOnce(vk::CommandBuffer) -> RenderResult<()>,
    before_submit: impl FnOnce() -> RenderResult<()>,
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> RenderResult<()> {
    let batch = match slot.take() {
        Some(batch) => {
            if let Err(e) = commands.restart(&batch) {
                *slot = Some(batch);
                return Err(e.into());
            }
            batch
        }
        None => commands.alloc_command_buffer(PoolType::Graphics, 1, wait_info)?,
    };

    if let Err(e) = record(batch.primary()).and_then(|()| before_submit()) {
        *slot = Some(batch);
        return Err(e);
    }

    *slot = commands.submit_command_buffer(batch, signal_semaphores, Some(fence))?;
    Ok(())
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            log::error!("Failed to wait for device idle on shutdown: {e}");
        }
        for batch in self.graphics_batches.iter_mut().filter_map(Option::take) {
            if let Err(e) = self.commands.free(batch) {
                log::warn!("Failed to free graphics batch: {e}");
            }
        }
        self.commands.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CommandConfig;
    use crate::render::commands::tests::MockDevice;
    use ash::vk::Handle;
    use std::sync::atomic::Ordering;

    fn commands() -> CommandManager<MockDevice> {
        CommandManager::new(Arc::new(MockDevice::default()), &CommandConfig::with_transfer_slots(1)).unwrap()
    }

    fn frame_fence() -> vk::Fence {
        vk::Fence::from_raw(1000)
    }

    #[test]
    fn test_failed_recording_keeps_the_batch_and_the_fence() {
        let commands = commands();
        let mut slot = None;
        let mut fence_resets = 0;

        let err = record_frame_batch(
            &commands,
            &mut slot,
            WaitInfo::none(),
            |_| Err(VulkanError::InvalidOperation { reason: "lost pipeline".to_string() }.into()),
            || {
                fence_resets += 1;
                Ok(())
            },
            &[],
            frame_fence(),
        );
        assert!(err.is_err());
        assert_eq!(fence_resets, 0);
        let kept = slot.as_ref().map(CommandBatch::primary).unwrap();

        let mut recorded_into = None;
        record_frame_batch(
            &commands,
            &mut slot,
            WaitInfo::none(),
            |cmd| {
                recorded_into = Some(cmd);
                Ok(())
            },
            || {
                fence_resets += 1;
                Ok(())
            },
            &[],
            frame_fence(),
        )
        .unwrap();
        assert_eq!(recorded_into, Some(kept));
        assert_eq!(fence_resets, 1);
        assert!(slot.is_some());
        assert_eq!(commands.device().submissions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_submit_frees_the_batch() {
        let commands = commands();
        commands.device().fail_submits.store(true, Ordering::SeqCst);
        let mut slot = None;

        let result = record_frame_batch(&commands, &mut slot, WaitInfo::none(), |_| Ok(()), || Ok(()), &[], frame_fence());
        assert!(result.is_err());
        assert!(slot.is_none());
        assert_eq!(commands.device().freed_buffers.load(Ordering::SeqCst), 1);

        commands.device().fail_submits.store(false, Ordering::SeqCst);
        record_frame_batch(&commands, &mut slot, WaitInfo::none(), |_| Ok(()), || Ok(()), &[], frame_fence()).unwrap();
        assert!(slot.is_some());
    }
}

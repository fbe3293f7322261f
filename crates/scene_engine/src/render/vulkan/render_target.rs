//! Per-frame attachment bundle drawables render into
//!
//! A [`RenderTarget`] hands out a render pass for a given load op, the
//! framebuffer of the image being rendered, and the viewport extent. The
//! first pass of a frame clears; every later pass loads what the earlier ones
//! wrote. After a target is rebuilt every handle obtained from it is invalid.

use std::sync::Mutex;

use ash::vk;

use super::context::VulkanContext;
use super::framebuffer::{DepthBuffer, Framebuffer};
use super::render_pass::RenderPass;
use super::swapchain::Swapchain;
use super::{VulkanError, VulkanResult};

/// Attachments of the frame currently being recorded
pub trait RenderTarget {
    /// Render pass beginning with `load_op`
    ///
    /// Any op other than `CLEAR` yields the loading pass.
    fn render_pass(&self, load_op: vk::AttachmentLoadOp) -> vk::RenderPass;

    /// Framebuffer of the current image, compatible with both passes
    fn framebuffer(&self) -> vk::Framebuffer;

    /// Size of the attachments
    fn viewport_extent(&self) -> vk::Extent2D;

    /// Load op the next pass of this frame should use
    fn current_load_op(&self) -> vk::AttachmentLoadOp;

    /// Number of frames presented so far
    fn frame_count(&self) -> u64;

    /// Clear values for the color and depth attachments
    fn clear_values(&self) -> [vk::ClearValue; 2];

    /// Record that a pass of this frame has been written, so later passes load
    fn mark_pass_recorded(&mut self);
}

/// Render target over the swapchain images and a shared depth buffer
pub struct SwapchainTarget {
    // field order is drop order: framebuffers before passes and attachments
    framebuffers: Vec<Framebuffer>,
    clear_pass: RenderPass,
    load_pass: RenderPass,
    depth: DepthBuffer,
    swapchain: Swapchain,
    clear_color: [f32; 4],
    image_index: u32,
    load_op: vk::AttachmentLoadOp,
    frame_count: u64,
}

impl SwapchainTarget {
    /// Build the swapchain, depth buffer, passes, and framebuffers
    ///
    /// When `previous` is given its swapchain is handed to the driver as the
    /// one being replaced; the caller drops the previous target afterwards.
    pub fn new(
        context: &VulkanContext,
        window_extent: vk::Extent2D,
        clear_color: [f32; 4],
        previous: Option<&SwapchainTarget>,
    ) -> VulkanResult<Self> {
        let device = context.raw_device();
        let swapchain = Swapchain::new(context, window_extent, previous.map(|target| &target.swapchain))?;
        let frame_count = previous.map_or(0, |target| target.frame_count);

        let extent = swapchain.extent();
        let color_format = swapchain.format().format;
        let depth = DepthBuffer::new(device.clone(), context.memory_properties(), extent)?;
        let clear_pass = RenderPass::new_forward_pass(device.clone(), color_format, vk::AttachmentLoadOp::CLEAR)?;
        let load_pass = RenderPass::new_forward_pass(device.clone(), color_format, vk::AttachmentLoadOp::LOAD)?;

        let framebuffers = swapchain
            .image_views()
            .iter()
            .map(|&view| Framebuffer::new(device.clone(), clear_pass.handle(), &[view, depth.image_view()], extent))
            .collect::<VulkanResult<Vec<_>>>()?;

        Ok(Self {
            framebuffers,
            clear_pass,
            load_pass,
            depth,
            swapchain,
            clear_color,
            image_index: 0,
            load_op: vk::AttachmentLoadOp::CLEAR,
            frame_count,
        })
    }

    /// Acquire the next image and reset the load op to `CLEAR`
    ///
    /// Returns `false` when the swapchain is out of date.
    pub fn acquire(&mut self, image_available: vk::Semaphore) -> VulkanResult<bool> {
        match self.swapchain.acquire_next_image(image_available)? {
            Some(index) => {
                if index as usize >= self.framebuffers.len() {
                    return Err(VulkanError::InvalidOperation {
                        reason: format!("Acquired image {index} of {}", self.framebuffers.len()),
                    });
                }
                self.image_index = index;
                self.load_op = vk::AttachmentLoadOp::CLEAR;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Present the current image; returns `true` when recreation is needed
    pub fn present(&mut self, queue: &Mutex<vk::Queue>, render_finished: vk::Semaphore) -> VulkanResult<bool> {
        let stale = self.swapchain.present(queue, self.image_index, render_finished)?;
        self.frame_count += 1;
        Ok(stale)
    }

    /// Number of swapchain images
    pub fn image_count(&self) -> usize {
        self.swapchain.image_count()
    }

    /// Index of the image being rendered
    pub fn image_index(&self) -> u32 {
        self.image_index
    }
}

impl RenderTarget for SwapchainTarget {
    fn render_pass(&self, load_op: vk::AttachmentLoadOp) -> vk::RenderPass {
        if load_op == vk::AttachmentLoadOp::CLEAR {
            self.clear_pass.handle()
        } else {
            self.load_pass.handle()
        }
    }

    fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffers
            .get(self.image_index as usize)
            .map_or_else(vk::Framebuffer::null, Framebuffer::handle)
    }

    fn viewport_extent(&self) -> vk::Extent2D {
        self.swapchain.extent()
    }

    fn current_load_op(&self) -> vk::AttachmentLoadOp {
        self.load_op
    }

    fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn clear_values(&self) -> [vk::ClearValue; 2] {
        [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: self.clear_color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            },
        ]
    }

    fn mark_pass_recorded(&mut self) {
        self.load_op = vk::AttachmentLoadOp::LOAD;
    }
}

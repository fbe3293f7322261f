//! Vulkan backend
//!
//! Thin RAII wrappers over `ash` objects plus the [`VulkanCommandDevice`]
//! that backs the command manager on real hardware. Every wrapper keeps a
//! clone of the logical device and destroys its handle on drop.

pub mod buffer;
pub mod command_device;
pub mod context;
pub mod framebuffer;
pub mod pipeline;
pub mod render_pass;
pub mod render_target;
pub mod swapchain;
pub mod sync;
pub mod window;

use ash::vk;
use thiserror::Error;

use crate::render::commands::CommandError;

pub use buffer::{Buffer, DeviceLocalBuffer, StagingBuffer};
pub use command_device::VulkanCommandDevice;
pub use context::{LogicalDevice, PhysicalDeviceInfo, QueueFamilies, VulkanContext, VulkanInstance};
pub use framebuffer::{DepthBuffer, Framebuffer};
pub use pipeline::{GraphicsPipeline, ShaderModule, VertexInput, MVP_PUSH_CONSTANT_SIZE};
pub use render_pass::{RenderPass, DEPTH_FORMAT};
pub use render_target::{RenderTarget, SwapchainTarget};
pub use swapchain::Swapchain;
pub use sync::{Fence, FrameSync, Semaphore};
pub use window::{Window, WindowEvent};

/// Vulkan backend errors
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Instance, device, or surface setup failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// Command manager failure
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Window system failure
    #[error("Window error: {0}")]
    Window(String),

    /// SPIR-V file could not be read
    #[error("Failed to load shader {path}: {source}")]
    ShaderLoad {
        /// Shader path
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

//! # Rendering
//!
//! - [`commands`]: pooled command batches and their background reclamation
//! - [`vulkan`]: `ash` backend (context, swapchain, buffers, pipeline)
//! - [`drawable`]: things that record into a frame
//! - [`renderer`]: the per-frame loop tying the scene to the swapchain

pub mod commands;
pub mod drawable;
pub mod renderer;
pub mod vulkan;

pub use commands::{
    CommandBatch, CommandDevice, CommandError, CommandManager, CommandResult, DeferredDestroy, PoolType,
    WaitInfo, MAX_COMMAND_BUFFERS,
};
pub use drawable::{ClearPass, Drawable, DrawableSet, MeshDrawable, MeshVertex};
pub use renderer::{FrameStatus, RenderError, RenderResult, Renderer};

//! # Scene Engine
//!
//! Scene graph and Vulkan command/resource lifecycle core for a real-time
//! renderer.
//!
//! ## Features
//!
//! - **Scene Graph**: structure-of-arrays hierarchy with level-ordered
//!   global transform propagation, typed node properties, subtree deletion
//!   with index compaction, and scene merging
//! - **Command Manager**: pooled transfer batches recycled by a background
//!   reclamation thread, plus graphics and compute batches
//! - **Vulkan Backend**: context, swapchain render target, staged buffer
//!   uploads, and a mesh pipeline over `ash` and `glfw`
//!
//! ## Quick Start
//!
//! ```rust
//! use scene_engine::prelude::*;
//!
//! let mut scene = Scene::new();
//! let arm = scene.add_node(ROOT_NODE)?;
//! let hand = scene.add_node(arm)?;
//! scene.set_node_local_transform(arm, translation(1.0, 0.0, 0.0))?;
//! scene.set_node_local_transform(hand, translation(0.0, 2.0, 0.0))?;
//! scene.recalculate_global_transforms();
//!
//! let global = scene.node_global_transform(hand)?;
//! assert_eq!((global[(0, 3)], global[(1, 3)]), (1.0, 2.0));
//! # Ok::<(), SceneError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod core;
pub mod foundation;
pub mod render;
pub mod scene;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::{Config, ConfigError},
        core::config::{ApplicationConfig, CommandConfig, RendererConfig, SceneConfig, ShaderConfig},
        foundation::math::{translation, uniform_scale, BoundingBox, Mat4, Transform, Vec3},
        render::{
            CommandManager, FrameStatus, MeshVertex, PoolType, RenderError, Renderer, WaitInfo,
        },
        render::vulkan::{Window, WindowEvent},
        scene::{
            CameraNode, MeshNode, NodeKind, NodeProperty, NodeIndex, Scene, SceneError, SceneResult,
            ROOT_NODE,
        },
    };
}

//! # Core Engine Module
//!
//! Shared configuration consumed by the scene graph, the command manager and
//! the renderer.

pub mod config;

pub use config::{
    ApplicationConfig,
    EngineConfig,
    SceneConfig,
    CommandConfig,
    RendererConfig,
    ShaderConfig,
};

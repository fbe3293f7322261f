//! # Unified Configuration System
//!
//! All configuration structures for the engine subsystems live here. Every
//! struct is serializable (TOML or RON through [`Config`]) and carries
//! defaults plus a `validate()` pass.
//!
//! ## Configuration Categories
//!
//! - **Engine Config**: logging and debug behaviour
//! - **Scene Config**: dirty-propagation tuning
//! - **Command Config**: transfer slot pool sizing
//! - **Renderer Config**: Vulkan instance, frames in flight, shaders

use serde::{Serialize, Deserialize};
use std::path::Path;

use crate::config::{Config, ConfigError};
use crate::render::commands::MAX_COMMAND_BUFFERS;

/// # Shader Configuration
///
/// SPIR-V paths for the mesh pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    /// Path to the vertex shader SPIR-V file
    pub vertex_shader_path: String,
    /// Path to the fragment shader SPIR-V file
    pub fragment_shader_path: String,
}

impl ShaderConfig {
    /// Create a new shader configuration
    pub fn new(vertex_path: impl Into<String>, fragment_path: impl Into<String>) -> Self {
        Self {
            vertex_shader_path: vertex_path.into(),
            fragment_shader_path: fragment_path.into(),
        }
    }

    /// Create shader config with automatic path resolution
    ///
    /// Tries a few common shader locations so the application can be started
    /// from different working directories.
    pub fn with_path_resolution(base_vertex: &str, base_fragment: &str) -> Self {
        let shader_dirs = [
            "target/shaders/",
            "shaders/",
            "resources/shaders/",
            "../shaders/",
            "./",
        ];

        let find = |base: &str| {
            shader_dirs
                .iter()
                .map(|dir| format!("{dir}{base}"))
                .find(|candidate| Path::new(candidate).exists())
                .unwrap_or_else(|| format!("shaders/{base}"))
        };

        Self {
            vertex_shader_path: find(base_vertex),
            fragment_shader_path: find(base_fragment),
        }
    }

    /// Validate that shader files exist
    pub fn validate(&self) -> Result<(), ConfigError> {
        for path in [&self.vertex_shader_path, &self.fragment_shader_path] {
            if !Path::new(path).exists() {
                return Err(ConfigError::Invalid(format!("Shader not found: {path}")));
            }
        }
        Ok(())
    }
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self::with_path_resolution("mesh.vert.spv", "mesh.frag.spv")
    }
}

/// # Engine Configuration
///
/// Core behaviour shared by every subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Log level used when `RUST_LOG` is not set
    pub log_level: String,
    /// Whether to enable debug features
    pub debug_mode: bool,
}

impl EngineConfig {
    /// Create a new engine configuration
    pub fn new() -> Self {
        Self {
            log_level: "info".to_string(),
            debug_mode: cfg!(debug_assertions),
        }
    }

    /// Set log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log_level.to_ascii_lowercase().as_str() {
            "off" | "error" | "warn" | "info" | "debug" | "trace" => Ok(()),
            other => Err(ConfigError::Invalid(format!("Unknown log level: {other}"))),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// # Scene Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Skip queueing a node that is already waiting for recomputation
    pub deduplicate_dirty: bool,
    /// Initial capacity reserved for the node arrays
    pub initial_capacity: usize,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            deduplicate_dirty: true,
            initial_capacity: 256,
        }
    }
}

/// # Command Configuration
///
/// Sizing of the leased transfer pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Number of command buffers, semaphores and fences pre-allocated for transfer work
    pub transfer_slots: usize,
}

impl CommandConfig {
    /// Create a configuration with `transfer_slots` slots of each kind
    pub fn with_transfer_slots(transfer_slots: usize) -> Self {
        Self { transfer_slots }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer_slots == 0 {
            return Err(ConfigError::Invalid("Transfer slot count must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self::with_transfer_slots(MAX_COMMAND_BUFFERS)
    }
}

/// # Renderer Configuration
///
/// Configuration specific to the Vulkan rendering backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for Vulkan instance creation
    pub application_name: String,
    /// Initial window size
    pub window_size: (u32, u32),
    /// Maximum frames in flight
    pub max_frames_in_flight: usize,
    /// Whether to enable Vulkan validation layers (`None` follows the build type)
    pub enable_validation: Option<bool>,
    /// Clear color for the first pass of each frame
    pub clear_color: [f32; 4],
    /// Shader configuration
    pub shaders: ShaderConfig,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            window_size: (1280, 720),
            max_frames_in_flight: 2,
            enable_validation: None,
            clear_color: [0.05, 0.05, 0.08, 1.0],
            shaders: ShaderConfig::default(),
        }
    }

    /// Set maximum frames in flight
    pub fn with_max_frames_in_flight(mut self, frames: usize) -> Self {
        self.max_frames_in_flight = frames;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration (shader files are checked separately at pipeline creation)
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_name.is_empty() {
            return Err(ConfigError::Invalid("Application name cannot be empty".to_string()));
        }

        if !(1..=8).contains(&self.max_frames_in_flight) {
            return Err(ConfigError::Invalid(format!(
                "Max frames in flight must be within 1..=8, got {}",
                self.max_frames_in_flight
            )));
        }

        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("Scene Viewer")
    }
}

/// # Complete Application Configuration
///
/// Top-level configuration that encompasses all engine subsystems.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Engine core configuration
    pub engine: EngineConfig,
    /// Scene graph configuration
    pub scene: SceneConfig,
    /// Command manager configuration
    pub commands: CommandConfig,
    /// Rendering system configuration
    pub renderer: RendererConfig,
}

impl ApplicationConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.commands.validate()?;
        self.renderer.validate()?;
        Ok(())
    }
}

impl Config for ApplicationConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ApplicationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.commands.transfer_slots, MAX_COMMAND_BUFFERS);
        assert!(config.scene.deduplicate_dirty);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(CommandConfig::with_transfer_slots(0).validate().is_err());
        assert!(RendererConfig::default().with_max_frames_in_flight(0).validate().is_err());
        assert!(RendererConfig::default().with_max_frames_in_flight(9).validate().is_err());
        assert!(EngineConfig::new().with_log_level("loud").validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_through_files() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("scene_engine_config_{}.toml", std::process::id()));
        let path = path.to_string_lossy().to_string();

        let mut config = ApplicationConfig::default();
        config.commands.transfer_slots = 8;
        config.renderer.max_frames_in_flight = 3;
        config.save_to_file(&path).unwrap();

        let loaded = ApplicationConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.commands.transfer_slots, 8);
        assert_eq!(loaded.renderer.max_frames_in_flight, 3);
        std::fs::remove_file(&path).unwrap();
    }
}

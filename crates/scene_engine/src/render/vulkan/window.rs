//! Window management using GLFW
//!
//! Provides window creation and the event pump for Vulkan rendering.

use ash::vk;

use super::{VulkanError, VulkanResult};

/// Window events the application reacts to
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowEvent {
    /// Framebuffer resized to the given size in pixels
    Resized(u32, u32),
    /// Key pressed
    KeyPressed(glfw::Key),
    /// Close requested
    CloseRequested,
}

/// GLFW window configured for Vulkan
pub struct Window {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
}

impl Window {
    /// Open a resizable window without a client API
    pub fn new(title: &str, width: u32, height: u32) -> VulkanResult<Self> {
        let mut glfw = glfw::init(glfw::fail_on_errors)
            .map_err(|e| VulkanError::Window(format!("GLFW initialization failed: {e:?}")))?;

        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(true));

        let (mut window, events) = glfw
            .create_window(width, height, title, glfw::WindowMode::Windowed)
            .ok_or_else(|| VulkanError::Window("Window creation failed".to_string()))?;

        window.set_key_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);

        log::debug!("Window created: {width}x{height}");
        Ok(Self { glfw, window, events })
    }

    /// Whether the user asked to close the window
    pub fn should_close(&self) -> bool {
        self.window.should_close()
    }

    /// Request the window to close
    pub fn set_should_close(&mut self, should_close: bool) {
        self.window.set_should_close(should_close);
    }

    /// Poll the OS and collect pending events
    pub fn poll_events(&mut self) -> Vec<WindowEvent> {
        self.glfw.poll_events();
        glfw::flush_messages(&self.events)
            .filter_map(|(_, event)| match event {
                glfw::WindowEvent::FramebufferSize(w, h) => Some(WindowEvent::Resized(w.max(0) as u32, h.max(0) as u32)),
                glfw::WindowEvent::Key(key, _, glfw::Action::Press, _) => Some(WindowEvent::KeyPressed(key)),
                glfw::WindowEvent::Close => Some(WindowEvent::CloseRequested),
                _ => None,
            })
            .collect()
    }

    /// Block until an event arrives (used while minimized)
    pub fn wait_events(&mut self) {
        self.glfw.wait_events();
    }

    /// Framebuffer size in pixels
    pub fn framebuffer_size(&self) -> (u32, u32) {
        let (width, height) = self.window.get_framebuffer_size();
        (width.max(0) as u32, height.max(0) as u32)
    }

    /// Instance extensions GLFW needs for surface creation
    pub fn required_instance_extensions(&self) -> VulkanResult<Vec<String>> {
        self.glfw
            .get_required_instance_extensions()
            .ok_or_else(|| VulkanError::Window("Vulkan is not supported by GLFW".to_string()))
    }

    /// Create a surface for this window
    pub fn create_vulkan_surface(&mut self, instance: vk::Instance) -> VulkanResult<vk::SurfaceKHR> {
        let mut surface = vk::SurfaceKHR::null();
        let result = self.window.create_window_surface(instance, std::ptr::null(), &mut surface);

        if result == vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(VulkanError::Window(format!("Failed to create Vulkan surface: {result:?}")))
        }
    }
}

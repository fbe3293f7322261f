//! Vulkan context management
//!
//! Instance creation (with validation in debug builds), physical device
//! selection with graphics, present, transfer, and compute queue families,
//! and the logical device that owns one queue per unique family.

use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::sync::{Arc, Mutex};

#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::{Surface, Swapchain as SwapchainLoader};
use ash::{vk, Device, Entry, Instance};

use super::window::Window;
use super::{VulkanError, VulkanResult};

fn c_string(value: &str) -> VulkanResult<CString> {
    CString::new(value).map_err(|e| VulkanError::InitializationFailed(format!("Invalid name {value:?}: {e}")))
}

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    /// Debug utilities extension (debug builds)
    #[cfg(debug_assertions)]
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create a new Vulkan instance, with validation layers when requested
    pub fn new(window: &Window, app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name_cstr = c_string(app_name)?;
        let engine_name_cstr = c_string("SceneEngine")?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let required_extensions = window.required_instance_extensions()?;
        let cstr_extensions = required_extensions
            .iter()
            .map(|ext| c_string(ext))
            .collect::<VulkanResult<Vec<_>>>()?;

        #[allow(unused_mut)]
        let mut extensions: Vec<*const c_char> = cstr_extensions.iter().map(|ext| ext.as_ptr()).collect();

        let validation = cfg!(debug_assertions) && enable_validation;
        #[cfg(debug_assertions)]
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if validation {
            vec![c_string("VK_LAYER_KHRONOS_validation")?]
        } else {
            Vec::new()
        };
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter().map(|name| name.as_ptr()).collect();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None).map_err(VulkanError::Api)? };

        #[cfg(debug_assertions)]
        let debug_utils = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger = Self::setup_debug_messenger(&debug_utils)?;
            Some((debug_utils, messenger))
        } else {
            None
        };

        log::debug!("Vulkan instance created (validation: {validation})");

        Ok(Self {
            entry,
            instance,
            #[cfg(debug_assertions)]
            debug_utils,
        })
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            #[cfg(debug_assertions)]
            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {message_type:?} - {message}");
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {message_type:?} - {message}");
    } else {
        log::debug!("[Vulkan] {message_type:?} - {message}");
    }

    vk::FALSE
}

/// Queue family indices used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    /// Graphics work
    pub graphics: u32,
    /// Presentation to the surface
    pub present: u32,
    /// Uploads; a dedicated family when available, else graphics
    pub transfer: u32,
    /// Compute; a dedicated family when available, else graphics if capable
    pub compute: Option<u32>,
}

impl QueueFamilies {
    /// Pick families from the properties reported by a device
    ///
    /// `present_support(index)` tells whether a family can present to the
    /// target surface.
    pub fn select(
        families: &[vk::QueueFamilyProperties],
        mut present_support: impl FnMut(u32) -> VulkanResult<bool>,
    ) -> VulkanResult<Self> {
        let with = |flags: vk::QueueFlags| {
            families
                .iter()
                .enumerate()
                .filter(move |(_, family)| family.queue_count > 0 && family.queue_flags.contains(flags))
                .map(|(index, family)| (index as u32, family.queue_flags))
        };

        let graphics = with(vk::QueueFlags::GRAPHICS)
            .map(|(index, _)| index)
            .next()
            .ok_or_else(|| VulkanError::InitializationFailed("No graphics queue family found".to_string()))?;

        let mut present = None;
        if present_support(graphics)? {
            present = Some(graphics);
        } else {
            for index in 0..families.len() as u32 {
                if present_support(index)? {
                    present = Some(index);
                    break;
                }
            }
        }
        let present =
            present.ok_or_else(|| VulkanError::InitializationFailed("No present queue family found".to_string()))?;

        let transfer = with(vk::QueueFlags::TRANSFER)
            .find(|(_, flags)| !flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
            .map_or(graphics, |(index, _)| index);

        let compute = with(vk::QueueFlags::COMPUTE)
            .find(|(_, flags)| !flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(index, _)| index)
            .or_else(|| {
                families[graphics as usize]
                    .queue_flags
                    .contains(vk::QueueFlags::COMPUTE)
                    .then_some(graphics)
            });

        Ok(Self { graphics, present, transfer, compute })
    }

    /// Distinct family indices
    pub fn unique(&self) -> Vec<u32> {
        let mut unique = vec![self.graphics, self.present, self.transfer];
        unique.extend(self.compute);
        unique.sort_unstable();
        unique.dedup();
        unique
    }
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Selected queue families
    pub queue_families: QueueFamilies,
}

impl PhysicalDeviceInfo {
    /// Select the first device that can render and present to `surface`
    pub fn select_suitable_device(
        instance: &Instance,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices().map_err(VulkanError::Api)? };

        for device in devices {
            match Self::evaluate_device(instance, device, surface, surface_loader) {
                Ok(info) => {
                    let name = unsafe { CStr::from_ptr(info.properties.device_name.as_ptr()) };
                    log::info!("Selected GPU: {}", name.to_string_lossy());
                    log::debug!("Queue families: {:?}", info.queue_families);
                    return Ok(info);
                }
                Err(e) => log::debug!("Skipping physical device: {e}"),
            }
        }

        Err(VulkanError::InitializationFailed("No suitable GPU found".to_string()))
    }

    fn evaluate_device(
        instance: &Instance,
        device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
        surface_loader: &Surface,
    ) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };
        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };

        let queue_families = QueueFamilies::select(&families, |index| unsafe {
            surface_loader
                .get_physical_device_surface_support(device, index, surface)
                .map_err(VulkanError::Api)
        })?;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .map_err(VulkanError::Api)?
        };
        let has_swapchain = extensions.iter().any(|available| {
            let name = unsafe { CStr::from_ptr(available.extension_name.as_ptr()) };
            name == SwapchainLoader::name()
        });
        if !has_swapchain {
            return Err(VulkanError::InitializationFailed(
                "Required device extensions not supported".to_string(),
            ));
        }

        Ok(Self { device, properties, memory_properties, queue_families })
    }
}

/// Logical device wrapper with RAII cleanup
///
/// Queues are shared behind mutexes since submission to a queue must be
/// externally synchronized and several families may resolve to the same one.
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Swapchain extension loader
    pub swapchain_loader: SwapchainLoader,
    /// Selected queue families
    pub families: QueueFamilies,
    queues: HashMap<u32, Arc<Mutex<vk::Queue>>>,
}

impl LogicalDevice {
    /// Create the device with one queue per unique family
    pub fn new(instance: &Instance, physical: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let families = physical.queue_families;
        let priorities = [1.0];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let required_extensions = [SwapchainLoader::name().as_ptr()];
        let features = vk::PhysicalDeviceFeatures::builder().build();
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&required_extensions)
            .enabled_features(&features);

        let device = unsafe {
            instance
                .create_device(physical.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };

        let queues = families
            .unique()
            .into_iter()
            .map(|family| {
                let queue = unsafe { device.get_device_queue(family, 0) };
                (family, Arc::new(Mutex::new(queue)))
            })
            .collect();

        let swapchain_loader = SwapchainLoader::new(instance, &device);

        Ok(Self { device, swapchain_loader, families, queues })
    }

    /// Queue of `family`, shared with every role mapped to it
    pub fn queue(&self, family: u32) -> VulkanResult<Arc<Mutex<vk::Queue>>> {
        self.queues.get(&family).cloned().ok_or_else(|| VulkanError::InvalidOperation {
            reason: format!("No queue created for family {family}"),
        })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Owns instance, surface, and device
///
/// Fields drop in declaration order: surface and device before the
/// instance.
pub struct VulkanContext {
    /// Vulkan surface for rendering
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader
    pub surface_loader: Surface,
    /// Selected physical device
    pub physical_device: PhysicalDeviceInfo,
    /// Logical device
    pub device: LogicalDevice,
    /// Vulkan instance and debug utilities
    pub instance: VulkanInstance,
}

impl VulkanContext {
    /// Create a context rendering into `window`
    pub fn new(window: &mut Window, app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let instance = VulkanInstance::new(window, app_name, enable_validation)?;

        let surface_loader = Surface::new(&instance.entry, &instance.instance);
        let surface = window.create_vulkan_surface(instance.instance.handle())?;

        let physical_device =
            PhysicalDeviceInfo::select_suitable_device(&instance.instance, surface, &surface_loader)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;

        Ok(Self { surface, surface_loader, physical_device, device, instance })
    }

    /// The Vulkan instance
    pub fn instance(&self) -> &Instance {
        &self.instance.instance
    }

    /// Clone of the raw logical device
    pub fn raw_device(&self) -> Device {
        self.device.device.clone()
    }

    /// Selected queue families
    pub fn queue_families(&self) -> QueueFamilies {
        self.physical_device.queue_families
    }

    /// Memory types of the physical device
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.physical_device.memory_properties
    }

    /// Block until the device has finished all work
    pub fn wait_idle(&self) -> VulkanResult<()> {
        unsafe { self.device.device.device_wait_idle().map_err(VulkanError::Api) }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_dedicated_families_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let selected = QueueFamilies::select(&families, |index| Ok(index == 0)).unwrap();
        assert_eq!(selected, QueueFamilies { graphics: 0, present: 0, transfer: 2, compute: Some(1) });
        assert_eq!(selected.unique(), vec![0, 1, 2]);
    }

    #[test]
    fn test_single_family_serves_everything() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        let selected = QueueFamilies::select(&families, |_| Ok(true)).unwrap();
        assert_eq!(selected, QueueFamilies { graphics: 0, present: 0, transfer: 0, compute: Some(0) });
        assert_eq!(selected.unique(), vec![0]);
    }

    #[test]
    fn test_missing_present_support_fails() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        assert!(QueueFamilies::select(&families, |_| Ok(false)).is_err());
        let selected = QueueFamilies::select(&[family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)], |i| {
            Ok(i == 1)
        })
        .unwrap();
        assert_eq!(selected.present, 1);
        assert_eq!(selected.compute, None);
    }
}

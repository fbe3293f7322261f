//! Buffer management for vertex and index data
//!
//! Host-visible buffers are written directly; device-local buffers are filled
//! through a staging buffer copied on a transfer batch. The staging buffer
//! rides along with the batch and is destroyed by the command manager once
//! the batch's fence signals.

use ash::{vk, Device};
use bytemuck::Pod;

use super::command_device::VulkanCommandDevice;
use super::{VulkanError, VulkanResult};
use crate::render::commands::{CommandManager, DeferredDestroy, PoolType, WaitInfo};

/// Buffer wrapper with memory management
pub struct Buffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl Buffer {
    /// Create a buffer and bind freshly allocated memory to it
    ///
    /// When `queue_families` names more than one family the buffer is created
    /// with concurrent sharing so transfer and graphics queues can both use it
    /// without ownership transfers.
    pub fn new(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
        queue_families: &[u32],
    ) -> VulkanResult<Self> {
        if size == 0 {
            return Err(VulkanError::InvalidOperation {
                reason: "Cannot create an empty buffer".to_string(),
            });
        }

        let mut families = queue_families.to_vec();
        families.sort_unstable();
        families.dedup();

        let mut buffer_info = vk::BufferCreateInfo::builder().size(size).usage(usage);
        buffer_info = if families.len() > 1 {
            buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            buffer_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let buffer = unsafe { device.create_buffer(&buffer_info, None).map_err(VulkanError::Api)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory = find_memory_type(memory_properties, requirements.memory_type_bits, properties)
            .and_then(|memory_type_index| {
                let alloc_info = vk::MemoryAllocateInfo::builder()
                    .allocation_size(requirements.size)
                    .memory_type_index(memory_type_index);
                unsafe { device.allocate_memory(&alloc_info, None).map_err(VulkanError::Api) }
            });
        let memory = match memory {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(VulkanError::Api(e));
        }

        Ok(Self { device, buffer, memory, size })
    }

    /// Copy `data` into host-visible memory
    pub fn write_data<T: Pod>(&self, data: &[T]) -> VulkanResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as vk::DeviceSize > self.size {
            return Err(VulkanError::InvalidOperation {
                reason: format!("Writing {} bytes into a {} byte buffer", bytes.len(), self.size),
            });
        }

        unsafe {
            let ptr = self
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .map_err(VulkanError::Api)?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.cast::<u8>(), bytes.len());
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get size
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Host-visible source of a transfer, destroyed once the copy has landed
pub struct StagingBuffer {
    buffer: Option<Buffer>,
}

impl StagingBuffer {
    /// Create a staging buffer holding `data`
    pub fn with_data<T: Pod>(
        device: Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        data: &[T],
    ) -> VulkanResult<Self> {
        let buffer = Buffer::new(
            device,
            memory_properties,
            std::mem::size_of_val(data) as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            &[],
        )?;
        buffer.write_data(data)?;
        Ok(Self { buffer: Some(buffer) })
    }

    /// Source buffer handle, null once destroyed
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.as_ref().map_or_else(vk::Buffer::null, Buffer::handle)
    }
}

impl DeferredDestroy for StagingBuffer {
    fn destroy(&mut self) {
        self.buffer = None;
    }
}

/// GPU-only buffer filled through a transfer batch
pub struct DeviceLocalBuffer {
    buffer: Buffer,
    element_count: u32,
}

impl DeviceLocalBuffer {
    /// Upload `data` into a new device-local buffer
    ///
    /// The copy is submitted on the transfer pool and is not waited for;
    /// call [`CommandManager::wait`] with [`PoolType::Transfer`] before the
    /// first draw that reads the buffer.
    pub fn with_data<T: Pod>(
        commands: &CommandManager<VulkanCommandDevice>,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> VulkanResult<Self> {
        let device_ops = commands.device();
        let device = device_ops.raw().clone();

        let families: Vec<u32> = [PoolType::Transfer, PoolType::Graphics]
            .into_iter()
            .filter_map(|pool| device_ops.family(pool))
            .collect();

        let staging = StagingBuffer::with_data(device.clone(), memory_properties, data)?;
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let buffer = Buffer::new(
            device.clone(),
            memory_properties,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            &families,
        )?;

        let mut batch = commands.alloc_command_buffer(PoolType::Transfer, 1, WaitInfo::none())?;
        let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
        unsafe {
            device.cmd_copy_buffer(batch.primary(), staging.handle(), buffer.handle(), &[region]);
        }
        batch.attach(staging);
        commands.submit_command_buffer(batch, &[], None)?;

        log::trace!("Staged upload of {size} bytes");
        Ok(Self { buffer, element_count: data.len() as u32 })
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    /// Number of elements uploaded
    pub fn element_count(&self) -> u32 {
        self.element_count
    }
}

/// Find memory type with required properties
pub(crate) fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> VulkanResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            type_filter & (1 << i) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or(VulkanError::NoSuitableMemoryType)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in properties.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        properties
    }

    #[test]
    fn test_memory_type_respects_filter_and_flags() {
        let properties = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(find_memory_type(&properties, 0b111, host).unwrap(), 2);
        assert_eq!(
            find_memory_type(&properties, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap(),
            1
        );
        assert_eq!(
            find_memory_type(&properties, 0b101, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
        assert!(matches!(
            find_memory_type(&properties, 0b011, host),
            Err(VulkanError::NoSuitableMemoryType)
        ));
    }
}

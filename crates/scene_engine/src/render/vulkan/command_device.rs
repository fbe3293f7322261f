//! [`CommandDevice`] backed by an `ash` logical device
//!
//! Graphics and compute buffers come from one command pool per pool type,
//! even when two pool types resolve to the same queue family. Transfer
//! buffers each get a dedicated command pool, so the reclaimer thread can
//! reset one transfer buffer while another is being recorded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ash::{vk, Device};

use super::context::LogicalDevice;
use super::VulkanResult;
use crate::render::commands::{CommandDevice, CommandError, CommandResult, PoolType, Submission};

enum PoolStorage {
    /// Every buffer of the pool type lives in this pool
    Shared(Mutex<vk::CommandPool>),
    /// Each buffer lives alone in its own pool
    PerBuffer(Mutex<HashMap<vk::CommandBuffer, vk::CommandPool>>),
}

struct PoolEntry {
    family: u32,
    storage: PoolStorage,
    queue: Arc<Mutex<vk::Queue>>,
}

/// Native command operations on a Vulkan device
pub struct VulkanCommandDevice {
    device: Device,
    pools: HashMap<PoolType, PoolEntry>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn create_pool(device: &Device, family: u32) -> CommandResult<vk::CommandPool> {
    let create_info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(family);
    unsafe { device.create_command_pool(&create_info, None).map_err(CommandError::Api) }
}

fn allocate_from(device: &Device, pool: vk::CommandPool, count: u32) -> CommandResult<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count);
    unsafe { device.allocate_command_buffers(&alloc_info).map_err(CommandError::Api) }
}

impl VulkanCommandDevice {
    /// Create pools for every pool type the device has a queue for
    pub fn new(logical: &LogicalDevice) -> VulkanResult<Self> {
        let device = logical.device.clone();
        let families = logical.families;

        let roles = [
            (PoolType::Graphics, Some(families.graphics)),
            (PoolType::Transfer, Some(families.transfer)),
            (PoolType::Compute, families.compute),
        ];

        let mut pools = HashMap::new();
        for (pool_type, family) in roles {
            let Some(family) = family else {
                log::debug!("No queue family for {pool_type:?} work");
                continue;
            };
            let storage = match pool_type {
                PoolType::Transfer => PoolStorage::PerBuffer(Mutex::new(HashMap::new())),
                PoolType::Graphics | PoolType::Compute => {
                    PoolStorage::Shared(Mutex::new(create_pool(&device, family)?))
                }
            };
            pools.insert(
                pool_type,
                PoolEntry {
                    family,
                    storage,
                    queue: logical.queue(family)?,
                },
            );
        }

        Ok(Self { device, pools })
    }

    /// The raw device, for recording commands into leased buffers
    pub fn raw(&self) -> &Device {
        &self.device
    }

    /// Queue family serving `pool`
    pub fn family(&self, pool: PoolType) -> Option<u32> {
        self.pools.get(&pool).map(|entry| entry.family)
    }

    fn entry(&self, pool: PoolType) -> CommandResult<&PoolEntry> {
        self.pools.get(&pool).ok_or(CommandError::PoolTypeUnavailable(pool))
    }

    /// Run a pool-level operation on `buffer` with its pool externally synchronized
    ///
    /// Shared pools are locked for the call. A dedicated pool belongs to the
    /// single lease holding its buffer, so it needs no lock.
    fn with_pool<T>(
        &self,
        pool: PoolType,
        buffer: vk::CommandBuffer,
        op: impl FnOnce() -> CommandResult<T>,
    ) -> CommandResult<T> {
        match &self.entry(pool)?.storage {
            PoolStorage::Shared(command_pool) => {
                let _pool = lock(command_pool);
                op()
            }
            PoolStorage::PerBuffer(owners) => {
                if !lock(owners).contains_key(&buffer) {
                    return Err(CommandError::InvalidOperation(format!(
                        "{buffer:?} was not allocated from a {pool:?} pool"
                    )));
                }
                op()
            }
        }
    }
}

impl CommandDevice for VulkanCommandDevice {
    fn supports(&self, pool: PoolType) -> bool {
        self.pools.contains_key(&pool)
    }

    fn allocate_command_buffers(&self, pool: PoolType, count: u32) -> CommandResult<Vec<vk::CommandBuffer>> {
        let entry = self.entry(pool)?;
        match &entry.storage {
            PoolStorage::Shared(command_pool) => allocate_from(&self.device, *lock(command_pool), count),
            PoolStorage::PerBuffer(owners) => {
                let mut buffers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let allocated = create_pool(&self.device, entry.family).and_then(|command_pool| {
                        match allocate_from(&self.device, command_pool, 1) {
                            Ok(buffer) => Ok((command_pool, buffer[0])),
                            Err(e) => {
                                unsafe { self.device.destroy_command_pool(command_pool, None) };
                                Err(e)
                            }
                        }
                    });
                    match allocated {
                        Ok((command_pool, buffer)) => {
                            lock(owners).insert(buffer, command_pool);
                            buffers.push(buffer);
                        }
                        Err(e) => {
                            self.free_command_buffers(pool, &buffers);
                            return Err(e);
                        }
                    }
                }
                Ok(buffers)
            }
        }
    }

    fn free_command_buffers(&self, pool: PoolType, buffers: &[vk::CommandBuffer]) {
        let Ok(entry) = self.entry(pool) else {
            return;
        };
        match &entry.storage {
            PoolStorage::Shared(command_pool) => {
                let command_pool = lock(command_pool);
                unsafe { self.device.free_command_buffers(*command_pool, buffers) };
            }
            PoolStorage::PerBuffer(owners) => {
                let mut owners = lock(owners);
                for buffer in buffers {
                    if let Some(command_pool) = owners.remove(buffer) {
                        unsafe { self.device.destroy_command_pool(command_pool, None) };
                    }
                }
            }
        }
    }

    fn begin_command_buffer(&self, pool: PoolType, buffer: vk::CommandBuffer) -> CommandResult<()> {
        self.with_pool(pool, buffer, || {
            let begin_info =
                vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe {
                self.device
                    .begin_command_buffer(buffer, &begin_info)
                    .map_err(CommandError::Api)
            }
        })
    }

    fn end_command_buffer(&self, pool: PoolType, buffer: vk::CommandBuffer) -> CommandResult<()> {
        self.with_pool(pool, buffer, || unsafe {
            self.device.end_command_buffer(buffer).map_err(CommandError::Api)
        })
    }

    fn reset_command_buffer(&self, pool: PoolType, buffer: vk::CommandBuffer) -> CommandResult<()> {
        self.with_pool(pool, buffer, || unsafe {
            self.device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())
                .map_err(CommandError::Api)
        })
    }

    fn create_semaphore(&self) -> CommandResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        unsafe { self.device.create_semaphore(&create_info, None).map_err(CommandError::Api) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self) -> CommandResult<vk::Fence> {
        let create_info = vk::FenceCreateInfo::builder();
        unsafe { self.device.create_fence(&create_info, None).map_err(CommandError::Api) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence) -> CommandResult<()> {
        unsafe {
            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(CommandError::Api)
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> CommandResult<()> {
        unsafe { self.device.reset_fences(&[fence]).map_err(CommandError::Api) }
    }

    fn submit(&self, pool: PoolType, submission: &Submission<'_>) -> CommandResult<()> {
        let entry = self.entry(pool)?;
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(submission.wait_semaphores)
            .wait_dst_stage_mask(submission.wait_stages)
            .command_buffers(submission.command_buffers)
            .signal_semaphores(submission.signal_semaphores)
            .build();

        let queue = lock(&entry.queue);
        unsafe {
            self.device
                .queue_submit(*queue, &[submit_info], submission.fence)
                .map_err(CommandError::Api)
        }
    }

    fn queue_wait_idle(&self, pool: PoolType) -> CommandResult<()> {
        let queue = lock(&self.entry(pool)?.queue);
        unsafe { self.device.queue_wait_idle(*queue).map_err(CommandError::Api) }
    }
}

impl Drop for VulkanCommandDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            for entry in self.pools.values() {
                match &entry.storage {
                    PoolStorage::Shared(command_pool) => {
                        self.device.destroy_command_pool(*lock(command_pool), None);
                    }
                    PoolStorage::PerBuffer(owners) => {
                        for (_, command_pool) in lock(owners).drain() {
                            self.device.destroy_command_pool(command_pool, None);
                        }
                    }
                }
            }
        }
    }
}

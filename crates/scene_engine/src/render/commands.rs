//! Command buffer batch allocation with background reclamation
//!
//! The [`CommandManager`] hands out [`CommandBatch`]es for three pool types.
//! Graphics and compute batches are allocated straight from their pool and
//! their lifetime belongs to the caller (the renderer keeps one per frame in
//! flight and re-records it every frame).
//!
//! Transfer batches are leased from a fixed set of pre-allocated slots:
//! command buffers, one semaphore and one fence per batch. Free slot indices
//! sit in bounded channels, so leasing blocks only when every slot is leased
//! or in flight. A submitted transfer batch is handed to a background thread
//! that waits for its fence, resets its command buffers, destroys every
//! resource attached to it during recording, and returns the slot indices.
//!
//! ```text
//! Free --alloc--> Leased --submit--> Submitted --fence--> Free
//! ```
//!
//! Native operations go through the [`CommandDevice`] trait so the batch
//! lifecycle can run against the Vulkan device or a test double.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use ash::vk;
use crossbeam::channel::{bounded, select, unbounded, Receiver, Sender};
use thiserror::Error;

use crate::core::config::CommandConfig;

/// Upper bound for command buffers in one batch, and the default number of
/// transfer slots
pub const MAX_COMMAND_BUFFERS: usize = 64;

/// Queue family a batch is allocated from and submitted to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolType {
    /// Rendering work, owned per frame by the renderer
    Graphics,
    /// Uploads, leased from fixed slots and reclaimed in the background
    Transfer,
    /// Compute dispatches
    Compute,
}

/// Command manager errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Native API call failed
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// The device exposes no queue for this pool type
    #[error("No queue available for {0:?} work")]
    PoolTypeUnavailable(PoolType),

    /// Requested command buffer count is zero or above the limit
    #[error("Invalid batch size {requested} (allowed 1..={max})")]
    InvalidBatchSize {
        /// Requested count
        requested: usize,
        /// Largest allowed count
        max: usize,
    },

    /// The batch was leased from a different manager
    #[error("Command batch does not belong to this manager")]
    BatchNotFromPool,

    /// The batch cannot be used this way
    #[error("Invalid batch operation: {0}")]
    InvalidOperation(String),

    /// A transfer batch could not be reclaimed; transfer leasing is disabled
    #[error("Transfer reclamation failed: {0}")]
    ReclaimFailed(String),

    /// The manager has been destroyed
    #[error("Command manager has been shut down")]
    ShutDown,
}

/// Result type for command operations
pub type CommandResult<T> = Result<T, CommandError>;

/// Semaphores a submission waits on, with the stage each one gates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitInfo {
    /// Semaphores to wait on
    pub semaphores: Vec<vk::Semaphore>,
    /// Destination stage for each semaphore
    pub stages: Vec<vk::PipelineStageFlags>,
}

impl WaitInfo {
    /// No waits
    pub fn none() -> Self {
        Self::default()
    }

    /// Add one wait
    pub fn with(mut self, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags) -> Self {
        self.semaphores.push(semaphore);
        self.stages.push(stage);
        self
    }
}

/// Resource that must outlive the GPU work recorded against it
///
/// Attached to a transfer batch with [`CommandBatch::attach`]; `destroy` runs
/// on the reclamation thread once the batch's fence has signalled.
pub trait DeferredDestroy: Send {
    /// Release the resource
    fn destroy(&mut self);
}

/// Everything a native queue submission needs
#[derive(Debug)]
pub struct Submission<'a> {
    /// Buffers to execute, in order
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores to wait on before execution
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Stage per wait semaphore
    pub wait_stages: &'a [vk::PipelineStageFlags],
    /// Semaphores signalled on completion
    pub signal_semaphores: &'a [vk::Semaphore],
    /// Fence signalled on completion, or null
    pub fence: vk::Fence,
}

/// Native command operations used by [`CommandManager`]
///
/// Implementations must be shareable with the reclamation thread. The
/// reclamation thread resets transfer buffers while other transfer buffers
/// are being recorded, so no two transfer buffers may share a command pool.
pub trait CommandDevice: Send + Sync + 'static {
    /// Whether a queue and pool exist for `pool`
    fn supports(&self, pool: PoolType) -> bool;

    /// Allocate primary command buffers from `pool`
    fn allocate_command_buffers(&self, pool: PoolType, count: u32) -> CommandResult<Vec<vk::CommandBuffer>>;
    /// Return command buffers to `pool`
    fn free_command_buffers(&self, pool: PoolType, buffers: &[vk::CommandBuffer]);
    /// Begin one-time-submit recording
    fn begin_command_buffer(&self, pool: PoolType, buffer: vk::CommandBuffer) -> CommandResult<()>;
    /// End recording
    fn end_command_buffer(&self, pool: PoolType, buffer: vk::CommandBuffer) -> CommandResult<()>;
    /// Reset a buffer to the initial state
    fn reset_command_buffer(&self, pool: PoolType, buffer: vk::CommandBuffer) -> CommandResult<()>;

    /// Create a binary semaphore
    fn create_semaphore(&self) -> CommandResult<vk::Semaphore>;
    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// Create an unsignalled fence
    fn create_fence(&self) -> CommandResult<vk::Fence>;
    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);
    /// Block until `fence` signals, without timeout
    fn wait_for_fence(&self, fence: vk::Fence) -> CommandResult<()>;
    /// Return `fence` to the unsignalled state
    fn reset_fence(&self, fence: vk::Fence) -> CommandResult<()>;

    /// Submit to the queue serving `pool`
    fn submit(&self, pool: PoolType, submission: &Submission<'_>) -> CommandResult<()>;
    /// Block until the queue serving `pool` is idle
    fn queue_wait_idle(&self, pool: PoolType) -> CommandResult<()>;
}

/// A leased group of command buffers, already recording
///
/// Transfer batches also carry one semaphore and one fence from the
/// manager's slots; graphics and compute batches carry neither.
pub struct CommandBatch {
    manager_id: u64,
    submit_id: u64,
    pool_type: PoolType,
    command_buffers: Vec<vk::CommandBuffer>,
    buffer_slots: Vec<usize>,
    semaphore: Option<(usize, vk::Semaphore)>,
    fence: Option<(usize, vk::Fence)>,
    signal_semaphore: bool,
    wait_info: WaitInfo,
    resources: Vec<Box<dyn DeferredDestroy>>,
    /// Slot queues a transfer batch returns to, until it is reclaimed
    lease: Option<Arc<Slots>>,
    submitted: bool,
}

impl CommandBatch {
    /// Pool this batch came from
    pub fn pool_type(&self) -> PoolType {
        self.pool_type
    }

    /// Monotonic id assigned at allocation
    pub fn submit_id(&self) -> u64 {
        self.submit_id
    }

    /// Command buffers in recording order
    pub fn command_buffers(&self) -> &[vk::CommandBuffer] {
        &self.command_buffers
    }

    /// First command buffer; batches always hold at least one
    pub fn primary(&self) -> vk::CommandBuffer {
        self.command_buffers[0]
    }

    /// Semaphore the submission will signal, for other queues to wait on
    ///
    /// Only transfer batches own one. Asking for it arms the signal, so the
    /// caller must wait on it exactly once.
    pub fn completion_semaphore(&mut self) -> Option<vk::Semaphore> {
        let (_, semaphore) = self.semaphore?;
        self.signal_semaphore = true;
        Some(semaphore)
    }

    /// Fence owned by a transfer batch
    pub fn fence(&self) -> Option<vk::Fence> {
        self.fence.map(|(_, fence)| fence)
    }

    /// Keep `resource` alive until the GPU has finished this batch
    pub fn attach<R: DeferredDestroy + 'static>(&mut self, resource: R) {
        self.resources.push(Box::new(resource));
    }

    /// Number of attached resources
    pub fn attached_count(&self) -> usize {
        self.resources.len()
    }

    fn destroy_resources(&mut self) {
        for resource in &mut self.resources {
            resource.destroy();
        }
        self.resources.clear();
    }

    /// Give leased transfer slots back to their free queues
    fn return_lease(&mut self) {
        if let Some(slots) = self.lease.take() {
            slots.release(self);
        }
    }
}

impl Drop for CommandBatch {
    fn drop(&mut self) {
        if self.lease.is_none() {
            return;
        }
        if self.submitted {
            // the GPU may still reference the slots and resources
            log::warn!("Transfer batch {} dropped before reclamation", self.submit_id);
            std::mem::forget(std::mem::take(&mut self.resources));
            return;
        }
        log::warn!("Transfer batch {} dropped without submit, returning its slots", self.submit_id);
        self.destroy_resources();
        self.return_lease();
    }
}

impl std::fmt::Debug for CommandBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBatch")
            .field("submit_id", &self.submit_id)
            .field("pool_type", &self.pool_type)
            .field("command_buffers", &self.command_buffers.len())
            .field("fence", &self.fence())
            .field("attached", &self.resources.len())
            .finish()
    }
}

/// Message consumed by the reclamation thread
enum Reclaim {
    Batch(CommandBatch),
    Shutdown,
}

/// Free-index queue for one kind of transfer slot
struct SlotQueue {
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
}

impl SlotQueue {
    fn filled(count: usize) -> Self {
        let (free_tx, free_rx) = bounded(count);
        for index in 0..count {
            // capacity equals count, never blocks
            let _ = free_tx.send(index);
        }
        Self { free_tx, free_rx }
    }

    fn release(&self, index: usize) {
        let _ = self.free_tx.send(index);
    }

    fn drain(&self) -> Vec<usize> {
        self.free_rx.try_iter().collect()
    }
}

/// Shared with the reclamation thread
struct Slots {
    buffers: SlotQueue,
    semaphores: SlotQueue,
    fences: SlotQueue,
}

impl Slots {
    fn release(&self, batch: &CommandBatch) {
        for &slot in &batch.buffer_slots {
            self.buffers.release(slot);
        }
        if let Some((slot, _)) = batch.semaphore {
            self.semaphores.release(slot);
        }
        if let Some((slot, _)) = batch.fence {
            self.fences.release(slot);
        }
    }
}

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates, submits, and recycles command batches
pub struct CommandManager<D: CommandDevice> {
    device: Arc<D>,
    id: u64,
    transfer_slots: usize,

    transfer_buffers: Vec<vk::CommandBuffer>,
    semaphores: Vec<vk::Semaphore>,
    fences: Vec<vk::Fence>,
    slots: Arc<Slots>,
    lease_lock: Mutex<()>,

    work_tx: Sender<Reclaim>,
    poisoned_rx: Receiver<()>,
    failure: Arc<Mutex<Option<String>>>,
    in_flight: Arc<AtomicUsize>,
    next_submit_id: AtomicU64,
    reclaimer: Option<JoinHandle<()>>,
}

impl<D: CommandDevice> CommandManager<D> {
    /// Create the manager and pre-allocate the transfer slots
    ///
    /// Fails when the device has no transfer queue or any slot cannot be
    /// created.
    pub fn new(device: Arc<D>, config: &CommandConfig) -> CommandResult<Self> {
        let slots = config.transfer_slots;
        if slots == 0 {
            return Err(CommandError::InvalidBatchSize { requested: 0, max: MAX_COMMAND_BUFFERS });
        }
        if !device.supports(PoolType::Transfer) {
            return Err(CommandError::PoolTypeUnavailable(PoolType::Transfer));
        }

        let transfer_buffers = device.allocate_command_buffers(PoolType::Transfer, slots as u32)?;
        let semaphores = (0..slots)
            .map(|_| device.create_semaphore())
            .collect::<CommandResult<Vec<_>>>()?;
        let fences = (0..slots)
            .map(|_| device.create_fence())
            .collect::<CommandResult<Vec<_>>>()?;

        let slot_queues = Arc::new(Slots {
            buffers: SlotQueue::filled(slots),
            semaphores: SlotQueue::filled(slots),
            fences: SlotQueue::filled(slots),
        });

        let (work_tx, work_rx) = unbounded();
        let (poisoned_tx, poisoned_rx) = bounded::<()>(0);
        let failure = Arc::new(Mutex::new(None));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let reclaimer = Reclaimer {
            device: Arc::clone(&device),
            work_rx,
            failure: Arc::clone(&failure),
            in_flight: Arc::clone(&in_flight),
            poisoned_tx: Some(poisoned_tx),
            quarantine: Vec::new(),
        };
        let handle = thread::Builder::new()
            .name("transfer-reclaim".to_string())
            .spawn(move || reclaimer.run())
            .map_err(|e| CommandError::InvalidOperation(format!("Failed to spawn reclamation thread: {e}")))?;

        log::debug!("Command manager created with {slots} transfer slots");

        Ok(Self {
            device,
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            transfer_slots: slots,
            transfer_buffers,
            semaphores,
            fences,
            slots: slot_queues,
            lease_lock: Mutex::new(()),
            work_tx,
            poisoned_rx,
            failure,
            in_flight,
            next_submit_id: AtomicU64::new(0),
            reclaimer: Some(handle),
        })
    }

    /// The native device
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Number of transfer slots
    pub fn transfer_slots(&self) -> usize {
        self.transfer_slots
    }

    /// Transfer batches submitted but not yet reclaimed
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Message of the reclamation failure, if one happened
    pub fn reclaim_failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Allocate `count` command buffers from `pool_type`, already recording
    ///
    /// Transfer allocations block while every slot is leased or in flight.
    pub fn alloc_command_buffer(
        &self,
        pool_type: PoolType,
        count: usize,
        wait_info: WaitInfo,
    ) -> CommandResult<CommandBatch> {
        if self.reclaimer.is_none() {
            return Err(CommandError::ShutDown);
        }
        if !self.device.supports(pool_type) {
            return Err(CommandError::PoolTypeUnavailable(pool_type));
        }
        let max = match pool_type {
            PoolType::Transfer => self.transfer_slots,
            PoolType::Graphics | PoolType::Compute => MAX_COMMAND_BUFFERS,
        };
        if count == 0 || count > max {
            return Err(CommandError::InvalidBatchSize { requested: count, max });
        }
        if wait_info.semaphores.len() != wait_info.stages.len() {
            return Err(CommandError::InvalidOperation(format!(
                "{} wait semaphores with {} stages",
                wait_info.semaphores.len(),
                wait_info.stages.len()
            )));
        }

        let mut batch = match pool_type {
            PoolType::Transfer => self.lease_transfer(count)?,
            PoolType::Graphics | PoolType::Compute => CommandBatch {
                manager_id: self.id,
                submit_id: 0,
                pool_type,
                command_buffers: self.device.allocate_command_buffers(pool_type, count as u32)?,
                buffer_slots: Vec::new(),
                semaphore: None,
                fence: None,
                signal_semaphore: false,
                wait_info: WaitInfo::none(),
                resources: Vec::new(),
                lease: None,
                submitted: false,
            },
        };
        batch.submit_id = self.next_submit_id.fetch_add(1, Ordering::Relaxed);
        batch.wait_info = wait_info;

        if let Err(e) = self.begin_all(&batch) {
            self.release_unsubmitted(&mut batch);
            return Err(e);
        }
        Ok(batch)
    }

    fn lease_transfer(&self, count: usize) -> CommandResult<CommandBatch> {
        // one caller leases at a time so partial leases cannot deadlock
        let _lease = self.lease_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.check_failure()?;

        let fence = self.take_slot(&self.slots.fences)?;
        let semaphore = match self.take_slot(&self.slots.semaphores) {
            Ok(slot) => slot,
            Err(e) => {
                self.slots.fences.release(fence);
                return Err(e);
            }
        };
        let mut buffer_slots = Vec::with_capacity(count);
        while buffer_slots.len() < count {
            match self.take_slot(&self.slots.buffers) {
                Ok(slot) => buffer_slots.push(slot),
                Err(e) => {
                    self.slots.fences.release(fence);
                    self.slots.semaphores.release(semaphore);
                    for slot in buffer_slots {
                        self.slots.buffers.release(slot);
                    }
                    return Err(e);
                }
            }
        }

        let batch = CommandBatch {
            manager_id: self.id,
            submit_id: 0,
            pool_type: PoolType::Transfer,
            command_buffers: buffer_slots.iter().map(|&s| self.transfer_buffers[s]).collect(),
            buffer_slots,
            semaphore: Some((semaphore, self.semaphores[semaphore])),
            fence: Some((fence, self.fences[fence])),
            signal_semaphore: false,
            wait_info: WaitInfo::none(),
            resources: Vec::new(),
            lease: Some(Arc::clone(&self.slots)),
            submitted: false,
        };

        // a batch dropped or rejected before submit may still be recording
        for &buffer in &batch.command_buffers {
            self.device.reset_command_buffer(PoolType::Transfer, buffer)?;
        }
        Ok(batch)
    }

    fn take_slot(&self, queue: &SlotQueue) -> CommandResult<usize> {
        select! {
            recv(queue.free_rx) -> slot => slot.map_err(|_| CommandError::ShutDown),
            recv(self.poisoned_rx) -> _ => Err(self.failure_error()),
        }
    }

    fn check_failure(&self) -> CommandResult<()> {
        match self.reclaim_failure() {
            Some(message) => Err(CommandError::ReclaimFailed(message)),
            None => Ok(()),
        }
    }

    fn failure_error(&self) -> CommandError {
        match self.reclaim_failure() {
            Some(message) => CommandError::ReclaimFailed(message),
            None => CommandError::ShutDown,
        }
    }

    fn begin_all(&self, batch: &CommandBatch) -> CommandResult<()> {
        for &buffer in &batch.command_buffers {
            self.device.begin_command_buffer(batch.pool_type, buffer)?;
        }
        Ok(())
    }

    fn check_owner(&self, batch: &CommandBatch) -> CommandResult<()> {
        if batch.manager_id == self.id {
            Ok(())
        } else {
            Err(CommandError::BatchNotFromPool)
        }
    }

    /// Return a batch that never reached the queue
    fn release_unsubmitted(&self, batch: &mut CommandBatch) {
        match batch.pool_type {
            PoolType::Transfer => {
                batch.destroy_resources();
                batch.return_lease();
            }
            PoolType::Graphics | PoolType::Compute => {
                self.device.free_command_buffers(batch.pool_type, &batch.command_buffers);
            }
        }
    }

    /// End recording and submit
    ///
    /// Transfer batches signal their own fence (and their semaphore if it was
    /// requested) and move to the reclamation thread; `fence` must be `None`
    /// for them and `Ok(None)` is returned. Graphics and compute batches
    /// signal `fence` if given and come back as `Ok(Some(batch))` for reuse
    /// with [`CommandManager::restart`].
    pub fn submit_command_buffer(
        &self,
        mut batch: CommandBatch,
        signal_semaphores: &[vk::Semaphore],
        fence: Option<vk::Fence>,
    ) -> CommandResult<Option<CommandBatch>> {
        self.check_owner(&batch)?;
        if self.reclaimer.is_none() {
            return Err(CommandError::ShutDown);
        }

        let mut signals = signal_semaphores.to_vec();
        let submit_fence = match (batch.pool_type, batch.fence, fence) {
            (PoolType::Transfer, Some(_), Some(_)) => {
                self.release_unsubmitted(&mut batch);
                return Err(CommandError::InvalidOperation(
                    "transfer batches signal their own fence".to_string(),
                ));
            }
            (PoolType::Transfer, Some((_, own)), None) => {
                if batch.signal_semaphore {
                    if let Some((_, semaphore)) = batch.semaphore {
                        signals.push(semaphore);
                    }
                }
                own
            }
            (_, _, fence) => fence.unwrap_or_else(vk::Fence::null),
        };

        let submitted = batch
            .command_buffers
            .iter()
            .try_for_each(|&buffer| self.device.end_command_buffer(batch.pool_type, buffer))
            .and_then(|()| {
                self.device.submit(
                    batch.pool_type,
                    &Submission {
                        command_buffers: &batch.command_buffers,
                        wait_semaphores: &batch.wait_info.semaphores,
                        wait_stages: &batch.wait_info.stages,
                        signal_semaphores: &signals,
                        fence: submit_fence,
                    },
                )
            });
        if let Err(e) = submitted {
            self.release_unsubmitted(&mut batch);
            return Err(e);
        }

        match batch.pool_type {
            PoolType::Transfer => {
                log::trace!("Transfer batch {} submitted", batch.submit_id);
                batch.submitted = true;
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                if let Err(err) = self.work_tx.send(Reclaim::Batch(batch)) {
                    // reclamation thread is gone; a submitted batch leaks on drop
                    self.in_flight.fetch_sub(1, Ordering::AcqRel);
                    drop(err);
                    return Err(self.failure_error());
                }
                Ok(None)
            }
            PoolType::Graphics | PoolType::Compute => Ok(Some(batch)),
        }
    }

    /// Reset and begin recording a graphics or compute batch again
    ///
    /// The caller must know the previous submission has completed.
    pub fn restart(&self, batch: &CommandBatch) -> CommandResult<()> {
        self.check_owner(batch)?;
        if batch.pool_type == PoolType::Transfer {
            return Err(CommandError::InvalidOperation(
                "transfer batches are recycled by the manager".to_string(),
            ));
        }
        for &buffer in &batch.command_buffers {
            self.device.reset_command_buffer(batch.pool_type, buffer)?;
        }
        self.begin_all(batch)
    }

    /// Free a batch without submitting it
    ///
    /// Transfer slots go back to their free queues; attached resources are
    /// destroyed immediately since no GPU work references them.
    pub fn free(&self, mut batch: CommandBatch) -> CommandResult<()> {
        self.check_owner(&batch)?;
        for buffer in &batch.command_buffers {
            self.device.reset_command_buffer(batch.pool_type, *buffer)?;
        }
        batch.destroy_resources();
        self.release_unsubmitted(&mut batch);
        Ok(())
    }

    /// Block until the queue serving `pool_type` is idle
    pub fn wait(&self, pool_type: PoolType) -> CommandResult<()> {
        if !self.device.supports(pool_type) {
            return Err(CommandError::PoolTypeUnavailable(pool_type));
        }
        self.device.queue_wait_idle(pool_type)
    }

    /// Stop the reclamation thread and destroy the transfer slots
    ///
    /// Batches already submitted are reclaimed first. Slots that are still
    /// leased, or held back after a reclamation failure, are left alive.
    /// Safe to call more than once.
    pub fn destroy(&mut self) {
        let Some(handle) = self.reclaimer.take() else {
            return;
        };

        let _ = self.work_tx.send(Reclaim::Shutdown);
        if handle.join().is_err() {
            log::error!("Transfer reclamation thread panicked");
        }

        let free_buffers: Vec<vk::CommandBuffer> = self
            .slots
            .buffers
            .drain()
            .into_iter()
            .map(|slot| self.transfer_buffers[slot])
            .collect();
        let free_semaphores = self.slots.semaphores.drain();
        let free_fences = self.slots.fences.drain();

        let leaked = self.transfer_slots - free_fences.len();
        if leaked > 0 {
            log::warn!("{leaked} transfer batches were not returned before shutdown");
        }

        if !free_buffers.is_empty() {
            self.device.free_command_buffers(PoolType::Transfer, &free_buffers);
        }
        for slot in free_semaphores {
            self.device.destroy_semaphore(self.semaphores[slot]);
        }
        for slot in free_fences {
            self.device.destroy_fence(self.fences[slot]);
        }

        log::debug!("Command manager destroyed");
    }
}

impl<D: CommandDevice> Drop for CommandManager<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// State owned by the reclamation thread
struct Reclaimer<D: CommandDevice> {
    device: Arc<D>,
    work_rx: Receiver<Reclaim>,
    failure: Arc<Mutex<Option<String>>>,
    in_flight: Arc<AtomicUsize>,
    /// Dropped on the first failure, waking every blocked allocator
    poisoned_tx: Option<Sender<()>>,
    /// Batches whose completion could not be confirmed
    quarantine: Vec<CommandBatch>,
}

impl<D: CommandDevice> Reclaimer<D> {
    fn run(mut self) {
        while let Ok(Reclaim::Batch(batch)) = self.work_rx.recv() {
            self.reclaim(batch);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }

        if !self.quarantine.is_empty() {
            log::warn!("Leaking {} unreclaimed transfer batches", self.quarantine.len());
        }
        // the GPU may still reference these
        std::mem::forget(std::mem::take(&mut self.quarantine));
    }

    fn reclaim(&mut self, mut batch: CommandBatch) {
        match self.wait_and_reset(&batch) {
            Ok(()) => {
                batch.destroy_resources();
                batch.return_lease();
                log::trace!("Transfer batch {} reclaimed", batch.submit_id);
            }
            Err(e) => {
                let message = format!("batch {}: {e}", batch.submit_id);
                log::error!("Transfer reclamation failed for {message}");
                self.failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_or_insert(message);
                self.poisoned_tx = None;
                self.quarantine.push(batch);
            }
        }
    }

    fn wait_and_reset(&self, batch: &CommandBatch) -> CommandResult<()> {
        let Some((_, fence)) = batch.fence else {
            return Err(CommandError::InvalidOperation("transfer batch without fence".to_string()));
        };
        self.device.wait_for_fence(fence)?;
        self.device.reset_fence(fence)?;
        for &buffer in &batch.command_buffers {
            self.device.reset_command_buffer(PoolType::Transfer, buffer)?;
        }
        Ok(())
    }
}

//! Headless backend for Cadence RHI.
//! Implements Device, Fence, Semaphore, Queue, CommandPool, CommandBuffer and Swapchain in-process.
//!
//! GPU work never runs on its own: submissions retire in order when a fence is waited on
//! (or on [`HeadlessDevice::complete_all`]). Every synchronization event is appended to a
//! journal, and API misuse that a real driver would turn into undefined behavior is recorded as
//! [`JournalEvent::Violation`].

mod command;
mod queue;
mod swapchain;

use crate::{
    CommandPool, CommandPoolDescriptor, Device, Fence, PresentMode, Queue, QueueFlags, ResourceId,
    RhiError, RhiResult, Semaphore, Swapchain, SwapchainDescriptor,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use command::{HeadlessCommandBuffer, HeadlessCommandPool, RecordingState};
pub use queue::HeadlessQueue;
pub use swapchain::HeadlessSwapchain;

/// Headless device configuration.
#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    /// Initial surface size. `None` creates a device without a surface (no swapchain support).
    pub surface_extent: Option<(u32, u32)>,
    /// Present modes the fake surface reports.
    pub present_modes: Vec<PresentMode>,
    /// Per-pool command buffer limit; allocations beyond it fail with `OutOfDeviceMemory`.
    /// Adjustable later through [`HeadlessDevice::set_command_buffer_limit`].
    pub max_command_buffers_per_pool: Option<usize>,
    /// Journal events kept; the oldest are dropped beyond it. Violations and fence wait counts
    /// are tracked outside the journal and survive the drop.
    pub journal_capacity: usize,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            surface_extent: Some((1280, 720)),
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
            max_command_buffers_per_pool: None,
            journal_capacity: 16_384,
        }
    }
}

/// One recorded synchronization event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEvent {
    FenceCreated { fence: ResourceId, signaled: bool },
    /// A CPU wait observed the fence signaled.
    FenceWaited { fence: ResourceId },
    FenceReset { fence: ResourceId },
    FenceDestroyed { fence: ResourceId, pending: bool },
    SemaphoreCreated { semaphore: ResourceId },
    SemaphoreDestroyed { semaphore: ResourceId },
    Submitted {
        fence: Option<ResourceId>,
        command_buffers: Vec<ResourceId>,
        wait_semaphores: Vec<ResourceId>,
        signal_semaphores: Vec<ResourceId>,
    },
    /// The fake GPU finished a submission.
    Retired { fence: Option<ResourceId> },
    CommandBufferReset { buffer: ResourceId },
    CommandBufferFreed { buffer: ResourceId },
    CommandPoolTrimmed { pool: ResourceId },
    SwapchainCreated { swapchain: ResourceId, extent: (u32, u32), image_count: u32 },
    SwapchainDestroyed { swapchain: ResourceId },
    Acquired { swapchain: ResourceId, image_index: u32 },
    Presented { swapchain: ResourceId, image_index: u32 },
    /// Misuse a real driver would not report.
    Violation(String),
}

/// One-shot outcome queued by the fault injection API.
#[derive(Debug, Clone)]
enum Injected {
    Error(RhiError),
    Suboptimal,
}

struct PendingSubmission {
    fence: Option<ResourceId>,
    command_buffers: Vec<ResourceId>,
}

pub(crate) struct State {
    next_id: ResourceId,
    fences: HashMap<ResourceId, bool>,
    semaphores: HashMap<ResourceId, bool>,
    pending: VecDeque<PendingSubmission>,
    pending_buffers: HashMap<ResourceId, usize>,
    journal: VecDeque<JournalEvent>,
    journal_capacity: usize,
    violations: Vec<String>,
    fence_waits: usize,
    surface_extent: Option<(u32, u32)>,
    current_swapchain: Option<ResourceId>,
    acquire_faults: VecDeque<Injected>,
    present_faults: VecDeque<Injected>,
    device_lost: bool,
    submissions: u64,
    max_in_flight: usize,
    pool_limit: Option<usize>,
}

impl State {
    fn new(config: &HeadlessConfig) -> Self {
        Self {
            next_id: 1,
            fences: HashMap::new(),
            semaphores: HashMap::new(),
            pending: VecDeque::new(),
            pending_buffers: HashMap::new(),
            journal: VecDeque::new(),
            journal_capacity: config.journal_capacity.max(1),
            violations: Vec::new(),
            fence_waits: 0,
            surface_extent: config.surface_extent,
            current_swapchain: None,
            acquire_faults: VecDeque::new(),
            present_faults: VecDeque::new(),
            device_lost: false,
            submissions: 0,
            max_in_flight: 0,
            pool_limit: config.max_command_buffers_per_pool,
        }
    }

    pub(crate) fn next_id(&mut self) -> ResourceId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn record(&mut self, event: JournalEvent) {
        if matches!(event, JournalEvent::FenceWaited { .. }) {
            self.fence_waits += 1;
        }
        if self.journal.len() == self.journal_capacity {
            self.journal.pop_front();
        }
        self.journal.push_back(event);
    }

    pub(crate) fn violation(&mut self, message: String) {
        log::error!("headless: {}", message);
        self.violations.push(message.clone());
        self.record(JournalEvent::Violation(message));
    }

    pub(crate) fn check_device(&self) -> RhiResult<()> {
        if self.device_lost {
            Err(RhiError::DeviceLost)
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_buffer_pending(&self, buffer: ResourceId) -> bool {
        self.pending_buffers.get(&buffer).copied().unwrap_or(0) > 0
    }

    fn is_fence_pending(&self, fence: ResourceId) -> bool {
        self.pending.iter().any(|p| p.fence == Some(fence))
    }

    /// Consume a signaled semaphore as a wait operation.
    pub(crate) fn consume_semaphore(&mut self, semaphore: ResourceId, what: &str) {
        match self.semaphores.get_mut(&semaphore) {
            Some(signaled) if *signaled => *signaled = false,
            Some(_) => self.violation(format!("{what} waits on unsignaled semaphore {semaphore}")),
            None => self.violation(format!("{what} waits on destroyed semaphore {semaphore}")),
        }
    }

    pub(crate) fn signal_semaphore(&mut self, semaphore: ResourceId, what: &str) {
        match self.semaphores.get_mut(&semaphore) {
            Some(signaled) if !*signaled => *signaled = true,
            Some(_) => self.violation(format!(
                "{what} signals semaphore {semaphore} that is already signaled"
            )),
            None => self.violation(format!("{what} signals destroyed semaphore {semaphore}")),
        }
    }

    pub(crate) fn push_submission(&mut self, fence: Option<ResourceId>, command_buffers: Vec<ResourceId>) {
        for b in &command_buffers {
            *self.pending_buffers.entry(*b).or_insert(0) += 1;
        }
        self.pending.push_back(PendingSubmission {
            fence,
            command_buffers,
        });
        self.submissions += 1;
        self.max_in_flight = self.max_in_flight.max(self.pending.len());
    }

    /// Finish the oldest pending submission. Returns false when nothing is pending.
    fn retire_front(&mut self) -> bool {
        let Some(done) = self.pending.pop_front() else {
            return false;
        };
        for b in &done.command_buffers {
            if let Some(count) = self.pending_buffers.get_mut(b) {
                *count -= 1;
                if *count == 0 {
                    self.pending_buffers.remove(b);
                }
            }
        }
        if let Some(fence) = done.fence {
            if let Some(signaled) = self.fences.get_mut(&fence) {
                *signaled = true;
            }
        }
        self.record(JournalEvent::Retired { fence: done.fence });
        true
    }

    fn take_fault(queue: &mut VecDeque<Injected>) -> Option<Injected> {
        queue.pop_front()
    }

    pub(crate) fn take_acquire_fault(&mut self) -> Option<Result<(), RhiError>> {
        Self::take_fault(&mut self.acquire_faults).map(|f| match f {
            Injected::Error(e) => Err(e),
            Injected::Suboptimal => Ok(()),
        })
    }

    pub(crate) fn take_present_fault(&mut self) -> Option<Result<(), RhiError>> {
        Self::take_fault(&mut self.present_faults).map(|f| match f {
            Injected::Error(e) => Err(e),
            Injected::Suboptimal => Ok(()),
        })
    }

    pub(crate) fn pool_limit(&self) -> Option<usize> {
        self.pool_limit
    }

    pub(crate) fn surface_extent(&self) -> Option<(u32, u32)> {
        self.surface_extent
    }

    pub(crate) fn current_swapchain(&self) -> Option<ResourceId> {
        self.current_swapchain
    }

    pub(crate) fn set_current_swapchain(&mut self, swapchain: Option<ResourceId>) {
        self.current_swapchain = swapchain;
    }
}

pub(crate) struct Shared {
    state: Mutex<State>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process device. Cheap to clone; clones share one timeline and journal.
#[derive(Clone)]
pub struct HeadlessDevice {
    shared: Arc<Shared>,
    config: Arc<HeadlessConfig>,
}

impl HeadlessDevice {
    pub fn new(config: HeadlessConfig) -> Arc<Self> {
        let state = State::new(&config);
        Arc::new(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
            }),
            config: Arc::new(config),
        })
    }

    /// Change the fake surface size. The current swapchain becomes out of date.
    pub fn resize_surface(&self, width: u32, height: u32) {
        self.shared.lock().surface_extent = Some((width, height));
    }

    /// The next acquire fails with `error` without signaling its semaphore.
    pub fn inject_acquire_error(&self, error: RhiError) {
        self.shared.lock().acquire_faults.push_back(Injected::Error(error));
    }

    /// The next successful acquire reports `SurfaceStatus::Suboptimal`.
    pub fn inject_acquire_suboptimal(&self) {
        self.shared.lock().acquire_faults.push_back(Injected::Suboptimal);
    }

    /// The next present releases its image but reports `error`.
    pub fn inject_present_error(&self, error: RhiError) {
        self.shared.lock().present_faults.push_back(Injected::Error(error));
    }

    pub fn inject_present_suboptimal(&self) {
        self.shared.lock().present_faults.push_back(Injected::Suboptimal);
    }

    /// Change the per-pool command buffer limit. Buffers already allocated stay valid.
    pub fn set_command_buffer_limit(&self, limit: Option<usize>) {
        self.shared.lock().pool_limit = limit;
    }

    /// Every later wait, submit, acquire and present fails with `DeviceLost`.
    pub fn lose_device(&self) {
        self.shared.lock().device_lost = true;
    }

    /// Retire every pending submission.
    pub fn complete_all(&self) {
        let mut state = self.shared.lock();
        while state.retire_front() {}
    }

    /// Retained journal events, oldest first.
    pub fn journal(&self) -> Vec<JournalEvent> {
        self.shared.lock().journal.iter().cloned().collect()
    }

    /// Drop the journal along with the violation list and fence wait count.
    pub fn clear_journal(&self) {
        let mut state = self.shared.lock();
        state.journal.clear();
        state.violations.clear();
        state.fence_waits = 0;
    }

    /// Every violation since creation or the last `clear_journal`, including ones the journal
    /// no longer holds.
    pub fn violations(&self) -> Vec<String> {
        self.shared.lock().violations.clone()
    }

    /// Submissions not yet retired.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Highest `in_flight` observed right after a submit.
    pub fn max_in_flight(&self) -> usize {
        self.shared.lock().max_in_flight
    }

    pub fn submission_count(&self) -> u64 {
        self.shared.lock().submissions
    }

    /// Successful fence waits since creation or the last `clear_journal`.
    pub fn fence_wait_count(&self) -> usize {
        self.shared.lock().fence_waits
    }
}

impl std::fmt::Debug for HeadlessDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("HeadlessDevice")
            .field("surface_extent", &state.surface_extent)
            .field("in_flight", &state.pending.len())
            .finish_non_exhaustive()
    }
}

impl Device for HeadlessDevice {
    fn create_fence(&self, signaled: bool) -> RhiResult<Box<dyn Fence>> {
        let mut state = self.shared.lock();
        let id = state.next_id();
        state.fences.insert(id, signaled);
        state.record(JournalEvent::FenceCreated { fence: id, signaled });
        Ok(Box::new(HeadlessFence {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }

    fn create_semaphore(&self) -> RhiResult<Box<dyn Semaphore>> {
        let mut state = self.shared.lock();
        let id = state.next_id();
        state.semaphores.insert(id, false);
        state.record(JournalEvent::SemaphoreCreated { semaphore: id });
        Ok(Box::new(HeadlessSemaphore {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }

    fn create_command_pool(&self, desc: &CommandPoolDescriptor) -> RhiResult<Box<dyn CommandPool>> {
        let id = self.shared.lock().next_id();
        Ok(Box::new(HeadlessCommandPool::new(Arc::clone(&self.shared), id, desc)))
    }

    fn queue(&self, flags: QueueFlags) -> RhiResult<Box<dyn Queue>> {
        let supported = QueueFlags::GRAPHICS | QueueFlags::COMPUTE | QueueFlags::TRANSFER | QueueFlags::PRESENT;
        if !supported.contains(flags) {
            return Err(RhiError::Unsupported(format!("queue flags {:?}", flags)));
        }
        Ok(Box::new(HeadlessQueue::new(Arc::clone(&self.shared), supported)))
    }

    fn present_modes(&self) -> Vec<PresentMode> {
        self.config.present_modes.clone()
    }

    fn surface_extent(&self) -> Option<(u32, u32)> {
        self.shared.lock().surface_extent()
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDescriptor,
        old_swapchain: Option<&dyn Swapchain>,
    ) -> RhiResult<Box<dyn Swapchain>> {
        if let Some(old) = old_swapchain {
            if old.as_any().downcast_ref::<HeadlessSwapchain>().is_none() {
                return Err(RhiError::Backend("old swapchain is not a headless swapchain".to_string()));
            }
        }
        let present_mode = if self.config.present_modes.contains(&desc.present_mode) {
            desc.present_mode
        } else {
            PresentMode::Fifo
        };
        let swapchain = HeadlessSwapchain::create(Arc::clone(&self.shared), desc, present_mode)?;
        Ok(Box::new(swapchain))
    }

    fn wait_idle(&self) -> RhiResult<()> {
        let mut state = self.shared.lock();
        state.check_device()?;
        while state.retire_front() {}
        Ok(())
    }
}

pub struct HeadlessFence {
    shared: Arc<Shared>,
    id: ResourceId,
}

impl Drop for HeadlessFence {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        let pending = state.is_fence_pending(self.id);
        if pending {
            state.violation(format!("fence {} destroyed while a pending submission signals it", self.id));
        }
        state.fences.remove(&self.id);
        state.record(JournalEvent::FenceDestroyed {
            fence: self.id,
            pending,
        });
    }
}

impl std::fmt::Debug for HeadlessFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessFence").field("id", &self.id).finish()
    }
}

impl Fence for HeadlessFence {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn wait(&self, timeout_ns: u64) -> RhiResult<()> {
        let mut state = self.shared.lock();
        state.check_device()?;
        loop {
            if state.fences.get(&self.id).copied().unwrap_or(false) {
                state.record(JournalEvent::FenceWaited { fence: self.id });
                return Ok(());
            }
            // Nothing left that could signal it: a real device would block until the timeout.
            if !state.retire_front() {
                return Err(RhiError::Timeout(timeout_ns));
            }
        }
    }

    fn reset(&self) -> RhiResult<()> {
        let mut state = self.shared.lock();
        if state.is_fence_pending(self.id) {
            state.violation(format!("fence {} reset while a pending submission signals it", self.id));
            return Err(RhiError::Backend(format!("fence {} is in use", self.id)));
        }
        if let Some(signaled) = state.fences.get_mut(&self.id) {
            *signaled = false;
        }
        state.record(JournalEvent::FenceReset { fence: self.id });
        Ok(())
    }

    fn is_signaled(&self) -> RhiResult<bool> {
        let state = self.shared.lock();
        state.check_device()?;
        Ok(state.fences.get(&self.id).copied().unwrap_or(false))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub struct HeadlessSemaphore {
    shared: Arc<Shared>,
    id: ResourceId,
}

impl Drop for HeadlessSemaphore {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.semaphores.remove(&self.id);
        state.record(JournalEvent::SemaphoreDestroyed { semaphore: self.id });
    }
}

impl std::fmt::Debug for HeadlessSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessSemaphore").field("id", &self.id).finish()
    }
}

impl Semaphore for HeadlessSemaphore {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

//! Frame synchronizer: the ring of in-flight frame slots.
//!
//! Each slot owns a completion fence and an acquire/release semaphore pair. Before a slot is
//! reused its previous submission must be observed complete through the fence, which bounds
//! the number of frames the CPU can queue ahead of the GPU to the ring size. Observed
//! completions advance the shared [`CompletionTimeline`], which is what the command context
//! pool consults before recycling buffers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_rhi::{CommandBuffer, Device, Fence, Queue, RhiError, Semaphore};

use crate::config::MAX_FRAMES_IN_FLIGHT;
use crate::error::{ConfigError, FatalError};

/// Monotonic tag of one queue submission. Serials start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubmissionSerial(u64);

impl SubmissionSerial {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Highest submission serial whose completion the CPU has observed.
#[derive(Debug, Clone, Default)]
pub struct CompletionTimeline {
    completed: Arc<AtomicU64>,
}

impl CompletionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_complete(&self, serial: SubmissionSerial) -> bool {
        serial.0 <= self.completed()
    }

    /// Submissions on one queue retire in order, so completing `serial` completes everything before it.
    pub(crate) fn advance(&self, serial: SubmissionSerial) {
        self.completed.fetch_max(serial.0, Ordering::AcqRel);
    }
}

struct FrameSlot {
    fence: Box<dyn Fence>,
    acquire: Box<dyn Semaphore>,
    release: Box<dyn Semaphore>,
    /// Submission that will signal `fence`, if any.
    pending: Option<SubmissionSerial>,
}

/// The slot handed out for one frame.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameToken {
    slot: usize,
    frame: u64,
}

impl FrameToken {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub frames: u64,
    pub submissions: u64,
    pub fence_waits: u64,
    pub in_flight: usize,
    pub max_in_flight: usize,
}

pub struct FrameSynchronizer {
    slots: Vec<FrameSlot>,
    next_slot: usize,
    next_serial: u64,
    timeout: Duration,
    timeline: CompletionTimeline,
    stats: SyncStats,
    released: bool,
}

impl std::fmt::Debug for FrameSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSynchronizer")
            .field("ring_size", &self.slots.len())
            .field("next_slot", &self.next_slot)
            .field("in_flight", &self.in_flight())
            .field("released", &self.released)
            .finish()
    }
}

impl FrameSynchronizer {
    pub fn new(
        device: &dyn Device,
        ring_size: usize,
        timeout: Duration,
        timeline: CompletionTimeline,
    ) -> Result<Self, FatalError> {
        if !(1..=MAX_FRAMES_IN_FLIGHT).contains(&ring_size) {
            return Err(ConfigError::FramesInFlight {
                got: ring_size,
                max: MAX_FRAMES_IN_FLIGHT,
            }
            .into());
        }
        let mut slots = Vec::with_capacity(ring_size);
        for _ in 0..ring_size {
            // Pre-signaled: the first use of every slot must not block.
            slots.push(FrameSlot {
                fence: device.create_fence(true).map_err(FatalError::Setup)?,
                acquire: device.create_semaphore().map_err(FatalError::Setup)?,
                release: device.create_semaphore().map_err(FatalError::Setup)?,
                pending: None,
            });
        }
        log::debug!("frame synchronizer: {} slots", ring_size);
        Ok(Self {
            slots,
            next_slot: 0,
            next_serial: 1,
            timeout,
            timeline,
            stats: SyncStats::default(),
            released: false,
        })
    }

    pub fn ring_size(&self) -> usize {
        self.slots.len()
    }

    pub fn timeline(&self) -> &CompletionTimeline {
        &self.timeline
    }

    /// Take the next slot in ring order, blocking until its previous submission completed.
    pub fn begin_frame(&mut self) -> Result<FrameToken, FatalError> {
        if self.released {
            return Err(FatalError::Terminated("frame synchronizer released".to_string()));
        }
        let slot = self.next_slot;
        self.next_slot = (slot + 1) % self.slots.len();
        self.wait_slot(slot)?;
        self.slots[slot]
            .fence
            .reset()
            .map_err(|source| FatalError::Sync { slot, source })?;
        let frame = self.stats.frames;
        self.stats.frames += 1;
        log::trace!("frame {}: slot {}", frame, slot);
        Ok(FrameToken { slot, frame })
    }

    /// Block until `slot`'s registered submission completed. No-op if nothing is registered.
    pub fn wait_slot(&mut self, slot: usize) -> Result<(), FatalError> {
        let timeout = self.timeout;
        let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        let entry = &mut self.slots[slot];
        let Some(serial) = entry.pending else {
            return Ok(());
        };
        entry.fence.wait(timeout_ns).map_err(|source| match source {
            RhiError::Timeout(_) => FatalError::FenceTimeout { slot, timeout },
            source => FatalError::Sync { slot, source },
        })?;
        entry.pending = None;
        self.timeline.advance(serial);
        self.stats.fence_waits += 1;
        Ok(())
    }

    pub fn acquire_semaphore(&self, token: &FrameToken) -> &dyn Semaphore {
        self.slots[token.slot].acquire.as_ref()
    }

    pub fn release_semaphore(&self, token: &FrameToken) -> &dyn Semaphore {
        self.slots[token.slot].release.as_ref()
    }

    /// Submit the frame's work: wait on the acquire semaphore, signal the release semaphore and
    /// the slot fence. `command_buffers` may be empty.
    pub fn submit(
        &mut self,
        token: &FrameToken,
        queue: &dyn Queue,
        command_buffers: &[&dyn CommandBuffer],
    ) -> Result<SubmissionSerial, FatalError> {
        let slot = &mut self.slots[token.slot];
        if let Some(previous) = slot.pending {
            return Err(FatalError::Submission(RhiError::Backend(format!(
                "slot {} already carries submission {}",
                token.slot,
                previous.get()
            ))));
        }
        queue
            .submit(
                command_buffers,
                &[slot.acquire.as_ref()],
                &[slot.release.as_ref()],
                Some(slot.fence.as_ref()),
            )
            .map_err(FatalError::Submission)?;
        let serial = SubmissionSerial(self.next_serial);
        self.next_serial += 1;
        slot.pending = Some(serial);
        self.stats.submissions += 1;
        let in_flight = self.in_flight();
        self.stats.max_in_flight = self.stats.max_in_flight.max(in_flight);
        Ok(serial)
    }

    /// Slots with a submission not yet observed complete.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.pending.is_some()).count()
    }

    /// Wait every slot that has a registered submission.
    pub fn wait_all(&mut self) -> Result<(), FatalError> {
        for slot in 0..self.slots.len() {
            self.wait_slot(slot)?;
        }
        Ok(())
    }

    /// Shutdown drain: like [`wait_all`](Self::wait_all), reporting failures as drain failures.
    pub fn drain(&mut self) -> Result<(), FatalError> {
        for slot in 0..self.slots.len() {
            self.wait_slot(slot).map_err(|e| match e {
                FatalError::Sync { slot, source } => FatalError::DrainFailed { slot, source },
                FatalError::FenceTimeout { slot, timeout } => FatalError::DrainFailed {
                    slot,
                    source: RhiError::Timeout(u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)),
                },
                other => other,
            })?;
        }
        Ok(())
    }

    /// Drain, then destroy the synchronization objects. If draining fails they are leaked,
    /// since the device may still signal them.
    pub fn shutdown(&mut self) -> Result<(), FatalError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match self.drain() {
            Ok(()) => {
                self.slots.clear();
                log::debug!("frame synchronizer released");
                Ok(())
            }
            Err(e) => {
                self.leak();
                Err(e)
            }
        }
    }

    /// Give up on the synchronization objects without destroying them.
    pub fn leak(&mut self) {
        self.released = true;
        let slots = std::mem::take(&mut self.slots);
        if !slots.is_empty() {
            log::error!("leaking {} frame slots with unconfirmed GPU work", slots.len());
        }
        std::mem::forget(slots);
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            in_flight: self.in_flight(),
            ..self.stats
        }
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("frame synchronizer dropped without a clean drain: {}", e);
        }
    }
}

//! Headless Queue: validates and enqueues submissions on the fake timeline.

use super::{HeadlessCommandBuffer, JournalEvent, RecordingState, Shared};
use crate::{CommandBuffer, Fence, Queue, QueueFlags, RhiError, RhiResult, Semaphore};
use std::sync::Arc;

pub struct HeadlessQueue {
    shared: Arc<Shared>,
    flags: QueueFlags,
}

impl HeadlessQueue {
    pub(crate) fn new(shared: Arc<Shared>, flags: QueueFlags) -> Self {
        Self { shared, flags }
    }
}

impl std::fmt::Debug for HeadlessQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessQueue").field("flags", &self.flags).finish()
    }
}

impl Queue for HeadlessQueue {
    fn flags(&self) -> QueueFlags {
        self.flags
    }

    fn submit(
        &self,
        command_buffers: &[&dyn CommandBuffer],
        wait_semaphores: &[&dyn Semaphore],
        signal_semaphores: &[&dyn Semaphore],
        signal_fence: Option<&dyn Fence>,
    ) -> RhiResult<()> {
        let mut buffer_ids = Vec::with_capacity(command_buffers.len());
        for b in command_buffers {
            let headless = b
                .as_any()
                .downcast_ref::<HeadlessCommandBuffer>()
                .ok_or_else(|| RhiError::Backend("command buffer is not a headless buffer".to_string()))?;
            if headless.recording_state() != RecordingState::Executable {
                return Err(RhiError::Backend(format!(
                    "command buffer {} submitted while {:?}",
                    headless.id(),
                    headless.recording_state()
                )));
            }
            buffer_ids.push(headless.id());
        }

        let mut state = self.shared.lock();
        state.check_device()?;
        let fence_id = signal_fence.map(|f| f.id());
        if let Some(fence) = signal_fence {
            // Vulkan requires the fence to be unsignaled at submit.
            if state.fences.get(&fence.id()).copied().unwrap_or(false) {
                return Err(RhiError::Backend(format!("fence {} is already signaled", fence.id())));
            }
        }

        let waits: Vec<_> = wait_semaphores.iter().map(|s| s.id()).collect();
        let signals: Vec<_> = signal_semaphores.iter().map(|s| s.id()).collect();
        for &s in &waits {
            state.consume_semaphore(s, "submit");
        }
        for &s in &signals {
            state.signal_semaphore(s, "submit");
        }
        state.push_submission(fence_id, buffer_ids.clone());
        state.record(JournalEvent::Submitted {
            fence: fence_id,
            command_buffers: buffer_ids,
            wait_semaphores: waits,
            signal_semaphores: signals,
        });
        Ok(())
    }
}

//! Headless command pool and command buffer. Buffers only track bindings and draw counts.

use super::{JournalEvent, Shared};
use crate::{
    BindPoint, CommandBuffer, CommandPool, CommandPoolDescriptor, CommandPoolFlags, QueueFlags,
    ResourceId, RhiError, RhiResult,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Lifecycle of a command buffer as the driver sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Initial,
    Recording,
    Executable,
}

pub struct HeadlessCommandPool {
    shared: Arc<Shared>,
    id: ResourceId,
    label: Option<&'static str>,
    queue_flags: QueueFlags,
    flags: CommandPoolFlags,
    live: usize,
}

impl HeadlessCommandPool {
    pub(crate) fn new(
        shared: Arc<Shared>,
        id: ResourceId,
        desc: &CommandPoolDescriptor,
    ) -> Self {
        Self {
            shared,
            id,
            label: desc.label,
            queue_flags: desc.queue_flags,
            flags: desc.flags,
            live: 0,
        }
    }

    pub fn live(&self) -> usize {
        self.live
    }
}

impl std::fmt::Debug for HeadlessCommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessCommandPool")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("queue_flags", &self.queue_flags)
            .field("live", &self.live)
            .finish()
    }
}

impl CommandPool for HeadlessCommandPool {
    fn flags(&self) -> CommandPoolFlags {
        self.flags
    }

    fn allocate(&mut self, count: u32) -> RhiResult<Vec<Box<dyn CommandBuffer>>> {
        let count = count as usize;
        let mut state = self.shared.lock();
        if let Some(limit) = state.pool_limit() {
            if self.live + count > limit {
                return Err(RhiError::OutOfDeviceMemory);
            }
        }
        state.check_device()?;
        let mut buffers: Vec<Box<dyn CommandBuffer>> = Vec::with_capacity(count);
        for _ in 0..count {
            let id = state.next_id();
            buffers.push(Box::new(HeadlessCommandBuffer {
                shared: Arc::clone(&self.shared),
                id,
                flags: self.flags,
                state: RecordingState::Initial,
                target: None,
                program: None,
                geometry: None,
                images: HashMap::new(),
                binds: 0,
                draws: 0,
            }));
        }
        self.live += count;
        Ok(buffers)
    }

    fn free(&mut self, buffers: Vec<Box<dyn CommandBuffer>>) {
        let mut state = self.shared.lock();
        for b in &buffers {
            if state.is_buffer_pending(b.id()) {
                state.violation(format!("command buffer {} freed while pending", b.id()));
            }
            state.record(JournalEvent::CommandBufferFreed { buffer: b.id() });
        }
        self.live = self.live.saturating_sub(buffers.len());
    }

    fn trim(&mut self) {
        self.shared
            .lock()
            .record(JournalEvent::CommandPoolTrimmed { pool: self.id });
    }
}

pub struct HeadlessCommandBuffer {
    shared: Arc<Shared>,
    id: ResourceId,
    flags: CommandPoolFlags,
    state: RecordingState,
    target: Option<ResourceId>,
    program: Option<ResourceId>,
    geometry: Option<ResourceId>,
    images: HashMap<u32, ResourceId>,
    binds: u32,
    draws: u32,
}

impl HeadlessCommandBuffer {
    pub fn recording_state(&self) -> RecordingState {
        self.state
    }

    /// Bind calls recorded since the last reset.
    pub fn bind_count(&self) -> u32 {
        self.binds
    }

    /// Draw calls recorded since the last reset.
    pub fn draw_count(&self) -> u32 {
        self.draws
    }

    fn require_recording(&self, what: &str) {
        if self.state != RecordingState::Recording {
            self.shared
                .lock()
                .violation(format!("{} on command buffer {} while {:?}", what, self.id, self.state));
        }
    }

    fn clear(&mut self) {
        self.target = None;
        self.program = None;
        self.geometry = None;
        self.images.clear();
        self.binds = 0;
        self.draws = 0;
    }
}

impl std::fmt::Debug for HeadlessCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessCommandBuffer")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("draws", &self.draws)
            .finish()
    }
}

impl CommandBuffer for HeadlessCommandBuffer {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn begin(&mut self) -> RhiResult<()> {
        if self.state != RecordingState::Initial {
            return Err(RhiError::Backend(format!(
                "begin on command buffer {} while {:?}",
                self.id, self.state
            )));
        }
        self.state = RecordingState::Recording;
        Ok(())
    }

    fn end(&mut self) -> RhiResult<()> {
        if self.state != RecordingState::Recording {
            return Err(RhiError::Backend(format!(
                "end on command buffer {} while {:?}",
                self.id, self.state
            )));
        }
        self.state = RecordingState::Executable;
        Ok(())
    }

    fn reset(&mut self) -> RhiResult<()> {
        if !self.flags.contains(CommandPoolFlags::RESET_COMMAND_BUFFER) {
            return Err(RhiError::Unsupported(
                "pool was created without RESET_COMMAND_BUFFER".to_string(),
            ));
        }
        {
            let mut state = self.shared.lock();
            if state.is_buffer_pending(self.id) {
                state.violation(format!("command buffer {} reset while pending", self.id));
                return Err(RhiError::Backend(format!("command buffer {} is in use", self.id)));
            }
            state.record(JournalEvent::CommandBufferReset { buffer: self.id });
        }
        self.clear();
        self.state = RecordingState::Initial;
        Ok(())
    }

    fn set_render_target(&mut self, target: Option<ResourceId>) {
        self.require_recording("set_render_target");
        self.target = target;
        self.binds += 1;
    }

    fn set_program(&mut self, program: Option<ResourceId>) {
        self.require_recording("set_program");
        self.program = program;
        self.binds += 1;
    }

    fn set_geometry(&mut self, geometry: Option<ResourceId>) {
        self.require_recording("set_geometry");
        self.geometry = geometry;
        self.binds += 1;
    }

    fn set_image(&mut self, slot: u32, image: Option<ResourceId>) {
        self.require_recording("set_image");
        match image {
            Some(id) => {
                self.images.insert(slot, id);
            }
            None => {
                self.images.remove(&slot);
            }
        }
        self.binds += 1;
    }

    fn draw(&mut self, _vertex_count: u32, _instance_count: u32, _first_vertex: u32, _first_instance: u32) {
        self.require_recording("draw");
        self.draws += 1;
    }

    fn draw_indexed(
        &mut self,
        _index_count: u32,
        _instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.require_recording("draw_indexed");
        self.draws += 1;
    }

    fn bound(&self, point: BindPoint) -> Option<ResourceId> {
        match point {
            BindPoint::RenderTarget => self.target,
            BindPoint::Program => self.program,
            BindPoint::Geometry => self.geometry,
            BindPoint::Image(slot) => self.images.get(&slot).copied(),
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

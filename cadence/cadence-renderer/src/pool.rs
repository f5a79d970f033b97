//! Command context pool.
//!
//! Owns command buffers for one queue affinity, split into a transient partition (re-recorded
//! every frame) and a long-lived one, each backed by its own backend pool. A context moves
//! `Ready -> Recording -> Submitted -> Ready`; the last edge is only taken once the
//! [`CompletionTimeline`] shows its submission finished.
//!
//! The pool is `Send` but not `Sync`, and every mutating call takes `&mut self`, so it is
//! driven by one thread at a time. Use one pool per recording thread.

use std::collections::VecDeque;

use cadence_rhi::{CommandBuffer, CommandPool, CommandPoolDescriptor, CommandPoolFlags, Device, QueueFlags};
use slotmap::SlotMap;

use crate::error::{Exhaustion, PoolError};
use crate::sync::{CompletionTimeline, SubmissionSerial};

slotmap::new_key_type! {
    /// Handle to a pool-owned command context.
    pub struct ContextId;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// Recorded once per frame and recycled when the frame completes.
    Transient,
    /// Kept across frames; reset explicitly by its owner.
    LongLived,
}

impl ContextKind {
    fn index(self) -> usize {
        match self {
            ContextKind::Transient => 0,
            ContextKind::LongLived => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextState {
    Ready,
    Recording,
    Submitted,
}

#[derive(Debug, Clone)]
pub struct ContextPoolDescriptor {
    pub label: Option<&'static str>,
    pub queue_flags: QueueFlags,
    /// Maximum live contexts across both partitions.
    pub max_contexts: usize,
    /// Ready contexts per partition that survive `trim`.
    pub trim_retain: usize,
}

impl Default for ContextPoolDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            queue_flags: QueueFlags::GRAPHICS,
            max_contexts: 8,
            trim_retain: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub ready: usize,
    pub recording: usize,
    pub submitted: usize,
    pub allocations: u64,
    pub resets: u64,
    pub exhaustions: u64,
    pub trims: u64,
    pub freed: u64,
}

#[derive(Debug)]
struct Context {
    kind: ContextKind,
    state: ContextState,
    /// Set by `finish`; a context can only be submitted after it.
    ended: bool,
    serial: Option<SubmissionSerial>,
    buffer: Box<dyn CommandBuffer>,
}

#[derive(Debug)]
pub struct CommandContextPool {
    label: Option<&'static str>,
    queue_flags: QueueFlags,
    max_contexts: usize,
    trim_retain: usize,
    backends: [Box<dyn CommandPool>; 2],
    contexts: SlotMap<ContextId, Context>,
    /// Ready contexts per partition, oldest first.
    ready: [VecDeque<ContextId>; 2],
    timeline: CompletionTimeline,
    stats: PoolStats,
}

impl CommandContextPool {
    pub fn new(
        device: &dyn Device,
        desc: &ContextPoolDescriptor,
        timeline: CompletionTimeline,
    ) -> Result<Self, PoolError> {
        let transient = device.create_command_pool(&CommandPoolDescriptor {
            label: desc.label,
            queue_flags: desc.queue_flags,
            flags: CommandPoolFlags::TRANSIENT | CommandPoolFlags::RESET_COMMAND_BUFFER,
        })?;
        let long_lived = device.create_command_pool(&CommandPoolDescriptor {
            label: desc.label,
            queue_flags: desc.queue_flags,
            flags: CommandPoolFlags::RESET_COMMAND_BUFFER,
        })?;
        Ok(Self {
            label: desc.label,
            queue_flags: desc.queue_flags,
            max_contexts: desc.max_contexts,
            trim_retain: desc.trim_retain,
            backends: [transient, long_lived],
            contexts: SlotMap::with_key(),
            ready: [VecDeque::new(), VecDeque::new()],
            timeline,
            stats: PoolStats::default(),
        })
    }

    pub fn queue_flags(&self) -> QueueFlags {
        self.queue_flags
    }

    pub fn live(&self) -> usize {
        self.contexts.len()
    }

    /// Allocate `count` contexts in the Ready state. All-or-nothing.
    pub fn allocate(&mut self, count: usize, kind: ContextKind) -> Result<Vec<ContextId>, PoolError> {
        let live = self.contexts.len();
        if count > self.max_contexts.saturating_sub(live) {
            return Err(self.exhausted(Exhaustion::Ceiling {
                requested: count,
                live,
                ceiling: self.max_contexts,
            }));
        }
        let buffers = match self.backends[kind.index()].allocate(count as u32) {
            Ok(buffers) => buffers,
            Err(e) if e.is_out_of_memory() => return Err(self.exhausted(Exhaustion::Device(e))),
            Err(e) => return Err(PoolError::Device(e)),
        };
        let ids: Vec<ContextId> = buffers
            .into_iter()
            .map(|buffer| {
                let id = self.contexts.insert(Context {
                    kind,
                    state: ContextState::Ready,
                    ended: false,
                    serial: None,
                    buffer,
                });
                self.ready[kind.index()].push_back(id);
                id
            })
            .collect();
        self.stats.allocations += count as u64;
        log::debug!(
            "pool {:?}: allocated {} {:?} contexts ({} live)",
            self.label,
            count,
            kind,
            self.contexts.len()
        );
        Ok(ids)
    }

    /// A context in the Recording state: a Ready one of `kind` if there is one, else a new one.
    pub fn acquire(&mut self, kind: ContextKind) -> Result<ContextId, PoolError> {
        let id = match self.ready[kind.index()].front().copied() {
            Some(id) => id,
            None => {
                let ids = self.allocate(1, kind)?;
                ids[0]
            }
        };
        self.begin(id)?;
        Ok(id)
    }

    /// Ready -> Recording.
    pub fn begin(&mut self, id: ContextId) -> Result<(), PoolError> {
        let context = self.get_mut(id)?;
        if context.state != ContextState::Ready {
            return Err(invalid(id, context.state, "begin requires a Ready context"));
        }
        context.buffer.begin()?;
        context.state = ContextState::Recording;
        context.ended = false;
        let kind = context.kind;
        self.ready[kind.index()].retain(|&r| r != id);
        Ok(())
    }

    pub fn buffer(&self, id: ContextId) -> Result<&dyn CommandBuffer, PoolError> {
        let context = self.contexts.get(id).ok_or(PoolError::UnknownContext(id))?;
        Ok(context.buffer.as_ref())
    }

    /// The command buffer of a context that is recording.
    pub fn buffer_mut(&mut self, id: ContextId) -> Result<&mut dyn CommandBuffer, PoolError> {
        let context = self.get_mut(id)?;
        if context.state != ContextState::Recording || context.ended {
            return Err(invalid(id, context.state, "not open for recording"));
        }
        Ok(context.buffer.as_mut())
    }

    /// End recording. The context stays Recording until it is marked submitted.
    pub fn finish(&mut self, id: ContextId) -> Result<(), PoolError> {
        let context = self.get_mut(id)?;
        if context.state != ContextState::Recording || context.ended {
            return Err(invalid(id, context.state, "finish requires an open recording"));
        }
        context.buffer.end()?;
        context.ended = true;
        Ok(())
    }

    /// Record that the context's buffer went out in the submission tagged `serial`.
    pub fn mark_submitted(&mut self, id: ContextId, serial: SubmissionSerial) -> Result<(), PoolError> {
        let context = self.get_mut(id)?;
        if context.state != ContextState::Recording || !context.ended {
            return Err(invalid(id, context.state, "only finished recordings can be submitted"));
        }
        context.state = ContextState::Submitted;
        context.serial = Some(serial);
        Ok(())
    }

    /// Return a context to Ready. Fails if its submission has not been observed complete.
    pub fn reset(&mut self, id: ContextId) -> Result<(), PoolError> {
        let completed = self.timeline.completed();
        let context = self.get_mut(id)?;
        match context.state {
            ContextState::Ready => return Ok(()),
            ContextState::Recording => {}
            ContextState::Submitted => {
                if let Some(serial) = context.serial {
                    if serial.get() > completed {
                        return Err(invalid(
                            id,
                            context.state,
                            &format!("submission {} outstanding (completed through {})", serial.get(), completed),
                        ));
                    }
                }
            }
        }
        context.buffer.reset()?;
        context.state = ContextState::Ready;
        context.ended = false;
        context.serial = None;
        let kind = context.kind;
        self.ready[kind.index()].push_back(id);
        self.stats.resets += 1;
        Ok(())
    }

    /// Reset every Submitted context whose submission completed. Returns how many were reset.
    pub fn reclaim(&mut self) -> Result<usize, PoolError> {
        let done: Vec<ContextId> = self
            .contexts
            .iter()
            .filter(|(_, c)| {
                c.state == ContextState::Submitted && c.serial.is_some_and(|s| self.timeline.is_complete(s))
            })
            .map(|(id, _)| id)
            .collect();
        for &id in &done {
            self.reset(id)?;
        }
        if !done.is_empty() {
            log::trace!("pool {:?}: reclaimed {} contexts", self.label, done.len());
        }
        Ok(done.len())
    }

    /// Free a context that is not in flight.
    pub fn free(&mut self, id: ContextId) -> Result<(), PoolError> {
        let completed = self.timeline.completed();
        let context = self.contexts.get(id).ok_or(PoolError::UnknownContext(id))?;
        if context.state == ContextState::Submitted && context.serial.is_some_and(|s| s.get() > completed) {
            return Err(invalid(id, context.state, "cannot free a context with outstanding work"));
        }
        if let Some(context) = self.contexts.remove(id) {
            self.ready[context.kind.index()].retain(|&r| r != id);
            self.backends[context.kind.index()].free(vec![context.buffer]);
            self.stats.freed += 1;
        }
        Ok(())
    }

    /// Free Ready contexts beyond the retain count and let the backend release memory.
    pub fn trim(&mut self) -> usize {
        let mut freed = 0;
        for kind in [ContextKind::Transient, ContextKind::LongLived] {
            let mut buffers = Vec::new();
            while self.ready[kind.index()].len() > self.trim_retain {
                let Some(id) = self.ready[kind.index()].pop_front() else {
                    break;
                };
                if let Some(context) = self.contexts.remove(id) {
                    buffers.push(context.buffer);
                }
            }
            freed += buffers.len();
            if !buffers.is_empty() {
                self.backends[kind.index()].free(buffers);
            }
            self.backends[kind.index()].trim();
        }
        self.stats.trims += 1;
        self.stats.freed += freed as u64;
        if freed > 0 {
            log::debug!("pool {:?}: trimmed {} contexts", self.label, freed);
        }
        freed
    }

    /// Free every context. Contexts whose submission is still outstanding are leaked instead,
    /// since pending work may still read them.
    pub fn release_all(&mut self) {
        let completed = self.timeline.completed();
        let mut released = [Vec::new(), Vec::new()];
        let mut leaked = 0;
        for (_, context) in self.contexts.drain() {
            let outstanding =
                context.state == ContextState::Submitted && context.serial.is_some_and(|s| s.get() > completed);
            if outstanding {
                std::mem::forget(context.buffer);
                leaked += 1;
            } else {
                released[context.kind.index()].push(context.buffer);
            }
        }
        self.ready = [VecDeque::new(), VecDeque::new()];
        for (backend, buffers) in self.backends.iter_mut().zip(released) {
            if !buffers.is_empty() {
                self.stats.freed += buffers.len() as u64;
                backend.free(buffers);
            }
        }
        if leaked > 0 {
            log::error!("pool {:?}: leaking {} contexts still in flight", self.label, leaked);
        }
    }

    pub fn state(&self, id: ContextId) -> Option<ContextState> {
        self.contexts.get(id).map(|c| c.state)
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats;
        stats.live = self.contexts.len();
        stats.ready = 0;
        stats.recording = 0;
        stats.submitted = 0;
        for context in self.contexts.values() {
            match context.state {
                ContextState::Ready => stats.ready += 1,
                ContextState::Recording => stats.recording += 1,
                ContextState::Submitted => stats.submitted += 1,
            }
        }
        stats
    }

    fn get_mut(&mut self, id: ContextId) -> Result<&mut Context, PoolError> {
        self.contexts.get_mut(id).ok_or(PoolError::UnknownContext(id))
    }

    fn exhausted(&mut self, cause: Exhaustion) -> PoolError {
        self.stats.exhaustions += 1;
        log::warn!("pool {:?}: {}", self.label, cause);
        PoolError::ResourceExhausted(cause)
    }
}

fn invalid(context: ContextId, state: ContextState, reason: &str) -> PoolError {
    PoolError::InvalidState {
        context,
        state,
        reason: reason.to_string(),
    }
}

impl Drop for CommandContextPool {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_rhi::{HeadlessConfig, HeadlessDevice, Queue};

    fn pool(device: &HeadlessDevice, max_contexts: usize) -> (CommandContextPool, CompletionTimeline) {
        let timeline = CompletionTimeline::new();
        let desc = ContextPoolDescriptor {
            max_contexts,
            ..ContextPoolDescriptor::default()
        };
        (CommandContextPool::new(device, &desc, timeline.clone()).unwrap(), timeline)
    }

    fn submit(device: &HeadlessDevice, pool: &mut CommandContextPool, id: ContextId, serial: u64) {
        let queue = device.queue(QueueFlags::GRAPHICS).unwrap();
        pool.finish(id).unwrap();
        queue.submit(&[pool.buffer(id).unwrap()], &[], &[], None).unwrap();
        pool.mark_submitted(id, SubmissionSerial::new(serial)).unwrap();
    }

    #[test]
    fn ceiling_exhaustion_leaves_pool_usable() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let (mut pool, _) = pool(&device, 4);
        let first = pool.allocate(3, ContextKind::Transient).unwrap();
        assert_eq!(first.len(), 3);

        let err = pool.allocate(2, ContextKind::Transient).unwrap_err();
        assert_eq!(
            err,
            PoolError::ResourceExhausted(Exhaustion::Ceiling {
                requested: 2,
                live: 3,
                ceiling: 4
            })
        );
        assert_eq!(pool.live(), 3);

        let id = pool.allocate(1, ContextKind::LongLived).unwrap()[0];
        pool.begin(id).unwrap();
        assert_eq!(pool.state(id), Some(ContextState::Recording));
        let stats = pool.stats();
        assert_eq!((stats.live, stats.exhaustions, stats.allocations), (4, 1, 4));
    }

    #[test]
    fn oversized_request_is_exhaustion() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let (mut pool, _) = pool(&device, 4);
        pool.allocate(1, ContextKind::Transient).unwrap();
        let err = pool.allocate(usize::MAX, ContextKind::Transient).unwrap_err();
        assert_eq!(
            err,
            PoolError::ResourceExhausted(Exhaustion::Ceiling {
                requested: usize::MAX,
                live: 1,
                ceiling: 4
            })
        );
        assert_eq!(pool.live(), 1);
        assert_eq!(pool.allocate(3, ContextKind::Transient).unwrap().len(), 3);
    }

    #[test]
    fn device_rejection_is_exhaustion() {
        let device = HeadlessDevice::new(HeadlessConfig {
            max_command_buffers_per_pool: Some(1),
            ..HeadlessConfig::default()
        });
        let (mut pool, _) = pool(&device, 8);
        pool.allocate(1, ContextKind::Transient).unwrap();
        let err = pool.allocate(1, ContextKind::Transient).unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(pool.live(), 1);
        // The other partition has its own backend pool.
        assert!(pool.allocate(1, ContextKind::LongLived).is_ok());
    }

    #[test]
    fn reset_waits_for_completion() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let (mut pool, timeline) = pool(&device, 4);
        let id = pool.acquire(ContextKind::Transient).unwrap();
        submit(&device, &mut pool, id, 1);

        let err = pool.reset(id).unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidState {
                state: ContextState::Submitted,
                ..
            }
        ));
        assert_eq!(pool.reclaim().unwrap(), 0);

        device.complete_all();
        timeline.advance(SubmissionSerial::new(1));
        assert_eq!(pool.reclaim().unwrap(), 1);
        assert_eq!(pool.state(id), Some(ContextState::Ready));
        assert!(device.violations().is_empty());
    }

    #[test]
    fn acquire_reuses_ready_contexts() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let (mut pool, timeline) = pool(&device, 2);
        let a = pool.acquire(ContextKind::Transient).unwrap();
        submit(&device, &mut pool, a, 1);
        device.complete_all();
        timeline.advance(SubmissionSerial::new(1));
        pool.reclaim().unwrap();

        let b = pool.acquire(ContextKind::Transient).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.stats().allocations, 1);
    }

    #[test]
    fn lifecycle_misuse_is_invalid_state() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let (mut pool, _) = pool(&device, 2);
        let id = pool.allocate(1, ContextKind::Transient).unwrap()[0];
        assert!(pool.finish(id).is_err());
        assert!(pool.mark_submitted(id, SubmissionSerial::new(1)).is_err());
        pool.begin(id).unwrap();
        assert!(pool.begin(id).is_err());
        assert!(pool.mark_submitted(id, SubmissionSerial::new(1)).is_err());
        // Abandoning a recording is allowed.
        pool.reset(id).unwrap();
        assert_eq!(pool.state(id), Some(ContextState::Ready));
    }

    #[test]
    fn trim_keeps_retain_count() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let (mut pool, _) = pool(&device, 8);
        pool.allocate(5, ContextKind::Transient).unwrap();
        assert_eq!(pool.trim(), 3);
        assert_eq!(pool.live(), 2);
        assert_eq!(pool.stats().trims, 1);
    }

    #[test]
    fn drop_leaks_in_flight_contexts() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let (mut pool, _) = pool(&device, 2);
        let id = pool.acquire(ContextKind::Transient).unwrap();
        submit(&device, &mut pool, id, 1);
        drop(pool);
        assert!(device.violations().is_empty());
        device.complete_all();
    }
}

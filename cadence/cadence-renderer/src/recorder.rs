//! Batch recording with explicit state tracking.
//!
//! The recorder remembers what it last bound on the current command buffer and only issues the
//! binds that differ. The live re-query through [`fingerprint_live`] is used purely as an
//! assertion when validation is on.

use cadence_rhi::{CommandBuffer, ResourceId};

use crate::error::FatalError;
use crate::hasher::{fingerprint_live, LiveState};
use crate::registry::ResourceRegistry;
use crate::scheduler::DrawBatch;
use crate::state::{DrawCall, RenderState, MAX_IMAGE_SLOTS};

/// Backend handles a state resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Resolved {
    target: Option<ResourceId>,
    program: ResourceId,
    geometry: ResourceId,
    images: [Option<ResourceId>; MAX_IMAGE_SLOTS],
}

impl Resolved {
    fn from_state(state: &RenderState, registry: &ResourceRegistry) -> Result<Self, FatalError> {
        let dangling = |kind| FatalError::DanglingIdentity { kind };
        let target = match state.target {
            Some(t) => Some(registry.target(t).ok_or(dangling("target"))?),
            None => None,
        };
        let program = registry.program(state.program).ok_or(dangling("program"))?;
        let geometry = registry.geometry(state.geometry).ok_or(dangling("geometry"))?;
        let mut images = [None; MAX_IMAGE_SLOTS];
        for (out, image) in images.iter_mut().zip(state.images.iter()) {
            if let Some(image) = image {
                *out = Some(registry.image(*image).ok_or(dangling("image"))?);
            }
        }
        Ok(Self {
            target,
            program,
            geometry,
            images,
        })
    }
}

/// Counters for one recorded command buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordStats {
    pub batches: usize,
    pub draws: usize,
    pub binds: usize,
}

#[derive(Debug, Default)]
pub struct StateRecorder {
    /// `None` until the first state is applied on the current buffer.
    applied: Option<Resolved>,
    validate: bool,
    stats: RecordStats,
}

impl StateRecorder {
    pub fn new(validate: bool) -> Self {
        Self {
            applied: None,
            validate,
            stats: RecordStats::default(),
        }
    }

    /// Forget everything bound. Call when switching to a freshly begun command buffer.
    pub fn restart(&mut self) {
        self.applied = None;
        self.stats = RecordStats::default();
    }

    pub fn stats(&self) -> RecordStats {
        self.stats
    }

    /// Bind `state`, issuing only the binds that differ from what was applied last.
    pub fn apply(
        &mut self,
        buffer: &mut dyn CommandBuffer,
        registry: &ResourceRegistry,
        state: &RenderState,
    ) -> Result<usize, FatalError> {
        let next = Resolved::from_state(state, registry)?;
        let previous = self.applied;
        let mut binds = 0;
        if previous.map(|p| p.target) != Some(next.target) {
            buffer.set_render_target(next.target);
            binds += 1;
        }
        if previous.map(|p| p.program) != Some(next.program) {
            buffer.set_program(Some(next.program));
            binds += 1;
        }
        if previous.map(|p| p.geometry) != Some(next.geometry) {
            buffer.set_geometry(Some(next.geometry));
            binds += 1;
        }
        for slot in 0..MAX_IMAGE_SLOTS {
            if previous.map(|p| p.images[slot]) != Some(next.images[slot]) {
                buffer.set_image(slot as u32, next.images[slot]);
                binds += 1;
            }
        }
        self.applied = Some(next);
        self.stats.binds += binds;
        Ok(binds)
    }

    /// Apply the batch state, optionally cross-check it against the live bindings, then draw.
    pub fn record_batch(
        &mut self,
        buffer: &mut dyn CommandBuffer,
        registry: &ResourceRegistry,
        batch: &DrawBatch,
    ) -> Result<(), FatalError> {
        self.apply(buffer, registry, &batch.state)?;
        if self.validate {
            let live = fingerprint_live(&LiveState {
                buffer: &*buffer,
                registry,
            });
            if live != batch.fingerprint {
                log::error!(
                    "live state {:#018x} does not match batch state {:#018x} ({:?})",
                    live,
                    batch.fingerprint,
                    batch.state
                );
                return Err(FatalError::StateDivergence {
                    expected: batch.fingerprint,
                    live,
                });
            }
        }
        for draw in &batch.draws {
            match *draw {
                DrawCall::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => buffer.draw(vertex_count, instance_count, first_vertex, first_instance),
                DrawCall::Indexed {
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                } => buffer.draw_indexed(index_count, instance_count, first_index, vertex_offset, first_instance),
            }
        }
        self.stats.batches += 1;
        self.stats.draws += batch.draws.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::fingerprint;
    use crate::registry::ImageId;
    use crate::state::RenderClass;
    use cadence_rhi::headless::HeadlessCommandBuffer;
    use cadence_rhi::{CommandPoolDescriptor, Device, HeadlessConfig, HeadlessDevice};

    fn batch(state: RenderState, draws: usize) -> DrawBatch {
        DrawBatch {
            state,
            fingerprint: fingerprint(&state),
            class: RenderClass::Opaque,
            draws: vec![DrawCall::indexed(6); draws],
        }
    }

    fn headless(buffer: &dyn CommandBuffer) -> &HeadlessCommandBuffer {
        buffer.as_any().downcast_ref().unwrap()
    }

    #[test]
    fn only_changed_fields_are_bound() {
        let mut registry = ResourceRegistry::new();
        let program = registry.register_program(1);
        let geometry = registry.register_geometry(2);
        let images: Vec<ImageId> = (10..12).map(|h| registry.register_image(h)).collect();
        let a = RenderState::new(program, geometry).with_image(0, images[0]);
        let b = a.with_image(1, images[1]);

        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut pool = device.create_command_pool(&CommandPoolDescriptor::default()).unwrap();
        let mut buffers = pool.allocate(1).unwrap();
        buffers[0].begin().unwrap();

        let mut recorder = StateRecorder::new(true);
        assert_eq!(recorder.apply(buffers[0].as_mut(), &registry, &a).unwrap(), 3 + MAX_IMAGE_SLOTS);
        assert_eq!(recorder.apply(buffers[0].as_mut(), &registry, &a).unwrap(), 0);
        assert_eq!(recorder.apply(buffers[0].as_mut(), &registry, &b).unwrap(), 1);
        recorder.record_batch(buffers[0].as_mut(), &registry, &batch(b, 4)).unwrap();

        let stats = recorder.stats();
        assert_eq!(stats.binds, 3 + MAX_IMAGE_SLOTS + 1);
        assert_eq!(stats.draws, 4);
        assert_eq!(headless(buffers[0].as_ref()).bind_count() as usize, stats.binds);
        assert_eq!(headless(buffers[0].as_ref()).draw_count(), 4);
        buffers[0].end().unwrap();
        pool.free(buffers);
    }

    #[test]
    fn dangling_identity_is_fatal() {
        let mut registry = ResourceRegistry::new();
        let program = registry.register_program(1);
        let geometry = registry.register_geometry(2);
        let state = RenderState::new(program, geometry);
        registry.remove_geometry(geometry);

        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut pool = device.create_command_pool(&CommandPoolDescriptor::default()).unwrap();
        let mut buffers = pool.allocate(1).unwrap();
        buffers[0].begin().unwrap();
        let err = StateRecorder::new(false)
            .apply(buffers[0].as_mut(), &registry, &state)
            .unwrap_err();
        assert_eq!(err, FatalError::DanglingIdentity { kind: "geometry" });
        buffers[0].end().unwrap();
        pool.free(buffers);
    }

    #[test]
    fn dangling_image_slot_is_named() {
        let mut registry = ResourceRegistry::new();
        let program = registry.register_program(1);
        let geometry = registry.register_geometry(2);
        let image = registry.register_image(3);
        let state = RenderState::new(program, geometry).with_image(4, image);

        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut pool = device.create_command_pool(&CommandPoolDescriptor::default()).unwrap();
        let mut buffers = pool.allocate(1).unwrap();
        buffers[0].begin().unwrap();
        let mut recorder = StateRecorder::new(false);
        recorder.apply(buffers[0].as_mut(), &registry, &state).unwrap();

        registry.remove_image(image);
        recorder.restart();
        let err = recorder.apply(buffers[0].as_mut(), &registry, &state).unwrap_err();
        assert_eq!(err, FatalError::DanglingIdentity { kind: "image" });
        buffers[0].end().unwrap();
        pool.free(buffers);
    }

    #[test]
    fn validation_catches_binds_behind_the_recorders_back() {
        let mut registry = ResourceRegistry::new();
        let program = registry.register_program(1);
        let geometry = registry.register_geometry(2);
        let state = RenderState::new(program, geometry);

        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut pool = device.create_command_pool(&CommandPoolDescriptor::default()).unwrap();
        let mut buffers = pool.allocate(1).unwrap();
        buffers[0].begin().unwrap();

        let mut recorder = StateRecorder::new(true);
        recorder.record_batch(buffers[0].as_mut(), &registry, &batch(state, 1)).unwrap();
        // Someone else rebinds the program; the tracked state still says it is bound.
        buffers[0].set_program(Some(77));
        let err = recorder
            .record_batch(buffers[0].as_mut(), &registry, &batch(state, 1))
            .unwrap_err();
        assert!(matches!(err, FatalError::StateDivergence { .. }));
        buffers[0].end().unwrap();
        pool.free(buffers);
    }
}

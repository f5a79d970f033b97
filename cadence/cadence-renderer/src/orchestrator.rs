//! Frame orchestrator: drives one frame through slot wait, acquire, record, submit and present.
//!
//! Stale chains and exhausted pools skip the frame and are reported through [`FrameResult`].
//! Anything else is fatal: it is returned from [`FrameOrchestrator::submit_frame`] and every
//! later call fails with [`FatalError::Terminated`].

use std::sync::Arc;

use cadence_rhi::{Device, Queue, TextureFormat};

use crate::config::FrameConfig;
use crate::error::{Exhaustion, FatalError, PoolError, SkipReason};
use crate::pool::{CommandContextPool, ContextKind, ContextPoolDescriptor};
use crate::present::{Acquired, PresentableImage, Presented, PresentationController, Reconstruction};
use crate::recorder::StateRecorder;
use crate::registry::ResourceRegistry;
use crate::scheduler::BatchScheduler;
use crate::state::RenderRequest;
use crate::stats::FrameStats;
use crate::sync::{CompletionTimeline, FrameSynchronizer, FrameToken};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameResult {
    Presented,
    Skipped(SkipReason),
}

pub struct FrameOrchestrator {
    // Field order is teardown order: contexts, then the chain, then the sync objects.
    pool: CommandContextPool,
    presenter: PresentationController,
    sync: FrameSynchronizer,
    queue: Box<dyn Queue>,
    scheduler: BatchScheduler,
    recorder: StateRecorder,
    registry: ResourceRegistry,
    config: FrameConfig,
    stats: FrameStats,
    poisoned: Option<FatalError>,
    shut_down: bool,
    device: Arc<dyn Device>,
}

impl std::fmt::Debug for FrameOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameOrchestrator")
            .field("presenter", &self.presenter)
            .field("sync", &self.sync)
            .field("poisoned", &self.poisoned)
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl FrameOrchestrator {
    pub fn new(device: Arc<dyn Device>, surface_extent: (u32, u32), config: FrameConfig) -> Result<Self, FatalError> {
        config.validate()?;
        let timeline = CompletionTimeline::new();
        let queue = device
            .queue(cadence_rhi::QueueFlags::GRAPHICS | cadence_rhi::QueueFlags::PRESENT)
            .map_err(FatalError::Setup)?;
        let sync = FrameSynchronizer::new(
            device.as_ref(),
            config.frames_in_flight,
            config.fence_timeout,
            timeline.clone(),
        )?;
        let presenter = PresentationController::new(Arc::clone(&device), surface_extent, &config)?;
        let pool = CommandContextPool::new(
            device.as_ref(),
            &ContextPoolDescriptor {
                label: Some("frame"),
                queue_flags: queue.flags(),
                max_contexts: config.max_contexts,
                trim_retain: config.trim_retain,
            },
            timeline,
        )
        .map_err(FatalError::Pool)?;
        log::info!(
            "frame orchestrator ready: {} frames in flight, {} contexts max, live validation {}",
            config.frames_in_flight,
            config.max_contexts,
            if config.validate_live_state { "on" } else { "off" }
        );
        Ok(Self {
            pool,
            presenter,
            sync,
            queue,
            scheduler: BatchScheduler::new(),
            recorder: StateRecorder::new(config.validate_live_state),
            registry: ResourceRegistry::new(),
            config,
            stats: FrameStats::default(),
            poisoned: None,
            shut_down: false,
            device,
        })
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn is_terminated(&self) -> bool {
        self.poisoned.is_some() || self.shut_down
    }

    /// Windowing notification. The chain is rebuilt at the start of the next frame.
    pub fn surface_changed(&mut self, extent: (u32, u32), format: Option<TextureFormat>) {
        self.presenter.surface_changed(extent, format);
    }

    /// Render and present one frame from `requests`.
    pub fn submit_frame(&mut self, requests: &[RenderRequest]) -> Result<FrameResult, FatalError> {
        if let Some(cause) = &self.poisoned {
            return Err(FatalError::Terminated(cause.to_string()));
        }
        if self.shut_down {
            return Err(FatalError::Terminated("orchestrator was shut down".to_string()));
        }
        match self.run_frame(requests) {
            Ok(result) => {
                match &result {
                    FrameResult::Presented => self.stats.frames_presented += 1,
                    FrameResult::Skipped(reason) => {
                        self.stats.frames_skipped += 1;
                        match reason {
                            SkipReason::Stale(_) => self.stats.frames_skipped_stale += 1,
                            SkipReason::ResourceExhausted(_) => self.stats.frames_skipped_exhausted += 1,
                            SkipReason::ImageNotReady => self.stats.frames_skipped_not_ready += 1,
                            SkipReason::SurfaceUnavailable => self.stats.frames_skipped_unavailable += 1,
                        }
                        log::warn!("frame {} skipped: {}", self.stats.frames_submitted, reason);
                    }
                }
                Ok(result)
            }
            Err(e) => {
                log::error!("frame {} failed: {}", self.stats.frames_submitted, e);
                self.poisoned = Some(e.clone());
                Err(e)
            }
        }
    }

    fn run_frame(&mut self, requests: &[RenderRequest]) -> Result<FrameResult, FatalError> {
        self.stats.frames_submitted += 1;

        let token = self.sync.begin_frame()?;
        self.pool.reclaim().map_err(FatalError::Pool)?;
        let interval = self.config.trim_interval;
        if interval > 0 && (token.frame() + 1) % interval == 0 {
            self.pool.trim();
        }

        if self.presenter.needs_reconstruct()
            && self.presenter.reconstruct(&mut self.sync)? == Reconstruction::Deferred
        {
            return Ok(FrameResult::Skipped(SkipReason::SurfaceUnavailable));
        }
        let image = match self.presenter.acquire_next(self.sync.acquire_semaphore(&token))? {
            Acquired::Image { image, .. } => image,
            Acquired::Stale(reason) => {
                self.presenter.reconstruct(&mut self.sync)?;
                return Ok(FrameResult::Skipped(SkipReason::Stale(reason)));
            }
            Acquired::NotReady => return Ok(FrameResult::Skipped(SkipReason::ImageNotReady)),
            Acquired::SurfaceUnavailable => return Ok(FrameResult::Skipped(SkipReason::SurfaceUnavailable)),
        };
        // The image may still be the render target of a frame queued from another slot.
        if let Some(owner) = self.presenter.image_owner(image.index()) {
            if owner != token.slot() {
                self.sync.wait_slot(owner)?;
            }
        }
        self.presenter.set_image_owner(image.index(), token.slot());

        let schedule = self.scheduler.schedule(requests);

        let context = match self.pool.acquire(ContextKind::Transient) {
            Ok(context) => context,
            Err(PoolError::ResourceExhausted(cause)) => return self.skip_exhausted(&token, image, cause),
            Err(e) => return Err(FatalError::Pool(e)),
        };
        self.recorder.restart();
        {
            let buffer = self.pool.buffer_mut(context).map_err(FatalError::Pool)?;
            for batch in &schedule.batches {
                self.recorder.record_batch(buffer, &self.registry, batch)?;
            }
        }
        self.pool.finish(context).map_err(FatalError::Pool)?;

        let serial = {
            let buffer = self.pool.buffer(context).map_err(FatalError::Pool)?;
            self.sync.submit(&token, self.queue.as_ref(), &[buffer])?
        };
        self.pool.mark_submitted(context, serial).map_err(FatalError::Pool)?;

        let recorded = self.recorder.stats();
        self.stats.batches_formed += schedule.stats.batches as u64;
        self.stats.state_transitions_avoided += schedule.stats.transitions_avoided as u64;
        self.stats.requests_recorded += recorded.draws as u64;
        self.stats.binds_issued += recorded.binds as u64;
        log::debug!(
            "frame {}: slot {}, image {}, {} batches, submission {}",
            token.frame(),
            token.slot(),
            image.index(),
            schedule.stats.batches,
            serial.get()
        );

        let presented = self.presenter.present(image, self.sync.release_semaphore(&token))?;
        self.after_present(presented)?;
        Ok(FrameResult::Presented)
    }

    /// No context to record into: release the acquired image with an empty submission so the
    /// semaphores and the slot fence stay balanced, then skip.
    fn skip_exhausted(
        &mut self,
        token: &FrameToken,
        image: PresentableImage,
        cause: Exhaustion,
    ) -> Result<FrameResult, FatalError> {
        self.sync.submit(token, self.queue.as_ref(), &[])?;
        let presented = self.presenter.present(image, self.sync.release_semaphore(token))?;
        self.after_present(presented)?;
        Ok(FrameResult::Skipped(SkipReason::ResourceExhausted(cause)))
    }

    fn after_present(&mut self, presented: Presented) -> Result<(), FatalError> {
        if let Presented::Stale(reason) = presented {
            log::info!("chain stale after present ({}), rebuilding", reason);
            self.presenter.reconstruct(&mut self.sync)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            reconstructions: self.presenter.reconstructions(),
            pool: self.pool.stats(),
            sync: self.sync.stats(),
            ..self.stats
        }
    }

    /// Wait for every in-flight frame, then release contexts, the chain and the sync objects in
    /// that order. If the wait fails nothing the device may still touch is destroyed.
    pub fn shutdown(&mut self) -> Result<(), FatalError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        log::info!("frame orchestrator shutting down");
        if let Err(e) = self.sync.drain() {
            log::error!("shutdown drain failed, leaking frame resources: {}", e);
            self.presenter.leak();
            self.sync.leak();
            return Err(e);
        }
        self.pool.reclaim().map_err(FatalError::Pool)?;
        self.pool.release_all();
        self.presenter.release();
        self.sync.shutdown()?;
        log::info!("frame orchestrator shut down after {} frames", self.stats.frames_submitted);
        Ok(())
    }
}

impl Drop for FrameOrchestrator {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("frame orchestrator dropped without a clean shutdown: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StaleReason;
    use crate::state::{DrawCall, RenderClass, RenderState};
    use cadence_rhi::{HeadlessConfig, HeadlessDevice, JournalEvent, RhiError};

    fn orchestrator(device: &Arc<HeadlessDevice>, config: FrameConfig) -> FrameOrchestrator {
        FrameOrchestrator::new(device.clone(), (1280, 720), config).unwrap()
    }

    fn requests(orchestrator: &mut FrameOrchestrator, count: usize) -> Vec<RenderRequest> {
        let registry = orchestrator.registry_mut();
        let geometry = registry.register_geometry(10);
        let image = registry.register_image(30);
        let programs = [registry.register_program(20), registry.register_program(21)];
        (0..count)
            .map(|i| {
                let state = RenderState::new(programs[i % 2], geometry).with_image(i % 3, image);
                RenderRequest::opaque(state, DrawCall::indexed(36))
            })
            .collect()
    }

    fn is_destruction(event: &JournalEvent) -> bool {
        matches!(
            event,
            JournalEvent::FenceDestroyed { .. }
                | JournalEvent::SemaphoreDestroyed { .. }
                | JournalEvent::CommandBufferFreed { .. }
                | JournalEvent::SwapchainDestroyed { .. }
        )
    }

    #[test]
    fn frames_in_flight_never_exceed_ring_size() {
        for ring in 1..=3 {
            let device = HeadlessDevice::new(HeadlessConfig::default());
            let mut o = orchestrator(
                &device,
                FrameConfig {
                    frames_in_flight: ring,
                    validate_live_state: true,
                    ..FrameConfig::default()
                },
            );
            let requests = requests(&mut o, 12);
            for _ in 0..30 {
                assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
                assert!(device.in_flight() <= ring);
            }
            let stats = o.stats();
            assert!(device.max_in_flight() <= ring);
            assert_eq!(stats.sync.max_in_flight, ring);
            assert_eq!(stats.frames_presented, 30);
            assert!(stats.pool.live <= ring, "ring {ring}: {} contexts", stats.pool.live);
            o.shutdown().unwrap();
            assert!(device.violations().is_empty(), "{:?}", device.violations());
        }
    }

    #[test]
    fn batching_is_reported() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut o = orchestrator(&device, FrameConfig::default());
        let requests = requests(&mut o, 12);
        o.submit_frame(&requests).unwrap();
        let stats = o.stats();
        // Six distinct (program, image slot) states.
        assert_eq!(stats.batches_formed, 6);
        assert_eq!(stats.state_transitions_avoided, 12 - 6);
        assert_eq!(stats.requests_recorded, 12);
    }

    #[test]
    fn stale_acquire_skips_once_then_presents() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut o = orchestrator(&device, FrameConfig::default());
        let requests = requests(&mut o, 4);
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);

        device.inject_acquire_error(RhiError::OutOfDate);
        assert_eq!(
            o.submit_frame(&requests).unwrap(),
            FrameResult::Skipped(SkipReason::Stale(StaleReason::OutOfDate))
        );
        assert_eq!(o.stats().reconstructions, 1);
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
        assert_eq!(o.stats().reconstructions, 1);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn unannounced_resize_recovers_at_new_extent() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut o = orchestrator(&device, FrameConfig::default());
        let requests = requests(&mut o, 4);
        o.submit_frame(&requests).unwrap();
        device.resize_surface(640, 480);
        assert!(matches!(
            o.submit_frame(&requests).unwrap(),
            FrameResult::Skipped(SkipReason::Stale(_))
        ));
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
        assert!(device
            .journal()
            .iter()
            .any(|e| matches!(e, JournalEvent::SwapchainCreated { extent: (640, 480), .. })));
    }

    #[test]
    fn announced_resize_rebuilds_before_acquire() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut o = orchestrator(&device, FrameConfig::default());
        let requests = requests(&mut o, 4);
        o.submit_frame(&requests).unwrap();
        device.resize_surface(800, 600);
        o.surface_changed((800, 600), None);
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
        assert_eq!(o.stats().reconstructions, 1);
    }

    #[test]
    fn stale_present_still_counts_as_presented() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut o = orchestrator(&device, FrameConfig::default());
        let requests = requests(&mut o, 4);
        device.inject_present_error(RhiError::OutOfDate);
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
        assert_eq!(o.stats().reconstructions, 1);
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
        assert!(device.violations().is_empty());
    }

    #[test]
    fn suboptimal_present_rebuilds_once_after_display() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut o = orchestrator(&device, FrameConfig::default());
        let requests = requests(&mut o, 4);
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);

        device.inject_present_suboptimal();
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
        assert_eq!(o.stats().reconstructions, 1);
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
        assert_eq!(o.stats().reconstructions, 1);

        let stats = o.stats();
        assert_eq!((stats.frames_presented, stats.frames_skipped), (3, 0));
        o.shutdown().unwrap();
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn suboptimal_acquire_presents_then_rebuilds() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut o = orchestrator(&device, FrameConfig::default());
        let requests = requests(&mut o, 4);

        device.inject_acquire_suboptimal();
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
        assert_eq!(o.stats().reconstructions, 1);
        let journal = device.journal();
        let created: Vec<usize> = journal
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, JournalEvent::SwapchainCreated { .. }))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(created.len(), 2);
        assert!(journal[created[0]..created[1]]
            .iter()
            .any(|e| matches!(e, JournalEvent::Presented { .. })));
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
        assert_eq!(o.stats().reconstructions, 1);

        o.shutdown().unwrap();
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn acquire_timeout_skips_without_stranding_the_slot() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut o = orchestrator(&device, FrameConfig::default());
        let requests = requests(&mut o, 4);
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);

        device.inject_acquire_error(RhiError::Timeout(0));
        assert_eq!(
            o.submit_frame(&requests).unwrap(),
            FrameResult::Skipped(SkipReason::ImageNotReady)
        );
        for _ in 0..6 {
            assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
        }

        let stats = o.stats();
        assert_eq!(stats.frames_skipped_not_ready, 1);
        assert_eq!(stats.frames_skipped, 1);
        assert_eq!(stats.frames_presented, 7);
        assert_eq!(stats.reconstructions, 0);
        assert!(device.in_flight() <= 2);
        o.shutdown().unwrap();
        assert_eq!(device.in_flight(), 0);
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn zero_area_surface_skips_until_resized() {
        let device = HeadlessDevice::new(HeadlessConfig {
            surface_extent: Some((0, 0)),
            ..HeadlessConfig::default()
        });
        let mut o = FrameOrchestrator::new(device.clone(), (0, 0), FrameConfig::default()).unwrap();
        let requests = requests(&mut o, 2);
        assert_eq!(
            o.submit_frame(&requests).unwrap(),
            FrameResult::Skipped(SkipReason::SurfaceUnavailable)
        );
        device.resize_surface(320, 240);
        o.surface_changed((320, 240), None);
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
    }

    #[test]
    fn exhausted_pool_skips_without_breaking_the_ring() {
        let device = HeadlessDevice::new(HeadlessConfig {
            max_command_buffers_per_pool: Some(1),
            ..HeadlessConfig::default()
        });
        let mut o = orchestrator(&device, FrameConfig::default());
        let requests = requests(&mut o, 4);
        let results: Vec<FrameResult> = (0..6).map(|_| o.submit_frame(&requests).unwrap()).collect();

        // One buffer, two slots: the buffer is only free again every other frame.
        for (i, result) in results.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(*result, FrameResult::Presented, "frame {i}");
            } else {
                assert_eq!(
                    *result,
                    FrameResult::Skipped(SkipReason::ResourceExhausted(Exhaustion::Device(
                        RhiError::OutOfDeviceMemory
                    ))),
                    "frame {i}"
                );
            }
        }
        let stats = o.stats();
        assert_eq!(stats.frames_skipped_exhausted, 3);
        assert_eq!(stats.pool.exhaustions, 3);
        assert_eq!(stats.pool.live, 1);
        o.shutdown().unwrap();
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn shutdown_waits_for_every_frame_before_releasing() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut o = orchestrator(
            &device,
            FrameConfig {
                frames_in_flight: 3,
                ..FrameConfig::default()
            },
        );
        let requests = requests(&mut o, 6);
        for _ in 0..3 {
            o.submit_frame(&requests).unwrap();
        }
        assert_eq!(device.in_flight(), 3);
        device.clear_journal();
        drop(o);

        let journal = device.journal();
        let first_release = journal.iter().position(is_destruction).unwrap();
        let waits_before = journal[..first_release]
            .iter()
            .filter(|e| matches!(e, JournalEvent::FenceWaited { .. }))
            .count();
        assert_eq!(waits_before, 3);
        assert_eq!(device.in_flight(), 0);
        assert!(!journal
            .iter()
            .any(|e| matches!(e, JournalEvent::FenceDestroyed { pending: true, .. })));
        assert!(device.violations().is_empty(), "{:?}", device.violations());
    }

    #[test]
    fn fatal_error_poisons_the_orchestrator() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut o = orchestrator(&device, FrameConfig::default());
        let requests = requests(&mut o, 2);
        o.submit_frame(&requests).unwrap();
        device.lose_device();

        let err = o.submit_frame(&requests).unwrap_err();
        assert!(matches!(err, FatalError::Presentation(RhiError::DeviceLost)), "{err}");
        assert!(o.is_terminated());
        assert!(matches!(o.submit_frame(&requests), Err(FatalError::Terminated(_))));
        assert!(matches!(o.shutdown(), Err(FatalError::DrainFailed { .. })));
    }

    #[test]
    fn dangling_identity_is_fatal() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut o = orchestrator(&device, FrameConfig::default());
        let requests = requests(&mut o, 2);
        let geometry = requests[0].state.geometry;
        o.registry_mut().remove_geometry(geometry);
        assert_eq!(
            o.submit_frame(&requests).unwrap_err(),
            FatalError::DanglingIdentity { kind: "geometry" }
        );
    }

    #[test]
    fn ui_requests_record_after_opaque() {
        let device = HeadlessDevice::new(HeadlessConfig::default());
        let mut o = orchestrator(&device, FrameConfig::default());
        let mut requests = requests(&mut o, 4);
        requests[0].class = RenderClass::Ui;
        assert_eq!(o.submit_frame(&requests).unwrap(), FrameResult::Presented);
        assert_eq!(o.stats().batches_formed, 4);
    }
}

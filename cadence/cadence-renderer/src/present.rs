//! Presentation controller: owns the presentable image chain.
//!
//! ```text
//! Valid --acquire--> ImageReady --present--> Valid
//! Valid --surface change / stale result--> Invalid --reconstruct--> Valid
//! ```
//!
//! Every chain carries a generation. Images handed out by [`PresentationController::acquire_next`]
//! remember it, and presenting an image from an older generation is a fatal error.

use std::sync::Arc;

use cadence_rhi::{
    Device, PresentMode, ResourceId, RhiError, Semaphore, SurfaceStatus, Swapchain, SwapchainDescriptor,
    TextureFormat,
};

use crate::config::FrameConfig;
use crate::error::{FatalError, StaleReason};
use crate::sync::FrameSynchronizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Valid,
    ImageReady,
    Invalid(StaleReason),
}

impl ChainState {
    fn describe(self) -> &'static str {
        match self {
            ChainState::Valid => "valid",
            ChainState::ImageReady => "holding an acquired image",
            ChainState::Invalid(_) => "invalid",
        }
    }
}

/// One acquired chain image, valid for the chain generation it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentableImage {
    index: u32,
    handle: ResourceId,
    generation: u64,
}

impl PresentableImage {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn handle(&self) -> ResourceId {
        self.handle
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// `suboptimal` images are usable; the chain is rebuilt after they are presented.
    Image { image: PresentableImage, suboptimal: bool },
    Stale(StaleReason),
    /// Acquire timed out.
    NotReady,
    /// The surface has zero area, so there is no chain to acquire from.
    SurfaceUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presented {
    Displayed,
    /// The frame was shown but the chain must be rebuilt before the next acquire.
    Stale(StaleReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconstruction {
    Rebuilt { generation: u64, extent: (u32, u32) },
    AlreadyValid,
    /// Zero-area surface; retried on the next frame.
    Deferred,
}

pub struct PresentationController {
    device: Arc<dyn Device>,
    chain: Option<Box<dyn Swapchain>>,
    generation: u64,
    state: ChainState,
    /// Set by a suboptimal acquire; applied once the image is presented.
    rebuild_after_present: Option<StaleReason>,
    surface_extent: (u32, u32),
    format: TextureFormat,
    present_mode: PresentMode,
    min_image_count: u32,
    acquire_timeout_ns: u64,
    /// Frame slot whose submission last rendered to each image.
    image_owners: Vec<Option<usize>>,
    reconstructions: u64,
}

impl std::fmt::Debug for PresentationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationController")
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("surface_extent", &self.surface_extent)
            .field("present_mode", &self.present_mode)
            .finish_non_exhaustive()
    }
}

impl PresentationController {
    /// Build the controller and its first chain. A zero-area surface defers chain creation.
    pub fn new(
        device: Arc<dyn Device>,
        surface_extent: (u32, u32),
        config: &FrameConfig,
    ) -> Result<Self, FatalError> {
        let supported = device.present_modes();
        let present_mode = config
            .present_mode_preference
            .iter()
            .copied()
            .find(|m| supported.contains(m))
            .unwrap_or(PresentMode::Fifo);
        let mut controller = Self {
            device,
            chain: None,
            generation: 0,
            state: ChainState::Invalid(StaleReason::SurfaceChanged),
            rebuild_after_present: None,
            surface_extent,
            format: config.surface_format,
            present_mode,
            min_image_count: config.min_image_count,
            acquire_timeout_ns: config.fence_timeout_ns(),
            image_owners: Vec::new(),
            reconstructions: 0,
        };
        if has_area(surface_extent) {
            controller.build()?;
        }
        Ok(controller)
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn extent(&self) -> Option<(u32, u32)> {
        self.chain.as_ref().map(|c| c.extent())
    }

    pub fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    pub fn reconstructions(&self) -> u64 {
        self.reconstructions
    }

    pub fn needs_reconstruct(&self) -> bool {
        matches!(self.state, ChainState::Invalid(_))
    }

    /// Windowing reported a new surface extent and possibly a new format.
    pub fn surface_changed(&mut self, extent: (u32, u32), format: Option<TextureFormat>) {
        let format_changed = format.is_some_and(|f| f != self.format);
        if extent == self.surface_extent && !format_changed {
            return;
        }
        log::debug!("surface changed: {:?} -> {:?}", self.surface_extent, extent);
        self.surface_extent = extent;
        if let Some(format) = format {
            self.format = format;
        }
        match self.state {
            ChainState::Valid => self.state = ChainState::Invalid(StaleReason::SurfaceChanged),
            ChainState::ImageReady => self.rebuild_after_present = Some(StaleReason::SurfaceChanged),
            ChainState::Invalid(_) => {}
        }
    }

    /// Acquire the next image, signaling `signal` once it is available.
    pub fn acquire_next(&mut self, signal: &dyn Semaphore) -> Result<Acquired, FatalError> {
        match self.state {
            ChainState::Valid => {}
            ChainState::Invalid(reason) => {
                if self.chain.is_none() && !has_area(self.surface_extent) {
                    return Ok(Acquired::SurfaceUnavailable);
                }
                return Ok(Acquired::Stale(reason));
            }
            ChainState::ImageReady => return Err(self.invalid_transition("acquire")),
        }
        let Some(chain) = self.chain.as_mut() else {
            return Ok(Acquired::SurfaceUnavailable);
        };
        match chain.acquire_next_image(signal, self.acquire_timeout_ns) {
            Ok(acquired) => {
                let suboptimal = acquired.status == SurfaceStatus::Suboptimal;
                if suboptimal {
                    self.rebuild_after_present = Some(StaleReason::Suboptimal);
                }
                self.state = ChainState::ImageReady;
                Ok(Acquired::Image {
                    image: PresentableImage {
                        index: acquired.image_index,
                        handle: acquired.image,
                        generation: self.generation,
                    },
                    suboptimal,
                })
            }
            Err(RhiError::Timeout(_)) => Ok(Acquired::NotReady),
            Err(e) => match stale_reason(&e) {
                Some(reason) => {
                    log::info!("acquire reported a stale chain: {}", reason);
                    self.state = ChainState::Invalid(reason);
                    Ok(Acquired::Stale(reason))
                }
                None => Err(FatalError::Presentation(e)),
            },
        }
    }

    /// Queue `image` for display once `wait` is signaled.
    pub fn present(&mut self, image: PresentableImage, wait: &dyn Semaphore) -> Result<Presented, FatalError> {
        if self.state != ChainState::ImageReady {
            return Err(self.invalid_transition("present"));
        }
        if image.generation != self.generation {
            return Err(FatalError::StaleImageHandle {
                index: image.index,
                image_generation: image.generation,
                current: self.generation,
            });
        }
        let outcome = match self.chain.as_mut() {
            Some(chain) => chain.present(image.index, wait),
            None => return Err(self.invalid_transition("present")),
        };
        let pending = self.rebuild_after_present.take();
        let stale = match outcome {
            Ok(SurfaceStatus::Optimal) => pending,
            Ok(SurfaceStatus::Suboptimal) => Some(StaleReason::Suboptimal),
            Err(e) => match stale_reason(&e) {
                Some(reason) => Some(reason),
                None => {
                    self.state = ChainState::Valid;
                    return Err(FatalError::Presentation(e));
                }
            },
        };
        match stale {
            Some(reason) => {
                self.state = ChainState::Invalid(reason);
                Ok(Presented::Stale(reason))
            }
            None => {
                self.state = ChainState::Valid;
                Ok(Presented::Displayed)
            }
        }
    }

    /// Rebuild the chain at the current surface extent once every in-flight frame completed.
    pub fn reconstruct(&mut self, sync: &mut FrameSynchronizer) -> Result<Reconstruction, FatalError> {
        match self.state {
            ChainState::Valid if self.chain.is_some() => return Ok(Reconstruction::AlreadyValid),
            ChainState::ImageReady => return Err(self.invalid_transition("reconstruct")),
            _ => {}
        }
        if let Some(extent) = self.device.surface_extent() {
            self.surface_extent = extent;
        }
        if !has_area(self.surface_extent) {
            log::debug!("reconstruction deferred: surface is {:?}", self.surface_extent);
            return Ok(Reconstruction::Deferred);
        }
        // Old chain images may still be referenced by queued frames.
        sync.wait_all()?;
        self.build()?;
        self.reconstructions += 1;
        log::info!(
            "presentation chain rebuilt: generation {} at {:?} ({:?})",
            self.generation,
            self.surface_extent,
            self.present_mode
        );
        Ok(Reconstruction::Rebuilt {
            generation: self.generation,
            extent: self.surface_extent,
        })
    }

    pub fn image_owner(&self, index: u32) -> Option<usize> {
        self.image_owners.get(index as usize).copied().flatten()
    }

    pub fn set_image_owner(&mut self, index: u32, slot: usize) {
        if let Some(owner) = self.image_owners.get_mut(index as usize) {
            *owner = Some(slot);
        }
    }

    /// Destroy the chain. Only valid once no queued work references it.
    pub fn release(&mut self) {
        if self.chain.take().is_some() {
            log::debug!("presentation chain released");
        }
        self.state = ChainState::Invalid(StaleReason::SurfaceLost);
    }

    /// Drop the chain without destroying it.
    pub fn leak(&mut self) {
        if let Some(chain) = self.chain.take() {
            log::error!("leaking presentation chain generation {}", self.generation);
            std::mem::forget(chain);
        }
        self.state = ChainState::Invalid(StaleReason::SurfaceLost);
    }

    fn build(&mut self) -> Result<(), FatalError> {
        let desc = SwapchainDescriptor {
            extent: self.surface_extent,
            format: self.format,
            min_image_count: self.min_image_count,
            present_mode: self.present_mode,
        };
        let chain = self
            .device
            .create_swapchain(&desc, self.chain.as_deref())
            .map_err(FatalError::Presentation)?;
        self.image_owners = vec![None; chain.image_count() as usize];
        // The old chain is destroyed here, after the new one took over its surface.
        self.chain = Some(chain);
        self.generation += 1;
        self.state = ChainState::Valid;
        self.rebuild_after_present = None;
        Ok(())
    }

    fn invalid_transition(&self, operation: &'static str) -> FatalError {
        FatalError::InvalidChainTransition {
            operation,
            state: self.state.describe(),
        }
    }
}

fn has_area((width, height): (u32, u32)) -> bool {
    width > 0 && height > 0
}

fn stale_reason(e: &RhiError) -> Option<StaleReason> {
    match e {
        RhiError::OutOfDate => Some(StaleReason::OutOfDate),
        RhiError::SurfaceLost => Some(StaleReason::SurfaceLost),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::CompletionTimeline;
    use cadence_rhi::{HeadlessConfig, HeadlessDevice, JournalEvent, Queue, QueueFlags};
    use std::time::Duration;

    struct Harness {
        device: Arc<HeadlessDevice>,
        queue: Box<dyn Queue>,
        sync: FrameSynchronizer,
        presenter: PresentationController,
    }

    fn harness(extent: (u32, u32)) -> Harness {
        let device = HeadlessDevice::new(HeadlessConfig {
            surface_extent: Some(extent),
            ..HeadlessConfig::default()
        });
        let queue = device.queue(QueueFlags::GRAPHICS).unwrap();
        let sync = FrameSynchronizer::new(device.as_ref(), 2, Duration::from_millis(50), CompletionTimeline::new())
            .unwrap();
        let presenter = PresentationController::new(device.clone(), extent, &FrameConfig::default()).unwrap();
        Harness {
            device,
            queue,
            sync,
            presenter,
        }
    }

    /// One full frame with an empty submission. Returns what present reported.
    fn frame(h: &mut Harness) -> Presented {
        let token = h.sync.begin_frame().unwrap();
        let Acquired::Image { image, .. } = h.presenter.acquire_next(h.sync.acquire_semaphore(&token)).unwrap() else {
            panic!("expected an image");
        };
        h.sync.submit(&token, h.queue.as_ref(), &[]).unwrap();
        h.presenter.present(image, h.sync.release_semaphore(&token)).unwrap()
    }

    #[test]
    fn prefers_mailbox_when_supported() {
        let h = harness((800, 600));
        assert_eq!(h.presenter.present_mode(), PresentMode::Mailbox);
        assert_eq!(h.presenter.generation(), 1);
        assert_eq!(h.presenter.state(), ChainState::Valid);
    }

    #[test]
    fn reconstruct_is_idempotent() {
        let mut h = harness((800, 600));
        assert_eq!(frame(&mut h), Presented::Displayed);
        h.presenter.surface_changed((1024, 768), None);
        h.device.resize_surface(1024, 768);
        let first = h.presenter.reconstruct(&mut h.sync).unwrap();
        assert_eq!(
            first,
            Reconstruction::Rebuilt {
                generation: 2,
                extent: (1024, 768)
            }
        );
        assert_eq!(h.presenter.reconstruct(&mut h.sync).unwrap(), Reconstruction::AlreadyValid);
        assert_eq!(h.presenter.reconstructions(), 1);
        assert_eq!(frame(&mut h), Presented::Displayed);
        assert!(h.device.violations().is_empty());
    }

    #[test]
    fn out_of_date_acquire_invalidates() {
        let mut h = harness((800, 600));
        h.device.inject_acquire_error(RhiError::OutOfDate);
        let token = h.sync.begin_frame().unwrap();
        let acquired = h.presenter.acquire_next(h.sync.acquire_semaphore(&token)).unwrap();
        assert_eq!(acquired, Acquired::Stale(StaleReason::OutOfDate));
        assert!(h.presenter.needs_reconstruct());
    }

    #[test]
    fn suboptimal_acquire_rebuilds_after_present() {
        let mut h = harness((800, 600));
        h.device.inject_acquire_suboptimal();
        assert_eq!(frame(&mut h), Presented::Stale(StaleReason::Suboptimal));
        assert!(h.presenter.needs_reconstruct());
        h.presenter.reconstruct(&mut h.sync).unwrap();
        assert_eq!(frame(&mut h), Presented::Displayed);
    }

    #[test]
    fn image_from_old_generation_is_rejected() {
        let mut h = harness((800, 600));
        let token = h.sync.begin_frame().unwrap();
        let Acquired::Image { image, .. } = h.presenter.acquire_next(h.sync.acquire_semaphore(&token)).unwrap() else {
            panic!("expected an image");
        };
        let forged = PresentableImage {
            generation: image.generation() + 1,
            ..image
        };
        let err = h.presenter.present(forged, h.sync.release_semaphore(&token)).unwrap_err();
        assert!(matches!(err, FatalError::StaleImageHandle { .. }));
    }

    #[test]
    fn double_acquire_is_an_invalid_transition() {
        let mut h = harness((800, 600));
        let token = h.sync.begin_frame().unwrap();
        h.presenter.acquire_next(h.sync.acquire_semaphore(&token)).unwrap();
        let err = h.presenter.acquire_next(h.sync.acquire_semaphore(&token)).unwrap_err();
        assert!(matches!(err, FatalError::InvalidChainTransition { operation: "acquire", .. }));
    }

    #[test]
    fn zero_area_surface_defers_chain() {
        let mut h = harness((0, 0));
        assert_eq!(h.presenter.extent(), None);
        let token = h.sync.begin_frame().unwrap();
        assert_eq!(
            h.presenter.acquire_next(h.sync.acquire_semaphore(&token)).unwrap(),
            Acquired::SurfaceUnavailable
        );
        assert_eq!(h.presenter.reconstruct(&mut h.sync).unwrap(), Reconstruction::Deferred);

        h.device.resize_surface(320, 200);
        h.presenter.surface_changed((320, 200), None);
        assert!(matches!(
            h.presenter.reconstruct(&mut h.sync).unwrap(),
            Reconstruction::Rebuilt { extent: (320, 200), .. }
        ));
        assert!(h
            .device
            .journal()
            .iter()
            .any(|e| matches!(e, JournalEvent::SwapchainCreated { extent: (320, 200), .. })));
    }
}

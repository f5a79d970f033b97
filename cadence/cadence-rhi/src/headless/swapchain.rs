//! Headless swapchain: round-robin images, out-of-date on surface resize or retirement.

use super::{JournalEvent, Shared};
use crate::{
    AcquiredImage, PresentMode, ResourceId, RhiError, RhiResult, Semaphore, SurfaceStatus,
    Swapchain, SwapchainDescriptor, TextureFormat,
};
use std::sync::Arc;

const MAX_IMAGES: u32 = 8;

pub struct HeadlessSwapchain {
    shared: Arc<Shared>,
    id: ResourceId,
    images: Vec<ResourceId>,
    acquired: Vec<bool>,
    next: usize,
    extent: (u32, u32),
    format: TextureFormat,
    present_mode: PresentMode,
}

impl HeadlessSwapchain {
    pub(crate) fn create(
        shared: Arc<Shared>,
        desc: &SwapchainDescriptor,
        present_mode: PresentMode,
    ) -> RhiResult<Self> {
        let mut state = shared.lock();
        state.check_device()?;
        let surface = state.surface_extent().ok_or_else(|| {
            RhiError::Unsupported("swapchain not supported (device created without surface)".to_string())
        })?;
        let (width, height) = desc.extent;
        if width == 0 || height == 0 {
            return Err(RhiError::Backend(format!("swapchain extent {width}x{height} has zero area")));
        }
        if surface != desc.extent {
            // A real surface clamps to its current extent; callers are expected to ask for it.
            log::warn!(
                "headless: swapchain requested at {:?} but surface is {:?}",
                desc.extent,
                surface
            );
        }
        let image_count = desc.min_image_count.clamp(2, MAX_IMAGES);
        let id = state.next_id();
        let images: Vec<ResourceId> = (0..image_count).map(|_| state.next_id()).collect();
        state.set_current_swapchain(Some(id));
        state.record(JournalEvent::SwapchainCreated {
            swapchain: id,
            extent: desc.extent,
            image_count,
        });
        drop(state);
        Ok(Self {
            shared,
            id,
            images,
            acquired: vec![false; image_count as usize],
            next: 0,
            extent: desc.extent,
            format: desc.format,
            present_mode,
        })
    }
}

impl Drop for HeadlessSwapchain {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.current_swapchain() == Some(self.id) {
            state.set_current_swapchain(None);
        }
        state.record(JournalEvent::SwapchainDestroyed { swapchain: self.id });
    }
}

impl std::fmt::Debug for HeadlessSwapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessSwapchain")
            .field("id", &self.id)
            .field("extent", &self.extent)
            .field("image_count", &self.images.len())
            .finish()
    }
}

impl Swapchain for HeadlessSwapchain {
    fn acquire_next_image(
        &mut self,
        signal_semaphore: &dyn Semaphore,
        timeout_ns: u64,
    ) -> RhiResult<AcquiredImage> {
        let mut state = self.shared.lock();
        state.check_device()?;
        if state.current_swapchain() != Some(self.id) {
            return Err(RhiError::OutOfDate);
        }
        let mut status = SurfaceStatus::Optimal;
        match state.take_acquire_fault() {
            Some(Err(e)) => return Err(e),
            Some(Ok(())) => status = SurfaceStatus::Suboptimal,
            None => {}
        }
        if state.surface_extent() != Some(self.extent) {
            return Err(RhiError::OutOfDate);
        }
        let count = self.images.len();
        let index = (0..count)
            .map(|i| (self.next + i) % count)
            .find(|&i| !self.acquired[i])
            .ok_or(RhiError::Timeout(timeout_ns))?;
        self.acquired[index] = true;
        self.next = (index + 1) % count;
        state.signal_semaphore(signal_semaphore.id(), "acquire");
        state.record(JournalEvent::Acquired {
            swapchain: self.id,
            image_index: index as u32,
        });
        Ok(AcquiredImage {
            image_index: index as u32,
            image: self.images[index],
            status,
        })
    }

    fn present(&mut self, image_index: u32, wait_semaphore: &dyn Semaphore) -> RhiResult<SurfaceStatus> {
        let mut state = self.shared.lock();
        state.check_device()?;
        let index = image_index as usize;
        if !self.acquired.get(index).copied().unwrap_or(false) {
            state.violation(format!(
                "present of image {} on swapchain {} that was not acquired",
                image_index, self.id
            ));
            return Err(RhiError::Backend(format!("image {image_index} was not acquired")));
        }
        state.consume_semaphore(wait_semaphore.id(), "present");
        self.acquired[index] = false;
        state.record(JournalEvent::Presented {
            swapchain: self.id,
            image_index,
        });
        match state.take_present_fault() {
            Some(Err(e)) => return Err(e),
            Some(Ok(())) => return Ok(SurfaceStatus::Suboptimal),
            None => {}
        }
        if state.current_swapchain() != Some(self.id) || state.surface_extent() != Some(self.extent) {
            return Err(RhiError::OutOfDate);
        }
        Ok(SurfaceStatus::Optimal)
    }

    fn extent(&self) -> (u32, u32) {
        self.extent
    }

    fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    fn format(&self) -> TextureFormat {
        self.format
    }

    fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

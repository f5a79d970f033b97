//! Cadence RHI: backend-agnostic capability model for frame submission.
//! This crate defines the traits the frame core is written against: queues, command pools,
//! a presentable image chain, and explicit CPU/GPU synchronization (fences, semaphores).

use std::any::Any;
use std::fmt::Debug;

/// Unique identifier for a GPU object.
pub type ResourceId = u64;

bitflags::bitflags! {
    /// Queue capabilities. A command pool is created against one queue affinity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QueueFlags: u32 {
        const GRAPHICS = 1 << 0;
        const COMPUTE = 1 << 1;
        const TRANSFER = 1 << 2;
        const PRESENT = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Command pool creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CommandPoolFlags: u32 {
        /// Buffers are short-lived (re-recorded every frame).
        const TRANSIENT = 1 << 0;
        /// Buffers may be reset individually; without it only whole-pool reuse is allowed.
        const RESET_COMMAND_BUFFER = 1 << 1;
    }
}

/// Errors reported by a backend. Mirrors the result codes of explicit graphics APIs.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RhiError {
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    /// The presentation chain no longer matches the surface.
    #[error("presentation chain is out of date")]
    OutOfDate,
    #[error("surface lost")]
    SurfaceLost,
    #[error("device lost")]
    DeviceLost,
    #[error("timed out after {0} ns")]
    Timeout(u64),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Backend(String),
}

impl RhiError {
    /// True for allocator rejections the caller may recover from by backing off.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, RhiError::OutOfDeviceMemory | RhiError::OutOfHostMemory)
    }
}

pub type RhiResult<T> = Result<T, RhiError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba8UnormSrgb,
    Bgra8UnormSrgb,
    Rgba16Float,
}

/// Presentation mode of a swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentMode {
    /// Vsync queue; always supported.
    #[default]
    Fifo,
    Mailbox,
    Immediate,
}

/// The core device trait that all backends must implement.
pub trait Device: Send + Sync + Debug {
    /// Create a fence for CPU-GPU synchronization. `signaled` creates it already signaled.
    fn create_fence(&self, signaled: bool) -> RhiResult<Box<dyn Fence>>;
    /// Create a semaphore for GPU-GPU synchronization (acquire -> render -> present).
    fn create_semaphore(&self) -> RhiResult<Box<dyn Semaphore>>;

    /// Create a command pool bound to one queue affinity.
    fn create_command_pool(&self, desc: &CommandPoolDescriptor) -> RhiResult<Box<dyn CommandPool>>;

    /// Get a queue with at least the requested capabilities.
    fn queue(&self, flags: QueueFlags) -> RhiResult<Box<dyn Queue>>;

    /// Present modes the surface supports, best first is not implied.
    fn present_modes(&self) -> Vec<PresentMode> {
        vec![PresentMode::Fifo]
    }

    /// Current size of the presentation surface, if the backend can query it.
    fn surface_extent(&self) -> Option<(u32, u32)> {
        None
    }

    /// Create a swapchain for presentation. Returns Err for devices without a surface.
    /// When rebuilding, pass the current swapchain as `old_swapchain` so the backend can reuse
    /// its resources; the old chain stays valid for images already presented but can no longer
    /// acquire.
    fn create_swapchain(
        &self,
        desc: &SwapchainDescriptor,
        old_swapchain: Option<&dyn Swapchain>,
    ) -> RhiResult<Box<dyn Swapchain>> {
        let _ = (desc, old_swapchain);
        Err(RhiError::Unsupported(
            "swapchain not supported (device created without surface)".to_string(),
        ))
    }

    /// Wait for the device to become idle (all submitted work finished).
    fn wait_idle(&self) -> RhiResult<()>;
}

/// Fence: CPU can wait for GPU to complete submitted work.
pub trait Fence: Send + Sync + Debug {
    fn id(&self) -> ResourceId;
    /// Block until signaled or until `timeout_ns` elapses (`RhiError::Timeout`).
    fn wait(&self, timeout_ns: u64) -> RhiResult<()>;
    /// Return to the unsignaled state. Must not be called while a pending submission will signal it.
    fn reset(&self) -> RhiResult<()>;
    fn is_signaled(&self) -> RhiResult<bool>;
    fn as_any(&self) -> &dyn Any;
}

/// Semaphore: GPU-GPU synchronization between acquire, submission and present.
pub trait Semaphore: Send + Sync + Debug {
    fn id(&self) -> ResourceId;
    fn as_any(&self) -> &dyn Any;
}

/// Queue for submitting work. Supports non-blocking submit with semaphores and fence.
/// The caller must keep command buffers alive and unreset until `signal_fence` has been waited on.
/// An empty `command_buffers` slice is valid and only performs the semaphore/fence operations.
pub trait Queue: Send + Sync + Debug {
    fn flags(&self) -> QueueFlags;
    fn submit(
        &self,
        command_buffers: &[&dyn CommandBuffer],
        wait_semaphores: &[&dyn Semaphore],
        signal_semaphores: &[&dyn Semaphore],
        signal_fence: Option<&dyn Fence>,
    ) -> RhiResult<()>;
}

#[derive(Debug, Clone)]
pub struct CommandPoolDescriptor {
    pub label: Option<&'static str>,
    pub queue_flags: QueueFlags,
    pub flags: CommandPoolFlags,
}

impl Default for CommandPoolDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            queue_flags: QueueFlags::GRAPHICS,
            flags: CommandPoolFlags::RESET_COMMAND_BUFFER,
        }
    }
}

/// Backing allocator for command buffers. Not `Sync`: a pool belongs to one thread of control.
pub trait CommandPool: Send + Debug {
    fn flags(&self) -> CommandPoolFlags;
    /// Allocate `count` buffers in the initial state. All-or-nothing.
    fn allocate(&mut self, count: u32) -> RhiResult<Vec<Box<dyn CommandBuffer>>>;
    /// Return buffers to the pool. Buffers must not be referenced by pending work.
    fn free(&mut self, buffers: Vec<Box<dyn CommandBuffer>>);
    /// Release unused backing memory. Advisory.
    fn trim(&mut self);
}

/// Bind points a command buffer tracks. `Image` is slot-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindPoint {
    RenderTarget,
    Program,
    Geometry,
    Image(u32),
}

/// A recordable command sequence.
pub trait CommandBuffer: Send + Debug {
    fn id(&self) -> ResourceId;
    fn begin(&mut self) -> RhiResult<()>;
    fn end(&mut self) -> RhiResult<()>;
    /// Return to the initial state. Requires `CommandPoolFlags::RESET_COMMAND_BUFFER`.
    fn reset(&mut self) -> RhiResult<()>;

    fn set_render_target(&mut self, target: Option<ResourceId>);
    fn set_program(&mut self, program: Option<ResourceId>);
    fn set_geometry(&mut self, geometry: Option<ResourceId>);
    fn set_image(&mut self, slot: u32, image: Option<ResourceId>);

    fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32);
    fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );

    /// Query what is currently bound at `point`. Intended for validation, not for state tracking.
    fn bound(&self, point: BindPoint) -> Option<ResourceId>;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone)]
pub struct SwapchainDescriptor {
    pub extent: (u32, u32),
    pub format: TextureFormat,
    pub min_image_count: u32,
    pub present_mode: PresentMode,
}

/// Whether the chain still matches the surface exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    Optimal,
    /// Usable, but the surface properties no longer match; rebuild soon.
    Suboptimal,
}

/// One swapchain image available for rendering this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub image_index: u32,
    pub image: ResourceId,
    pub status: SurfaceStatus,
}

/// Swapchain for presenting to a window. Acquire an image, render to it, then present.
pub trait Swapchain: Send + Sync + Debug {
    /// Acquire the next image. `signal_semaphore` is signaled when the image is available.
    /// On `Err` the semaphore is left untouched.
    fn acquire_next_image(
        &mut self,
        signal_semaphore: &dyn Semaphore,
        timeout_ns: u64,
    ) -> RhiResult<AcquiredImage>;
    /// Present the image. `wait_semaphore` should be signaled when rendering to it is done.
    fn present(&mut self, image_index: u32, wait_semaphore: &dyn Semaphore) -> RhiResult<SurfaceStatus>;
    /// Current extent (width, height).
    fn extent(&self) -> (u32, u32);
    fn image_count(&self) -> u32;
    fn format(&self) -> TextureFormat;
    fn present_mode(&self) -> PresentMode;
    fn as_any(&self) -> &dyn Any;
}

#[cfg(feature = "headless")]
pub mod headless;

#[cfg(feature = "headless")]
pub use headless::{HeadlessConfig, HeadlessDevice, JournalEvent};

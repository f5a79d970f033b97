//! Cadence Renderer: the per-frame core.
//! Decides what GPU state to bind and when, and owns the lifetime of per-frame resources:
//! command contexts, the presentation chain and the frame-in-flight ring.

pub mod config;
pub mod error;
pub mod hasher;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod present;
pub mod recorder;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod stats;
pub mod sync;

pub use config::FrameConfig;
pub use error::{ConfigError, Exhaustion, FatalError, PoolError, SkipReason, StaleReason};
pub use hasher::{fingerprint, fingerprint_live, LiveState, StateSampler};
pub use orchestrator::{FrameOrchestrator, FrameResult};
pub use pool::{CommandContextPool, ContextId, ContextKind, ContextState};
pub use present::{PresentableImage, PresentationController};
pub use registry::{GeometryId, ImageId, ProgramId, ResourceRegistry, TargetId};
pub use scheduler::{BatchScheduler, DrawBatch, ScheduleStats};
pub use state::{DrawCall, RenderClass, RenderRequest, RenderState, MAX_IMAGE_SLOTS};
pub use stats::FrameStats;
pub use sync::{CompletionTimeline, FrameSynchronizer, SubmissionSerial};

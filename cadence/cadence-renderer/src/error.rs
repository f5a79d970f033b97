//! Error taxonomy of the frame core.
//!
//! Recoverable conditions (stale chain, exhausted pools) are folded into
//! [`FrameResult`](crate::FrameResult) by the orchestrator. Everything in [`FatalError`] is a
//! programming defect or a lost device and ends the rendering session.

use std::time::Duration;

use cadence_rhi::RhiError;

use crate::pool::{ContextId, ContextState};

/// Why a command context request could not be served.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Exhaustion {
    #[error("{requested} requested with {live} of {ceiling} contexts live")]
    Ceiling {
        requested: usize,
        live: usize,
        ceiling: usize,
    },
    #[error("device allocator refused: {0}")]
    Device(RhiError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("command contexts exhausted: {0}")]
    ResourceExhausted(Exhaustion),
    #[error("context {context:?} is {state:?}: {reason}")]
    InvalidState {
        context: ContextId,
        state: ContextState,
        reason: String,
    },
    #[error("unknown command context {0:?}")]
    UnknownContext(ContextId),
    #[error("device error: {0}")]
    Device(#[from] RhiError),
}

impl PoolError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, PoolError::ResourceExhausted(_))
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("frames_in_flight must be in 1..={max}, got {got}")]
    FramesInFlight { got: usize, max: usize },
    #[error("max_contexts ({max_contexts}) must cover frames_in_flight ({frames_in_flight})")]
    ContextCeiling {
        max_contexts: usize,
        frames_in_flight: usize,
    },
    #[error("fence timeout must be non-zero")]
    FenceTimeout,
    #[error("invalid value {value:?} for {key}")]
    Env { key: &'static str, value: String },
}

/// Why the presentation chain no longer matches the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaleReason {
    OutOfDate,
    /// Still presentable but no longer an exact match.
    Suboptimal,
    /// Windowing reported a new extent or format.
    SurfaceChanged,
    SurfaceLost,
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            StaleReason::OutOfDate => "out of date",
            StaleReason::Suboptimal => "suboptimal",
            StaleReason::SurfaceChanged => "surface changed",
            StaleReason::SurfaceLost => "surface lost",
        };
        f.write_str(text)
    }
}

/// Why a frame was skipped. Skips are recoverable; the next frame proceeds normally.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    #[error("presentation chain stale ({0})")]
    Stale(StaleReason),
    #[error("resources exhausted: {0}")]
    ResourceExhausted(Exhaustion),
    #[error("surface has zero area")]
    SurfaceUnavailable,
    #[error("no chain image became available")]
    ImageNotReady,
}

/// Conditions that terminate the frame loop.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("fence of frame slot {slot} did not signal within {timeout:?}")]
    FenceTimeout { slot: usize, timeout: Duration },
    #[error("synchronization object of frame slot {slot} failed: {source}")]
    Sync { slot: usize, source: RhiError },
    #[error("failed to create frame resources: {0}")]
    Setup(RhiError),
    #[error("queue submission failed: {0}")]
    Submission(RhiError),
    #[error("presentation failed: {0}")]
    Presentation(RhiError),
    #[error("command context pool invariant violated: {0}")]
    Pool(PoolError),
    #[error("render state refers to an unregistered {kind}")]
    DanglingIdentity { kind: &'static str },
    #[error("live bound state {live:#018x} diverged from applied state {expected:#018x}")]
    StateDivergence { expected: u64, live: u64 },
    #[error("image {index} is from chain generation {image_generation}, current is {current}")]
    StaleImageHandle {
        index: u32,
        image_generation: u64,
        current: u64,
    },
    #[error("presentation chain cannot {operation} while {state}")]
    InvalidChainTransition {
        operation: &'static str,
        state: &'static str,
    },
    #[error("ring drain at shutdown failed on slot {slot}: {source}")]
    DrainFailed { slot: usize, source: RhiError },
    #[error("rendering session already terminated: {0}")]
    Terminated(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

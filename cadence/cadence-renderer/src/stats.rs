//! Read-only statistics snapshot for observability tooling.

use crate::pool::PoolStats;
use crate::sync::SyncStats;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_submitted: u64,
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub frames_skipped_stale: u64,
    pub frames_skipped_exhausted: u64,
    /// No chain image became available within the acquire timeout.
    pub frames_skipped_not_ready: u64,
    /// Surface had zero area.
    pub frames_skipped_unavailable: u64,
    pub batches_formed: u64,
    pub state_transitions_avoided: u64,
    pub requests_recorded: u64,
    pub binds_issued: u64,
    pub reconstructions: u64,
    pub pool: PoolStats,
    pub sync: SyncStats,
}

impl std::fmt::Display for FrameStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "frames: {} submitted, {} presented, {} skipped ({} stale, {} exhausted, {} not ready, {} no surface)",
            self.frames_submitted,
            self.frames_presented,
            self.frames_skipped,
            self.frames_skipped_stale,
            self.frames_skipped_exhausted,
            self.frames_skipped_not_ready,
            self.frames_skipped_unavailable
        )?;
        writeln!(
            f,
            "batching: {} requests in {} batches, {} transitions avoided, {} binds",
            self.requests_recorded, self.batches_formed, self.state_transitions_avoided, self.binds_issued
        )?;
        writeln!(
            f,
            "contexts: {} live, {} allocated, {} resets, {} exhaustions, {} trims",
            self.pool.live, self.pool.allocations, self.pool.resets, self.pool.exhaustions, self.pool.trims
        )?;
        write!(
            f,
            "sync: {} fence waits, {} in flight (max {}), {} reconstructions",
            self.sync.fence_waits, self.sync.in_flight, self.sync.max_in_flight, self.reconstructions
        )
    }
}

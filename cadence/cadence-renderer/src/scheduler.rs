//! Batch scheduling: order a frame's requests so that equal states end up adjacent.
//!
//! Requests are stably sorted by class (opaque, transparent, UI). Opaque requests are then
//! ordered by target, program, geometry and image set. Transparent and UI requests keep their
//! submission order, since blending depends on it. Adjacent requests with equal class and state
//! become one [`DrawBatch`].

use crate::hasher::fingerprint;
use crate::state::{DrawCall, RenderClass, RenderRequest, RenderState, MAX_IMAGE_SLOTS};

/// Draws sharing one state, in recording order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawBatch {
    pub state: RenderState,
    pub fingerprint: u64,
    pub class: RenderClass,
    pub draws: Vec<DrawCall>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub requests: usize,
    pub batches: usize,
    /// State runs if the requests were recorded in submission order.
    pub input_runs: usize,
    pub transitions_avoided: usize,
}

/// Scheduled output of one frame.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    pub batches: Vec<DrawBatch>,
    pub stats: ScheduleStats,
}

type SortKey = (RenderClass, (u64, u64, u64, [u64; MAX_IMAGE_SLOTS]));

#[derive(Debug, Default)]
pub struct BatchScheduler {
    keyed: Vec<(SortKey, usize, u64)>,
}

impl BatchScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, requests: &[RenderRequest]) -> Schedule {
        let input_runs = count_runs(requests);

        // Scratch is kept across frames to avoid reallocating.
        self.keyed.clear();
        self.keyed.extend(requests.iter().enumerate().map(|(index, request)| {
            let state_key = if request.class.reorderable() {
                request.state.sort_key()
            } else {
                Default::default()
            };
            ((request.class, state_key), index, fingerprint(&request.state))
        }));
        // sort_by is stable: ties keep submission order.
        self.keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let mut batches: Vec<DrawBatch> = Vec::new();
        for &(_, index, fp) in &self.keyed {
            let request = &requests[index];
            match batches.last_mut() {
                Some(last)
                    if last.class == request.class
                        && last.fingerprint == fp
                        && last.state == request.state =>
                {
                    last.draws.push(request.draw);
                }
                _ => batches.push(DrawBatch {
                    state: request.state,
                    fingerprint: fp,
                    class: request.class,
                    draws: vec![request.draw],
                }),
            }
        }

        let stats = ScheduleStats {
            requests: requests.len(),
            batches: batches.len(),
            input_runs,
            transitions_avoided: input_runs.saturating_sub(batches.len()),
        };
        log::trace!(
            "scheduled {} requests into {} batches ({} transitions avoided)",
            stats.requests,
            stats.batches,
            stats.transitions_avoided
        );
        Schedule { batches, stats }
    }
}

fn count_runs(requests: &[RenderRequest]) -> usize {
    let mut runs = 0;
    let mut previous: Option<(RenderClass, &RenderState)> = None;
    for request in requests {
        if previous != Some((request.class, &request.state)) {
            runs += 1;
        }
        previous = Some((request.class, &request.state));
    }
    runs
}

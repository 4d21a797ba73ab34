//! Batch controller: how many pending jobs may be promoted right now.

use serde::Serialize;

/// Snapshot of the counts the controller decides on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub processing: usize,
    pub pending: usize,
}

/// What a single promotion cycle should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    /// Promote up to this many pending jobs.
    Promote(usize),
    /// Every slot is busy; wait for one to free up.
    Saturated,
    /// Nothing pending and nothing running.
    Idle,
    /// Work is in flight but nothing is waiting.
    Draining,
}

#[derive(Debug, Clone)]
pub struct BatchController {
    max_concurrent_jobs: usize,
    idle: bool,
}

impl BatchController {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            idle: true,
        }
    }

    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    /// Decide the next cycle from the current counts.
    pub fn plan(&self, counts: BatchCounts) -> BatchDecision {
        match (counts.processing, counts.pending) {
            (0, 0) => BatchDecision::Idle,
            (_, 0) => BatchDecision::Draining,
            (processing, pending) if processing < self.max_concurrent_jobs => {
                BatchDecision::Promote((self.max_concurrent_jobs - processing).min(pending))
            }
            _ => BatchDecision::Saturated,
        }
    }

    /// Record the latest counts. Returns true exactly when the queue has
    /// just become idle, so the idle signal fires once per drain.
    pub fn observe(&mut self, counts: BatchCounts) -> bool {
        let idle = counts.processing == 0 && counts.pending == 0;
        let became_idle = idle && !self.idle;
        self.idle = idle;
        became_idle
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }
}

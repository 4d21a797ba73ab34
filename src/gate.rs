//! Rate/concurrency gate.
//!
//! Tracks which jobs currently hold a dispatch slot and whether the engine
//! asked the whole pipeline to back off. A rate limit suspends dispatch even
//! when slots are free.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;

use crate::state_machine::JobId;

#[derive(Debug)]
pub struct RateGate {
    active: HashSet<JobId>,
    max_concurrent: usize,
    rate_limit_until: Option<Instant>,
    default_delay: Duration,
}

impl RateGate {
    pub fn new(max_concurrent: usize, default_delay: Duration) -> Self {
        Self {
            active: HashSet::new(),
            max_concurrent: max_concurrent.max(1),
            rate_limit_until: None,
            default_delay,
        }
    }

    pub fn can_dispatch(&self, now: Instant) -> bool {
        self.active.len() < self.max_concurrent && !self.is_rate_limited(now)
    }

    pub fn is_rate_limited(&self, now: Instant) -> bool {
        self.rate_limit_until.is_some_and(|until| now < until)
    }

    /// Deadline of the current cooldown, if one is still running.
    pub fn rate_limited_until(&self, now: Instant) -> Option<Instant> {
        self.rate_limit_until.filter(|until| now < *until)
    }

    /// Start (or extend) a pipeline-wide cooldown. Never shortens a running one.
    /// Returns the deadline now in force.
    pub fn rate_limit(&mut self, now: Instant, retry_after: Option<Duration>) -> Instant {
        let candidate = now + retry_after.unwrap_or(self.default_delay);
        let deadline = match self.rate_limit_until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        };
        self.rate_limit_until = Some(deadline);
        deadline
    }

    /// Take a slot for `job_id`. Returns false when the job already holds one.
    pub fn acquire(&mut self, job_id: &str) -> bool {
        self.active.insert(job_id.to_string())
    }

    /// Free the slot held by `job_id`. Returns false when it held none, so a
    /// slot is released exactly once however many paths reach here.
    pub fn release(&mut self, job_id: &str) -> bool {
        self.active.remove(job_id)
    }

    pub fn rebind(&mut self, old: &str, new: &str) {
        if self.active.remove(old) {
            self.active.insert(new.to_string());
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_bound_dispatch() {
        let now = Instant::now();
        let mut gate = RateGate::new(2, Duration::from_secs(1));
        assert!(gate.can_dispatch(now));
        assert!(gate.acquire("a"));
        assert!(gate.acquire("b"));
        assert!(!gate.can_dispatch(now));
        assert_eq!(gate.active_count(), 2);

        assert!(gate.release("a"));
        assert!(gate.can_dispatch(now));
    }

    #[test]
    fn release_is_idempotent() {
        let mut gate = RateGate::new(1, Duration::from_secs(1));
        gate.acquire("a");
        assert!(gate.release("a"));
        assert!(!gate.release("a"));
        assert_eq!(gate.active_count(), 0);
    }

    #[test]
    fn double_acquire_holds_one_slot() {
        let mut gate = RateGate::new(3, Duration::from_secs(1));
        assert!(gate.acquire("a"));
        assert!(!gate.acquire("a"));
        assert_eq!(gate.active_count(), 1);
    }

    #[test]
    fn rate_limit_blocks_even_with_free_slots() {
        let now = Instant::now();
        let mut gate = RateGate::new(4, Duration::from_secs(1));
        let deadline = gate.rate_limit(now, Some(Duration::from_millis(2000)));
        assert_eq!(deadline, now + Duration::from_millis(2000));
        assert!(!gate.can_dispatch(now));
        assert!(!gate.can_dispatch(now + Duration::from_millis(1999)));
        assert!(gate.can_dispatch(now + Duration::from_millis(2000)));
        assert!(gate.rate_limited_until(now + Duration::from_millis(2500)).is_none());
    }

    #[test]
    fn rate_limit_uses_default_delay() {
        let now = Instant::now();
        let mut gate = RateGate::new(1, Duration::from_millis(750));
        let deadline = gate.rate_limit(now, None);
        assert_eq!(deadline, now + Duration::from_millis(750));
    }

    #[test]
    fn rate_limit_never_shortens_cooldown() {
        let now = Instant::now();
        let mut gate = RateGate::new(1, Duration::from_secs(1));
        gate.rate_limit(now, Some(Duration::from_secs(5)));
        let deadline = gate.rate_limit(now, Some(Duration::from_secs(1)));
        assert_eq!(deadline, now + Duration::from_secs(5));
    }

    #[test]
    fn rebind_moves_slot() {
        let mut gate = RateGate::new(2, Duration::from_secs(1));
        gate.acquire("local");
        gate.rebind("local", "remote");
        assert_eq!(gate.active_count(), 1);
        assert!(!gate.release("local"));
        assert!(gate.release("remote"));
    }
}

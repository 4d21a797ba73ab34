//! Folds inbound engine events into job state.
//!
//! The transport is independent of local actions, so frames routinely arrive
//! for jobs that were paused, cancelled or already finished. Such frames are
//! discarded with a reason, never raised as errors.

use serde::Serialize;
use tokio::time::Instant;

use crate::cache::ResultCache;
use crate::error::ErrorKind;
use crate::events::GenerationEvent;
use crate::state_machine::{GenerationResult, JobError, JobStatus, Mutation, Transition};
use crate::store::JobStore;

/// Why an event left the store untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnknownJob,
    /// The id belonged to an earlier attempt of a job that was dispatched again.
    RetiredId,
    /// Progress lower than what is already stored.
    StaleProgress,
    /// The event is not legal in the job's current status (duplicates land here).
    IllegalState(JobStatus),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReconcileOutcome {
    Applied(Transition),
    Ignored(IgnoreReason),
}

impl ReconcileOutcome {
    pub fn transition(&self) -> Option<Transition> {
        match self {
            ReconcileOutcome::Applied(t) => Some(*t),
            ReconcileOutcome::Ignored(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilerStats {
    pub applied: u64,
    pub ignored: u64,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    stats: ReconcilerStats,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. A completion also stores its result in `cache` under
    /// the job's parameter fingerprint, but only when the completion itself
    /// was applied, so duplicates never insert twice.
    pub fn reconcile(
        &mut self,
        store: &mut JobStore,
        cache: &mut ResultCache<GenerationResult>,
        event: GenerationEvent,
        now: Instant,
    ) -> ReconcileOutcome {
        let job_id = event.job_id().to_string();
        let kind = event.kind();

        let Some(current) = store.get(&job_id).map(|job| job.status) else {
            let reason = if store.is_retired(&job_id) {
                IgnoreReason::RetiredId
            } else {
                IgnoreReason::UnknownJob
            };
            return self.ignore(&job_id, kind, reason);
        };

        let (mutation, completed_result) = match event {
            GenerationEvent::Progress {
                progress,
                step,
                total_steps,
                eta,
                ..
            } => (
                Mutation::Progress {
                    progress,
                    step,
                    total_steps,
                    eta_ms: eta,
                },
                None,
            ),
            GenerationEvent::Completed { result, .. } => {
                (Mutation::Complete(result.clone()), Some(result))
            }
            GenerationEvent::Failed { error, .. } => (
                Mutation::Fail(JobError::new(ErrorKind::Unknown, error)),
                None,
            ),
        };

        let transition = match store.apply(&job_id, mutation, now) {
            Ok(t) => t,
            Err(_) => return self.ignore(&job_id, kind, IgnoreReason::UnknownJob),
        };

        if let Transition::Ignored { status } = transition {
            let reason = if kind == "progress" && status == JobStatus::Processing {
                IgnoreReason::StaleProgress
            } else {
                IgnoreReason::IllegalState(current)
            };
            return self.ignore(&job_id, kind, reason);
        }

        if let Some(result) = completed_result
            && let Some(job) = store.get(&job_id)
        {
            cache.set(job.fingerprint.clone(), result, None, now);
        }

        self.stats.applied += 1;
        ReconcileOutcome::Applied(transition)
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats
    }

    fn ignore(&mut self, job_id: &str, kind: &str, reason: IgnoreReason) -> ReconcileOutcome {
        self.stats.ignored += 1;
        tracing::debug!(job_id, event = kind, ?reason, "discarding event");
        ReconcileOutcome::Ignored(reason)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::params::GenerationParams;
    use crate::state_machine::{Job, RetryConfig};

    struct Fixture {
        store: JobStore,
        cache: ResultCache<GenerationResult>,
        reconciler: Reconciler,
        job_id: String,
    }

    fn fixture() -> Fixture {
        let mut store = JobStore::new(100);
        let job_id = store.insert(Job::new(
            GenerationParams::new("a quiet harbour"),
            0,
            RetryConfig::default(),
        ));
        store
            .apply(&job_id, Mutation::Dispatch, Instant::now())
            .unwrap();
        Fixture {
            store,
            cache: ResultCache::new(10, Duration::from_secs(60)),
            reconciler: Reconciler::new(),
            job_id,
        }
    }

    impl Fixture {
        fn send(&mut self, event: GenerationEvent) -> ReconcileOutcome {
            self.reconciler
                .reconcile(&mut self.store, &mut self.cache, event, Instant::now())
        }

        fn progress(&mut self, value: f32) -> ReconcileOutcome {
            self.send(GenerationEvent::Progress {
                job_id: self.job_id.clone(),
                progress: value,
                step: None,
                total_steps: Some(20),
                eta: None,
            })
        }

        fn completed(&mut self) -> ReconcileOutcome {
            self.send(GenerationEvent::Completed {
                job_id: self.job_id.clone(),
                result: GenerationResult {
                    image: Some("img".into()),
                    ..Default::default()
                },
            })
        }

        fn job(&self) -> &Job {
            self.store.get(&self.job_id).unwrap()
        }
    }

    #[test]
    fn progress_keeps_maximum() {
        let mut f = fixture();
        for value in [10.0, 25.0, 25.0, 60.0] {
            assert!(matches!(f.progress(value), ReconcileOutcome::Applied(_)));
        }
        assert_eq!(
            f.progress(40.0),
            ReconcileOutcome::Ignored(IgnoreReason::StaleProgress)
        );
        assert_eq!(f.job().progress, 60.0);
        assert_eq!(f.job().total_steps, Some(20));
    }

    #[test]
    fn duplicate_completion_is_noop_and_caches_once() {
        let mut f = fixture();
        let outcome = f.completed();
        assert!(outcome.transition().unwrap().left_processing());
        assert_eq!(f.job().status, JobStatus::Completed);
        assert_eq!(f.job().progress, 100.0);
        assert_eq!(f.cache.len(), 1);

        // Empty the cache so any second insert would be visible.
        f.cache.invalidate(None);
        assert_eq!(
            f.completed(),
            ReconcileOutcome::Ignored(IgnoreReason::IllegalState(JobStatus::Completed))
        );
        assert!(f.cache.is_empty());
    }

    #[test]
    fn failure_records_error_and_is_idempotent() {
        let mut f = fixture();
        let failed = GenerationEvent::Failed {
            job_id: f.job_id.clone(),
            error: "CUDA out of memory".into(),
        };
        assert!(matches!(f.send(failed.clone()), ReconcileOutcome::Applied(_)));
        let error = f.job().error.clone().unwrap();
        assert_eq!(error.message, "CUDA out of memory");
        assert!(f.job().completed_at.is_some());
        let completed_at = f.job().completed_at;

        assert!(matches!(f.send(failed), ReconcileOutcome::Ignored(_)));
        assert_eq!(f.job().completed_at, completed_at);
        assert!(f.cache.is_empty());
    }

    #[test]
    fn events_after_cancel_are_discarded() {
        let mut f = fixture();
        let id = f.job_id.clone();
        f.store.apply(&id, Mutation::Cancel, Instant::now()).unwrap();

        assert_eq!(
            f.progress(90.0),
            ReconcileOutcome::Ignored(IgnoreReason::IllegalState(JobStatus::Cancelled))
        );
        assert!(matches!(f.completed(), ReconcileOutcome::Ignored(_)));
        assert_eq!(f.job().status, JobStatus::Cancelled);
        assert!(f.job().result.is_none());
    }

    #[test]
    fn progress_for_paused_job_is_discarded() {
        let mut f = fixture();
        let id = f.job_id.clone();
        f.store.apply(&id, Mutation::Pause, Instant::now()).unwrap();
        assert_eq!(
            f.progress(30.0),
            ReconcileOutcome::Ignored(IgnoreReason::IllegalState(JobStatus::Paused))
        );
    }

    #[test]
    fn unknown_job_is_discarded() {
        let mut f = fixture();
        let outcome = f.send(GenerationEvent::Failed {
            job_id: "never-seen".into(),
            error: "x".into(),
        });
        assert_eq!(outcome, ReconcileOutcome::Ignored(IgnoreReason::UnknownJob));
        assert_eq!(f.reconciler.stats().ignored, 1);
    }

    #[test]
    fn frames_for_previous_attempt_are_discarded() {
        let mut f = fixture();
        let now = Instant::now();
        let local = f.job_id.clone();
        f.store.rebind(&local, "engine-1").unwrap();
        f.job_id = "engine-1".into();
        f.send(GenerationEvent::Failed {
            job_id: "engine-1".into(),
            error: "worker lost".into(),
        });

        f.store.apply(&local, Mutation::Retry, now).unwrap();
        f.store.retire_engine_id(&local).unwrap();
        f.store.apply(&local, Mutation::Dispatch, now).unwrap();
        f.store.rebind(&local, "engine-2").unwrap();

        let redelivered = f.send(GenerationEvent::Failed {
            job_id: "engine-1".into(),
            error: "worker lost".into(),
        });
        assert_eq!(redelivered, ReconcileOutcome::Ignored(IgnoreReason::RetiredId));
        f.job_id = "engine-2".into();
        assert_eq!(f.job().status, JobStatus::Processing);
        assert_eq!(f.job().retry_count, 1);
    }

    #[test]
    fn completion_is_cached_under_fingerprint() {
        let mut f = fixture();
        f.completed();
        let fingerprint = f.job().fingerprint.clone();
        let cached = f.cache.get(&fingerprint, Instant::now()).unwrap();
        assert_eq!(cached.image.as_deref(), Some("img"));
    }
}

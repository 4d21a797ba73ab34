use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::job::{GenerationResult, Job, JobError};

/// Lifecycle status of a job.
///
/// `pending → processing → {completed | failed | cancelled}`, with the side
/// loops `processing → paused → pending` and `failed → pending` (retry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl JobStatus {
    /// `completed` and `cancelled` never change again. `failed` can be retried.
    pub fn is_absorbing(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Processing => write!(f, "PROCESSING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
            JobStatus::Paused => write!(f, "PAUSED"),
        }
    }
}

/// A requested change to a single job.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Promote a pending job to processing.
    Dispatch,
    Progress {
        progress: f32,
        step: Option<u32>,
        total_steps: Option<u32>,
        eta_ms: Option<u64>,
    },
    Complete(GenerationResult),
    /// Finish a pending job straight from the result cache.
    CompleteFromCache(GenerationResult),
    Fail(JobError),
    Cancel,
    Pause,
    Resume,
    Retry,
    /// The submission was rate limited; hand the job back to the queue.
    Requeue,
    SetPriority(i32),
    /// The engine accepted the job and estimated its duration.
    Estimate(Option<u64>),
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Dispatch => "dispatch",
            Mutation::Progress { .. } => "progress",
            Mutation::Complete(_) => "complete",
            Mutation::CompleteFromCache(_) => "complete_from_cache",
            Mutation::Fail(_) => "fail",
            Mutation::Cancel => "cancel",
            Mutation::Pause => "pause",
            Mutation::Resume => "resume",
            Mutation::Retry => "retry",
            Mutation::Requeue => "requeue",
            Mutation::SetPriority(_) => "set_priority",
            Mutation::Estimate(_) => "estimate",
        }
    }
}

/// The result of applying a [`Mutation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    /// The job moved between statuses.
    Moved { from: JobStatus, to: JobStatus },
    /// Fields changed but the status did not (progress, priority).
    Updated,
    /// The mutation is not legal in the job's current status; nothing changed.
    Ignored { status: JobStatus },
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        !matches!(self, Transition::Ignored { .. })
    }

    /// True when the job left `processing`, which is when its dispatch slot frees up.
    pub fn left_processing(&self) -> bool {
        matches!(
            self,
            Transition::Moved {
                from: JobStatus::Processing,
                to,
            } if *to != JobStatus::Processing
        )
    }
}

/// Applies mutations to a `Job` according to the lifecycle rules.
pub struct StateMachine;

impl StateMachine {
    /// Apply `mutation` to `job` at time `now`.
    ///
    /// Illegal mutations return [`Transition::Ignored`] and leave the job
    /// untouched, so stale or duplicate events are harmless.
    pub fn apply(job: &mut Job, mutation: Mutation, now: Instant) -> Transition {
        use JobStatus::*;

        let from = job.status;
        let ignored = Transition::Ignored { status: from };

        match (from, mutation) {
            (Pending, Mutation::Dispatch) => {
                job.status = Processing;
                if job.started_at.is_none() {
                    job.started_at = Some(Utc::now());
                }
                job.started_instant = Some(now);
                job.elapsed_ms = Some(0);
            }
            (
                Processing,
                Mutation::Progress {
                    progress,
                    step,
                    total_steps,
                    eta_ms,
                },
            ) => {
                if !progress.is_finite() {
                    return ignored;
                }
                let progress = progress.clamp(0.0, 100.0);
                if progress < job.progress {
                    return ignored;
                }
                job.progress = progress;
                job.step = step.or(job.step);
                job.total_steps = total_steps.or(job.total_steps);
                job.eta_ms = eta_ms;
                job.elapsed_ms = job
                    .started_instant
                    .map(|started| now.saturating_duration_since(started).as_millis() as u64);
                return Transition::Updated;
            }
            (Processing, Mutation::Complete(result)) => {
                Self::finish(job, now);
                job.status = Completed;
                job.progress = 100.0;
                job.eta_ms = Some(0);
                job.result = Some(result);
            }
            (Pending, Mutation::CompleteFromCache(result)) => {
                Self::finish(job, now);
                job.status = Completed;
                job.progress = 100.0;
                job.result = Some(result);
                job.from_cache = true;
            }
            (Processing, Mutation::Fail(error)) => {
                Self::finish(job, now);
                job.status = Failed;
                job.error = Some(error);
                job.eta_ms = None;
            }
            (Pending | Processing | Paused, Mutation::Cancel) => {
                Self::finish(job, now);
                job.status = Cancelled;
                job.eta_ms = None;
            }
            (Processing, Mutation::Pause) => {
                job.status = Paused;
                job.eta_ms = None;
            }
            (Paused, Mutation::Resume) => {
                job.status = Pending;
                job.progress = 0.0;
                job.step = None;
            }
            (Failed, Mutation::Retry) if job.can_retry() => {
                job.status = Pending;
                job.retry_count += 1;
                job.progress = 0.0;
                job.step = None;
                job.error = None;
                job.completed_at = None;
            }
            (Processing, Mutation::Requeue) => {
                job.status = Pending;
                job.eta_ms = None;
            }
            (Pending | Paused, Mutation::SetPriority(priority)) => {
                job.priority = priority;
                return Transition::Updated;
            }
            (Processing, Mutation::Estimate(eta_ms)) => {
                job.eta_ms = eta_ms;
                return Transition::Updated;
            }
            _ => return ignored,
        }

        Transition::Moved {
            from,
            to: job.status,
        }
    }

    fn finish(job: &mut Job, now: Instant) {
        job.completed_at = Some(Utc::now());
        if let Some(started) = job.started_instant {
            job.elapsed_ms = Some(now.saturating_duration_since(started).as_millis() as u64);
        }
    }
}

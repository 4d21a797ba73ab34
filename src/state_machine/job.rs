use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::state::JobStatus;
use crate::error::ErrorKind;
use crate::params::GenerationParams;

/// Opaque job identifier. Local ids are UUID v4; the engine may hand out its own.
pub type JobId = String;

/// Output of a finished generation as reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GenerationResult {
    /// Base64 payload or URL of the generated image.
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Engine-side generation time in seconds.
    #[serde(default)]
    pub generation_time: Option<f64>,
}

/// Error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries before a failure becomes permanent.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// A single generation request tracked by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Current id: the local id until the engine assigns one.
    pub id: JobId,
    /// Id assigned at enqueue. Always resolves to this job.
    pub local_id: JobId,
    pub params: GenerationParams,
    /// Cache key derived from `params`.
    pub fingerprint: String,
    pub priority: i32,
    pub status: JobStatus,
    /// Percent complete, 0..=100.
    pub progress: f32,
    pub step: Option<u32>,
    pub total_steps: Option<u32>,
    /// Advisory estimate of remaining milliseconds.
    pub eta_ms: Option<u64>,
    pub elapsed_ms: Option<u64>,
    pub result: Option<GenerationResult>,
    pub error: Option<JobError>,
    pub retry_count: u32,
    pub retry_config: RetryConfig,
    /// Set when the result was served from the cache without dispatching.
    pub from_cache: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) started_instant: Option<Instant>,
}

impl Job {
    pub fn new(params: GenerationParams, priority: i32, retry_config: RetryConfig) -> Self {
        let fingerprint = params.fingerprint();
        let id = Uuid::new_v4().to_string();
        Self {
            local_id: id.clone(),
            id,
            params,
            fingerprint,
            priority,
            status: JobStatus::Pending,
            progress: 0.0,
            step: None,
            total_steps: None,
            eta_ms: None,
            elapsed_ms: None,
            result: None,
            error: None,
            retry_count: 0,
            retry_config,
            from_cache: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            started_instant: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.status == JobStatus::Failed && self.retry_count < self.retry_config.max_retries
    }
}

/// Summary printed once a job reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub prompt: String,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub from_cache: bool,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl JobReport {
    pub fn from_job(job: &Job) -> Self {
        let duration = job
            .completed_at
            .map(|done| (done - job.created_at).num_milliseconds());

        Self {
            job_id: job.id.clone(),
            prompt: job.params.prompt.clone(),
            status: job.status,
            priority: job.priority,
            retry_count: job.retry_count,
            max_retries: job.retry_config.max_retries,
            from_cache: job.from_cache,
            error: job.error.clone(),
            created_at: job.created_at,
            completed_at: job.completed_at,
            duration_ms: duration,
        }
    }
}

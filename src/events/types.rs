//! Inbound event frames and outbound control frames.
//!
//! The engine sends JSON frames tagged by `"type"`:
//! `{"type": "progress", "job_id": "...", "progress": 42.0, ...}`.
//! Unknown types and malformed JSON fail to parse; callers log and move on.

use serde::{Deserialize, Serialize};

use crate::state_machine::{GenerationResult, JobId};

/// A progress/completion/failure frame addressed to one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GenerationEvent {
    Progress {
        #[serde(alias = "jobId")]
        job_id: JobId,
        /// Percent complete, 0..=100.
        progress: f32,
        #[serde(default)]
        step: Option<u32>,
        #[serde(default, alias = "totalSteps")]
        total_steps: Option<u32>,
        /// Estimated milliseconds remaining.
        #[serde(default)]
        eta: Option<u64>,
    },
    Completed {
        #[serde(alias = "jobId")]
        job_id: JobId,
        result: GenerationResult,
    },
    Failed {
        #[serde(alias = "jobId")]
        job_id: JobId,
        error: String,
    },
}

impl GenerationEvent {
    pub fn job_id(&self) -> &str {
        match self {
            GenerationEvent::Progress { job_id, .. }
            | GenerationEvent::Completed { job_id, .. }
            | GenerationEvent::Failed { job_id, .. } => job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GenerationEvent::Progress { .. } => "progress",
            GenerationEvent::Completed { .. } => "completed",
            GenerationEvent::Failed { .. } => "failed",
        }
    }
}

/// Frames the client sends to address the stream to specific jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Subscribe { job_id: JobId },
    Unsubscribe { job_id: JobId },
}

/// Parse a text frame from the engine.
pub fn parse_event(text: &str) -> Result<GenerationEvent, serde_json::Error> {
    serde_json::from_str(text)
}

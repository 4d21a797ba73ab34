//! Generation request parameters, validation and fingerprinting.
//!
//! [`GenerationParams`] is immutable once a job is enqueued. Validation runs
//! synchronously at enqueue time so malformed requests never reach the queue.
//! The [`fingerprint`](GenerationParams::fingerprint) is the result cache key.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::OrchestratorError;

/// Style presets accepted by the engine.
pub const STYLES: &[&str] = &["realistic", "artistic", "anime", "portrait", "landscape"];

/// Schedulers accepted by the engine.
pub const SCHEDULERS: &[&str] = &["ddim", "dpm", "euler", "euler_a"];

pub const MIN_DIMENSION: u32 = 64;
pub const MAX_DIMENSION: u32 = 1024;
pub const MAX_STEPS: u32 = 100;
pub const MIN_GUIDANCE: f32 = 1.0;
pub const MAX_GUIDANCE: f32 = 20.0;
pub const MAX_SEED: u64 = u32::MAX as u64;

/// A text-to-image request as sent to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_steps")]
    pub num_inference_steps: u32,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
}

fn default_dimension() -> u32 {
    512
}

fn default_steps() -> u32 {
    20
}

fn default_guidance_scale() -> f32 {
    7.5
}

fn default_scheduler() -> String {
    "ddim".to_string()
}

impl GenerationParams {
    /// Parameters for `prompt` with every other field at its default.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: default_dimension(),
            height: default_dimension(),
            num_inference_steps: default_steps(),
            guidance_scale: default_guidance_scale(),
            seed: None,
            style: None,
            scheduler: default_scheduler(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Checks every field against the engine's accepted ranges.
    pub fn validate(&self, max_prompt_length: usize) -> Result<(), OrchestratorError> {
        let prompt_len = self.prompt.trim().chars().count();
        if prompt_len == 0 {
            return Err(invalid("prompt must not be empty"));
        }
        if prompt_len > max_prompt_length {
            return Err(invalid(format!(
                "prompt exceeds {max_prompt_length} characters"
            )));
        }
        if let Some(negative) = &self.negative_prompt
            && negative.chars().count() > max_prompt_length
        {
            return Err(invalid(format!(
                "negative prompt exceeds {max_prompt_length} characters"
            )));
        }

        for (name, value) in [("width", self.width), ("height", self.height)] {
            if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
                return Err(invalid(format!(
                    "{name} must be between {MIN_DIMENSION} and {MAX_DIMENSION}, got {value}"
                )));
            }
            if value % 8 != 0 {
                return Err(invalid(format!("{name} must be a multiple of 8, got {value}")));
            }
        }

        if !(1..=MAX_STEPS).contains(&self.num_inference_steps) {
            return Err(invalid(format!(
                "num_inference_steps must be between 1 and {MAX_STEPS}"
            )));
        }

        if !self.guidance_scale.is_finite()
            || !(MIN_GUIDANCE..=MAX_GUIDANCE).contains(&self.guidance_scale)
        {
            return Err(invalid(format!(
                "guidance_scale must be between {MIN_GUIDANCE} and {MAX_GUIDANCE}"
            )));
        }

        if let Some(seed) = self.seed
            && seed > MAX_SEED
        {
            return Err(invalid(format!("seed must be at most {MAX_SEED}")));
        }

        if let Some(style) = &self.style
            && !STYLES.contains(&style.as_str())
        {
            return Err(invalid(format!(
                "unknown style '{style}', available: {}",
                STYLES.join(", ")
            )));
        }

        if !SCHEDULERS.contains(&self.scheduler.as_str()) {
            return Err(invalid(format!(
                "unknown scheduler '{}', available: {}",
                self.scheduler,
                SCHEDULERS.join(", ")
            )));
        }

        Ok(())
    }

    /// Deterministic cache key: SHA-256 over the canonical JSON encoding.
    ///
    /// Field order is fixed by the struct definition, so two requests with
    /// equal parameters always produce the same key.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn invalid(msg: impl Into<String>) -> OrchestratorError {
    OrchestratorError::Validation(msg.into())
}

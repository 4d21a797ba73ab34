//! Priority-scheduled client-side orchestrator for a remote image-generation
//! engine: a bounded-concurrency dispatcher with pipeline-wide rate-limit
//! backoff, a fingerprint-keyed result cache and event-driven job tracking.

pub mod batch;
pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod demo;
pub mod error;
pub mod events;
pub mod gate;
pub mod orchestrator;
pub mod params;
pub mod queue;
pub mod reconciler;
pub mod state_machine;
pub mod store;
pub mod ui;

pub use error::{ErrorKind, OrchestratorError};
pub use orchestrator::{Orchestrator, OrchestratorConfig, QueueStats};
pub use params::GenerationParams;

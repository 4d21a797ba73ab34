//! In-process simulated engine for the `demo` command and for tests.
//!
//! [`SimulatedEngine`] accepts every submission, assigns a `sim-N` id and
//! spawns an emitter that reports one inference step per `step_interval`,
//! then a completion. Progress is deterministic: step `k` of `n` is always
//! `k * 100 / n` percent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use crate::client::{GenerationBackend, Submission, SubmitError};
use crate::events::GenerationEvent;
use crate::params::GenerationParams;
use crate::state_machine::GenerationResult;

/// Shortest step interval the emitter will use.
pub const MIN_STEP_INTERVAL: Duration = Duration::from_millis(50);

const EVENT_BUFFER: usize = 256;

pub struct SimulatedEngine {
    events: mpsc::Sender<GenerationEvent>,
    step_interval: Duration,
    next_id: AtomicU64,
    /// Prompts containing this marker fail halfway through.
    fail_marker: Option<String>,
}

impl SimulatedEngine {
    /// Create an engine and the receiver its events arrive on.
    pub fn new(step_interval: Duration) -> (Self, mpsc::Receiver<GenerationEvent>) {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let engine = Self {
            events,
            step_interval: step_interval.max(MIN_STEP_INTERVAL),
            next_id: AtomicU64::new(1),
            fail_marker: None,
        };
        (engine, rx)
    }

    pub fn fail_on(mut self, marker: impl Into<String>) -> Self {
        self.fail_marker = Some(marker.into());
        self
    }

    pub fn step_interval(&self) -> Duration {
        self.step_interval
    }

    fn spawn_emitter(&self, job_id: String, params: GenerationParams) {
        let events = self.events.clone();
        let interval = self.step_interval;
        let total = params.num_inference_steps.max(1);
        let fail_at = self
            .fail_marker
            .as_deref()
            .filter(|marker| params.prompt.contains(marker))
            .map(|_| total.div_ceil(2));

        tokio::spawn(async move {
            for step in 1..=total {
                tokio::time::sleep(interval).await;
                if fail_at == Some(step) {
                    let _ = events
                        .send(GenerationEvent::Failed {
                            job_id: job_id.clone(),
                            error: format!("simulated failure at step {step}"),
                        })
                        .await;
                    return;
                }
                let remaining = interval.as_millis() as u64 * u64::from(total - step);
                let progress = GenerationEvent::Progress {
                    job_id: job_id.clone(),
                    progress: (step * 100 / total) as f32,
                    step: Some(step),
                    total_steps: Some(total),
                    eta: Some(remaining),
                };
                if events.send(progress).await.is_err() {
                    return;
                }
            }

            let result = GenerationResult {
                image: Some(format!("sim://{job_id}.png")),
                metadata: json!({
                    "prompt": params.prompt,
                    "width": params.width,
                    "height": params.height,
                    "steps": total,
                    "seed": params.seed,
                    "scheduler": params.scheduler,
                }),
                generation_time: Some(interval.as_secs_f64() * f64::from(total)),
            };
            let _ = events
                .send(GenerationEvent::Completed { job_id, result })
                .await;
        });
    }
}

impl GenerationBackend for SimulatedEngine {
    async fn submit_generation(
        &self,
        params: &GenerationParams,
    ) -> Result<Submission, SubmitError> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let job_id = format!("sim-{n}");
        let estimate = self.step_interval.as_millis() as u64 * u64::from(params.num_inference_steps);
        tracing::debug!(job_id = %job_id, steps = params.num_inference_steps, "simulated engine accepted job");

        self.spawn_emitter(job_id.clone(), params.clone());
        Ok(Submission {
            job_id,
            estimated_time_ms: Some(estimate),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{Orchestrator, OrchestratorConfig};
    use crate::state_machine::JobStatus;

    fn short(prompt: &str, steps: u32) -> GenerationParams {
        let mut params = GenerationParams::new(prompt);
        params.num_inference_steps = steps;
        params
    }

    #[tokio::test(start_paused = true)]
    async fn emits_monotonic_progress_then_completion() {
        let (engine, mut rx) = SimulatedEngine::new(Duration::from_millis(100));
        let submission = engine.submit_generation(&short("fern", 4)).await.unwrap();
        assert_eq!(submission.job_id, "sim-1");
        assert_eq!(submission.estimated_time_ms, Some(400));

        let mut seen = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, GenerationEvent::Completed { .. });
            seen.push(event);
            if done {
                break;
            }
        }

        let progress: Vec<f32> = seen
            .iter()
            .filter_map(|event| match event {
                GenerationEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![25.0, 50.0, 75.0, 100.0]);
        assert!(matches!(seen.last(), Some(GenerationEvent::Completed { job_id, .. }) if job_id == "sim-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_is_clamped() {
        let (engine, _rx) = SimulatedEngine::new(Duration::from_millis(1));
        assert_eq!(engine.step_interval(), MIN_STEP_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn marked_prompt_fails_halfway() {
        let (engine, mut rx) = SimulatedEngine::new(Duration::from_millis(50));
        let engine = engine.fail_on("glitch");
        engine.submit_generation(&short("glitch art", 4)).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, GenerationEvent::Progress { step: Some(1), .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, GenerationEvent::Failed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn drives_orchestrator_to_idle() {
        let (engine, rx) = SimulatedEngine::new(Duration::from_millis(50));
        let config = OrchestratorConfig {
            max_concurrent_jobs: 2,
            max_concurrent_requests: 2,
            ..Default::default()
        };
        let orch = Orchestrator::new(config, engine.fail_on("glitch"));
        let events = orch.attach_events(rx);

        let ids = orch
            .enqueue_many(vec![
                (short("harbour at dawn", 6), 1),
                (short("glitch mosaic", 6), 2),
                (short("fox in snow", 6), 3),
            ])
            .unwrap();
        orch.wait_idle().await;

        let statuses: Vec<JobStatus> = ids
            .iter()
            .map(|id| orch.job(id).unwrap().status)
            .collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Completed, JobStatus::Failed, JobStatus::Completed]
        );
        let done = orch.job(&ids[0]).unwrap();
        assert_eq!(done.progress, 100.0);
        assert!(done.id.starts_with("sim-"));
        assert_eq!(orch.stats().subscriptions, 0);
        events.abort();
    }
}

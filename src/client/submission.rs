//! Submission client: wraps a [`GenerationBackend`] with a request ceiling,
//! per-request cancellation and observability counters.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::client::GenerationBackend;
use super::error::SubmitError;
use super::types::{ClientMetrics, Submission};
use crate::params::GenerationParams;

pub struct SubmissionClient<B> {
    backend: B,
    timeout: Duration,
    metrics: Mutex<ClientMetrics>,
}

impl<B: GenerationBackend> SubmissionClient<B> {
    pub fn new(backend: B, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            metrics: Mutex::new(ClientMetrics::default()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Submit `params`, giving up when `cancel` fires or the ceiling elapses.
    ///
    /// Cancellation wins over a response that arrives in the same instant.
    pub async fn submit(
        &self,
        job_id: &str,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<Submission, SubmitError> {
        self.with_metrics(|m| m.total_requests += 1);
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.with_metrics(|m| m.cancelled_requests += 1);
                tracing::debug!(job_id, "submission cancelled");
                return Err(SubmitError::Cancelled);
            }
            result = tokio::time::timeout(self.timeout, self.backend.submit_generation(params)) => {
                result.unwrap_or_else(|_| Err(SubmitError::Timeout(self.timeout.as_millis() as u64)))
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.with_metrics(|m| m.record(elapsed_ms, outcome.is_ok()));

        match &outcome {
            Ok(submission) => tracing::info!(
                job_id,
                engine_job_id = %submission.job_id,
                elapsed_ms,
                "generation accepted"
            ),
            Err(err) => tracing::warn!(job_id, error = %err, elapsed_ms, "submission failed"),
        }
        outcome
    }

    /// Read-only snapshot of the counters.
    pub fn metrics(&self) -> ClientMetrics {
        self.metrics.lock().map(|m| *m).unwrap_or_default()
    }

    fn with_metrics(&self, f: impl FnOnce(&mut ClientMetrics)) {
        if let Ok(mut metrics) = self.metrics.lock() {
            f(&mut metrics);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    struct DelayedBackend {
        delay: Duration,
        response: Result<Submission, SubmitError>,
    }

    impl GenerationBackend for DelayedBackend {
        async fn submit_generation(
            &self,
            _params: &GenerationParams,
        ) -> Result<Submission, SubmitError> {
            tokio::time::sleep(self.delay).await;
            self.response.clone()
        }
    }

    fn accepted(delay_ms: u64) -> DelayedBackend {
        DelayedBackend {
            delay: Duration::from_millis(delay_ms),
            response: Ok(Submission {
                job_id: "gen-1".into(),
                estimated_time_ms: Some(1000),
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_updates_metrics() {
        let client = SubmissionClient::new(accepted(200), Duration::from_secs(5));
        let token = CancellationToken::new();
        let sub = client
            .submit("local", &GenerationParams::new("p"), &token)
            .await
            .unwrap();
        assert_eq!(sub.job_id, "gen-1");

        let metrics = client.metrics();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.successful_requests, 1);
        assert!((metrics.average_response_ms - 200.0).abs() < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_surfaces_as_timeout() {
        let client = SubmissionClient::new(accepted(10_000), Duration::from_millis(500));
        let token = CancellationToken::new();
        let err = client
            .submit("local", &GenerationParams::new("p"), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Timeout(500)));
        assert_eq!(err.kind(), Some(ErrorKind::Timeout));
        assert_eq!(client.metrics().failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_in_flight_request() {
        let client = std::sync::Arc::new(SubmissionClient::new(
            accepted(10_000),
            Duration::from_secs(60),
        ));
        let token = CancellationToken::new();

        let task = {
            let client = client.clone();
            let token = token.clone();
            tokio::spawn(async move {
                client
                    .submit("local", &GenerationParams::new("p"), &token)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SubmitError::Cancelled));
        let metrics = client.metrics();
        assert_eq!(metrics.cancelled_requests, 1);
        assert_eq!(metrics.failed_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backend_errors_pass_through() {
        let backend = DelayedBackend {
            delay: Duration::ZERO,
            response: Err(SubmitError::RateLimited {
                retry_after_ms: Some(2000),
            }),
        };
        let client = SubmissionClient::new(backend, Duration::from_secs(5));
        let err = client
            .submit("local", &GenerationParams::new("p"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::RateLimited));
    }
}

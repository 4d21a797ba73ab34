use std::future::Future;
use std::time::Duration;

use reqwest::Client;

use super::error::SubmitError;
use super::types::Submission;
use crate::params::GenerationParams;

const API_URL: &str = "http://localhost:8000/api/v1";

/// The request/response half of the remote engine contract.
///
/// Implemented by [`HttpBackend`] for the real service and by in-process
/// engines for the demo and tests.
pub trait GenerationBackend: Send + Sync + 'static {
    fn submit_generation(
        &self,
        params: &GenerationParams,
    ) -> impl Future<Output = Result<Submission, SubmitError>> + Send;
}

pub struct HttpBackend {
    api_key: String,
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(api_key: String) -> Result<Self, SubmitError> {
        Self::with_base_url(api_key, API_URL.to_string())
    }

    /// Create a backend pointing at a custom base URL (useful for testing).
    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self, SubmitError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl GenerationBackend for HttpBackend {
    async fn submit_generation(&self, params: &GenerationParams) -> Result<Submission, SubmitError> {
        let mut request = self
            .client
            .post(format!("{}/generate", self.base_url))
            .header("content-type", "application/json")
            .json(params);
        if !self.api_key.is_empty() {
            request = request.header("X-API-Key", &self.api_key);
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(SubmitError::from_status(
                status.as_u16(),
                retry_after,
                message,
            ));
        }

        let body = response.text().await?;
        serde_json::from_str::<Submission>(&body).map_err(|e| SubmitError::Unknown {
            status: Some(status.as_u16()),
            message: format!("failed to decode submission response: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn backend(server: &MockServer) -> HttpBackend {
        HttpBackend::with_base_url("secret".into(), server.uri()).unwrap()
    }

    #[tokio::test]
    async fn submit_success_returns_engine_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .and(header("X-API-Key", "secret"))
            .and(body_partial_json(serde_json::json!({"prompt": "koi pond", "width": 512})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"job_id": "gen-7", "estimated_time": 900})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let sub = backend(&server)
            .await
            .submit_generation(&GenerationParams::new("koi pond"))
            .await
            .unwrap();
        assert_eq!(sub.job_id, "gen-7");
        assert_eq!(sub.estimated_time_ms, Some(900));
    }

    #[tokio::test]
    async fn rate_limit_reads_retry_after_seconds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .await
            .submit_generation(&GenerationParams::new("p"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SubmitError::RateLimited {
                retry_after_ms: Some(2000)
            }
        ));
    }

    #[tokio::test]
    async fn rate_limit_without_header_uses_default() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = backend(&server)
            .await
            .submit_generation(&GenerationParams::new("p"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SubmitError::RateLimited {
                retry_after_ms: None
            }
        ));
    }

    #[tokio::test]
    async fn classifies_auth_and_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Invalid API key"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Model not loaded"))
            .mount(&server)
            .await;

        let backend = backend(&server).await;
        let params = GenerationParams::new("p");

        match backend.submit_generation(&params).await.unwrap_err() {
            SubmitError::Auth { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid API key");
            }
            other => panic!("expected Auth, got {other:?}"),
        }
        assert!(matches!(
            backend.submit_generation(&params).await.unwrap_err(),
            SubmitError::ServiceUnavailable { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn undecodable_body_is_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .await
            .submit_generation(&GenerationParams::new("p"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Unknown { status: Some(200), .. }));
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        // Nothing listens on port 9 of localhost in the test environment.
        let backend =
            HttpBackend::with_base_url(String::new(), "http://127.0.0.1:9".into()).unwrap();
        let err = backend
            .submit_generation(&GenerationParams::new("p"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Network(_)));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let backend =
            HttpBackend::with_base_url(String::new(), "http://engine:8000/api/".into()).unwrap();
        assert_eq!(backend.base_url(), "http://engine:8000/api");
    }
}

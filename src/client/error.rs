//! Tipos de erro para o cliente de submissão de gerações.
//!
//! Define [`SubmitError`] com uma variante por classe de falha que o
//! orquestrador trata de forma diferente. Usa `thiserror` para derivar
//! `Display` e `Error` a partir dos atributos `#[error(...)]`.

use thiserror::Error;

use crate::error::ErrorKind;

/// Erros que podem ocorrer ao submeter uma geração ao motor remoto.
///
/// - [`RateLimited`](SubmitError::RateLimited) pausa o pipeline inteiro, não o job
/// - [`Cancelled`](SubmitError::Cancelled) nunca vira falha de job
/// - as demais variantes marcam o job como `failed`
#[derive(Debug, Clone, Error)]
pub enum SubmitError {
    /// HTTP 401/403: chave ausente ou rejeitada.
    #[error("authentication failed (status {status}): {message}")]
    Auth { status: u16, message: String },

    /// HTTP 429. `retry_after_ms` vem do cabeçalho `Retry-After`, se presente.
    #[error("rate limited, retry after {}", retry_after_display(*retry_after_ms))]
    RateLimited { retry_after_ms: Option<u64> },

    /// HTTP 502/503/504: motor sobrecarregado ou modelo não carregado.
    #[error("service unavailable (status {status}): {message}")]
    ServiceUnavailable { status: u16, message: String },

    /// O teto de tempo da requisição expirou.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// Falha de rede subjacente (DNS, conexão recusada, reset).
    #[error("network error: {0}")]
    Network(String),

    /// HTTP 400/422: parâmetros rejeitados pelo motor.
    #[error("request rejected (status {status}): {message}")]
    Validation { status: u16, message: String },

    /// Qualquer outra resposta, incluindo corpos que não puderam ser decodificados.
    #[error("unexpected response{}: {message}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Unknown { status: Option<u16>, message: String },

    /// A requisição foi cancelada localmente antes de terminar.
    #[error("request cancelled")]
    Cancelled,
}

fn retry_after_display(retry_after_ms: Option<u64>) -> String {
    match retry_after_ms {
        Some(ms) => format!("{ms}ms"),
        None => "default delay".to_string(),
    }
}

impl SubmitError {
    /// Classifica uma resposta HTTP sem sucesso.
    pub fn from_status(status: u16, retry_after_ms: Option<u64>, message: String) -> Self {
        match status {
            401 | 403 => SubmitError::Auth { status, message },
            429 => SubmitError::RateLimited { retry_after_ms },
            502..=504 => SubmitError::ServiceUnavailable { status, message },
            408 => SubmitError::Timeout(0),
            400 | 422 => SubmitError::Validation { status, message },
            _ => SubmitError::Unknown {
                status: Some(status),
                message,
            },
        }
    }

    /// Classe de erro registrada no job; `None` para cancelamento.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SubmitError::Auth { .. } => Some(ErrorKind::Auth),
            SubmitError::RateLimited { .. } => Some(ErrorKind::RateLimited),
            SubmitError::ServiceUnavailable { .. } => Some(ErrorKind::ServiceUnavailable),
            SubmitError::Timeout(_) => Some(ErrorKind::Timeout),
            SubmitError::Network(_) => Some(ErrorKind::Network),
            SubmitError::Validation { .. } => Some(ErrorKind::Validation),
            SubmitError::Unknown { .. } => Some(ErrorKind::Unknown),
            SubmitError::Cancelled => None,
        }
    }
}

impl From<reqwest::Error> for SubmitError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SubmitError::Timeout(0)
        } else if err.is_decode() {
            SubmitError::Unknown {
                status: err.status().map(|s| s.as_u16()),
                message: err.to_string(),
            }
        } else {
            SubmitError::Network(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_display() {
        let err = SubmitError::RateLimited {
            retry_after_ms: Some(5000),
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");

        let err = SubmitError::RateLimited {
            retry_after_ms: None,
        };
        assert_eq!(err.to_string(), "rate limited, retry after default delay");
    }

    #[test]
    fn classifies_statuses() {
        let classify = |status| SubmitError::from_status(status, None, "x".into()).kind();
        assert_eq!(classify(401), Some(ErrorKind::Auth));
        assert_eq!(classify(403), Some(ErrorKind::Auth));
        assert_eq!(classify(429), Some(ErrorKind::RateLimited));
        assert_eq!(classify(503), Some(ErrorKind::ServiceUnavailable));
        assert_eq!(classify(422), Some(ErrorKind::Validation));
        assert_eq!(classify(500), Some(ErrorKind::Unknown));
    }

    #[test]
    fn unknown_display_includes_status() {
        let err = SubmitError::from_status(500, None, "boom".into());
        assert_eq!(err.to_string(), "unexpected response (status 500): boom");
    }

    #[test]
    fn cancelled_has_no_kind() {
        assert_eq!(SubmitError::Cancelled.kind(), None);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SubmitError>();
    }
}

//! Tipos de dados da interface de submissão do motor de geração.
//!
//! O corpo da requisição é o próprio [`GenerationParams`](crate::params::GenerationParams);
//! aqui ficam a resposta do endpoint `/generate` e o snapshot de métricas do cliente.

use serde::{Deserialize, Serialize};

/// Resposta de sucesso do endpoint `POST /generate`.
///
/// O motor aceita o pedido e devolve o id sob o qual os eventos de progresso
/// serão publicados. Os nomes em camelCase também são aceitos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Identificador atribuído pelo motor.
    #[serde(alias = "jobId")]
    pub job_id: String,
    /// Estimativa do tempo total em milissegundos.
    #[serde(default, alias = "estimatedTime", alias = "estimated_time")]
    pub estimated_time_ms: Option<u64>,
}

/// Contadores de observabilidade do cliente de submissão (somente leitura).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClientMetrics {
    /// Total de requisições iniciadas.
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Requisições canceladas antes da resposta.
    pub cancelled_requests: u64,
    /// Média do tempo de resposta das requisições concluídas, em milissegundos.
    pub average_response_ms: f64,
}

impl ClientMetrics {
    /// Incorpora uma amostra à média acumulada.
    pub(crate) fn record(&mut self, elapsed_ms: f64, success: bool) {
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        let samples = (self.successful_requests + self.failed_requests) as f64;
        self.average_response_ms += (elapsed_ms - self.average_response_ms) / samples;
    }

    pub fn success_rate(&self) -> f64 {
        let finished = self.successful_requests + self.failed_requests;
        if finished == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / finished as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_deserialize_snake_and_camel() {
        let snake: Submission =
            serde_json::from_str(r#"{"job_id":"gen-1","estimated_time":4200}"#).unwrap();
        assert_eq!(snake.job_id, "gen-1");
        assert_eq!(snake.estimated_time_ms, Some(4200));

        let camel: Submission =
            serde_json::from_str(r#"{"jobId":"gen-2","estimatedTime":100}"#).unwrap();
        assert_eq!(camel.job_id, "gen-2");
        assert_eq!(camel.estimated_time_ms, Some(100));
    }

    #[test]
    fn submission_without_estimate() {
        let sub: Submission = serde_json::from_str(r#"{"job_id":"gen-3"}"#).unwrap();
        assert_eq!(sub.estimated_time_ms, None);
    }

    #[test]
    fn metrics_running_average() {
        let mut metrics = ClientMetrics::default();
        metrics.record(100.0, true);
        metrics.record(300.0, false);
        metrics.record(200.0, true);
        assert_eq!(metrics.successful_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert!((metrics.average_response_ms - 200.0).abs() < 1e-9);
        assert!((metrics.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }
}

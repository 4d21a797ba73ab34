//! Configuração do LEXIGRAPH carregada a partir de `lexigraph.toml`.
//!
//! A struct [`LexigraphConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `LEXIGRAPH_API_KEY` tem precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::orchestrator::OrchestratorConfig;
use crate::state_machine::RetryConfig;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "lexigraph.toml";

/// Variável de ambiente que sobrescreve `api_key`.
pub const API_KEY_ENV: &str = "LEXIGRAPH_API_KEY";

/// Configuração de nível superior carregada de `lexigraph.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LexigraphConfig {
    /// URL base da API HTTP do motor de geração.
    pub api_url: String,

    /// URL do stream de eventos WebSocket.
    pub ws_url: String,

    /// Chave enviada no cabeçalho `X-API-Key`.
    pub api_key: String,

    /// Jobs simultâneos em `processing`.
    pub max_concurrent_jobs: usize,

    /// Slots de despacho mantidos pelo gate.
    pub max_concurrent_requests: usize,

    /// Tempo máximo de uma submissão, em milissegundos.
    pub request_timeout_ms: u64,

    /// Pausa aplicada quando o limite de taxa não traz `Retry-After`.
    pub default_rate_limit_ms: u64,

    /// Máximo de retentativas antes de uma falha se tornar permanente.
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    pub base_delay_ms: u64,

    /// Retenta automaticamente falhas transitórias.
    pub auto_retry: bool,

    /// Número máximo de resultados em cache.
    pub cache_max_size: usize,

    /// Tempo de vida de um resultado em cache, em milissegundos.
    pub cache_ttl_ms: u64,

    /// Jobs finalizados mantidos no histórico.
    pub max_history: usize,

    /// Período da reavaliação de segurança, em milissegundos.
    pub tick_interval_ms: u64,

    /// Comprimento máximo do prompt.
    pub max_prompt_length: usize,
}

impl Default for LexigraphConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/api/v1".to_string(),
            ws_url: "ws://localhost:8000/ws".to_string(),
            api_key: String::new(),
            max_concurrent_jobs: 3,
            max_concurrent_requests: 3,
            request_timeout_ms: 300_000,
            default_rate_limit_ms: 1000,
            max_retries: 3,
            base_delay_ms: 1000,
            auto_retry: false,
            cache_max_size: 50,
            cache_ttl_ms: 3_600_000,
            max_history: 100,
            tick_interval_ms: 500,
            max_prompt_length: 500,
        }
    }
}

impl LexigraphConfig {
    /// Carrega a configuração de `lexigraph.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<LexigraphConfig>(&contents)
                .with_context(|| format!("invalid configuration in {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração para a chave API.
        if let Ok(key) = std::env::var(API_KEY_ENV)
            && !key.is_empty()
        {
            config.api_key = key;
        }

        Ok(config)
    }

    /// Converte para a configuração usada pelo orquestrador.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent_jobs: self.max_concurrent_jobs,
            max_concurrent_requests: self.max_concurrent_requests,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            default_rate_limit: Duration::from_millis(self.default_rate_limit_ms),
            retry: RetryConfig {
                max_retries: self.max_retries,
                base_delay_ms: self.base_delay_ms,
            },
            auto_retry: self.auto_retry,
            cache_max_size: self.cache_max_size,
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            max_history: self.max_history,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            max_prompt_length: self.max_prompt_length,
        }
    }

    /// Serializa como TOML com a chave API mascarada.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.api_key.is_empty() {
            shown.api_key = "********".to_string();
        }
        Ok(toml::to_string_pretty(&shown)?)
    }
}

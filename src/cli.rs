//! Interface de linha de comando do LEXIGRAPH baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, demo, config)
//! e flags globais (--max-concurrent, --max-retries, --verbose).

use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::config::LexigraphConfig;
use crate::params::GenerationParams;

/// LEXIGRAPH: orquestrador de filas de geração de imagens.
#[derive(Debug, Parser)]
#[command(name = "lexigraph", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Jobs simultâneos em processamento (sobrescreve o arquivo de configuração).
    #[arg(long, global = true)]
    pub max_concurrent: Option<usize>,

    /// Número máximo de retentativas em caso de falha.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Enfileira um ou mais prompts e acompanha até terminarem.
    Run {
        /// Prompts a gerar; cada um vira um job.
        prompts: Vec<String>,

        /// Prioridade aplicada aos prompts da linha de comando.
        #[arg(long, short, default_value_t = 0)]
        priority: i32,

        /// Caminho para um arquivo JSON ou TOML contendo definições de job.
        #[arg(long)]
        file: Option<String>,

        /// Usa o motor simulado em vez do motor remoto.
        #[arg(long, default_value_t = false)]
        demo: bool,
    },

    /// Executa a demonstração com o motor simulado.
    Demo,

    /// Mostra a configuração efetiva em TOML.
    Config,
}

impl Cli {
    /// Aplica as flags globais sobre a configuração carregada.
    pub fn apply_overrides(&self, config: &mut LexigraphConfig) {
        if let Some(n) = self.max_concurrent {
            config.max_concurrent_jobs = n;
            config.max_concurrent_requests = n;
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
    }
}

/// Uma definição de job em arquivo: parâmetros de geração mais prioridade.
#[derive(Debug, Deserialize)]
pub struct JobSpec {
    #[serde(flatten)]
    pub params: GenerationParams,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Deserialize)]
struct JobFile {
    jobs: Vec<JobSpec>,
}

/// Lê definições de job de um arquivo `.json` ou `.toml`.
///
/// Ambos os formatos usam uma lista `jobs`; em JSON também é aceito um
/// array no nível superior.
pub fn load_job_file(path: &Path) -> Result<Vec<(GenerationParams, i32)>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read job file {}", path.display()))?;
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();

    let specs = match extension {
        "toml" => toml::from_str::<JobFile>(&contents)
            .with_context(|| format!("invalid job file {}", path.display()))?
            .jobs,
        "json" => match serde_json::from_str::<Vec<JobSpec>>(&contents) {
            Ok(specs) => specs,
            Err(_) => serde_json::from_str::<JobFile>(&contents)
                .with_context(|| format!("invalid job file {}", path.display()))?
                .jobs,
        },
        other => bail!("unsupported job file extension {other:?}, expected .json or .toml"),
    };

    Ok(specs
        .into_iter()
        .map(|spec| (spec.params, spec.priority))
        .collect())
}

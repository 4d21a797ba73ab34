//! Interface de terminal do LEXIGRAPH: barras de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para as barras de progresso por job e `console`
//! para estilização com cores. O [`QueueView`] acompanha visualmente
//! todos os jobs de uma execução no terminal.

use std::collections::HashMap;

use console::Style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::orchestrator::QueueStats;
use crate::state_machine::{Job, JobReport, JobStatus};

// Largura máxima do prompt exibido ao lado da barra.
const PROMPT_WIDTH: usize = 32;

/// Indicador visual de progresso para todos os jobs acompanhados.
///
/// Cada job ganha uma barra; sucesso aparece em verde, falha em vermelho
/// e retentativas ou pausas em amarelo.
pub struct QueueView {
    // Agrupa as barras para que desenhem juntas.
    multi: MultiProgress,
    // Barra de cada job, indexada pelo id local devolvido no enfileiramento.
    bars: HashMap<String, ProgressBar>,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Default for QueueView {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueView {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Cria a barra de um job recém-enfileirado.
    pub fn track(&mut self, local_id: &str, prompt: &str) {
        let pb = self.multi.add(ProgressBar::new(100));
        pb.set_style(
            ProgressStyle::with_template("{prefix:32} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.set_prefix(truncate(prompt, PROMPT_WIDTH));
        pb.set_message(self.dim.apply_to("PENDING").to_string());
        self.bars.insert(local_id.to_string(), pb);
    }

    /// Atualiza a barra de um job a partir do seu estado atual.
    pub fn refresh(&self, local_id: &str, job: &Job) {
        let Some(pb) = self.bars.get(local_id) else {
            return;
        };
        if pb.is_finished() {
            return;
        }
        pb.set_position(job.progress.round() as u64);

        match job.status {
            JobStatus::Pending if job.retry_count > 0 => pb.set_message(format!(
                "{} retry {}/{}",
                self.yellow.apply_to("↻"),
                job.retry_count,
                job.retry_config.max_retries
            )),
            JobStatus::Pending => pb.set_message(self.dim.apply_to("PENDING").to_string()),
            JobStatus::Processing => {
                let step = match (job.step, job.total_steps) {
                    (Some(step), Some(total)) => format!("step {step}/{total}"),
                    _ => "PROCESSING".to_string(),
                };
                let eta = job
                    .eta_ms
                    .map(|ms| format!(" eta {:.1}s", ms as f64 / 1000.0))
                    .unwrap_or_default();
                pb.set_message(format!("{step}{eta}"));
            }
            JobStatus::Paused => pb.set_message(self.yellow.apply_to("PAUSED").to_string()),
            JobStatus::Failed => {
                let reason = job
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default();
                pb.set_message(format!("{} {reason}", self.red.apply_to("✗")));
            }
            JobStatus::Completed => {
                let origin = if job.from_cache { " (cache)" } else { "" };
                pb.finish_with_message(format!("{}{origin}", self.green.apply_to("✓")));
            }
            JobStatus::Cancelled => {
                pb.finish_with_message(self.yellow.apply_to("cancelled").to_string());
            }
        }
    }

    /// Encerra as barras que ainda estão abertas (falhas definitivas).
    pub fn finish(&self) {
        for pb in self.bars.values().filter(|pb| !pb.is_finished()) {
            pb.abandon();
        }
    }

    /// Imprime um resumo da fila com estatísticas de cache e cliente.
    pub fn print_summary(&self, stats: &QueueStats) {
        let jobs = &stats.jobs;
        println!();
        println!(
            "  {} completed  {} failed  {} cancelled",
            self.green.apply_to(jobs.completed),
            self.red.apply_to(jobs.failed),
            self.yellow.apply_to(jobs.cancelled),
        );
        println!(
            "  cache: {} hits / {} misses, {} entries",
            stats.cache.hits, stats.cache.misses, stats.cache.entries
        );
        println!(
            "  requests: {} total, {:.0}% ok, avg {:.0}ms",
            stats.client.total_requests,
            stats.client.success_rate() * 100.0,
            stats.client.average_response_ms
        );
    }

    /// Imprime o relatório de um job formatado em JSON com estilo colorido.
    pub fn print_report(&self, report: &JobReport) {
        let status_style = match report.status {
            JobStatus::Completed => &self.green,
            JobStatus::Failed => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", status_style.apply_to("─── Job Report ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(report).unwrap_or_default()
        );
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::GenerationParams;
    use crate::state_machine::RetryConfig;

    #[test]
    fn truncate_keeps_short_prompts() {
        assert_eq!(truncate("fox", 8), "fox");
        assert_eq!(truncate("a very long prompt", 8), "a very …");
    }

    #[test]
    fn completed_job_finishes_bar() {
        let mut view = QueueView::new();
        view.track("local-1", "harbour");
        let mut job = Job::new(GenerationParams::new("harbour"), 0, RetryConfig::default());
        job.status = JobStatus::Completed;
        job.progress = 100.0;

        view.refresh("local-1", &job);
        let pb = &view.bars["local-1"];
        assert!(pb.is_finished());
        assert_eq!(pb.position(), 100);
    }

    #[test]
    fn failed_job_stays_open_until_finish() {
        let mut view = QueueView::new();
        view.track("local-1", "harbour");
        let mut job = Job::new(GenerationParams::new("harbour"), 0, RetryConfig::default());
        job.status = JobStatus::Failed;

        view.refresh("local-1", &job);
        assert!(!view.bars["local-1"].is_finished());
        view.finish();
        assert!(view.bars["local-1"].is_finished());
    }
}

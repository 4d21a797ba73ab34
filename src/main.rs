use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lexigraph::cli::{Cli, Command, load_job_file};
use lexigraph::client::{GenerationBackend, HttpBackend};
use lexigraph::config::LexigraphConfig;
use lexigraph::demo::SimulatedEngine;
use lexigraph::events;
use lexigraph::state_machine::{JobId, JobReport};
use lexigraph::ui::QueueView;
use lexigraph::{GenerationParams, Orchestrator};

/// Step interval of the simulated engine used by `demo` and `run --demo`.
const DEMO_STEP_INTERVAL: Duration = Duration::from_millis(120);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = LexigraphConfig::load()?;
    cli.apply_overrides(&mut config);

    match cli.command {
        Command::Run {
            prompts,
            priority,
            file,
            demo,
        } => {
            let mut requests: Vec<(GenerationParams, i32)> = prompts
                .into_iter()
                .map(|prompt| (GenerationParams::new(prompt), priority))
                .collect();
            if let Some(path) = file {
                requests.extend(load_job_file(Path::new(&path))?);
            }
            if requests.is_empty() {
                bail!("nothing to run: pass at least one prompt or --file");
            }

            if demo {
                run_simulated(&config, requests).await
            } else {
                run_remote(&config, requests).await
            }
        }
        Command::Demo => run_simulated(&config, demo_requests()).await,
        Command::Config => {
            print!("{}", config.to_redacted_toml()?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "lexigraph=debug"
    } else {
        "lexigraph=warn"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run_remote(config: &LexigraphConfig, requests: Vec<(GenerationParams, i32)>) -> Result<()> {
    let backend = HttpBackend::with_base_url(config.api_key.clone(), config.api_url.clone())?;
    let orch = Orchestrator::new(config.orchestrator_config(), backend);

    let stream = events::connect(&config.ws_url).await?;
    let events = orch.attach_stream(stream);

    let result = drive(&orch, config.auto_retry, requests).await;
    events.abort();
    result
}

async fn run_simulated(
    config: &LexigraphConfig,
    requests: Vec<(GenerationParams, i32)>,
) -> Result<()> {
    let (engine, rx) = SimulatedEngine::new(DEMO_STEP_INTERVAL);
    let orch = Orchestrator::new(config.orchestrator_config(), engine.fail_on("glitch"));
    let events = orch.attach_events(rx);

    let result = drive(&orch, config.auto_retry, requests).await;
    events.abort();
    result
}

/// Prompts shown by `lexigraph demo`. One repeats, so a late duplicate can
/// be served from the cache, and one fails on purpose.
fn demo_requests() -> Vec<(GenerationParams, i32)> {
    vec![
        (GenerationParams::new("lighthouse at dusk").with_seed(7), 1),
        (GenerationParams::new("fox curled in snow").with_style("realistic"), 5),
        (GenerationParams::new("glitch mosaic of a city"), 1),
        (GenerationParams::new("orchard in spring").with_style("artistic"), 3),
        (GenerationParams::new("lighthouse at dusk").with_seed(7), 0),
    ]
}

/// Enqueue `requests`, redraw on every state change and return once nothing
/// is left to run. Ctrl-C cancels every outstanding job.
async fn drive<B: GenerationBackend>(
    orch: &Orchestrator<B>,
    auto_retry: bool,
    requests: Vec<(GenerationParams, i32)>,
) -> Result<()> {
    let mut changes = orch.watch_changes();
    let ticker = orch.spawn_ticker();
    let mut view = QueueView::new();

    let ids = orch.enqueue_many(requests)?;
    for id in &ids {
        if let Some(job) = orch.job(id) {
            view.track(id, &job.params.prompt);
        }
    }

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                render(orch, &view, &ids);
                if orch.is_idle() && !awaiting_retry(orch, auto_retry, &ids) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted, cancelling outstanding jobs");
                for id in &ids {
                    let _ = orch.cancel(id);
                }
            }
        }
    }

    ticker.abort();
    render(orch, &view, &ids);
    view.finish();

    for id in &ids {
        if let Some(job) = orch.job(id) {
            view.print_report(&JobReport::from_job(&job));
        }
    }
    view.print_summary(&orch.stats());
    Ok(())
}

fn render<B: GenerationBackend>(orch: &Orchestrator<B>, view: &QueueView, ids: &[JobId]) {
    for id in ids {
        if let Some(job) = orch.job(id) {
            view.refresh(id, &job);
        }
    }
}

/// Failed jobs that an automatic retry will pick up again.
fn awaiting_retry<B: GenerationBackend>(orch: &Orchestrator<B>, auto_retry: bool, ids: &[JobId]) -> bool {
    auto_retry
        && ids.iter().filter_map(|id| orch.job(id)).any(|job| {
            job.can_retry() && job.error.as_ref().is_some_and(|e| e.kind.is_retryable())
        })
}

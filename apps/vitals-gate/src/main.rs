//! vitals-gate command-line front end
//!
//! Loads one configuration file, runs every audit, prints the summary and
//! exits non-zero when the run failed.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vitals_gate_core::report::{ConsoleReporter, JsonReporter};
use vitals_gate_core::{Baseline, EventSink, PooledWorkerEngine, RunConfig, RunEvent, Runner};

#[derive(Parser, Debug)]
#[command(name = "vitals-gate")]
#[command(version, about = "Audit Core Web Vitals and fail on regressions")]
struct Args {
    /// Configuration file (TOML, or JSON by extension)
    #[arg(short, long, default_value = "vitals-gate.toml")]
    config: PathBuf,

    /// Print the summary as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Save successful results as a baseline file
    #[arg(long)]
    save_baseline: Option<PathBuf>,

    /// Override the number of concurrent audits
    #[arg(long)]
    concurrency: Option<usize>,

    /// Show the browser window
    #[arg(long)]
    headful: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Args::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<bool> {
    let mut config = RunConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    config.worker.headful |= args.headful;
    config.validate()?;

    info!("Starting vitals-gate v{}", env!("CARGO_PKG_VERSION"));

    let engine = Arc::new(PooledWorkerEngine::from_config(&config)?);
    let (events, rx) = EventSink::channel();
    let progress = tokio::spawn(log_progress(rx));
    let runner = Arc::new(Runner::new(config, engine.clone(), events));

    let mut run = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run().await }
    });

    let joined = tokio::select! {
        joined = &mut run => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; stopping audits");
            runner.stop();
            engine.shutdown().await;
            run.await
        }
    };
    let summary = joined.context("Run task failed")??;
    drop(runner);
    let _ = progress.await;

    if args.json {
        println!("{}", JsonReporter::format(&summary, true)?);
    } else {
        println!("{}", ConsoleReporter::format(&summary)?);
    }

    if let Some(path) = &args.save_baseline {
        Baseline::from_summary(&summary)
            .write_to_file(path)
            .with_context(|| format!("Failed to save baseline to {}", path.display()))?;
        info!("Baseline saved to {}", path.display());
    }

    Ok(summary.passed)
}

async fn log_progress(mut rx: UnboundedReceiver<RunEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::TaskStarted(task) => {
                info!("▶ {} [{}] attempt {}", task.target.display_name(), task.profile, task.attempt)
            }
            RunEvent::TaskCompleted(result) => {
                let status = if result.passed() { "✓" } else { "✗" };
                info!("{} {} [{}] in {}ms", status, result.target, result.profile, result.duration_ms)
            }
            RunEvent::TaskRetry { task, attempt } => {
                info!("↻ {} [{}] retrying (attempt {})", task.target.id, task.profile, attempt)
            }
            RunEvent::RunCompleted(summary) => {
                info!("Run complete: {}/{} tasks succeeded", summary.completed_tasks, summary.total_tasks);
                break;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["vitals-gate"]);
        assert_eq!(args.config, PathBuf::from("vitals-gate.toml"));
        assert!(!args.json);
        assert!(args.save_baseline.is_none());
    }
}

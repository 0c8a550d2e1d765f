//! Audit worker
//!
//! Spawned once per task by the vitals-gate worker boundary. Inputs arrive
//! through environment variables (or the equivalent flags); the outcome is
//! written as JSON to the designated result file. Exit code 0 means a
//! result was written, anything else is a failure. Logs go to stderr, which
//! the parent keeps as diagnostics.

mod audit;
mod auth;
mod collector;
mod scoring;
mod settings;
mod throttling;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vitals_gate_core::auth::AuthConfig;
use vitals_gate_core::worker::{
    WorkerOutput, ENV_AUTH, ENV_BROWSER_WS, ENV_RESULT_FILE, ENV_SETTINGS, ENV_URL,
};

use crate::audit::AuditJob;

/// Exit code when the result file itself cannot be written
const EXIT_NO_RESULT: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "audit-worker")]
#[command(version, about = "Measure Core Web Vitals for one URL in a running Chrome")]
struct Args {
    /// URL to audit
    #[arg(long, env = ENV_URL)]
    url: String,

    /// DevTools websocket of the browser to attach to
    #[arg(long, env = ENV_BROWSER_WS)]
    browser_ws: String,

    /// Resolved engine settings (JSON object)
    #[arg(long, env = ENV_SETTINGS, default_value = "{}")]
    settings: String,

    /// Resolved auth headers and cookies (JSON)
    #[arg(long, env = ENV_AUTH)]
    auth: Option<String>,

    /// Where to write the result
    #[arg(long, env = ENV_RESULT_FILE)]
    result_file: PathBuf,
}

impl Args {
    fn job(&self) -> Result<AuditJob> {
        let settings = serde_json::from_str(&self.settings).context("Settings are not valid JSON")?;
        let auth = self
            .auth
            .as_deref()
            .map(serde_json::from_str::<AuthConfig>)
            .transpose()
            .context("Auth is not valid JSON")?;
        Ok(AuditJob {
            url: self.url.clone(),
            browser_ws: self.browser_ws.clone(),
            settings,
            auth,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .init();

    let args = Args::parse();
    let outcome = match args.job() {
        Ok(job) => audit::run(&job).await,
        Err(e) => Err(e),
    };

    let (output, succeeded) = match outcome {
        Ok(result) => (WorkerOutput::Ok { result }, true),
        Err(e) => {
            tracing::error!("Audit failed: {:#}", e);
            (
                WorkerOutput::Error {
                    message: format!("{:#}", e),
                },
                false,
            )
        }
    };

    if let Err(e) = write_output(&args.result_file, &output) {
        tracing::error!("{:#}", e);
        return ExitCode::from(EXIT_NO_RESULT);
    }

    if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn write_output(path: &Path, output: &WorkerOutput) -> Result<()> {
    let json = serde_json::to_string(output)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write result file {}", path.display()))
}

//! One audit against a pooled browser
//!
//! The worker attaches to an already running Chrome over its DevTools
//! websocket, opens a page in a fresh browser context, applies emulation
//! and auth, navigates, and measures. The browser itself belongs to the
//! pool and is left running. The context is disposed afterwards, so cookies
//! and cache never carry over to the next audit on the same instance.

use anyhow::{Context, Result};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, warn};
use vitals_gate_core::auth::AuthConfig;

use crate::collector::VitalsCollector;
use crate::settings::EngineSettings;
use crate::{auth, scoring, throttling};

/// Inputs for one audit
#[derive(Debug, Clone)]
pub struct AuditJob {
    pub url: String,
    pub browser_ws: String,
    /// Resolved profile settings, echoed into the result
    pub settings: Value,
    pub auth: Option<AuthConfig>,
}

/// Run the audit and return the engine result
#[instrument(skip(job), fields(url = %job.url))]
pub async fn run(job: &AuditJob) -> Result<Value> {
    let settings = EngineSettings::from_value(&job.settings)?;

    let (browser, mut handler) = Browser::connect(job.browser_ws.as_str())
        .await
        .with_context(|| format!("Failed to connect to browser at {}", job.browser_ws))?;

    // Spawn handler to process browser events
    let handler_task = tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
    });

    let outcome = audit_in_new_page(&browser, job, &settings).await;
    handler_task.abort();
    outcome
}

/// Target params for a blank page inside `context`
fn isolated_target(context: BrowserContextId) -> Result<CreateTargetParams> {
    CreateTargetParams::builder()
        .url("about:blank")
        .browser_context_id(context)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build target params: {}", e))
}

async fn audit_in_new_page(browser: &Browser, job: &AuditJob, settings: &EngineSettings) -> Result<Value> {
    let context = browser
        .execute(CreateBrowserContextParams::default())
        .await
        .context("Failed to create browser context")?
        .result
        .browser_context_id;
    debug!("Created browser context {:?}", context);

    let outcome = match browser.new_page(isolated_target(context.clone())?).await {
        Ok(page) => {
            let outcome = measure(&page, job, settings).await;
            if let Err(e) = page.close().await {
                warn!("Failed to close page: {}", e);
            }
            outcome
        }
        Err(e) => Err(e).context("Failed to create page"),
    };

    if let Err(e) = browser.execute(DisposeBrowserContextParams::new(context)).await {
        warn!("Failed to dispose browser context: {}", e);
    }
    outcome
}

async fn measure(page: &Page, job: &AuditJob, settings: &EngineSettings) -> Result<Value> {
    throttling::apply_settings(page, settings).await?;
    if let Some(auth) = &job.auth {
        auth::apply(page, auth, &job.url).await?;
    }

    let collector = VitalsCollector::default();
    collector.inject_into_page(page).await?;

    let budget = settings.max_wait_for_load();
    let started = Instant::now();
    info!("Navigating as {:?} (budget {:?})", settings.form_factor, budget);
    timeout(budget, page.goto(job.url.as_str()))
        .await
        .map_err(|_| anyhow::anyhow!("Page did not load within {:?}", budget))?
        .with_context(|| format!("Failed to navigate to {}", job.url))?;
    debug!("Loaded in {:?}", started.elapsed());

    let remaining = budget.saturating_sub(started.elapsed());
    let snapshot = collector.collect(page, remaining).await?;
    debug!("Snapshot: {:?}", snapshot);

    let final_url = page
        .url()
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| job.url.clone());
    Ok(scoring::build_result(&job.url, &final_url, &job.settings, &snapshot))
}

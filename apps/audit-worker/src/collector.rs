//! Core Web Vitals collection via chromiumoxide
//!
//! # How it works
//!
//! 1. A script is injected with `addScriptToEvaluateOnNewDocument`, so it runs
//!    before any page script
//! 2. PerformanceObservers record LCP, CLS, FCP and long tasks into
//!    `window.__VITALS_GATE__`
//! 3. After navigation the collector polls that object until LCP shows up
//!    (or the wait budget runs out), lets the page settle, and reads a
//!    final [`VitalsSnapshot`]

use anyhow::{Context, Result};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::Page;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, instrument, warn};

/// Interval between polls of the page state
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Metrics read from the page. Anything the browser did not report is `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VitalsSnapshot {
    /// Largest Contentful Paint (ms)
    pub lcp: Option<f64>,
    /// Cumulative Layout Shift
    pub cls: Option<f64>,
    /// First Contentful Paint (ms)
    pub fcp: Option<f64>,
    /// Total Blocking Time after FCP (ms)
    pub tbt: Option<f64>,
    /// Time to first byte (ms)
    pub ttfb: Option<f64>,
    /// Quiet point after the last long task (ms)
    pub tti: Option<f64>,
}

/// Web Vitals collector
#[derive(Debug, Clone)]
pub struct VitalsCollector {
    /// How long to keep observing after LCP appears
    settle: Duration,
}

impl VitalsCollector {
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }

    /// Inject the observer script. Call before navigating.
    #[instrument(skip(self, page))]
    pub async fn inject_into_page(&self, page: &Page) -> Result<()> {
        let params = AddScriptToEvaluateOnNewDocumentParams::new(OBSERVER_SCRIPT);
        page.execute(params)
            .await
            .context("Failed to inject web vitals observer")?;
        debug!("Web vitals observer injected");
        Ok(())
    }

    /// Read the current metrics from the page
    pub async fn snapshot(&self, page: &Page) -> Result<VitalsSnapshot> {
        let value: serde_json::Value = page
            .evaluate(SNAPSHOT_SCRIPT)
            .await
            .context("Failed to read web vitals")?
            .into_value()
            .context("Failed to get web vitals value")?;
        serde_json::from_value(value).context("Unexpected web vitals payload")
    }

    /// Wait up to `budget` for LCP, let the page settle, then read the
    /// final snapshot. A page that never reports LCP yields whatever else
    /// was observed.
    #[instrument(skip(self, page))]
    pub async fn collect(&self, page: &Page, budget: Duration) -> Result<VitalsSnapshot> {
        let waited = timeout(budget, async {
            loop {
                let snapshot = self.snapshot(page).await?;
                if snapshot.lcp.is_some() {
                    return Ok::<_, anyhow::Error>(snapshot);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await;

        match waited {
            Ok(Ok(snapshot)) => debug!("LCP observed: {:?}", snapshot.lcp),
            Ok(Err(e)) => return Err(e),
            Err(_) => warn!("No LCP reported within {:?}", budget),
        }

        let settle_until = Instant::now() + self.settle;
        tokio::time::sleep_until(settle_until).await;
        self.snapshot(page).await
    }
}

impl Default for VitalsCollector {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000))
    }
}

const OBSERVER_SCRIPT: &str = r#"
(function() {
    'use strict';

    const state = { lcp: null, cls: 0, fcp: null, longTasks: [] };
    window.__VITALS_GATE__ = state;

    function observe(type, callback) {
        try {
            new PerformanceObserver((list) => list.getEntries().forEach(callback))
                .observe({ type: type, buffered: true });
        } catch (e) {
            console.warn('vitals-gate: ' + type + ' observer not supported');
        }
    }

    observe('largest-contentful-paint', (entry) => {
        state.lcp = entry.renderTime || entry.loadTime || entry.startTime;
    });
    observe('layout-shift', (entry) => {
        if (!entry.hadRecentInput) {
            state.cls += entry.value;
        }
    });
    observe('paint', (entry) => {
        if (entry.name === 'first-contentful-paint') {
            state.fcp = entry.startTime;
        }
    });
    observe('longtask', (entry) => {
        state.longTasks.push({ start: entry.startTime, duration: entry.duration });
    });
})();
"#;

const SNAPSHOT_SCRIPT: &str = r#"
(function() {
    const state = window.__VITALS_GATE__ || { lcp: null, cls: null, fcp: null, longTasks: [] };
    const nav = performance.getEntriesByType('navigation')[0];
    const fcp = state.fcp;

    let tbt = null;
    let lastLongTaskEnd = 0;
    if (fcp !== null) {
        tbt = 0;
        for (const task of state.longTasks) {
            const end = task.start + task.duration;
            lastLongTaskEnd = Math.max(lastLongTaskEnd, end);
            if (task.start >= fcp) {
                tbt += Math.max(0, task.duration - 50);
            }
        }
    }

    let tti = null;
    if (fcp !== null) {
        const domReady = nav ? nav.domContentLoadedEventEnd : 0;
        tti = Math.max(fcp, domReady, lastLongTaskEnd);
    }

    return {
        lcp: state.lcp,
        cls: state.cls,
        fcp: fcp,
        tbt: tbt,
        ttfb: nav ? nav.responseStart : null,
        tti: tti
    };
})()
"#;

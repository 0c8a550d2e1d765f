//! Shared fixtures for pipeline tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vitals_gate_core::error::WorkerError;
use vitals_gate_core::pool::{BrowserLauncher, BrowserProcess};
use vitals_gate_core::{AuditEngine, AuditRequest};

/// Route test logs through the test writer; safe to call from every test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("vitals_gate_core=debug")
        .with_test_writer()
        .try_init();
}

/// A result shaped like the worker's output
pub fn engine_result(lcp: f64, cls: f64, score: f64) -> Value {
    json!({
        "categories": { "performance": { "score": score } },
        "audits": {
            "largest-contentful-paint": { "numericValue": lcp },
            "cumulative-layout-shift": { "numericValue": cls },
            "total-blocking-time": { "displayValue": "120 ms" }
        }
    })
}

/// Engine that answers per URL and can fail the first N calls for a URL
#[derive(Default)]
pub struct ScriptedEngine {
    results: HashMap<String, Value>,
    failures: Mutex<HashMap<String, u32>>,
    delay: Option<Duration>,
    pub requests: Mutex<Vec<AuditRequest>>,
    pub cleanups: AtomicU32,
    in_flight: AtomicUsize,
    /// Most audits ever running at once
    pub peak_in_flight: AtomicUsize,
}

/// Counts an audit as in flight until dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, url: &str, result: Value) -> Self {
        self.results.insert(url.to_string(), result);
        self
    }

    pub fn failing_first(self, url: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(url.to_string(), times);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<AuditRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|r| r.url == url).count()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditEngine for ScriptedEngine {
    async fn audit(&self, request: AuditRequest) -> Result<Value, WorkerError> {
        self.requests.lock().unwrap().push(request.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&request.url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(WorkerError::Audit("navigation failed".to_string()));
                }
            }
        }

        self.results
            .get(&request.url)
            .cloned()
            .ok_or_else(|| WorkerError::Audit(format!("no result for {}", request.url)))
    }

    async fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Launcher whose processes only hand out a fake endpoint
pub struct FakeLauncher {
    pub launched: Arc<AtomicU32>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            launched: Arc::new(AtomicU32::new(0)),
        }
    }
}

struct FakeBrowser {
    endpoint: String,
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> anyhow::Result<Box<dyn BrowserProcess>> {
        let n = self.launched.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeBrowser {
            endpoint: format!("ws://127.0.0.1:9222/devtools/browser/fake-{}", n),
        }))
    }
}

#[async_trait]
impl BrowserProcess for FakeBrowser {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn kill(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

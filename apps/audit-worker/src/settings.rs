//! Engine settings
//!
//! The resolved profile arrives as an opaque JSON object. This module reads
//! the keys the worker understands and ignores everything else.

use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Default navigation budget when `maxWaitForLoadMs` is absent
const DEFAULT_MAX_WAIT_FOR_LOAD_MS: u64 = 45_000;

/// Typed view of a resolved profile's settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    #[serde(default)]
    pub form_factor: FormFactor,
    #[serde(default)]
    pub screen_emulation: Option<ScreenEmulation>,
    #[serde(default)]
    pub throttling: Option<Throttling>,
    #[serde(default)]
    pub throttling_method: ThrottlingMethod,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub max_wait_for_load_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormFactor {
    #[default]
    Desktop,
    Mobile,
}

/// Viewport emulation
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenEmulation {
    pub width: i64,
    pub height: i64,
    #[serde(default = "default_scale")]
    pub device_scale_factor: f64,
    #[serde(default)]
    pub mobile: bool,
    /// Leave the browser's own viewport alone
    #[serde(default)]
    pub disabled: bool,
}

fn default_scale() -> f64 {
    1.0
}

/// Simulated network and CPU conditions
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Throttling {
    /// Added round-trip latency
    #[serde(default)]
    pub rtt_ms: f64,
    /// Download bandwidth; 0 means unthrottled
    #[serde(default)]
    pub throughput_kbps: f64,
    /// Upload bandwidth; 0 means unthrottled
    #[serde(default)]
    pub upload_throughput_kbps: f64,
    /// CPU slowdown factor (1 = none)
    #[serde(default = "default_cpu")]
    pub cpu_slowdown_multiplier: f64,
}

fn default_cpu() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottlingMethod {
    /// Apply throttling through DevTools
    #[default]
    Devtools,
    /// Conditions are provided externally; apply nothing
    Provided,
}

impl EngineSettings {
    /// Parse settings, ignoring unknown keys
    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone()).context("Invalid engine settings")
    }

    /// Throttling to apply through DevTools, if any
    pub fn devtools_throttling(&self) -> Option<&Throttling> {
        match self.throttling_method {
            ThrottlingMethod::Devtools => self.throttling.as_ref(),
            ThrottlingMethod::Provided => None,
        }
    }

    /// Screen emulation to apply, if any
    pub fn active_screen_emulation(&self) -> Option<&ScreenEmulation> {
        self.screen_emulation.as_ref().filter(|s| !s.disabled)
    }

    pub fn max_wait_for_load(&self) -> Duration {
        Duration::from_millis(self.max_wait_for_load_ms.unwrap_or(DEFAULT_MAX_WAIT_FOR_LOAD_MS))
    }
}

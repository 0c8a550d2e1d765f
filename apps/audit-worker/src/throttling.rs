//! Device and network emulation via Chrome DevTools Protocol
//!
//! Network conditions use `Network.emulateNetworkConditions`, CPU slowdown
//! uses `Emulation.setCPUThrottlingRate`, and the viewport is set with
//! `Emulation.setDeviceMetricsOverride`.

#![allow(deprecated)] // EmulateNetworkConditionsParams is deprecated but still functional

use anyhow::Result;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetCpuThrottlingRateParams, SetDeviceMetricsOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    ConnectionType, EmulateNetworkConditionsParams, SetUserAgentOverrideParams,
};
use chromiumoxide::Page;
use tracing::{debug, instrument};

use crate::settings::{EngineSettings, ScreenEmulation, Throttling};

/// Bytes per second for a kilobit rate; -1 disables the limit
fn throughput_bytes(kbps: f64) -> f64 {
    if kbps > 0.0 {
        kbps * 1024.0 / 8.0
    } else {
        -1.0
    }
}

/// Network throttling controller
pub struct NetworkThrottler;

impl NetworkThrottler {
    /// Apply latency and bandwidth limits to a page
    #[instrument(skip(page))]
    pub async fn apply(page: &Page, throttling: &Throttling) -> Result<()> {
        let download = throughput_bytes(throttling.throughput_kbps);
        let upload = throughput_bytes(throttling.upload_throughput_kbps);
        debug!(
            "Applying network throttling: latency={}ms, down={:.2} KB/s, up={:.2} KB/s",
            throttling.rtt_ms,
            download / 1024.0,
            upload / 1024.0
        );

        let params = EmulateNetworkConditionsParams::builder()
            .offline(false)
            .latency(throttling.rtt_ms.max(0.0))
            .download_throughput(download)
            .upload_throughput(upload)
            .connection_type(ConnectionType::Cellular4g) // Generic type for throttled connections
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build network params: {}", e))?;

        page.execute(params).await?;
        Ok(())
    }
}

/// CPU throttling controller
pub struct CpuThrottler;

impl CpuThrottler {
    /// Apply a CPU slowdown multiplier (1.0 = no throttling)
    #[instrument(skip(page), fields(rate = %rate))]
    pub async fn apply(page: &Page, rate: f64) -> Result<()> {
        if rate < 1.0 {
            anyhow::bail!("CPU throttling rate must be >= 1.0 (got {})", rate);
        }

        debug!("Applying CPU throttling with {}x slowdown", rate);

        let params = SetCpuThrottlingRateParams::builder()
            .rate(rate)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build CPU params: {}", e))?;

        page.execute(params).await?;
        Ok(())
    }
}

/// Viewport and user agent emulation
pub struct DeviceEmulator;

impl DeviceEmulator {
    #[instrument(skip(page))]
    pub async fn apply_screen(page: &Page, screen: &ScreenEmulation) -> Result<()> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(screen.width)
            .height(screen.height)
            .device_scale_factor(screen.device_scale_factor)
            .mobile(screen.mobile)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build device metrics params: {}", e))?;

        page.execute(params).await?;
        Ok(())
    }

    pub async fn apply_user_agent(page: &Page, user_agent: &str) -> Result<()> {
        debug!("Overriding user agent");
        page.execute(SetUserAgentOverrideParams::new(user_agent)).await?;
        Ok(())
    }
}

/// Apply every emulation the settings ask for, before navigation
pub async fn apply_settings(page: &Page, settings: &EngineSettings) -> Result<()> {
    if let Some(screen) = settings.active_screen_emulation() {
        DeviceEmulator::apply_screen(page, screen).await?;
    }
    if let Some(user_agent) = &settings.user_agent {
        DeviceEmulator::apply_user_agent(page, user_agent).await?;
    }
    if let Some(throttling) = settings.devtools_throttling() {
        NetworkThrottler::apply(page, throttling).await?;
        if throttling.cpu_slowdown_multiplier > 1.0 {
            CpuThrottler::apply(page, throttling.cpu_slowdown_multiplier).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throughput_conversion() {
        // 1638.4 Kbps is the slow-4G preset: 204.8 KB/s
        assert!((throughput_bytes(1638.4) - 209_715.2).abs() < 1e-6);
        assert_eq!(throughput_bytes(8.0), 1024.0);
    }

    #[test]
    fn test_zero_throughput_is_unthrottled() {
        assert_eq!(throughput_bytes(0.0), -1.0);
        assert_eq!(throughput_bytes(-5.0), -1.0);
    }
}

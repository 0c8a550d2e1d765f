//! Authentication injection
//!
//! Headers are sent with every request via `Network.setExtraHTTPHeaders`;
//! cookies are set up front via `Network.setCookies`. A cookie without a
//! domain is scoped to the audited URL.

use anyhow::{Context, Result};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, Headers, SetExtraHttpHeadersParams,
};
use chromiumoxide::Page;
use tracing::debug;
use vitals_gate_core::auth::{AuthConfig, AuthCookie};

/// Build CDP cookie params for `url`
pub fn cookie_params(cookies: &[AuthCookie], url: &str) -> Result<Vec<CookieParam>> {
    cookies
        .iter()
        .map(|cookie| {
            let mut builder = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone());
            builder = match &cookie.domain {
                Some(domain) => builder.domain(domain.clone()),
                None => builder.url(url.to_string()),
            };
            if let Some(path) = &cookie.path {
                builder = builder.path(path.clone());
            }
            builder
                .build()
                .map_err(|e| anyhow::anyhow!("Invalid cookie '{}': {}", cookie.name, e))
        })
        .collect()
}

/// Apply headers and cookies to `page` before it navigates to `url`
pub async fn apply(page: &Page, auth: &AuthConfig, url: &str) -> Result<()> {
    if !auth.headers.is_empty() {
        debug!("Setting {} extra HTTP headers", auth.headers.len());
        let headers = Headers::new(serde_json::to_value(&auth.headers)?);
        page.execute(SetExtraHttpHeadersParams::new(headers))
            .await
            .context("Failed to set extra HTTP headers")?;
    }

    if !auth.cookies.is_empty() {
        debug!("Setting {} cookies", auth.cookies.len());
        page.set_cookies(cookie_params(&auth.cookies, url)?)
            .await
            .context("Failed to set cookies")?;
    }

    Ok(())
}

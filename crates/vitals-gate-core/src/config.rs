//! Run configuration
//!
//! This module provides the configuration model for an audit run: the
//! targets under test, custom profiles, concurrency/retry/timeout limits,
//! assertions, baseline and output settings. Configuration can be loaded
//! from a TOML or JSON file; discovery and layering of several sources is
//! left to the caller.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::assertions::AssertionsConfig;
use crate::auth::AuthConfig;
use crate::baseline::BaselineConfig;
use crate::error::ConfigError;
use crate::profiles::Profile;
use crate::report::OutputConfig;

/// Main configuration structure for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// URLs under test
    pub targets: Vec<Target>,
    /// Custom profiles; a custom profile replaces a built-in with the same id
    #[serde(default)]
    pub profiles: Vec<Profile>,
    /// Profile used for targets without an override (default: "desktop")
    #[serde(default = "default_profile")]
    pub default_profile: String,
    /// Maximum number of audits in flight (default: 1)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries after the first failed attempt (default: 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-attempt timeout (default: 120000ms)
    #[serde(default = "default_timeout", rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Number of pooled browser instances (default: `concurrency`)
    #[serde(default)]
    pub pool_size: Option<usize>,
    /// Thresholds and baseline delta rules
    #[serde(default)]
    pub assertions: Option<AssertionsConfig>,
    /// Baseline used for delta assertions
    #[serde(default)]
    pub baseline: Option<BaselineConfig>,
    /// Where to write the run summary
    #[serde(default)]
    pub output: Option<OutputConfig>,
    /// Audit engine process settings
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// A URL under test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Unique id within the configuration
    pub id: String,
    /// Absolute http(s) URL
    pub url: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tags used for threshold overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Profile to use instead of the run default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// Target-level auth, merged over the profile's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

impl Target {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            name: None,
            tags: Vec::new(),
            profile: None,
            auth: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// How the audit engine process is launched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Engine executable (default: `audit-worker` next to the current binary)
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Extra arguments passed before the engine's own flags
    #[serde(default)]
    pub args: Vec<String>,
    /// Directory for result files (default: the system temp dir)
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
    /// Launch Chrome with a visible window
    #[serde(default)]
    pub headful: bool,
}

fn default_profile() -> String {
    "desktop".to_string()
}

fn default_concurrency() -> usize {
    1
}

fn default_max_retries() -> u32 {
    2
}

fn default_timeout() -> Duration {
    Duration::from_millis(120_000)
}

impl RunConfig {
    /// Build a configuration with defaults for everything but the targets
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets,
            profiles: Vec::new(),
            default_profile: default_profile(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            timeout: default_timeout(),
            pool_size: None,
            assertions: None,
            baseline: None,
            output: None,
            worker: WorkerConfig::default(),
        }
    }

    /// Load configuration from a file.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as TOML.
    /// The result is validated before it is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or fails
    /// [`RunConfig::validate`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&content)?
        } else {
            Self::from_str(&content)?
        };

        // Relative baseline/output paths are relative to the config file
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(config.rebase_paths(base_dir))
    }

    /// Parse and validate configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a JSON string
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the structural invariants of the configuration.
    ///
    /// Profile references are checked later, when the profile resolver is
    /// built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("at least one target is required".into()));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "target with url '{}' has an empty id",
                    target.url
                )));
            }
            if !seen.insert(target.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target id '{}'",
                    target.id
                )));
            }
            validate_url(&target.id, &target.url)?;
        }

        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::Invalid("timeout_ms must be positive".into()));
        }
        if self.pool_size == Some(0) {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        if self.default_profile.trim().is_empty() {
            return Err(ConfigError::Invalid("default_profile must not be empty".into()));
        }

        Ok(())
    }

    /// Number of browser instances to pool
    pub fn effective_pool_size(&self) -> usize {
        self.pool_size.unwrap_or(self.concurrency).max(1)
    }

    fn rebase_paths(mut self, base_dir: &Path) -> Self {
        let rebase = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base_dir.join(&*p);
            }
        };
        if let Some(path) = self.baseline.as_mut().and_then(|b| b.path.as_mut()) {
            rebase(path);
        }
        if let Some(path) = self.output.as_mut().and_then(|o| o.path.as_mut()) {
            rebase(path);
        }
        self
    }
}

fn validate_url(id: &str, raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ConfigError::Invalid(format!("target '{}' has invalid url '{}': {}", id, raw, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.has_host() => Ok(()),
        _ => Err(ConfigError::Invalid(format!(
            "target '{}' url must be an absolute http(s) url, got '{}'",
            id, raw
        ))),
    }
}

/// Serde module for serializing/deserializing Duration as milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::MatchBy;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [[targets]]
            id = "home"
            url = "https://example.com/"
        "#;

        let config = RunConfig::from_str(toml).unwrap();
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.default_profile, "desktop");
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.timeout, Duration::from_millis(120_000));
        assert_eq!(config.effective_pool_size(), 1);
        assert!(config.assertions.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r##"
            default_profile = "mobile"
            concurrency = 3
            max_retries = 1
            timeout_ms = 45000
            pool_size = 2

            [[targets]]
            id = "home"
            url = "https://example.com/"
            tags = ["critical"]

            [[targets]]
            id = "login"
            url = "https://example.com/login"
            profile = "desktop"
            [targets.auth.headers]
            Authorization = "Bearer ${TOKEN}"

            [[profiles]]
            id = "tablet"
            extends = "mobile"
            settings = { screenEmulation = { width = 800 } }

            [assertions.metrics.lcp]
            max = 2500.0

            [assertions.tags.critical.lcp]
            max = 2000.0

            [baseline]
            path = "baseline.json"
            match_by = "url"

            [output]
            path = "summary.json"
        "##;

        let config = RunConfig::from_str(toml).unwrap();
        assert_eq!(config.default_profile, "mobile");
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.timeout, Duration::from_secs(45));
        assert_eq!(config.effective_pool_size(), 2);
        assert_eq!(config.targets[1].profile.as_deref(), Some("desktop"));
        assert_eq!(
            config.targets[1].auth.as_ref().unwrap().headers["Authorization"],
            "Bearer ${TOKEN}"
        );
        assert_eq!(config.profiles[0].extends.as_deref(), Some("mobile"));
        assert_eq!(config.baseline.as_ref().unwrap().match_by, MatchBy::Url);
        let assertions = config.assertions.unwrap();
        assert_eq!(assertions.metrics["lcp"].max, Some(2500.0));
        assert_eq!(assertions.tags["critical"]["lcp"].max, Some(2000.0));
    }

    #[test]
    fn test_parse_json_config() {
        let json = r#"{
            "targets": [{ "id": "home", "url": "http://localhost:3000" }],
            "concurrency": 2,
            "timeout_ms": 1000
        }"#;
        let config = RunConfig::from_json_str(json).unwrap();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_rejects_no_targets() {
        let err = RunConfig::from_json_str(r#"{ "targets": [] }"#).unwrap_err();
        assert!(err.to_string().contains("at least one target"));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let config = RunConfig::new(vec![
            Target::new("a", "https://example.com/1"),
            Target::new("a", "https://example.com/2"),
        ]);
        assert!(config.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_relative_or_non_http_urls() {
        for url in ["/relative", "example.com", "ftp://example.com/file", "mailto:a@b.c"] {
            let config = RunConfig::new(vec![Target::new("t", url)]);
            assert!(config.validate().is_err(), "{} should be rejected", url);
        }
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut config = RunConfig::new(vec![Target::new("t", "https://example.com")]);
        config.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::new(vec![Target::new("t", "https://example.com")]);
        config.timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = RunConfig::new(vec![Target::new("t", "https://example.com")]);
        config.pool_size = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_rebases_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vitals.toml");
        std::fs::write(
            &path,
            r#"
                [[targets]]
                id = "home"
                url = "https://example.com/"

                [baseline]
                path = "baseline.json"
            "#,
        )
        .unwrap();

        let config = RunConfig::from_file(&path).unwrap();
        assert_eq!(
            config.baseline.unwrap().path.unwrap(),
            dir.path().join("baseline.json")
        );
    }

    #[test]
    fn test_from_file_missing() {
        let err = RunConfig::from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

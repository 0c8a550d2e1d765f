//! Configuration profiles and inheritance resolution
//!
//! A profile is a named bundle of engine settings (device emulation, network
//! and CPU throttling). Profiles may `extends` another profile; resolution
//! walks the chain depth-first and deep-merges the derived settings over the
//! base. Objects merge key by key, while arrays and scalars are replaced
//! wholesale by the more specific profile.
//!
//! ```text
//!   mobile-slow-3g ──extends──▶ mobile
//!        │                         │
//!        └── throttling.rttMs ─────┴── screenEmulation, formFactor, ...
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::auth::AuthConfig;
use crate::error::ProfileError;

/// A named, inheritable bundle of audit-engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Unique profile id
    pub id: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Opaque engine configuration
    #[serde(default = "empty_settings")]
    pub settings: Value,
    /// Id of the base profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    /// Auth applied to every target audited with this profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
}

fn empty_settings() -> Value {
    Value::Object(Map::new())
}

impl Profile {
    pub fn new(id: impl Into<String>, settings: Value) -> Self {
        Self {
            id: id.into(),
            name: None,
            settings,
            extends: None,
            auth: None,
        }
    }

    pub fn extending(mut self, base: impl Into<String>) -> Self {
        self.extends = Some(base.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Profiles shipped with the engine
pub fn builtin_profiles() -> Vec<Profile> {
    vec![
        Profile::new(
            "desktop",
            json!({
                "formFactor": "desktop",
                "screenEmulation": {
                    "mobile": false,
                    "width": 1350,
                    "height": 940,
                    "deviceScaleFactor": 1,
                    "disabled": false
                },
                "throttlingMethod": "devtools",
                "throttling": {
                    "rttMs": 40,
                    "throughputKbps": 10240,
                    "uploadThroughputKbps": 10240,
                    "cpuSlowdownMultiplier": 1
                }
            }),
        )
        .with_name("Desktop"),
        Profile::new(
            "mobile",
            json!({
                "formFactor": "mobile",
                "screenEmulation": {
                    "mobile": true,
                    "width": 412,
                    "height": 823,
                    "deviceScaleFactor": 1.75,
                    "disabled": false
                },
                "throttlingMethod": "devtools",
                "throttling": {
                    "rttMs": 150,
                    "throughputKbps": 1638.4,
                    "uploadThroughputKbps": 675,
                    "cpuSlowdownMultiplier": 4
                }
            }),
        )
        .with_name("Mobile (Slow 4G)"),
        Profile::new(
            "mobile-slow-3g",
            json!({
                "throttling": {
                    "rttMs": 562.5,
                    "throughputKbps": 400,
                    "uploadThroughputKbps": 400
                }
            }),
        )
        .with_name("Mobile (Slow 3G)")
        .extending("mobile"),
        Profile::new(
            "desktop-unthrottled",
            json!({
                "throttlingMethod": "provided",
                "throttling": {
                    "rttMs": 0,
                    "throughputKbps": 0,
                    "uploadThroughputKbps": 0,
                    "cpuSlowdownMultiplier": 1
                }
            }),
        )
        .with_name("Desktop (no throttling)")
        .extending("desktop"),
    ]
}

/// Resolves profile ids into fully merged profiles
///
/// The registry is immutable after construction, so resolution is pure and
/// may be repeated freely.
#[derive(Debug, Clone)]
pub struct ProfileResolver {
    registry: BTreeMap<String, Profile>,
}

impl ProfileResolver {
    /// Build a resolver seeded with the built-in profiles, then `custom`.
    ///
    /// A custom profile with the id of a built-in replaces it.
    pub fn new(custom: impl IntoIterator<Item = Profile>) -> Self {
        let mut registry = BTreeMap::new();
        for profile in builtin_profiles() {
            registry.insert(profile.id.clone(), profile);
        }
        for profile in custom {
            debug!("Registering profile '{}'", profile.id);
            registry.insert(profile.id.clone(), profile);
        }
        Self { registry }
    }

    /// Build a resolver with no built-ins
    pub fn without_builtins(profiles: impl IntoIterator<Item = Profile>) -> Self {
        Self {
            registry: profiles
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect(),
        }
    }

    /// All registered profiles, unresolved, ordered by id
    pub fn list_profiles(&self) -> Vec<&Profile> {
        self.registry.values().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry.contains_key(id)
    }

    /// Resolve `id`, following `extends` links. The returned profile has no
    /// `extends` left.
    pub fn get_profile(&self, id: &str) -> Result<Profile, ProfileError> {
        let mut visiting = Vec::new();
        self.resolve(id, None, &mut visiting)
    }

    fn resolve(
        &self,
        id: &str,
        referenced_by: Option<&str>,
        visiting: &mut Vec<String>,
    ) -> Result<Profile, ProfileError> {
        if visiting.iter().any(|v| v == id) {
            let start = visiting.iter().position(|v| v == id).unwrap_or(0);
            let mut chain: Vec<String> = visiting[start..].to_vec();
            chain.push(id.to_string());
            return Err(ProfileError::Cycle { chain });
        }

        let profile = match (self.registry.get(id), referenced_by) {
            (Some(p), _) => p,
            (None, Some(child)) => {
                return Err(ProfileError::BaseNotFound {
                    base: id.to_string(),
                    profile: child.to_string(),
                })
            }
            (None, None) => return Err(ProfileError::NotFound(id.to_string())),
        };

        if !profile.settings.is_object() {
            return Err(ProfileError::InvalidSettings(id.to_string()));
        }

        let Some(base_id) = profile.extends.as_deref() else {
            return Ok(profile.clone());
        };

        visiting.push(id.to_string());
        let base = self.resolve(base_id, Some(id), visiting)?;
        visiting.pop();

        let mut settings = base.settings;
        deep_merge(&mut settings, &profile.settings);

        Ok(Profile {
            id: profile.id.clone(),
            name: profile.name.clone().or(base.name),
            settings,
            extends: None,
            auth: profile.auth.clone().or(base.auth),
        })
    }
}

impl Default for ProfileResolver {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Deep-merge `overlay` into `base`.
///
/// Objects merge recursively; any other value in `overlay` (arrays
/// included) replaces the value in `base`.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

//! Authentication material for audited pages
//!
//! Targets and profiles may both carry headers and cookies. They are merged
//! per task and every `${VAR}` / `$VAR` reference is substituted from the
//! environment before the audit starts. Resolution fails closed: a single
//! missing variable aborts the task instead of auditing anonymously.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::AuthError;

/// Headers and cookies applied before navigation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Extra request headers
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Cookies set on the browser before navigation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<AuthCookie>,
}

/// A single cookie
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl AuthConfig {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.cookies.is_empty()
    }

    /// Merge profile-level and target-level auth.
    ///
    /// Target headers replace profile headers with the same (case-insensitive)
    /// name. Cookies are concatenated target-after-profile; a profile cookie
    /// whose name the target also sets is dropped.
    pub fn merge(profile: Option<&AuthConfig>, target: Option<&AuthConfig>) -> Option<AuthConfig> {
        match (profile, target) {
            (None, None) => None,
            (Some(p), None) => Some(p.clone()),
            (None, Some(t)) => Some(t.clone()),
            (Some(p), Some(t)) => {
                let mut headers = p.headers.clone();
                for (key, value) in &t.headers {
                    headers.retain(|existing, _| !existing.eq_ignore_ascii_case(key));
                    headers.insert(key.clone(), value.clone());
                }

                let mut cookies: Vec<AuthCookie> = p
                    .cookies
                    .iter()
                    .filter(|c| !t.cookies.iter().any(|tc| tc.name == c.name))
                    .cloned()
                    .collect();
                cookies.extend(t.cookies.iter().cloned());

                Some(AuthConfig { headers, cookies })
            }
        }
    }

    /// Names of every environment variable this config references
    pub fn referenced_variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        let values = self
            .headers
            .values()
            .chain(self.cookies.iter().map(|c| &c.value));
        for value in values {
            for name in variable_names(value) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Substitute environment variables into header and cookie values
    pub fn resolve(&self) -> Result<AuthConfig, AuthError> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Substitute variables using a custom lookup
    pub fn resolve_with<F>(&self, lookup: F) -> Result<AuthConfig, AuthError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let missing: Vec<String> = self
            .referenced_variables()
            .into_iter()
            .filter(|name| lookup(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(AuthError::MissingVariables(missing));
        }

        let headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, &lookup)))
            .collect();
        let cookies = self
            .cookies
            .iter()
            .map(|c| AuthCookie {
                value: substitute(&c.value, &lookup),
                ..c.clone()
            })
            .collect();

        Ok(AuthConfig { headers, cookies })
    }
}

/// A piece of a templated string
enum Segment<'a> {
    Literal(&'a str),
    Variable(&'a str),
}

fn is_var_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_var_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn segments(input: &str) -> Vec<Segment<'_>> {
    let bytes = input.as_bytes();
    let mut out = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' || i + 1 >= bytes.len() {
            i += 1;
            continue;
        }

        let (name_start, name_end, next) = if bytes[i + 1] == b'{' {
            match input[i + 2..].find('}') {
                Some(offset) => (i + 2, i + 2 + offset, i + 3 + offset),
                None => {
                    i += 1;
                    continue;
                }
            }
        } else if is_var_start(bytes[i + 1]) {
            let mut end = i + 1;
            while end < bytes.len() && is_var_char(bytes[end]) {
                end += 1;
            }
            (i + 1, end, end)
        } else {
            i += 1;
            continue;
        };

        if name_start == name_end {
            i = next;
            continue;
        }

        if literal_start < i {
            out.push(Segment::Literal(&input[literal_start..i]));
        }
        out.push(Segment::Variable(&input[name_start..name_end]));
        literal_start = next;
        i = next;
    }

    if literal_start < input.len() {
        out.push(Segment::Literal(&input[literal_start..]));
    }
    out
}

fn variable_names(input: &str) -> Vec<String> {
    segments(input)
        .into_iter()
        .filter_map(|s| match s {
            Segment::Variable(name) => Some(name.to_string()),
            Segment::Literal(_) => None,
        })
        .collect()
}

fn substitute<F>(input: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    segments(input)
        .into_iter()
        .map(|s| match s {
            Segment::Literal(text) => text.to_string(),
            Segment::Variable(name) => lookup(name).unwrap_or_default(),
        })
        .collect()
}

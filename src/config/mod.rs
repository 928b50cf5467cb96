//! Configuration: an immutable template plus per-request resolution.
//!
//! The template is loaded once at startup. Every key carries a default and an
//! ordered list of override rules; a rule matches on the request URI or on a
//! request header value (regular expressions, unanchored, so a plain substring
//! works too). Resolution walks each key's rules in order and the first match
//! wins. Nothing is mutated after load: each request gets its own
//! [`ResolvedConfig`] and typed [`CacheSettings`].
//!
//! ## File format
//!
//! ```json
//! {
//!   "max_stale_age": {
//!     "default": 30,
//!     "rules": [
//!       { "uri": "^/live/", "value": 0 },
//!       { "header": "X-Preview", "pattern": "^1$", "value": 0 }
//!     ]
//!   },
//!   "collapse_origin_requests": true
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::context::RequestContext;

pub mod settings;

pub use settings::CacheSettings;

/// Errors produced while loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown config key {0:?}")]
    UnknownKey(String),

    #[error("config key {key:?} expects {expected}, found {found}")]
    InvalidValue {
        key: String,
        expected: &'static str,
        found: Value,
    },

    #[error("invalid pattern in rule for {key:?}: {source}")]
    Pattern {
        key: String,
        #[source]
        source: regex::Error,
    },

    #[error("rule for {key:?} must match on either \"uri\" or \"header\" + \"pattern\"")]
    InvalidRule { key: String },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawSetting {
    Full {
        default: Option<Value>,
        #[serde(default)]
        rules: Vec<RawRule>,
    },
    Plain(Value),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    uri: Option<String>,
    header: Option<String>,
    pattern: Option<String>,
    value: Value,
}

#[derive(Debug, Clone)]
enum Matcher {
    Uri(Regex),
    Header { name: String, pattern: Regex },
}

impl Matcher {
    fn matches(&self, ctx: &RequestContext) -> bool {
        match self {
            Self::Uri(pattern) => pattern.is_match(ctx.uri()),
            Self::Header { name, pattern } => ctx
                .headers()
                .iter()
                .any(|(k, v)| k.eq_ignore_ascii_case(name) && pattern.is_match(v)),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    matcher: Matcher,
    value: Value,
}

#[derive(Debug, Clone)]
struct Setting {
    default: Value,
    rules: Vec<Rule>,
}

/// The immutable configuration template.
#[derive(Debug, Clone)]
pub struct ConfigTemplate {
    settings: BTreeMap<String, Setting>,
}

impl Default for ConfigTemplate {
    /// Built-in defaults for every key, no override rules.
    fn default() -> Self {
        let settings = settings::defaults()
            .into_iter()
            .map(|(key, default)| {
                (
                    key.to_owned(),
                    Setting {
                        default,
                        rules: Vec::new(),
                    },
                )
            })
            .collect();
        Self { settings }
    }
}

impl ConfigTemplate {
    /// Loads a template from a JSON file, layered over the built-in defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the file cannot be read or any key, value, or rule is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Parses a template from JSON text, layered over the built-in defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if any key, value, or rule is invalid.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let raw: BTreeMap<String, RawSetting> = serde_json::from_str(text)?;
        let mut template = Self::default();

        for (key, raw_setting) in raw {
            let Some(setting) = template.settings.get_mut(&key) else {
                return Err(ConfigError::UnknownKey(key));
            };
            let (default, raw_rules) = match raw_setting {
                RawSetting::Full { default, rules } => (default, rules),
                RawSetting::Plain(value) => (Some(value), Vec::new()),
            };
            if let Some(default) = default {
                settings::validate(&key, &default)?;
                setting.default = default;
            }
            for raw_rule in raw_rules {
                settings::validate(&key, &raw_rule.value)?;
                let matcher = compile_matcher(&key, &raw_rule)?;
                setting.rules.push(Rule {
                    matcher,
                    value: raw_rule.value,
                });
            }
            debug!(key = %key, rules = setting.rules.len(), "config key loaded");
        }

        if let Ok(defaults) = CacheSettings::from_resolved(&template.defaults()) {
            defaults.check_lease_contract();
        }
        Ok(template)
    }

    /// The defaults alone, as if no rule matched.
    pub fn defaults(&self) -> ResolvedConfig {
        ResolvedConfig {
            values: self
                .settings
                .iter()
                .map(|(k, s)| (k.clone(), s.default.clone()))
                .collect(),
        }
    }

    /// Resolves every key for `ctx`: the first matching rule wins, otherwise the default.
    pub fn resolve(&self, ctx: &RequestContext) -> ResolvedConfig {
        let values = self
            .settings
            .iter()
            .map(|(key, setting)| {
                let value = setting
                    .rules
                    .iter()
                    .find(|rule| rule.matcher.matches(ctx))
                    .map_or(&setting.default, |rule| &rule.value);
                (key.clone(), value.clone())
            })
            .collect();
        ResolvedConfig { values }
    }

    /// Resolves and converts to the typed [`CacheSettings`].
    ///
    /// # Errors
    ///
    /// Only if the template holds a value that bypassed load-time validation.
    pub fn settings_for(&self, ctx: &RequestContext) -> Result<CacheSettings, ConfigError> {
        CacheSettings::from_resolved(&self.resolve(ctx))
    }
}

fn compile_matcher(key: &str, rule: &RawRule) -> Result<Matcher, ConfigError> {
    let compile = |pattern: &str| {
        Regex::new(pattern).map_err(|source| ConfigError::Pattern {
            key: key.to_owned(),
            source,
        })
    };
    match (&rule.uri, &rule.header, &rule.pattern) {
        (Some(uri), None, None) => Ok(Matcher::Uri(compile(uri)?)),
        (None, Some(name), Some(pattern)) => Ok(Matcher::Header {
            name: name.clone(),
            pattern: compile(pattern)?,
        }),
        _ => Err(ConfigError::InvalidRule {
            key: key.to_owned(),
        }),
    }
}

/// One request's resolved `key → value` mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    values: BTreeMap<String, Value>,
}

impl ResolvedConfig {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

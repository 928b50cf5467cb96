//! Known configuration keys and the typed view the cache consumes.

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use super::{ConfigError, ResolvedConfig};

pub const CACHE_ENABLED: &str = "cache_enabled";
pub const MAX_STALE_AGE: &str = "max_stale_age";
pub const COLLAPSE_ORIGIN_REQUESTS: &str = "collapse_origin_requests";
pub const CLAIM_LEASE: &str = "claim_lease";
pub const RENEW_CLAIM_LEASE: &str = "renew_claim_lease";
pub const NOTIFICATION_TIMEOUT: &str = "notification_timeout";
pub const ORIGIN_TIMEOUT: &str = "origin_timeout";
pub const BACKGROUND_REVALIDATE: &str = "background_revalidate";

#[derive(Debug, Clone, Copy)]
enum Kind {
    Flag,
    /// Whole seconds, zero allowed.
    Seconds,
    /// Whole seconds, strictly positive.
    PositiveSeconds,
}

/// Ceiling for every seconds-valued key: one year.
pub const MAX_SECONDS: u64 = 365 * 24 * 60 * 60;

const KEYS: &[(&str, Kind)] = &[
    (CACHE_ENABLED, Kind::Flag),
    (MAX_STALE_AGE, Kind::Seconds),
    (COLLAPSE_ORIGIN_REQUESTS, Kind::Flag),
    (CLAIM_LEASE, Kind::PositiveSeconds),
    (RENEW_CLAIM_LEASE, Kind::Flag),
    (NOTIFICATION_TIMEOUT, Kind::PositiveSeconds),
    (ORIGIN_TIMEOUT, Kind::PositiveSeconds),
    (BACKGROUND_REVALIDATE, Kind::Flag),
];

/// Built-in default for every known key.
pub(crate) fn defaults() -> Vec<(&'static str, Value)> {
    let d = CacheSettings::default();
    vec![
        (CACHE_ENABLED, Value::from(d.cache_enabled)),
        (MAX_STALE_AGE, Value::from(d.max_stale_age)),
        (COLLAPSE_ORIGIN_REQUESTS, Value::from(d.collapse_origin_requests)),
        (CLAIM_LEASE, Value::from(d.claim_lease.as_secs())),
        (RENEW_CLAIM_LEASE, Value::from(d.renew_claim_lease)),
        (NOTIFICATION_TIMEOUT, Value::from(d.notification_timeout.as_secs())),
        (ORIGIN_TIMEOUT, Value::from(d.origin_timeout.as_secs())),
        (BACKGROUND_REVALIDATE, Value::from(d.background_revalidate)),
    ]
}

/// Checks that `value` has the shape `key` expects.
pub(crate) fn validate(key: &str, value: &Value) -> Result<(), ConfigError> {
    let Some((_, kind)) = KEYS.iter().find(|(k, _)| *k == key) else {
        return Err(ConfigError::UnknownKey(key.to_owned()));
    };
    let in_range = |n: u64| n <= MAX_SECONDS;
    let ok = match kind {
        Kind::Flag => value.is_boolean(),
        Kind::Seconds => value.as_u64().is_some_and(in_range),
        Kind::PositiveSeconds => value.as_u64().is_some_and(|n| n > 0 && in_range(n)),
    };
    if ok {
        Ok(())
    } else {
        Err(invalid(key, *kind, value))
    }
}

fn invalid(key: &str, kind: Kind, value: &Value) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_owned(),
        expected: match kind {
            Kind::Flag => "a boolean",
            Kind::Seconds => "an integer from 0 to 31536000 (seconds)",
            Kind::PositiveSeconds => "an integer from 1 to 31536000 (seconds)",
        },
        found: value.clone(),
    }
}

/// Per-request cache behaviour, resolved from the configuration template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    /// When false the request bypasses the cache entirely.
    pub cache_enabled: bool,
    /// Stale-serving allowance in seconds.
    pub max_stale_age: i64,
    /// When false every caller fetches from origin independently.
    pub collapse_origin_requests: bool,
    /// Lease on the fetch claim. Must exceed worst-case origin latency unless
    /// `renew_claim_lease` keeps extending it.
    pub claim_lease: Duration,
    /// Leader re-issues the claim lease while its origin call is in flight.
    pub renew_claim_lease: bool,
    /// Longest a follower waits for the leader.
    pub notification_timeout: Duration,
    /// Deadline on each origin call.
    pub origin_timeout: Duration,
    /// Refresh `Warm` records in a background task instead of inline.
    pub background_revalidate: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            max_stale_age: 0,
            collapse_origin_requests: true,
            claim_lease: Duration::from_secs(15),
            renew_claim_lease: true,
            notification_timeout: Duration::from_secs(15),
            origin_timeout: Duration::from_secs(10),
            background_revalidate: true,
        }
    }
}

impl CacheSettings {
    /// Builds the typed view from a resolved key/value mapping. Keys missing
    /// from the mapping keep their built-in default.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] if a value has the wrong shape.
    pub fn from_resolved(resolved: &ResolvedConfig) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        for (key, value) in resolved.iter() {
            validate(key, value)?;
            match key {
                CACHE_ENABLED => settings.cache_enabled = flag(value),
                MAX_STALE_AGE => {
                    settings.max_stale_age = i64::try_from(seconds(value))
                        .map_err(|_| invalid(key, Kind::Seconds, value))?;
                }
                COLLAPSE_ORIGIN_REQUESTS => settings.collapse_origin_requests = flag(value),
                CLAIM_LEASE => settings.claim_lease = Duration::from_secs(seconds(value)),
                RENEW_CLAIM_LEASE => settings.renew_claim_lease = flag(value),
                NOTIFICATION_TIMEOUT => {
                    settings.notification_timeout = Duration::from_secs(seconds(value));
                }
                ORIGIN_TIMEOUT => settings.origin_timeout = Duration::from_secs(seconds(value)),
                BACKGROUND_REVALIDATE => settings.background_revalidate = flag(value),
                _ => return Err(ConfigError::UnknownKey(key.to_owned())),
            }
        }
        Ok(settings)
    }

    /// Returns `false` (and logs) when a leader could outlive its own claim:
    /// a lease no longer than the origin deadline, without renewal, lets a
    /// second leader start a duplicate origin fetch.
    pub fn check_lease_contract(&self) -> bool {
        if self.collapse_origin_requests
            && !self.renew_claim_lease
            && self.claim_lease <= self.origin_timeout
        {
            warn!(
                claim_lease = ?self.claim_lease,
                origin_timeout = ?self.origin_timeout,
                "claim lease does not exceed the origin timeout; slow fetches may be duplicated"
            );
            return false;
        }
        true
    }
}

fn flag(value: &Value) -> bool {
    value.as_bool().unwrap_or_default()
}

fn seconds(value: &Value) -> u64 {
    value.as_u64().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_validate() {
        for (key, value) in defaults() {
            validate(key, &value).unwrap();
        }
    }

    #[test]
    fn rejects_ill_typed_values() {
        assert!(matches!(
            validate(MAX_STALE_AGE, &json!(-1)),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            validate(CLAIM_LEASE, &json!(0)),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            validate(CACHE_ENABLED, &json!("yes")),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            validate("max_age", &json!(1)),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn seconds_are_bounded() {
        let huge = json!(u64::MAX);
        for key in [MAX_STALE_AGE, CLAIM_LEASE, NOTIFICATION_TIMEOUT, ORIGIN_TIMEOUT] {
            assert!(matches!(
                validate(key, &huge),
                Err(ConfigError::InvalidValue { .. })
            ));
            validate(key, &json!(MAX_SECONDS)).unwrap();
            assert!(validate(key, &json!(MAX_SECONDS + 1)).is_err());
        }
    }

    #[test]
    fn lease_contract() {
        let mut settings = CacheSettings::default();
        assert!(settings.check_lease_contract());
        settings.renew_claim_lease = false;
        assert!(settings.check_lease_contract());
        settings.claim_lease = Duration::from_secs(5);
        assert!(!settings.check_lease_contract());
    }
}

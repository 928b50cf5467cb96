//! Freshness classification and the diagnostic header text.
//!
//! Logic only ever branches on [`FreshnessState`] and [`FetchOutcome`]; the
//! strings produced by [`diagnostic`] are for the outward header alone.

use std::fmt;

use super::record::CacheRecord;

/// Name of the outward diagnostic header.
pub const DIAGNOSTIC_HEADER: &str = "X-Cache-State";

/// How usable a stored record is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FreshnessState {
    /// No record present.
    SubZero,
    /// Reserved. No transition produces it.
    Cold,
    /// Record present, remaining TTL within the stale-serving allowance.
    Warm,
    /// Record present, remaining TTL beyond the stale-serving allowance.
    Hot,
}

impl FreshnessState {
    /// Returns `true` if a servable record exists.
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Warm | Self::Hot)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SubZero => "Sub-Zero",
            Self::Cold => "Cold",
            Self::Warm => "Warm",
            Self::Hot => "Hot",
        }
    }
}

impl fmt::Display for FreshnessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a `fetch` call did. Annotates, never replaces, the freshness state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchOutcome {
    /// This call went to the origin.
    Fetched,
    /// This call waited for another caller's fetch.
    Collapsed,
    /// This call chose not to fetch and served its stale copy.
    Abstained,
}

impl FetchOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetched => "Fetched",
            Self::Collapsed => "Collapsed",
            Self::Abstained => "Abstained",
        }
    }
}

impl fmt::Display for FetchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a record against the stale-serving allowance.
///
/// With `max_stale_age = 0` a record is `Warm` only once its TTL reached 0,
/// which stores rarely report (they report the key as missing instead), so in
/// practice every present record is `Hot`. That boundary is intended.
///
/// # Examples
///
/// ```
/// use rttp_cache::cache::{classify, CacheRecord, FreshnessState};
///
/// let record = CacheRecord { status: 200, body: "hi".into(), headers: Default::default(), ttl_seconds: 5 };
/// assert_eq!(classify(None, 10), FreshnessState::SubZero);
/// assert_eq!(classify(Some(&record), 10), FreshnessState::Warm);
/// assert_eq!(classify(Some(&record), 4), FreshnessState::Hot);
/// ```
pub fn classify(record: Option<&CacheRecord>, max_stale_age: i64) -> FreshnessState {
    match record {
        None => FreshnessState::SubZero,
        Some(r) if r.ttl_seconds - max_stale_age <= 0 => FreshnessState::Warm,
        Some(_) => FreshnessState::Hot,
    }
}

/// Renders the diagnostic header value, e.g. `Hot` or `Sub-Zero; Fetched`.
pub fn diagnostic(freshness: FreshnessState, outcome: Option<FetchOutcome>) -> String {
    match outcome {
        Some(outcome) => format!("{}; {}", freshness.as_str(), outcome.as_str()),
        None => freshness.as_str().to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ttl_seconds: i64) -> CacheRecord {
        CacheRecord {
            status: 200,
            body: bytes::Bytes::from_static(b"x"),
            headers: Default::default(),
            ttl_seconds,
        }
    }

    #[test]
    fn boundary_is_warm() {
        assert_eq!(classify(Some(&record(10)), 10), FreshnessState::Warm);
        assert_eq!(classify(Some(&record(11)), 10), FreshnessState::Hot);
        assert_eq!(classify(Some(&record(1)), 10), FreshnessState::Warm);
    }

    #[test]
    fn zero_allowance_is_hot_for_live_records() {
        assert_eq!(classify(Some(&record(1)), 0), FreshnessState::Hot);
        assert_eq!(classify(Some(&record(0)), 0), FreshnessState::Warm);
    }

    #[test]
    fn header_text() {
        assert_eq!(diagnostic(FreshnessState::Hot, None), "Hot");
        assert_eq!(
            diagnostic(FreshnessState::SubZero, Some(FetchOutcome::Fetched)),
            "Sub-Zero; Fetched"
        );
        assert_eq!(
            diagnostic(FreshnessState::Warm, Some(FetchOutcome::Abstained)),
            "Warm; Abstained"
        );
    }

    #[test]
    fn usable_states() {
        assert!(!FreshnessState::SubZero.is_usable());
        assert!(!FreshnessState::Cold.is_usable());
        assert!(FreshnessState::Warm.is_usable());
        assert!(FreshnessState::Hot.is_usable());
    }
}

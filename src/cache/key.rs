//! Cache key derivation.

use std::fmt;

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "cache";

const RECORD_TAG: &str = "record";
const HEADERS_TAG: &str = "headers";
const CLAIM_TAG: &str = "fetching";

/// The three store identifiers belonging to one cached URI.
///
/// Each is `<namespace>:<tag>:<uri>`. The tag sits between two fixed
/// separators ahead of the URI, so no URI can produce another URI's keys:
///
/// | identifier | key                            | holds                         |
/// |------------|--------------------------------|-------------------------------|
/// | record     | `cache:record:/news?page=2`    | status, body, header back-ref |
/// | headers    | `cache:headers:/news?page=2`   | full header map               |
/// | claim      | `cache:fetching:/news?page=2`  | the leader's fetch claim      |
///
/// The "finished" notification channel is named after the record key.
///
/// # Examples
///
/// ```
/// use rttp_cache::cache::CacheKey;
///
/// let key = CacheKey::from_uri("/news?page=2");
/// assert_eq!(key.record(), "cache:record:/news?page=2");
/// assert_eq!(key.headers(), "cache:headers:/news?page=2");
/// assert_eq!(key.claim(), "cache:fetching:/news?page=2");
/// assert_eq!(key.channel(), key.record());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    uri: String,
    record: String,
    headers: String,
    claim: String,
}

impl CacheKey {
    /// Derives the key for `uri` in the default namespace.
    pub fn from_uri(uri: &str) -> Self {
        Self::with_namespace(DEFAULT_NAMESPACE, uri)
    }

    /// Derives the key for `uri` in `namespace`.
    pub fn with_namespace(namespace: &str, uri: &str) -> Self {
        Self {
            uri: uri.to_owned(),
            record: format!("{namespace}:{RECORD_TAG}:{uri}"),
            headers: format!("{namespace}:{HEADERS_TAG}:{uri}"),
            claim: format!("{namespace}:{CLAIM_TAG}:{uri}"),
        }
    }

    /// The URI this key was derived from; also what the origin is asked for.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn record(&self) -> &str {
        &self.record
    }

    pub fn headers(&self) -> &str {
        &self.headers
    }

    pub fn claim(&self) -> &str {
        &self.claim
    }

    pub fn channel(&self) -> &str {
        &self.record
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.record)
    }
}

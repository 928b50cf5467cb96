//! Stored cache records and the TTL policy that sizes them.

use std::collections::BTreeMap;

use bytes::Bytes;

/// Record-hash field holding the status code.
pub(crate) const FIELD_STATUS: &str = "status";
/// Record-hash field holding the body.
pub(crate) const FIELD_BODY: &str = "body";
/// Record-hash field pointing at the header key.
pub(crate) const FIELD_HEADER_REF: &str = "headers_key";

/// A cached response as read back from the store.
///
/// Records are written wholesale and never patched; `ttl_seconds` is the
/// remaining lifetime reported by the store at read time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRecord {
    pub status: u16,
    pub body: Bytes,
    pub headers: BTreeMap<String, String>,
    pub ttl_seconds: i64,
}

/// Decides how long a response may be cached, from its headers.
///
/// A non-positive result means "do not cache".
pub trait ExpiryPolicy: Send + Sync {
    fn ttl_seconds(&self, headers: &BTreeMap<String, String>) -> i64;
}

impl<F> ExpiryPolicy for F
where
    F: Fn(&BTreeMap<String, String>) -> i64 + Send + Sync,
{
    fn ttl_seconds(&self, headers: &BTreeMap<String, String>) -> i64 {
        self(headers)
    }
}

/// Placeholder policy: every response lives for the same number of seconds.
///
/// Cache-Control / Expires evaluation is deliberately not performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedExpiry(pub i64);

impl FixedExpiry {
    pub const DEFAULT_SECONDS: i64 = 300;
}

impl Default for FixedExpiry {
    fn default() -> Self {
        Self(Self::DEFAULT_SECONDS)
    }
}

impl ExpiryPolicy for FixedExpiry {
    fn ttl_seconds(&self, _headers: &BTreeMap<String, String>) -> i64 {
        self.0
    }
}

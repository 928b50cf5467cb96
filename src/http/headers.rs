//! HTTP header map with case-insensitive name lookup.
//!
//! On the wire headers are order-preserving and may repeat. In the cache they
//! are stored as a flat `name → value` map, so this type also knows how to fold
//! itself into that shape and back.

use std::collections::BTreeMap;

/// Connection-scoped headers that must not be stored or replayed (RFC 9110 §7.6.1).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Returns `true` if `name` is a hop-by-hop header.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// A case-insensitive, multi-value HTTP header map.
///
/// # Examples
///
/// ```
/// use rttp_cache::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Content-Type", "text/html; charset=utf-8");
/// headers.insert("Vary", "Accept");
/// headers.insert("vary", "Cookie");
///
/// assert_eq!(headers.get("content-type"), Some("text/html; charset=utf-8"));
/// let map = headers.to_map();
/// assert_eq!(map.get("Vary").map(String::as_str), Some("Accept, Cookie"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    inner: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a header map with pre-allocated capacity for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
        }
    }

    /// Builds a header map from a stored `name → value` map.
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        let mut headers = Self::with_capacity(map.len());
        for (name, value) in map {
            headers.insert(name.as_str(), value.as_str());
        }
        headers
    }

    /// Appends a header entry. Multiple values for the same name are preserved.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.push((name.into(), value.into()));
    }

    /// Replaces every entry named `name` with a single `name: value` entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.inner.push((name, value.into()));
    }

    /// Returns the first value for the given header name (case-insensitive), or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Removes all entries with the given header name (case-insensitive).
    ///
    /// Returns `true` if any entries were removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.inner.len();
        self.inner.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.inner.len() < before
    }

    /// Returns `true` if the map contains at least one entry with the given name.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Returns the total number of header entries (not unique names).
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if there are no header entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Folds the entries into a storable `name → value` map.
    ///
    /// Hop-by-hop headers and `Content-Length` are dropped. Repeated names are
    /// joined with `", "` under the spelling of their first occurrence.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in self.iter() {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            match map.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
                Some((_, existing)) => {
                    existing.push_str(", ");
                    existing.push_str(value);
                }
                None => {
                    map.insert(name.to_owned(), value.to_owned());
                }
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive_get() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn set_replaces_all_values() {
        let mut h = Headers::new();
        h.insert("X-Cache-State", "Hot");
        h.insert("x-cache-state", "Warm");
        h.set("X-Cache-State", "Sub-Zero");
        assert_eq!(h.len(), 1);
        assert_eq!(h.get("x-cache-state"), Some("Sub-Zero"));
    }

    #[test]
    fn to_map_drops_hop_by_hop_and_length() {
        let mut h = Headers::new();
        h.insert("Connection", "close");
        h.insert("Transfer-Encoding", "chunked");
        h.insert("Content-Length", "12");
        h.insert("Cache-Control", "max-age=60");
        let map = h.to_map();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("Cache-Control").map(String::as_str), Some("max-age=60"));
    }

    #[test]
    fn map_round_trip_preserves_names() {
        let mut map = BTreeMap::new();
        map.insert("ETag".to_owned(), "\"abc\"".to_owned());
        let h = Headers::from_map(&map);
        assert_eq!(h.get("etag"), Some("\"abc\""));
        assert_eq!(h.to_map(), map);
    }
}

//! The unit handed back to callers and serialized to the outward response.

use std::collections::BTreeMap;

use bytes::Bytes;

use super::freshness::{DIAGNOSTIC_HEADER, FetchOutcome, FreshnessState, diagnostic};
use super::record::CacheRecord;
use crate::http::{Headers, Response, StatusCode};
use crate::origin::OriginResponse;

/// A response plus its cache classification.
///
/// A `SubZero` envelope produced by `prepare` carries no response yet: its
/// status is `0` and its body empty until `fetch` fills it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub body: Bytes,
    pub headers: BTreeMap<String, String>,
    pub freshness: FreshnessState,
    pub outcome: Option<FetchOutcome>,
}

impl ResponseEnvelope {
    /// An envelope for a key with no stored record.
    pub fn sub_zero() -> Self {
        Self {
            status: 0,
            body: Bytes::new(),
            headers: BTreeMap::new(),
            freshness: FreshnessState::SubZero,
            outcome: None,
        }
    }

    pub fn from_record(record: CacheRecord, freshness: FreshnessState) -> Self {
        Self {
            status: record.status,
            body: record.body,
            headers: record.headers,
            freshness,
            outcome: None,
        }
    }

    pub fn from_origin(response: OriginResponse, freshness: FreshnessState) -> Self {
        Self {
            status: response.status,
            body: response.body,
            headers: response.headers,
            freshness,
            outcome: None,
        }
    }

    /// A cache-generated failure response.
    pub fn failure(status: StatusCode, message: impl Into<String>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(
            "Content-Type".to_owned(),
            "text/plain; charset=utf-8".to_owned(),
        );
        Self {
            status: status.as_u16(),
            body: Bytes::from(message.into()),
            headers,
            freshness: FreshnessState::SubZero,
            outcome: None,
        }
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: FetchOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Returns `true` if this envelope carries a servable response.
    pub fn has_response(&self) -> bool {
        self.status != 0
    }

    /// The diagnostic header value, e.g. `Warm; Abstained`.
    pub fn diagnostic(&self) -> String {
        diagnostic(self.freshness, self.outcome)
    }

    /// Builds the outward response, including the diagnostic header.
    pub fn into_response(self) -> Response {
        let value = self.diagnostic();
        let mut response = self.into_bare_response();
        response.set_header(DIAGNOSTIC_HEADER, value);
        response
    }

    /// Builds the outward response without the diagnostic header.
    pub fn into_bare_response(self) -> Response {
        Response::new(StatusCode::new(self.status))
            .headers(Headers::from_map(&self.headers))
            .body_bytes(self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outward_response_carries_diagnostic() {
        let envelope = ResponseEnvelope::from_origin(
            OriginResponse::new(200, "hello").header("ETag", "\"v1\""),
            FreshnessState::SubZero,
        )
        .with_outcome(FetchOutcome::Fetched);
        let response = envelope.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.header_map().get("x-cache-state"),
            Some("Sub-Zero; Fetched")
        );
        assert_eq!(response.header_map().get("etag"), Some("\"v1\""));
        assert_eq!(response.body_ref(), &Bytes::from_static(b"hello"));
    }

    #[test]
    fn stored_diagnostic_is_replaced() {
        let record = CacheRecord {
            status: 200,
            body: Bytes::new(),
            headers: [("X-Cache-State".to_owned(), "Hot".to_owned())].into(),
            ttl_seconds: 30,
        };
        let response = ResponseEnvelope::from_record(record, FreshnessState::Warm).into_response();
        let values: Vec<_> = response
            .header_map()
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(DIAGNOSTIC_HEADER))
            .map(|(_, v)| v)
            .collect();
        assert_eq!(values, vec!["Warm"]);
    }

    #[test]
    fn sub_zero_has_no_response() {
        assert!(!ResponseEnvelope::sub_zero().has_response());
        assert!(ResponseEnvelope::failure(StatusCode::BAD_GATEWAY, "x").has_response());
    }
}

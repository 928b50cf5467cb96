//! Origin collaborator: the slow upstream the cache protects.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::BoxFuture;

pub mod http;

pub use http::HttpOrigin;

/// Errors produced while fetching from the origin.
///
/// A non-2xx origin status is a response, not an error.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("failed to connect to origin {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("origin I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed origin response: {0}")]
    Malformed(String),

    #[error("origin response exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("origin did not respond within {after:?}")]
    Timeout { after: Duration },
}

/// A complete origin response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponse {
    pub status: u16,
    pub body: Bytes,
    /// End-to-end headers only; hop-by-hop headers and `Content-Length` are dropped.
    pub headers: BTreeMap<String, String>,
}

impl OriginResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Fetches resources from the origin.
///
/// Implementations need not enforce a deadline; callers wrap every call in one.
pub trait OriginClient: Send + Sync {
    fn fetch<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Result<OriginResponse, OriginError>>;
}

//! Per-request context: what configuration override rules are matched against.

use crate::Request;
use crate::http::Headers;

/// The parts of a request that configuration rules can inspect.
///
/// # Examples
///
/// ```
/// use rttp_cache::context::RequestContext;
///
/// let ctx = RequestContext::new("/news?page=2").header("X-Preview", "1");
/// assert_eq!(ctx.uri(), "/news?page=2");
/// assert_eq!(ctx.headers().get("x-preview"), Some("1"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    uri: String,
    headers: Headers,
}

impl RequestContext {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            headers: Headers::new(),
        }
    }

    /// Captures the URI and headers of an inbound request.
    pub fn from_request(request: &Request) -> Self {
        Self {
            uri: request.uri().to_owned(),
            headers: request.headers().clone(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_request_target_and_headers() {
        let raw = b"GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\nCookie: s=1\r\n\r\n";
        let (request, _) = Request::parse(raw).unwrap();
        let ctx = RequestContext::from_request(&request);
        assert_eq!(ctx.uri(), "/a?b=1");
        assert_eq!(ctx.headers().get("cookie"), Some("s=1"));
    }
}

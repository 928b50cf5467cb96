//! The request handler that puts the cache in front of an origin.
//!
//! `GET` goes through the cache. `HEAD` is answered exactly like `GET`,
//! minus the body. Anything else is rejected with `405`.

use std::time::Instant;

use tracing::{error, info};

use crate::cache::CacheOrchestrator;
use crate::config::ConfigTemplate;
use crate::context::RequestContext;
use crate::http::{Method, Request, Response, StatusCode};

/// Serves requests from the cache, resolving per-request settings from the
/// configuration template.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rttp_cache::cache::CacheOrchestrator;
/// use rttp_cache::config::ConfigTemplate;
/// use rttp_cache::origin::HttpOrigin;
/// use rttp_cache::proxy::CacheProxy;
/// use rttp_cache::store::MemoryStore;
///
/// let store = Arc::new(MemoryStore::new());
/// let origin = Arc::new(HttpOrigin::new("127.0.0.1:9000"));
/// let cache = CacheOrchestrator::new(store.clone(), origin, store);
/// let proxy = CacheProxy::new(cache, ConfigTemplate::default());
/// ```
#[derive(Debug, Clone)]
pub struct CacheProxy {
    cache: CacheOrchestrator,
    config: ConfigTemplate,
}

impl CacheProxy {
    pub fn new(cache: CacheOrchestrator, config: ConfigTemplate) -> Self {
        Self { cache, config }
    }

    pub fn cache(&self) -> &CacheOrchestrator {
        &self.cache
    }

    /// Handles one request and logs `METHOD /uri - STATUS (duration) [state]`.
    pub async fn handle(&self, request: Request) -> Response {
        let start = Instant::now();
        let keep_alive = request.is_keep_alive();
        let method = request.method().clone();

        let response = match &method {
            Method::Get | Method::Head => self.lookup(&request).await,
            Method::Other(_) => Response::new(StatusCode::METHOD_NOT_ALLOWED)
                .header("Allow", "GET, HEAD")
                .body("Method Not Allowed"),
        };
        let response = response
            .keep_alive(keep_alive)
            .omit_body(method == Method::Head);

        let state = response
            .header_map()
            .get(crate::cache::DIAGNOSTIC_HEADER)
            .unwrap_or("-");
        info!(
            "{} {} - {} ({:?}) [{}]",
            method,
            request.uri(),
            response.status().as_u16(),
            start.elapsed(),
            state
        );
        response
    }

    async fn lookup(&self, request: &Request) -> Response {
        let ctx = RequestContext::from_request(request);
        let settings = match self.config.settings_for(&ctx) {
            Ok(settings) => settings,
            Err(e) => {
                error!(uri = %request.uri(), error = %e, "failed to resolve cache settings");
                return Response::new(StatusCode::INTERNAL_SERVER_ERROR)
                    .body("Internal Server Error");
            }
        };

        let envelope = self.cache.serve(request.uri(), &settings).await;
        if settings.cache_enabled {
            envelope.into_response()
        } else {
            envelope.into_bare_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::BoxFuture;
    use crate::origin::{HttpOrigin, OriginClient, OriginError, OriginResponse};
    use crate::server::Server;
    use crate::store::MemoryStore;

    struct StubOrigin {
        calls: AtomicUsize,
    }

    impl OriginClient for StubOrigin {
        fn fetch<'a>(
            &'a self,
            uri: &'a str,
        ) -> BoxFuture<'a, Result<OriginResponse, OriginError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(OriginResponse::new(200, format!("origin says {uri}"))
                    .header("Content-Type", "text/plain"))
            })
        }
    }

    fn proxy(config: ConfigTemplate) -> (CacheProxy, Arc<StubOrigin>) {
        let store = Arc::new(MemoryStore::new());
        let origin = Arc::new(StubOrigin {
            calls: AtomicUsize::new(0),
        });
        let cache = CacheOrchestrator::new(store.clone(), origin.clone(), store);
        (CacheProxy::new(cache, config), origin)
    }

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    #[tokio::test]
    async fn get_is_cached() {
        let (proxy, origin) = proxy(ConfigTemplate::default());

        let first = proxy.handle(request("GET /a?x=1 HTTP/1.1\r\nHost: h\r\n\r\n")).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.header_map().get("x-cache-state"), Some("Sub-Zero; Fetched"));
        assert_eq!(&first.body_ref()[..], b"origin says /a?x=1");

        let second = proxy.handle(request("GET /a?x=1 HTTP/1.1\r\nHost: h\r\n\r\n")).await;
        assert_eq!(second.header_map().get("x-cache-state"), Some("Hot"));
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn head_shares_the_get_entry() {
        let (proxy, origin) = proxy(ConfigTemplate::default());
        proxy.handle(request("GET /a HTTP/1.1\r\n\r\n")).await;

        let head = proxy.handle(request("HEAD /a HTTP/1.1\r\n\r\n")).await;
        assert_eq!(head.header_map().get("x-cache-state"), Some("Hot"));
        let wire = head.into_bytes();
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.contains("Content-Length: 14\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
        assert_eq!(origin.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn other_methods_are_rejected() {
        let (proxy, origin) = proxy(ConfigTemplate::default());
        let response = proxy
            .handle(request("POST /a HTTP/1.1\r\nContent-Length: 0\r\n\r\n"))
            .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.header_map().get("allow"), Some("GET, HEAD"));
        assert_eq!(origin.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_cache_bypasses_without_diagnostic() {
        let config = ConfigTemplate::from_json_str(
            r#"{ "cache_enabled": { "rules": [ { "uri": "^/private/", "value": false } ] } }"#,
        )
        .unwrap();
        let (proxy, origin) = proxy(config);

        for _ in 0..2 {
            let response = proxy.handle(request("GET /private/a HTTP/1.1\r\n\r\n")).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.header_map().get("x-cache-state"), None);
        }
        assert_eq!(origin.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connection_close_is_honoured() {
        let (proxy, _) = proxy(ConfigTemplate::default());
        let response = proxy
            .handle(request("GET /a HTTP/1.1\r\nConnection: close\r\n\r\n"))
            .await;
        let wire = response.into_bytes();
        assert!(std::str::from_utf8(&wire).unwrap().contains("Connection: close\r\n"));
    }

    /// Origin server answering every connection with a fixed body.
    async fn spawn_origin(body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nETag: \"e1\"\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(reply.as_bytes()).await;
            }
        });
        (addr, hits)
    }

    async fn read_until(stream: &mut TcpStream, suffix: &str) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while !buf.ends_with(suffix.as_bytes()) {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed early: {}", String::from_utf8_lossy(&buf));
            buf.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn end_to_end_over_tcp() {
        let (origin_addr, hits) = spawn_origin("from origin").await;
        let store = Arc::new(MemoryStore::new());
        let origin = Arc::new(HttpOrigin::new(origin_addr));
        let cache = CacheOrchestrator::new(store.clone(), origin, store);
        let proxy = Arc::new(CacheProxy::new(cache, ConfigTemplate::default()));

        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(move |req| {
            let proxy = Arc::clone(&proxy);
            async move { proxy.handle(req).await }
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        for expected_state in ["Sub-Zero; Fetched", "Hot"] {
            client
                .write_all(b"GET /page HTTP/1.1\r\nHost: cache\r\n\r\n")
                .await
                .unwrap();
            let text = read_until(&mut client, "from origin").await;
            assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
            assert!(text.contains(&format!("X-Cache-State: {expected_state}\r\n")), "{text}");
            assert!(text.contains("ETag: \"e1\"\r\n"), "{text}");
            assert!(text.ends_with("from origin"), "{text}");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

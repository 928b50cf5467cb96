//! # rttp-cache
//!
//! A collapsed-forwarding HTTP response cache built on the rttp HTTP/1.1 core.
//!
//! Every request is classified against a key-value store with native TTLs
//! (`Sub-Zero`, `Warm`, `Hot`). Misses go to the origin, but per cache key
//! only one flow (the *leader*, elected through a self-expiring claim) fetches
//! at a time; the others either wait for the leader's "finished" notification
//! or, when they already hold a stale copy, serve it without waiting.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rttp_cache::cache::CacheOrchestrator;
//! use rttp_cache::config::ConfigTemplate;
//! use rttp_cache::origin::HttpOrigin;
//! use rttp_cache::proxy::CacheProxy;
//! use rttp_cache::server::Server;
//! use rttp_cache::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     let origin = Arc::new(HttpOrigin::new("127.0.0.1:9000"));
//!     let cache = CacheOrchestrator::new(store.clone(), origin, store);
//!     let proxy = Arc::new(CacheProxy::new(cache, ConfigTemplate::default()));
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server
//!         .run(move |req| {
//!             let proxy = Arc::clone(&proxy);
//!             async move { proxy.handle(req).await }
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod notify;
pub mod origin;
pub mod proxy;
pub mod server;
pub mod store;

/// A boxed, `Send` future: the return type of every collaborator trait method,
/// keeping the traits usable as `dyn` objects.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{
    CacheKey, CacheOrchestrator, CacheRecord, FetchError, FetchOutcome, FreshnessState,
    ResponseEnvelope,
};
pub use config::{CacheSettings, ConfigTemplate};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};

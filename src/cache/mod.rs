//! Cache core: classification, storage and collapsed forwarding.
//!
//! ## Overview
//!
//! Callers go through [`CacheOrchestrator`] in two phases:
//!
//! 1. [`prepare`](CacheOrchestrator::prepare) reads the record for a URI and
//!    classifies it as [`FreshnessState::SubZero`], [`Warm`](FreshnessState::Warm)
//!    or [`Hot`](FreshnessState::Hot).
//! 2. [`fetch`](CacheOrchestrator::fetch) obtains a fresh response. Concurrent
//!    callers for the same key collapse onto one origin call; see [`collapse`].
//!
//! [`serve`](CacheOrchestrator::serve) runs both phases and never fails: it
//! falls back to a stale copy or a failure envelope.
//!
//! ## Store layout
//!
//! For URI `u` under namespace `ns`:
//!
//! | key                 | content                                   |
//! |---------------------|-------------------------------------------|
//! | `ns:record:u`       | hash: `status`, `body`, `headers_key`     |
//! | `ns:headers:u`      | hash: one field per response header       |
//! | `ns:fetching:u`     | claim marker, leased                      |
//!
//! Completion is announced on channel `ns:record:u` with the message `finished`.

pub mod collapse;
pub mod envelope;
pub mod error;
pub mod freshness;
pub mod key;
pub mod orchestrator;
pub mod record;
pub mod storage;

pub use collapse::{Claim, CollapsedForwarding};
pub use envelope::ResponseEnvelope;
pub use error::FetchError;
pub use freshness::{DIAGNOSTIC_HEADER, FetchOutcome, FreshnessState, classify, diagnostic};
pub use key::{CacheKey, DEFAULT_NAMESPACE};
pub use orchestrator::CacheOrchestrator;
pub use record::{CacheRecord, ExpiryPolicy, FixedExpiry};
pub use storage::StorageAdapter;

//! The two-phase cache entry point: `prepare` then `fetch`.
//!
//! `prepare` reads and classifies without side effects. `fetch` is only worth
//! calling for `Sub-Zero` and `Warm` results; it runs collapsed forwarding and
//! returns the response to serve. `serve` composes the two with the
//! degradation policy a front end wants: stale beats an error page.

use std::sync::Arc;

use tracing::{debug, warn};

use super::collapse::CollapsedForwarding;
use super::envelope::ResponseEnvelope;
use super::error::FetchError;
use super::freshness::{FetchOutcome, FreshnessState, classify};
use super::key::{CacheKey, DEFAULT_NAMESPACE};
use super::record::ExpiryPolicy;
use super::storage::StorageAdapter;
use crate::config::CacheSettings;
use crate::notify::NotificationClient;
use crate::origin::OriginClient;
use crate::store::{Store, StoreError};

/// Owns the cache collaborators and exposes `prepare` / `fetch` / `serve`.
///
/// Cheap to clone; clones share the same store, origin and notifier.
#[derive(Clone, Debug)]
pub struct CacheOrchestrator {
    storage: StorageAdapter,
    forwarding: CollapsedForwarding,
    namespace: Arc<str>,
}

impl CacheOrchestrator {
    /// Builds an orchestrator with the placeholder expiry policy and the
    /// default key namespace.
    pub fn new(
        store: Arc<dyn Store>,
        origin: Arc<dyn OriginClient>,
        notifier: Arc<dyn NotificationClient>,
    ) -> Self {
        let storage = StorageAdapter::new(store);
        Self::from_parts(storage, origin, notifier)
    }

    /// Builds an orchestrator whose saved records take their TTL from `expiry`.
    pub fn with_expiry(
        store: Arc<dyn Store>,
        origin: Arc<dyn OriginClient>,
        notifier: Arc<dyn NotificationClient>,
        expiry: Arc<dyn ExpiryPolicy>,
    ) -> Self {
        let storage = StorageAdapter::with_expiry(store, expiry);
        Self::from_parts(storage, origin, notifier)
    }

    fn from_parts(
        storage: StorageAdapter,
        origin: Arc<dyn OriginClient>,
        notifier: Arc<dyn NotificationClient>,
    ) -> Self {
        Self {
            forwarding: CollapsedForwarding::new(storage.clone(), origin, notifier),
            storage,
            namespace: Arc::from(DEFAULT_NAMESPACE),
        }
    }

    /// Prefixes every store key with `namespace` instead of the default.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl AsRef<str>) -> Self {
        self.namespace = Arc::from(namespace.as_ref());
        self
    }

    /// The cache key for `uri` under this orchestrator's namespace.
    pub fn key(&self, uri: &str) -> CacheKey {
        CacheKey::with_namespace(&self.namespace, uri)
    }

    pub fn storage(&self) -> &StorageAdapter {
        &self.storage
    }

    /// Reads the stored record for `key` and classifies it. No side effects
    /// beyond TTL read-repair.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the store is unreachable; callers treat that as
    /// "no cache" and degrade.
    pub async fn prepare(
        &self,
        key: &CacheKey,
        settings: &CacheSettings,
    ) -> Result<ResponseEnvelope, StoreError> {
        let record = self.storage.read(key).await?;
        let freshness = classify(record.as_ref(), settings.max_stale_age);
        debug!(key = %key, %freshness, "prepared");
        Ok(match record {
            Some(record) => ResponseEnvelope::from_record(record, freshness),
            None => ResponseEnvelope::sub_zero(),
        })
    }

    /// Obtains a fresh response for `key`, collapsing concurrent callers.
    ///
    /// `envelope` must come from [`prepare`](Self::prepare) for the same key.
    /// A `Hot` envelope is returned unchanged.
    ///
    /// # Errors
    ///
    /// See [`FetchError`]. Staleness and absence are never errors.
    pub async fn fetch(
        &self,
        key: &CacheKey,
        envelope: ResponseEnvelope,
        settings: &CacheSettings,
    ) -> Result<ResponseEnvelope, FetchError> {
        if envelope.freshness == FreshnessState::Hot {
            return Ok(envelope);
        }
        self.forwarding.run(key, envelope, settings).await
    }

    /// `prepare` + `fetch` with degradation: always yields something to send.
    ///
    /// - store down during `prepare`: straight to origin, uncached.
    /// - `Warm` with background revalidation: served now, refreshed in a
    ///   spawned task.
    /// - fetch failure: the fetched-but-unsaved response, else the stale copy,
    ///   else a failure envelope with the mapped status.
    pub async fn serve(&self, uri: &str, settings: &CacheSettings) -> ResponseEnvelope {
        if !settings.cache_enabled {
            return self.pass_through(uri, settings).await;
        }

        let key = self.key(uri);
        let envelope = match self.prepare(&key, settings).await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(key = %key, error = %e, "cache unavailable; going straight to origin");
                return self.pass_through(uri, settings).await;
            }
        };

        match envelope.freshness {
            FreshnessState::Hot => envelope,
            FreshnessState::Warm if settings.background_revalidate => {
                self.revalidate_in_background(key, envelope.clone(), settings.clone());
                envelope
            }
            _ => {
                let stale = envelope.freshness.is_usable().then(|| envelope.clone());
                match self.fetch(&key, envelope, settings).await {
                    Ok(fetched) => fetched,
                    Err(e) => degrade(&key, e, stale),
                }
            }
        }
    }

    /// Fetches `uri` directly, bypassing store and claim entirely.
    pub async fn pass_through(&self, uri: &str, settings: &CacheSettings) -> ResponseEnvelope {
        let key = self.key(uri);
        match self.forwarding.fetch_origin(&key, settings, false).await {
            Ok(response) => ResponseEnvelope::from_origin(response, FreshnessState::SubZero)
                .with_outcome(FetchOutcome::Fetched),
            Err(e) => degrade(&key, e, None),
        }
    }

    fn revalidate_in_background(
        &self,
        key: CacheKey,
        envelope: ResponseEnvelope,
        settings: CacheSettings,
    ) {
        let forwarding = self.forwarding.clone();
        tokio::spawn(async move {
            match forwarding.run(&key, envelope, &settings).await {
                Ok(refreshed) => {
                    debug!(key = %key, state = %refreshed.diagnostic(), "background revalidation done");
                }
                Err(e) => warn!(key = %key, error = %e, "background revalidation failed"),
            }
        });
    }
}

fn degrade(key: &CacheKey, err: FetchError, stale: Option<ResponseEnvelope>) -> ResponseEnvelope {
    match (err, stale) {
        (FetchError::Save { response, source, .. }, _) => {
            warn!(key = %key, error = %source, "serving response that could not be cached");
            *response
        }
        (err, Some(stale)) => {
            warn!(key = %key, error = %err, "fetch failed; serving stale copy");
            stale
        }
        (err, None) => {
            warn!(key = %key, error = %err, "fetch failed with nothing to serve");
            let status = err.status();
            let reason = match status.canonical_reason() {
                "" => "Error",
                reason => reason,
            };
            ResponseEnvelope::failure(status, format!("{reason}: {err}"))
        }
    }
}

//! Storage adapter: batched reads and writes of cache records.
//!
//! A record lives in two store keys that are written and expired together:
//! the record hash (`status`, `body`, a back-reference to the header key) and
//! the header hash. Their TTLs must match. Neither batch is atomic, so a crash
//! between the two TTL commands can leave one key persistent; [`read`] detects
//! that and repairs it.
//!
//! [`read`]: StorageAdapter::read

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use super::key::CacheKey;
use super::record::{
    CacheRecord, ExpiryPolicy, FIELD_BODY, FIELD_HEADER_REF, FIELD_STATUS, FixedExpiry,
};
use crate::origin::OriginResponse;
use crate::store::{Command, Reply, Store, StoreError, TTL_PERSISTENT, round_trip};

/// Reads and writes [`CacheRecord`]s through a [`Store`].
#[derive(Clone)]
pub struct StorageAdapter {
    store: Arc<dyn Store>,
    expiry: Arc<dyn ExpiryPolicy>,
}

impl std::fmt::Debug for StorageAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAdapter").finish_non_exhaustive()
    }
}

impl StorageAdapter {
    /// Creates an adapter using the placeholder [`FixedExpiry`] policy.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_expiry(store, Arc::new(FixedExpiry::default()))
    }

    pub fn with_expiry(store: Arc<dyn Store>, expiry: Arc<dyn ExpiryPolicy>) -> Self {
        Self { store, expiry }
    }

    pub(crate) fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Reads the record for `key` in one round trip.
    ///
    /// Returns `Ok(None)` when the record key does not exist, or when it exists
    /// but holds no parseable status (the next save overwrites it).
    ///
    /// # Errors
    ///
    /// [`StoreError`] on transport failure or an error reply.
    pub async fn read(&self, key: &CacheKey) -> Result<Option<CacheRecord>, StoreError> {
        let replies = round_trip(
            self.store(),
            vec![
                Command::HashGet {
                    key: key.record().to_owned(),
                    fields: vec![FIELD_STATUS.to_owned(), FIELD_BODY.to_owned()],
                },
                Command::HashGetAll {
                    key: key.headers().to_owned(),
                },
                Command::Ttl {
                    key: key.record().to_owned(),
                },
                Command::Ttl {
                    key: key.headers().to_owned(),
                },
            ],
        )
        .await?;
        let [fields, header_pairs, ttl, header_ttl]: [Reply; 4] = replies
            .try_into()
            .map_err(|_| StoreError::Protocol("read batch reply count".to_owned()))?;

        let ttl = ttl.into_integer()?;
        if ttl < 0 && ttl != TTL_PERSISTENT {
            return Ok(None);
        }

        let mut fields = fields.into_values()?.into_iter();
        let status = fields.next().flatten();
        let body = fields.next().flatten().unwrap_or_default();
        let Some(status) = status.as_deref().and_then(parse_status) else {
            warn!(key = %key, "cached record has no usable status; treating as absent");
            return Ok(None);
        };

        let headers: BTreeMap<String, String> = header_pairs
            .into_pairs()?
            .into_iter()
            .map(|(name, value)| (name, String::from_utf8_lossy(&value).into_owned()))
            .collect();

        let header_ttl = header_ttl.into_integer()?;
        let ttl_seconds = if ttl == TTL_PERSISTENT {
            let derived = self.expiry.ttl_seconds(&headers);
            warn!(key = %key, ttl = derived, "cached record has no expiry; re-deriving TTL");
            self.repair(key, derived, true).await;
            if derived <= 0 {
                return Ok(None);
            }
            derived
        } else {
            if header_ttl == TTL_PERSISTENT || (header_ttl >= 0 && (header_ttl - ttl).abs() > 1) {
                warn!(key = %key, ttl, header_ttl, "header TTL diverged from record TTL; repairing");
                self.repair(key, ttl, false).await;
            }
            ttl
        };

        Ok(Some(CacheRecord {
            status,
            body,
            headers,
            ttl_seconds,
        }))
    }

    /// Stores `response` under `key` with a TTL from the expiry policy.
    ///
    /// Returns the record as written, or `None` when the policy declared the
    /// response uncacheable (non-positive TTL) and nothing was written.
    ///
    /// # Errors
    ///
    /// - [`StoreError::PartialWrite`]: some commands of the write batch were
    ///   rejected; the entry may be inconsistent until it is rewritten.
    /// - any other [`StoreError`] on transport failure.
    pub async fn save(
        &self,
        key: &CacheKey,
        response: &OriginResponse,
    ) -> Result<Option<CacheRecord>, StoreError> {
        let ttl = self.expiry.ttl_seconds(&response.headers);
        if ttl <= 0 {
            debug!(key = %key, ttl, "response not cacheable; skipping save");
            return Ok(None);
        }

        let mut batch = vec![
            Command::Delete {
                key: key.headers().to_owned(),
            },
            Command::HashSet {
                key: key.record().to_owned(),
                fields: vec![
                    (
                        FIELD_STATUS.to_owned(),
                        Bytes::from(response.status.to_string()),
                    ),
                    (FIELD_BODY.to_owned(), response.body.clone()),
                    (
                        FIELD_HEADER_REF.to_owned(),
                        Bytes::from(key.headers().to_owned()),
                    ),
                ],
            },
        ];
        if !response.headers.is_empty() {
            batch.push(Command::HashSet {
                key: key.headers().to_owned(),
                fields: response
                    .headers
                    .iter()
                    .map(|(name, value)| (name.clone(), Bytes::from(value.clone())))
                    .collect(),
            });
        }
        batch.push(Command::Expire {
            key: key.record().to_owned(),
            seconds: ttl,
        });
        batch.push(Command::Expire {
            key: key.headers().to_owned(),
            seconds: ttl,
        });

        let total = batch.len();
        let replies = round_trip(self.store(), batch).await?;
        let mut failures = replies.iter().filter_map(Reply::error);
        if let Some(reason) = failures.next() {
            let failed = 1 + failures.count();
            error!(key = %key, failed, total, reason, "cache write partially applied");
            return Err(StoreError::PartialWrite {
                failed,
                total,
                reason: reason.to_owned(),
            });
        }

        debug!(key = %key, ttl, status = response.status, "record saved");
        Ok(Some(CacheRecord {
            status: response.status,
            body: response.body.clone(),
            headers: response.headers.clone(),
            ttl_seconds: ttl,
        }))
    }

    /// Re-applies `ttl` to the header key, and to the record key too when
    /// `record_too`. Failures are logged; the next read retries.
    async fn repair(&self, key: &CacheKey, ttl: i64, record_too: bool) {
        let mut batch = Vec::with_capacity(2);
        if record_too {
            batch.push(Command::Expire {
                key: key.record().to_owned(),
                seconds: ttl,
            });
        }
        batch.push(Command::Expire {
            key: key.headers().to_owned(),
            seconds: ttl,
        });
        match round_trip(self.store(), batch).await {
            Ok(replies) => {
                if let Some(reason) = replies.iter().find_map(Reply::error) {
                    warn!(key = %key, reason, "TTL repair rejected");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "TTL repair failed"),
        }
    }
}

fn parse_status(raw: &[u8]) -> Option<u16> {
    std::str::from_utf8(raw)
        .ok()?
        .parse()
        .ok()
        .filter(|s| (100..1000).contains(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxFuture;
    use crate::store::{MemoryStore, TTL_MISSING};

    fn adapter(store: Arc<MemoryStore>, ttl: i64) -> StorageAdapter {
        StorageAdapter::with_expiry(store, Arc::new(FixedExpiry(ttl)))
    }

    fn response() -> OriginResponse {
        OriginResponse::new(200, "hello")
            .header("Content-Type", "text/plain")
            .header("ETag", "\"v1\"")
    }

    async fn ttl_of(store: &MemoryStore, key: &str) -> i64 {
        store
            .execute(vec![Command::Ttl { key: key.to_owned() }])
            .await
            .unwrap()
            .remove(0)
            .into_integer()
            .unwrap()
    }

    #[tokio::test]
    async fn missing_record_reads_as_none() {
        let storage = adapter(Arc::new(MemoryStore::new()), 60);
        assert_eq!(storage.read(&CacheKey::from_uri("/none")).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn save_then_read_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let storage = adapter(store.clone(), 60);
        let key = CacheKey::from_uri("/a");

        let saved = storage.save(&key, &response()).await.unwrap().unwrap();
        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        let read = storage.read(&key).await.unwrap().unwrap();

        assert_eq!(read.status, saved.status);
        assert_eq!(read.body, saved.body);
        assert_eq!(read.headers, saved.headers);
        assert_eq!(read.ttl_seconds, 55);
        assert_eq!(ttl_of(&store, key.headers()).await, 55);
    }

    #[tokio::test]
    async fn save_replaces_previous_headers_wholesale() {
        let store = Arc::new(MemoryStore::new());
        let storage = adapter(store, 60);
        let key = CacheKey::from_uri("/a");

        storage.save(&key, &response()).await.unwrap();
        storage
            .save(&key, &OriginResponse::new(404, "gone"))
            .await
            .unwrap();

        let read = storage.read(&key).await.unwrap().unwrap();
        assert_eq!(read.status, 404);
        assert!(read.headers.is_empty());
    }

    #[tokio::test]
    async fn uncacheable_response_is_not_written() {
        let store = Arc::new(MemoryStore::new());
        let storage = adapter(store.clone(), 0);
        let key = CacheKey::from_uri("/a");
        assert_eq!(storage.save(&key, &response()).await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn persistent_record_ttl_is_repaired() {
        let store = Arc::new(MemoryStore::new());
        let storage = adapter(store.clone(), 90);
        let key = CacheKey::from_uri("/a");
        // A crash right after the field writes: neither key got its TTL.
        store
            .execute(vec![
                Command::HashSet {
                    key: key.record().to_owned(),
                    fields: vec![
                        (FIELD_STATUS.to_owned(), Bytes::from_static(b"200")),
                        (FIELD_BODY.to_owned(), Bytes::from_static(b"hi")),
                    ],
                },
                Command::HashSet {
                    key: key.headers().to_owned(),
                    fields: vec![("ETag".to_owned(), Bytes::from_static(b"x"))],
                },
            ])
            .await
            .unwrap();

        let read = storage.read(&key).await.unwrap().unwrap();
        assert_eq!(read.ttl_seconds, 90);
        assert_eq!(ttl_of(&store, key.record()).await, 90);
        assert_eq!(ttl_of(&store, key.headers()).await, 90);
    }

    #[tokio::test]
    async fn persistent_header_ttl_is_repaired() {
        let store = Arc::new(MemoryStore::new());
        let storage = adapter(store.clone(), 90);
        let key = CacheKey::from_uri("/a");
        storage.save(&key, &response()).await.unwrap();
        // Re-create the header key without expiry.
        store
            .execute(vec![
                Command::Delete {
                    key: key.headers().to_owned(),
                },
                Command::HashSet {
                    key: key.headers().to_owned(),
                    fields: vec![("X".to_owned(), Bytes::from_static(b"1"))],
                },
            ])
            .await
            .unwrap();
        assert_eq!(ttl_of(&store, key.headers()).await, TTL_PERSISTENT);

        storage.read(&key).await.unwrap().unwrap();
        assert_eq!(ttl_of(&store, key.headers()).await, 90);
    }

    #[tokio::test]
    async fn record_without_status_reads_as_none() {
        let store = Arc::new(MemoryStore::new());
        let storage = adapter(store.clone(), 90);
        let key = CacheKey::from_uri("/a");
        store
            .execute(vec![
                Command::HashSet {
                    key: key.record().to_owned(),
                    fields: vec![(FIELD_BODY.to_owned(), Bytes::from_static(b"hi"))],
                },
                Command::Expire {
                    key: key.record().to_owned(),
                    seconds: 30,
                },
            ])
            .await
            .unwrap();
        assert_eq!(storage.read(&key).await.unwrap(), None);
        assert_ne!(ttl_of(&store, key.record()).await, TTL_MISSING);
    }

    /// Rejects the `n`th command of every write batch.
    struct RejectingStore {
        inner: MemoryStore,
        reject: usize,
    }

    impl Store for RejectingStore {
        fn execute(&self, batch: Vec<Command>) -> BoxFuture<'_, Result<Vec<Reply>, StoreError>> {
            Box::pin(async move {
                let is_write = batch.iter().any(|c| matches!(c, Command::HashSet { .. }));
                let mut replies = self.inner.execute(batch).await?;
                if is_write {
                    replies[self.reject] = Reply::Error("ERR simulated".to_owned());
                }
                Ok(replies)
            })
        }
    }

    #[tokio::test]
    async fn partial_write_is_surfaced() {
        let store = Arc::new(RejectingStore {
            inner: MemoryStore::new(),
            reject: 4,
        });
        let storage = StorageAdapter::with_expiry(store, Arc::new(FixedExpiry(60)));
        let err = storage
            .save(&CacheKey::from_uri("/a"), &response())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::PartialWrite { failed: 1, total: 5, .. }
        ));
    }

    struct DownStore;

    impl Store for DownStore {
        fn execute(&self, _batch: Vec<Command>) -> BoxFuture<'_, Result<Vec<Reply>, StoreError>> {
            Box::pin(async { Err(StoreError::Unavailable("connection refused".to_owned())) })
        }
    }

    #[tokio::test]
    async fn transport_failure_propagates() {
        let storage = StorageAdapter::new(Arc::new(DownStore));
        let err = storage.read(&CacheKey::from_uri("/a")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}

//! Collapsed forwarding: at most one origin fetch in flight per cache key.
//!
//! Per `(key, caller)` the protocol runs:
//!
//! ```text
//! NotStarted ─┬─ claim created ─► Fetching ─► Published ─► Done        (leader)
//!             └─ claim held ────┬─ Sub-Zero ─► Waiting ─► Done         (follower)
//!                               └─ Warm/Hot ─► Abstained               (follower)
//! ```
//!
//! The claim is a `set-if-absent` marker on the claim key. The same batch gives
//! it a lease if it has none, so a leader that dies mid-fetch blocks followers
//! for at most one lease. Followers' claim attempts never extend a live lease. While the origin call runs, the leader can
//! keep re-issuing the lease so slow fetches are not duplicated; without
//! renewal the lease must exceed the worst-case origin latency.
//!
//! A follower subscribes to the record-key channel *before* re-checking the
//! claim. If the claim is already gone the leader has published and the wait
//! is skipped, so a follower never waits on a message it cannot receive. The
//! wait itself is always bounded by a deadline.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::envelope::ResponseEnvelope;
use super::error::FetchError;
use super::freshness::FetchOutcome;
use super::key::CacheKey;
use super::storage::StorageAdapter;
use crate::config::CacheSettings;
use crate::notify::{FINISHED, NotificationClient};
use crate::origin::{OriginClient, OriginError, OriginResponse};
use crate::store::{Command, StoreError, round_trip};

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller created the claim and leads the fetch.
    Acquired,
    /// Another caller holds a live claim.
    Held,
}

enum Followed {
    /// The leader finished and a record is readable.
    Ready(ResponseEnvelope),
    /// The leader finished but stored nothing (uncacheable response).
    Uncacheable,
    /// The claim vanished without a record; leadership is up for grabs.
    Vacated,
}

/// Drives the claim / fetch / publish / wait protocol.
#[derive(Clone)]
pub struct CollapsedForwarding {
    storage: StorageAdapter,
    origin: Arc<dyn OriginClient>,
    notifier: Arc<dyn NotificationClient>,
}

impl std::fmt::Debug for CollapsedForwarding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollapsedForwarding")
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl CollapsedForwarding {
    pub fn new(
        storage: StorageAdapter,
        origin: Arc<dyn OriginClient>,
        notifier: Arc<dyn NotificationClient>,
    ) -> Self {
        Self {
            storage,
            origin,
            notifier,
        }
    }

    /// Fetches for `key`, collapsing concurrent callers onto a single origin call.
    ///
    /// `envelope` is the caller's `prepare` result; its freshness decides what a
    /// follower does and is kept on the returned envelope.
    ///
    /// # Errors
    ///
    /// - [`FetchError::Origin`]: the leader's origin call failed; the claim is
    ///   left to expire on its lease.
    /// - [`FetchError::Notification`]: a follower's wait timed out or broke.
    /// - [`FetchError::Save`]: fetched but not stored; carries the response.
    /// - [`FetchError::Store`]: claim commands or the follower's re-read failed.
    pub async fn run(
        &self,
        key: &CacheKey,
        envelope: ResponseEnvelope,
        settings: &CacheSettings,
    ) -> Result<ResponseEnvelope, FetchError> {
        if !settings.collapse_origin_requests {
            return self.fetch_independently(key, envelope, settings).await;
        }

        // A second round covers a claim that vanished while we followed it.
        for round in 0..2 {
            match self.claim(key, settings.claim_lease).await? {
                Claim::Acquired => return self.lead(key, envelope, settings).await,
                Claim::Held if envelope.freshness.is_usable() => {
                    debug!(key = %key, freshness = %envelope.freshness, "claim held; serving stale copy");
                    return Ok(envelope.with_outcome(FetchOutcome::Abstained));
                }
                Claim::Held => match self.follow(key, &envelope, settings).await? {
                    Followed::Ready(collapsed) => return Ok(collapsed),
                    Followed::Uncacheable => break,
                    Followed::Vacated => {
                        debug!(key = %key, round, "claim vacated without a record; retrying");
                    }
                },
            }
        }

        warn!(key = %key, "leader left nothing to collapse onto; fetching independently");
        self.fetch_independently(key, envelope, settings).await
    }

    /// Attempts to create the claim for `key`.
    ///
    /// The lease is applied to a claim without an expiry, which covers a fresh
    /// claim and one orphaned between its two commands. A held claim keeps the
    /// expiry its leader gave it.
    ///
    /// # Errors
    ///
    /// [`StoreError`] on transport failure or an error reply.
    pub async fn claim(&self, key: &CacheKey, lease: Duration) -> Result<Claim, StoreError> {
        let replies = round_trip(
            self.storage.store(),
            vec![
                Command::SetIfAbsent {
                    key: key.claim().to_owned(),
                    value: Bytes::from_static(b"1"),
                },
                Command::ExpireIfPersistent {
                    key: key.claim().to_owned(),
                    seconds: lease_seconds(lease),
                },
            ],
        )
        .await?;
        let mut replies = replies.into_iter();
        let created = replies.next().map(|r| r.into_integer()).transpose()?;
        if let Some(reason) = replies.next().as_ref().and_then(|r| r.error()) {
            warn!(key = %key, reason, "claim lease rejected");
        }
        Ok(match created {
            Some(1) => Claim::Acquired,
            _ => Claim::Held,
        })
    }

    async fn lead(
        &self,
        key: &CacheKey,
        envelope: ResponseEnvelope,
        settings: &CacheSettings,
    ) -> Result<ResponseEnvelope, FetchError> {
        debug!(key = %key, "claim acquired; fetching from origin");
        let started = Instant::now();
        let response = match self.fetch_origin(key, settings, true).await {
            Ok(response) => response,
            Err(e) => {
                warn!(key = %key, error = %e, "leader fetch failed; claim left to expire");
                return Err(e);
            }
        };

        let saved = self.storage.save(key, &response).await;
        if let Err(e) = self.release(key).await {
            warn!(key = %key, error = %e, "claim release failed; followers wait out their deadline");
        }

        let fetched = ResponseEnvelope::from_origin(response, envelope.freshness)
            .with_outcome(FetchOutcome::Fetched);
        info!(
            key = %key,
            status = fetched.status,
            elapsed = ?started.elapsed(),
            "leader fetch complete"
        );
        match saved {
            Ok(_) => Ok(fetched),
            Err(source) => Err(FetchError::Save {
                uri: key.uri().to_owned(),
                source,
                response: Box::new(fetched),
            }),
        }
    }

    async fn follow(
        &self,
        key: &CacheKey,
        envelope: &ResponseEnvelope,
        settings: &CacheSettings,
    ) -> Result<Followed, FetchError> {
        let mut subscription = self.notifier.subscribe(key.channel()).await?;

        let still_fetching = self.claim_exists(key).await?;
        if still_fetching {
            debug!(key = %key, deadline = ?settings.notification_timeout, "waiting for leader");
            let note = subscription.wait(settings.notification_timeout).await?;
            if !note.is_finished() {
                debug!(key = %key, message = ?note.message, "unexpected message; re-reading anyway");
            }
        }

        match self.storage.read(key).await? {
            Some(record) => {
                let collapsed = ResponseEnvelope::from_record(record, envelope.freshness)
                    .with_outcome(FetchOutcome::Collapsed);
                Ok(Followed::Ready(collapsed))
            }
            None if still_fetching => Ok(Followed::Uncacheable),
            None => Ok(Followed::Vacated),
        }
    }

    /// Fetches, saves, and returns without touching the claim.
    async fn fetch_independently(
        &self,
        key: &CacheKey,
        envelope: ResponseEnvelope,
        settings: &CacheSettings,
    ) -> Result<ResponseEnvelope, FetchError> {
        let response = self.fetch_origin(key, settings, false).await?;
        let saved = self.storage.save(key, &response).await;
        let fetched = ResponseEnvelope::from_origin(response, envelope.freshness)
            .with_outcome(FetchOutcome::Fetched);
        match saved {
            Ok(_) => Ok(fetched),
            Err(source) => Err(FetchError::Save {
                uri: key.uri().to_owned(),
                source,
                response: Box::new(fetched),
            }),
        }
    }

    /// Calls the origin under `settings.origin_timeout`, renewing the claim
    /// lease every half lease while `leading` and renewal is enabled.
    pub(crate) async fn fetch_origin(
        &self,
        key: &CacheKey,
        settings: &CacheSettings,
        leading: bool,
    ) -> Result<OriginResponse, FetchError> {
        let deadline = settings.origin_timeout;
        let call = tokio::time::timeout(deadline, self.origin.fetch(key.uri()));
        tokio::pin!(call);

        let outcome = if leading && settings.renew_claim_lease {
            let period = (settings.claim_lease / 2).max(Duration::from_secs(1));
            let first = Instant::now().checked_add(period).unwrap_or_else(Instant::now);
            let mut renew = tokio::time::interval_at(first, period);
            renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    outcome = &mut call => break outcome,
                    _ = renew.tick() => self.renew(key, settings.claim_lease).await,
                }
            }
        } else {
            call.await
        };

        let source = match outcome {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(e)) => e,
            Err(_elapsed) => OriginError::Timeout { after: deadline },
        };
        Err(FetchError::Origin {
            uri: key.uri().to_owned(),
            source,
        })
    }

    async fn renew(&self, key: &CacheKey, lease: Duration) {
        let batch = vec![Command::Expire {
            key: key.claim().to_owned(),
            seconds: lease_seconds(lease),
        }];
        match round_trip(self.storage.store(), batch).await {
            Ok(replies) if replies.first().and_then(|r| r.error()).is_none() => {
                debug!(key = %key, "claim lease renewed");
            }
            Ok(_) => warn!(key = %key, "claim lease renewal rejected"),
            Err(e) => warn!(key = %key, error = %e, "claim lease renewal failed"),
        }
    }

    async fn claim_exists(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let replies = round_trip(
            self.storage.store(),
            vec![Command::Exists {
                key: key.claim().to_owned(),
            }],
        )
        .await?;
        let exists = replies
            .into_iter()
            .next()
            .map(|r| r.into_integer())
            .transpose()?;
        Ok(exists == Some(1))
    }

    /// Deletes the claim and announces completion, in one batch.
    async fn release(&self, key: &CacheKey) -> Result<(), StoreError> {
        let replies = round_trip(
            self.storage.store(),
            vec![
                Command::Delete {
                    key: key.claim().to_owned(),
                },
                Command::Publish {
                    channel: key.channel().to_owned(),
                    message: Bytes::from_static(FINISHED.as_bytes()),
                },
            ],
        )
        .await?;
        if let Some(reason) = replies.iter().find_map(|r| r.error()) {
            return Err(StoreError::Protocol(reason.to_owned()));
        }
        debug!(key = %key, "claim released; finished published");
        Ok(())
    }
}

fn lease_seconds(lease: Duration) -> i64 {
    i64::try_from(lease.as_secs().max(1)).unwrap_or(i64::MAX)
}

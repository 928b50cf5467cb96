//! In-process [`Store`] with per-key expiry and pub/sub channels.
//!
//! Models a single-threaded key-value server: each batch is applied under one
//! lock, keys expire lazily on access (plus an optional sweeper task), and
//! channels are `tokio::sync::broadcast` senders created on first subscribe.
//! A publish retires its channel: current subscribers get the message and then
//! see the channel closed. Senders whose subscribers all left are pruned by
//! the sweeper.
//! Expiry runs on the tokio clock, so paused-clock tests can drive leases and
//! record TTLs deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Command, Reply, Store, StoreError, TTL_MISSING, TTL_PERSISTENT};
use crate::BoxFuture;
use crate::notify::{NotificationClient, NotifyError, Subscription};

/// Messages buffered per subscriber before it starts lagging.
const CHANNEL_CAPACITY: usize = 16;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

#[derive(Debug)]
enum Value {
    Str(Bytes),
    Hash(BTreeMap<String, Bytes>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// An in-memory key-value store.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use rttp_cache::store::{Command, MemoryStore, Reply, Store};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// let replies = store
///     .execute(vec![
///         Command::SetIfAbsent { key: "k".into(), value: Bytes::from_static(b"1") },
///         Command::SetIfAbsent { key: "k".into(), value: Bytes::from_static(b"1") },
///     ])
///     .await
///     .unwrap();
/// assert_eq!(replies, vec![Reply::Integer(1), Reply::Integer(0)]);
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.data)
            .map(|data| data.values().filter(|e| !e.is_expired(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of channels that still hold a sender.
    pub fn channel_count(&self) -> usize {
        lock(&self.channels).map(|channels| channels.len()).unwrap_or(0)
    }

    /// Drops every channel nobody is subscribed to. Returns how many were dropped.
    pub fn prune_channels(&self) -> usize {
        match lock(&self.channels) {
            Ok(mut channels) => {
                let before = channels.len();
                channels.retain(|_, sender| sender.receiver_count() > 0);
                before - channels.len()
            }
            Err(_) => 0,
        }
    }

    /// Removes every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        match lock(&self.data) {
            Ok(mut data) => {
                let before = data.len();
                data.retain(|_, e| !e.is_expired(now));
                before - data.len()
            }
            Err(_) => 0,
        }
    }

    /// Spawns a task that calls [`purge_expired`](Self::purge_expired) and
    /// [`prune_channels`](Self::prune_channels) every `every`. The task ends
    /// once the store is dropped.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else { break };
                let purged = store.purge_expired();
                let pruned = store.prune_channels();
                if purged > 0 || pruned > 0 {
                    debug!(purged, pruned, "expired keys and idle channels swept");
                }
            }
        })
    }

    fn apply(
        &self,
        data: &mut HashMap<String, Entry>,
        command: Command,
        now: Instant,
    ) -> Reply {
        trace!(command = command.name(), "apply");
        match command {
            Command::HashGet { key, fields } => match live(data, &key, now) {
                None => Reply::Values(vec![None; fields.len()]),
                Some(Entry {
                    value: Value::Hash(hash),
                    ..
                }) => Reply::Values(fields.iter().map(|f| hash.get(f).cloned()).collect()),
                Some(_) => Reply::Error(WRONGTYPE.to_owned()),
            },
            Command::HashGetAll { key } => match live(data, &key, now) {
                None => Reply::Pairs(Vec::new()),
                Some(Entry {
                    value: Value::Hash(hash),
                    ..
                }) => Reply::Pairs(hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
                Some(_) => Reply::Error(WRONGTYPE.to_owned()),
            },
            Command::HashSet { key, fields } => {
                if fields.is_empty() {
                    return Reply::Error("ERR wrong number of arguments for HSET".to_owned());
                }
                evict_expired(data, &key, now);
                let entry = data.entry(key).or_insert_with(|| Entry {
                    value: Value::Hash(BTreeMap::new()),
                    expires_at: None,
                });
                match &mut entry.value {
                    Value::Hash(hash) => {
                        let mut added = 0;
                        for (field, value) in fields {
                            if hash.insert(field, value).is_none() {
                                added += 1;
                            }
                        }
                        Reply::Integer(added)
                    }
                    Value::Str(_) => Reply::Error(WRONGTYPE.to_owned()),
                }
            }
            Command::Ttl { key } => match live(data, &key, now) {
                None => Reply::Integer(TTL_MISSING),
                Some(Entry {
                    expires_at: None, ..
                }) => Reply::Integer(TTL_PERSISTENT),
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => {
                    let remaining = at.saturating_duration_since(now).as_millis();
                    Reply::Integer(i64::try_from((remaining + 500) / 1000).unwrap_or(i64::MAX))
                }
            },
            Command::Expire { key, seconds } => {
                if live(data, &key, now).is_none() {
                    return Reply::Integer(0);
                }
                set_expiry(data, key, seconds, now)
            }
            Command::ExpireIfPersistent { key, seconds } => match live(data, &key, now) {
                Some(Entry {
                    expires_at: None, ..
                }) => set_expiry(data, key, seconds, now),
                _ => Reply::Integer(0),
            },
            Command::SetIfAbsent { key, value } => {
                if live(data, &key, now).is_some() {
                    return Reply::Integer(0);
                }
                data.insert(
                    key,
                    Entry {
                        value: Value::Str(value),
                        expires_at: None,
                    },
                );
                Reply::Integer(1)
            }
            Command::Exists { key } => Reply::Integer(i64::from(live(data, &key, now).is_some())),
            Command::Delete { key } => {
                let existed = live(data, &key, now).is_some();
                data.remove(&key);
                Reply::Integer(i64::from(existed))
            }
            Command::Publish { channel, message } => {
                Reply::Integer(self.publish(&channel, message))
            }
        }
    }

    fn publish(&self, channel: &str, message: Bytes) -> i64 {
        let Ok(mut channels) = lock(&self.channels) else {
            return 0;
        };
        let Some(sender) = channels.get(channel) else {
            return 0;
        };
        let reached = sender.send(message).unwrap_or(0);
        // Receivers keep what was already sent to them; later subscribers get a
        // fresh sender.
        channels.remove(channel);
        i64::try_from(reached).unwrap_or(i64::MAX)
    }
}

impl Store for MemoryStore {
    fn execute(&self, batch: Vec<Command>) -> BoxFuture<'_, Result<Vec<Reply>, StoreError>> {
        Box::pin(async move {
            let now = Instant::now();
            let mut data = lock(&self.data)?;
            let replies = batch
                .into_iter()
                .map(|command| self.apply(&mut data, command, now))
                .collect();
            Ok(replies)
        })
    }
}

impl NotificationClient for MemoryStore {
    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
    ) -> BoxFuture<'a, Result<Subscription, NotifyError>> {
        Box::pin(async move {
            let mut channels = lock(&self.channels)?;
            let rx = match channels.get(channel) {
                Some(sender) => sender.subscribe(),
                None => {
                    let (sender, rx) = broadcast::channel(CHANNEL_CAPACITY);
                    channels.insert(channel.to_owned(), sender);
                    rx
                }
            };
            Ok(Subscription::new(channel, rx))
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_owned()))
}

/// Applies a TTL to a live key. Non-positive values delete it.
fn set_expiry(
    data: &mut HashMap<String, Entry>,
    key: String,
    seconds: i64,
    now: Instant,
) -> Reply {
    if seconds <= 0 {
        data.remove(&key);
        return Reply::Integer(1);
    }
    let Some(at) = now.checked_add(Duration::from_secs(seconds.unsigned_abs())) else {
        return Reply::Error("ERR invalid expire time".to_owned());
    };
    if let Some(entry) = data.get_mut(&key) {
        entry.expires_at = Some(at);
    }
    Reply::Integer(1)
}

fn evict_expired(data: &mut HashMap<String, Entry>, key: &str, now: Instant) {
    if data.get(key).is_some_and(|e| e.is_expired(now)) {
        data.remove(key);
    }
}

fn live<'a>(data: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a Entry> {
    evict_expired(data, key, now);
    data.get(key)
}

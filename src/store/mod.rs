//! Key-value store collaborator: batched commands with native TTL support.
//!
//! The cache talks to its backing store exclusively through [`Store::execute`],
//! which sends an ordered batch of [`Command`]s and returns one [`Reply`] per
//! command, in the same order. A batch is one round trip; it is **not** a
//! transaction, so callers must tolerate other flows interleaving between
//! commands of different batches.
//!
//! Two kinds of failure are distinguished:
//!
//! - the round trip itself fails → `Err(StoreError)` for the whole batch;
//! - an individual command is rejected → [`Reply::Error`] in its slot, while the
//!   other commands of the batch may still have been applied.
//!
//! TTL replies follow the usual key-value server conventions: `-2` when the key
//! does not exist, `-1` when it exists without an expiry.

use bytes::Bytes;
use thiserror::Error;

use crate::BoxFuture;

pub mod memory;

pub use memory::MemoryStore;

/// TTL reply for a key that does not exist.
pub const TTL_MISSING: i64 = -2;

/// TTL reply for a key that exists but never expires.
pub const TTL_PERSISTENT: i64 = -1;

/// Errors produced by the store collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store protocol error: {0}")]
    Protocol(String),

    #[error("partial write: {failed} of {total} commands failed (first failure: {reason})")]
    PartialWrite {
        failed: usize,
        total: usize,
        reason: String,
    },
}

/// A single store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read selected fields of a hash. Replies [`Reply::Values`].
    HashGet { key: String, fields: Vec<String> },
    /// Read every field of a hash. Replies [`Reply::Pairs`] (empty if missing).
    HashGetAll { key: String },
    /// Write fields into a hash, creating it if needed. Replies [`Reply::Integer`]
    /// with the number of new fields.
    HashSet {
        key: String,
        fields: Vec<(String, Bytes)>,
    },
    /// Remaining time to live in whole seconds. Replies [`Reply::Integer`].
    Ttl { key: String },
    /// Set a time to live. Non-positive values delete the key. Replies `1` if the
    /// key existed, `0` otherwise.
    Expire { key: String, seconds: i64 },
    /// Like [`Expire`](Self::Expire), but only applied to a key that currently
    /// has no expiry. Replies `1` if the expiry was set, `0` otherwise.
    ExpireIfPersistent { key: String, seconds: i64 },
    /// Create a string value only if the key is absent. Replies `1` if created.
    SetIfAbsent { key: String, value: Bytes },
    /// Replies `1` if the key exists.
    Exists { key: String },
    /// Replies `1` if the key existed and was removed.
    Delete { key: String },
    /// Broadcast a message. Replies the number of subscribers reached.
    Publish { channel: String, message: Bytes },
}

impl Command {
    /// Short command name, used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HashGet { .. } => "HMGET",
            Self::HashGetAll { .. } => "HGETALL",
            Self::HashSet { .. } => "HSET",
            Self::Ttl { .. } => "TTL",
            Self::Expire { .. } => "EXPIRE",
            Self::ExpireIfPersistent { .. } => "EXPIRE NX",
            Self::SetIfAbsent { .. } => "SETNX",
            Self::Exists { .. } => "EXISTS",
            Self::Delete { .. } => "DEL",
            Self::Publish { .. } => "PUBLISH",
        }
    }
}

/// A single command reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Integer(i64),
    Values(Vec<Option<Bytes>>),
    Pairs(Vec<(String, Bytes)>),
    Error(String),
}

impl Reply {
    /// Unwraps an integer reply.
    pub fn into_integer(self) -> Result<i64, StoreError> {
        match self {
            Self::Integer(n) => Ok(n),
            other => Err(other.unexpected("integer")),
        }
    }

    /// Unwraps a field-values reply.
    pub fn into_values(self) -> Result<Vec<Option<Bytes>>, StoreError> {
        match self {
            Self::Values(values) => Ok(values),
            other => Err(other.unexpected("values")),
        }
    }

    /// Unwraps a field-pairs reply.
    pub fn into_pairs(self) -> Result<Vec<(String, Bytes)>, StoreError> {
        match self {
            Self::Pairs(pairs) => Ok(pairs),
            other => Err(other.unexpected("pairs")),
        }
    }

    /// Returns the error message if this is an error reply.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }

    fn unexpected(self, wanted: &str) -> StoreError {
        match self {
            Self::Error(msg) => StoreError::Protocol(msg),
            other => StoreError::Protocol(format!("expected {wanted} reply, got {other:?}")),
        }
    }
}

/// A key-value store reachable through batched round trips.
///
/// Implementations must return exactly one reply per command, in command order.
pub trait Store: Send + Sync {
    /// Executes `batch` in one round trip.
    fn execute(&self, batch: Vec<Command>) -> BoxFuture<'_, Result<Vec<Reply>, StoreError>>;
}

/// Executes `batch` and checks the reply count.
pub(crate) async fn round_trip(
    store: &dyn Store,
    batch: Vec<Command>,
) -> Result<Vec<Reply>, StoreError> {
    let expected = batch.len();
    let replies = store.execute(batch).await?;
    if replies.len() != expected {
        return Err(StoreError::Protocol(format!(
            "expected {expected} replies, got {}",
            replies.len()
        )));
    }
    Ok(replies)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reply_becomes_protocol_error() {
        let err = Reply::Error("WRONGTYPE".into()).into_integer().unwrap_err();
        assert!(matches!(err, StoreError::Protocol(msg) if msg == "WRONGTYPE"));
    }

    #[test]
    fn mismatched_reply_kind() {
        let err = Reply::Integer(3).into_pairs().unwrap_err();
        assert!(err.to_string().contains("expected pairs"));
    }
}

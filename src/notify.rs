//! Notification collaborator: "fetch finished" broadcasts between flows.
//!
//! A leader publishes [`FINISHED`] on a channel named after the record key once
//! the fresh response is saved. Followers subscribe to that channel and wait,
//! always under a deadline: a follower that misses the message must time out,
//! never hang.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;

use crate::BoxFuture;
use crate::store::StoreError;

/// Payload published by a leader after a successful fetch.
pub const FINISHED: &str = "finished";

/// Errors produced while waiting for a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no notification on {channel} within {waited:?}")]
    Timeout { channel: String, waited: Duration },

    #[error("notification channel {channel} closed")]
    Closed { channel: String },

    #[error("notification transport failed: {0}")]
    Store(#[from] StoreError),
}

/// A message received on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub message: Bytes,
}

impl Notification {
    /// Returns `true` if this is the leader's completion message.
    pub fn is_finished(&self) -> bool {
        self.message.as_ref() == FINISHED.as_bytes()
    }
}

/// A live subscription to one channel.
///
/// Messages published after the subscription was created are buffered until
/// [`wait`](Self::wait) consumes them.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Bytes>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: broadcast::Receiver<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next message, giving up after `deadline`.
    ///
    /// # Errors
    ///
    /// - [`NotifyError::Timeout`]: nothing arrived in time.
    /// - [`NotifyError::Closed`]: the publisher side went away.
    pub async fn wait(&mut self, deadline: Duration) -> Result<Notification, NotifyError> {
        // A deadline past the clock's range never fires.
        let until = Instant::now().checked_add(deadline);
        loop {
            let received = match until {
                Some(until) => tokio::time::timeout_at(until, self.rx.recv()).await,
                None => Ok(self.rx.recv().await),
            };
            match received {
                Err(_) => {
                    return Err(NotifyError::Timeout {
                        channel: self.channel.clone(),
                        waited: deadline,
                    });
                }
                Ok(Ok(message)) => {
                    return Ok(Notification {
                        channel: self.channel.clone(),
                        message,
                    });
                }
                // Older messages were dropped; the next recv yields the oldest kept one.
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::debug!(channel = %self.channel, skipped, "subscription lagged");
                }
                Ok(Err(RecvError::Closed)) => {
                    return Err(NotifyError::Closed {
                        channel: self.channel.clone(),
                    });
                }
            }
        }
    }
}

/// Subscribes to named channels.
pub trait NotificationClient: Send + Sync {
    /// Opens a subscription on `channel`. Messages published before this call
    /// completes are not observed.
    fn subscribe<'a>(&'a self, channel: &'a str)
    -> BoxFuture<'a, Result<Subscription, NotifyError>>;

    /// Subscribes and waits for the first message, bounded by `deadline`.
    fn wait<'a>(
        &'a self,
        channel: &'a str,
        deadline: Duration,
    ) -> BoxFuture<'a, Result<Notification, NotifyError>> {
        Box::pin(async move {
            let mut subscription = self.subscribe(channel).await?;
            subscription.wait(deadline).await
        })
    }
}

//! Errors surfaced by `fetch`.
//!
//! Cache absence and staleness never appear here; they are freshness states.

use thiserror::Error;

use super::envelope::ResponseEnvelope;
use crate::http::StatusCode;
use crate::notify::NotifyError;
use crate::origin::OriginError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The origin call failed or timed out. Not retried.
    #[error("origin fetch for {uri} failed: {source}")]
    Origin {
        uri: String,
        #[source]
        source: OriginError,
    },

    /// The store was unreachable or rejected a claim/read command.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Waiting for the leader failed or timed out.
    #[error(transparent)]
    Notification(#[from] NotifyError),

    /// The origin answered but the response could not be stored. The fetched
    /// response is kept so the caller can still serve it.
    #[error("saving {uri} failed: {source}")]
    Save {
        uri: String,
        #[source]
        source: StoreError,
        response: Box<ResponseEnvelope>,
    },
}

impl FetchError {
    /// The status served when no stale record can stand in.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Origin {
                source: OriginError::Timeout { .. },
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            Self::Origin { .. } => StatusCode::BAD_GATEWAY,
            Self::Notification(NotifyError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Self::Notification(_) | Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Save { response, .. } => StatusCode::new(response.status),
        }
    }

    /// Returns `true` for the deadline-driven failures.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Origin {
                source: OriginError::Timeout { .. },
                ..
            } | Self::Notification(NotifyError::Timeout { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_mapping() {
        let timeout = FetchError::Origin {
            uri: "/a".into(),
            source: OriginError::Timeout {
                after: Duration::from_secs(1),
            },
        };
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(timeout.is_timeout());

        let malformed = FetchError::Origin {
            uri: "/a".into(),
            source: OriginError::Malformed("bad".into()),
        };
        assert_eq!(malformed.status(), StatusCode::BAD_GATEWAY);

        let waited = FetchError::from(NotifyError::Timeout {
            channel: "cache:record:/a".into(),
            waited: Duration::from_secs(2),
        });
        assert_eq!(waited.status(), StatusCode::GATEWAY_TIMEOUT);

        let store = FetchError::from(StoreError::Unavailable("down".into()));
        assert_eq!(store.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!store.is_timeout());
    }
}

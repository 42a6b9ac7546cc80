//! Error types shared by the playback core.
//!
//! Every failure that can reach a user carries a human-readable reason.
//! Timeouts are kept apart from explicit remote errors so the command layer
//! can tell "the node never answered" from "the node said no".

use std::time::Duration;
use thiserror::Error;

use crate::nodes::NodeId;

pub type PlaybackResult<T> = Result<T, PlaybackError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlaybackError {
    /// No healthy node, or the local engine could not be used.
    #[error("no audio transport available: {0}")]
    TransportUnavailable(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("node {node} rejected {operation}: {message}")]
    Remote {
        node: NodeId,
        operation: &'static str,
        message: String,
    },

    #[error("audio node {0} is unreachable")]
    NodeUnreachable(NodeId),

    #[error("could not play {title}: {reason}")]
    TrackLoadFailure { title: String, reason: String },

    #[error("{0}")]
    QueueLimitExceeded(String),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("the player for this server has been shut down")]
    PlayerDestroyed,

    #[error("already connecting to a voice channel")]
    ConnectInProgress,

    #[error("there is no track at queue position {0}")]
    InvalidQueuePosition(usize),
}

impl PlaybackError {
    /// True when the failure should drop the player back to `NotConnected`.
    /// A node that answered with a rejection is still reachable.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable(_) | Self::Timeout { .. } | Self::NodeUnreachable(_)
        )
    }
}

/// Rejections from the pending search-selection cache.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("you have no active search selection")]
    NoActiveSelection,

    #[error("your search selection has expired, please search again")]
    Expired,

    #[error("pick a number between 1 and {available} (got {index})")]
    IndexOutOfRange { index: usize, available: usize },

    #[error("'{0}' is not a valid selection")]
    Unparsable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_reported_differently_from_remote_errors() {
        let timeout = PlaybackError::Timeout {
            operation: "connect",
            after: Duration::from_secs(10),
        };
        let remote = PlaybackError::Remote {
            node: NodeId::from("eu-1"),
            operation: "connect",
            message: "bad channel".to_string(),
        };

        assert_eq!(timeout.to_string(), "connect timed out after 10s");
        assert_eq!(remote.to_string(), "node eu-1 rejected connect: bad channel");
        assert!(timeout.is_transport_failure());
        assert!(!remote.is_transport_failure());
        assert!(!PlaybackError::QueueLimitExceeded("full".into()).is_transport_failure());
    }
}

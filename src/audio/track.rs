use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::UserId;
use std::time::Duration;

/// A resolved, playable track as returned by the track-loading service.
///
/// `identifier` is what the transport plays: an encoded track for remote
/// nodes, or a URL / search string for the local engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub identifier: String,
    pub title: String,
    pub uri: Option<String>,
    pub duration: Option<Duration>,
    pub is_stream: bool,
}

impl TrackInfo {
    pub fn new(identifier: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            title: title.into(),
            uri: None,
            duration: None,
            is_stream: false,
        }
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn as_stream(mut self) -> Self {
        self.is_stream = true;
        self
    }

    /// Source handed to the local engine.
    pub fn playable_source(&self) -> &str {
        self.uri.as_deref().unwrap_or(&self.identifier)
    }
}

/// A track sitting in a guild queue. Never mutated after creation; the queue
/// only moves `Arc`s of it around, so identity is pointer identity.
#[derive(Debug)]
pub struct QueuedTrack {
    track: TrackInfo,
    requested_by: UserId,
    added_at: DateTime<Utc>,
}

impl QueuedTrack {
    pub fn new(track: TrackInfo, requested_by: UserId) -> Self {
        Self {
            track,
            requested_by,
            added_at: Utc::now(),
        }
    }

    pub fn track(&self) -> &TrackInfo {
        &self.track
    }

    pub fn title(&self) -> &str {
        &self.track.title
    }

    pub fn identifier(&self) -> &str {
        &self.track.identifier
    }

    pub fn requested_by(&self) -> UserId {
        self.requested_by
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_source_prefers_uri() {
        let bare = TrackInfo::new("ytsearch:lofi", "Lofi");
        let linked = bare.clone().with_uri("https://youtu.be/abc");

        assert_eq!(bare.playable_source(), "ytsearch:lofi");
        assert_eq!(linked.playable_source(), "https://youtu.be/abc");
    }
}

//! Control channel to a remote audio node.
//!
//! Operations go out as JSON over HTTP, the health ping is a `GET` returning
//! a single load number, and events come back as newline-delimited JSON on a
//! long-lived `GET /v1/events` response.

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{NodeId, NodeManager};
use crate::audio::events::{TrackEndReason, TrackException};

const EVENT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Operation messages understood by a node. `generation` on `play` is
/// echoed back on every event about that play.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeOp {
    Connect { guild_id: u64, channel_id: u64 },
    Play { guild_id: u64, track: String, start_offset_ms: u64, generation: u64 },
    Pause { guild_id: u64, paused: bool },
    Stop { guild_id: u64 },
    Seek { guild_id: u64, position_ms: u64 },
    SetVolume { guild_id: u64, volume: u8 },
    Destroy { guild_id: u64 },
}

impl NodeOp {
    pub fn connect(guild_id: GuildId, channel_id: ChannelId) -> Self {
        Self::Connect {
            guild_id: guild_id.get(),
            channel_id: channel_id.get(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Play { .. } => "play",
            Self::Pause { .. } => "pause",
            Self::Stop { .. } => "stop",
            Self::Seek { .. } => "seek",
            Self::SetVolume { .. } => "setVolume",
            Self::Destroy { .. } => "destroy",
        }
    }
}

/// Event messages pushed by a node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeEvent {
    TrackStart {
        guild_id: u64,
        generation: u64,
        track: String,
    },
    TrackEnd {
        guild_id: u64,
        generation: u64,
        track: String,
        reason: TrackEndReason,
    },
    TrackException {
        guild_id: u64,
        generation: u64,
        track: String,
        exception: TrackException,
    },
    PlayerUpdate {
        guild_id: u64,
        generation: u64,
        position_ms: u64,
    },
    NodeDisconnected {
        guild_id: u64,
    },
}

impl NodeEvent {
    pub fn guild_id(&self) -> Option<GuildId> {
        let raw = match self {
            Self::TrackStart { guild_id, .. }
            | Self::TrackEnd { guild_id, .. }
            | Self::TrackException { guild_id, .. }
            | Self::PlayerUpdate { guild_id, .. }
            | Self::NodeDisconnected { guild_id } => *guild_id,
        };
        (raw != 0).then(|| GuildId::new(raw))
    }
}

/// Health ping response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct NodeStats {
    pub load: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeClientError {
    #[error("node unreachable: {0}")]
    Unreachable(String),

    #[error("node answered {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for NodeClientError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            Self::Rejected {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Unreachable(err.to_string())
        } else {
            Self::Protocol(err.to_string())
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn send(&self, op: NodeOp) -> Result<(), NodeClientError>;
    async fn ping(&self) -> Result<NodeStats, NodeClientError>;
}

pub struct HttpNodeClient {
    http: reqwest::Client,
    base: Url,
    password: String,
}

impl HttpNodeClient {
    pub fn new(http: reqwest::Client, base: Url, password: impl Into<String>) -> Self {
        Self {
            http,
            base,
            password: password.into(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, NodeClientError> {
        self.base
            .join(path)
            .map_err(|e| NodeClientError::Protocol(format!("bad node url: {e}")))
    }

    /// Follows the node's event stream until `cancel` fires, reconnecting
    /// after a short delay whenever the stream drops.
    pub async fn listen(
        self: Arc<Self>,
        node_id: NodeId,
        manager: Arc<NodeManager>,
        cancel: CancellationToken,
    ) {
        info!("📡 Listening for events from node {}", node_id);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.stream_events(&node_id, &manager) => match result {
                    Ok(()) => debug!("Event stream from node {} closed", node_id),
                    Err(e) => warn!("⚠️ Event stream from node {} failed: {}", node_id, e),
                },
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(EVENT_RECONNECT_DELAY) => {}
            }
        }
        debug!("Stopped listening to node {}", node_id);
    }

    async fn stream_events(
        &self,
        node_id: &NodeId,
        manager: &NodeManager,
    ) -> Result<(), NodeClientError> {
        let response = self
            .http
            .get(self.endpoint("v1/events")?)
            .header(AUTHORIZATION, &self.password)
            .send()
            .await?
            .error_for_status()?;

        let mut stream = response.bytes_stream();
        let mut buffer = BytesMut::new();

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);

            while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(newline + 1);
                let line = line[..newline].trim_ascii();
                if line.is_empty() {
                    continue;
                }

                match serde_json::from_slice::<NodeEvent>(line) {
                    Ok(event) => manager.handle_node_event(node_id, event).await,
                    Err(e) => warn!("⚠️ Unparsable event from node {}: {}", node_id, e),
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn send(&self, op: NodeOp) -> Result<(), NodeClientError> {
        let response = self
            .http
            .post(self.endpoint("v1/ops")?)
            .header(AUTHORIZATION, &self.password)
            .json(&op)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(NodeClientError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }

    async fn ping(&self) -> Result<NodeStats, NodeClientError> {
        let stats = self
            .http
            .get(self.endpoint("v1/health")?)
            .header(AUTHORIZATION, &self.password)
            .send()
            .await?
            .error_for_status()?
            .json::<NodeStats>()
            .await?;
        Ok(stats)
    }
}

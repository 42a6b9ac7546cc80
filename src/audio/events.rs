//! Track and transport events flowing from the engine or a remote node back
//! into the owning [`GuildPlayer`](super::player::GuildPlayer).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::sync::{OnceLock, Weak};
use tracing::{debug, warn};

use super::facade::TransportRoute;

/// Why a track stopped. Only `Finished` and `LoadFailed` may start the next
/// track; the others are side effects of our own stop/replace calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackEndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl TrackEndReason {
    pub fn may_start_next(self) -> bool {
        matches!(self, Self::Finished | Self::LoadFailed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExceptionKind {
    /// A load attempt found nothing. Deliberately not forwarded.
    NoMatches,
    Common,
    Suspicious,
    Fault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackException {
    pub kind: ExceptionKind,
    pub message: String,
}

/// Track events carry the generation of the `play` that started them. A
/// player bumps its generation on every `play`, so events from an earlier
/// play of the same song are told apart from the current one.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    TrackStart {
        generation: u64,
        track: String,
    },
    TrackEnd {
        generation: u64,
        track: String,
        reason: TrackEndReason,
    },
    TrackException {
        generation: u64,
        track: String,
        error: TrackException,
    },
    /// Playback position reported by a remote node.
    PositionUpdate {
        generation: u64,
        position_ms: u64,
    },
    /// The transport carrying this guild went away. `fallback` is where to
    /// reconnect, or `None` when nothing healthy is left.
    NodeDisconnected {
        fallback: Option<TransportRoute>,
    },
}

/// Narrow callback surface a guild player exposes to the transport layer.
#[async_trait]
pub trait TrackEventListener: Send + Sync {
    async fn on_track_start(&self, generation: u64, track: String);
    async fn on_track_end(&self, generation: u64, track: String, reason: TrackEndReason);
    async fn on_track_exception(&self, generation: u64, track: String, error: TrackException);
    async fn on_position_update(&self, generation: u64, position_ms: u64);
    async fn on_node_disconnect(&self, fallback: Option<TransportRoute>);
}

/// Routes an event to whichever listener currently owns the guild.
#[async_trait]
pub trait PlayerEventSink: Send + Sync {
    async fn dispatch(&self, guild_id: GuildId, event: PlayerEvent);
}

/// Late-bound handle to the sink, shared by the local engine and the node
/// manager. Binding happens once, when the player registry is built.
#[derive(Default)]
pub struct EventRelay {
    sink: OnceLock<Weak<dyn PlayerEventSink>>,
}

impl EventRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, sink: Weak<dyn PlayerEventSink>) {
        if self.sink.set(sink).is_err() {
            warn!("⚠️ Event relay already bound, ignoring second sink");
        }
    }

    pub async fn emit(&self, guild_id: GuildId, event: PlayerEvent) {
        if let PlayerEvent::TrackException { error, .. } = &event {
            if error.kind == ExceptionKind::NoMatches {
                debug!("🔇 Ignoring no-match load exception for guild {}", guild_id);
                return;
            }
        }

        match self.sink.get().and_then(Weak::upgrade) {
            Some(sink) => sink.dispatch(guild_id, event).await,
            None => warn!(
                "⚠️ No player sink bound, dropping {:?} for guild {}",
                event, guild_id
            ),
        }
    }
}

/// Feeds one event into a listener.
pub async fn deliver<L: TrackEventListener + ?Sized>(listener: &L, event: PlayerEvent) {
    match event {
        PlayerEvent::TrackStart { generation, track } => {
            listener.on_track_start(generation, track).await
        }
        PlayerEvent::TrackEnd {
            generation,
            track,
            reason,
        } => listener.on_track_end(generation, track, reason).await,
        PlayerEvent::TrackException {
            generation,
            track,
            error,
        } => listener.on_track_exception(generation, track, error).await,
        PlayerEvent::PositionUpdate {
            generation,
            position_ms,
        } => listener.on_position_update(generation, position_ms).await,
        PlayerEvent::NodeDisconnected { fallback } => listener.on_node_disconnect(fallback).await,
    }
}

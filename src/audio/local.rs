use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use songbird::{
    input::YoutubeDl,
    tracks::{PlayMode, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, info, warn};

use super::events::{EventRelay, ExceptionKind, PlayerEvent, TrackEndReason, TrackException};
use super::facade::LocalEngine;
use super::track::TrackInfo;
use crate::error::{PlaybackError, PlaybackResult};

const DEFAULT_VOLUME: u8 = 100;

struct ActiveTrack {
    token: u64,
    handle: TrackHandle,
}

/// In-process transport backed by songbird.
///
/// Every `play` gets a fresh token. Lifecycle events from songbird only
/// count as a natural end when their token is still the guild's active one;
/// anything else was stopped or replaced by us and must not advance a queue.
pub struct SongbirdEngine {
    songbird: Arc<Songbird>,
    http: reqwest::Client,
    relay: Arc<EventRelay>,
    active: Arc<DashMap<GuildId, ActiveTrack>>,
    volumes: DashMap<GuildId, u8>,
    next_token: AtomicU64,
}

impl SongbirdEngine {
    pub fn new(songbird: Arc<Songbird>, http: reqwest::Client, relay: Arc<EventRelay>) -> Self {
        info!("🎵 Initialising local songbird engine");
        Self {
            songbird,
            http,
            relay,
            active: Arc::new(DashMap::new()),
            volumes: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    fn current_handle(&self, guild_id: GuildId) -> PlaybackResult<TrackHandle> {
        self.active
            .get(&guild_id)
            .map(|track| track.handle.clone())
            .ok_or_else(|| {
                PlaybackError::TransportUnavailable("nothing is playing locally".into())
            })
    }

    fn volume_of(&self, guild_id: GuildId) -> f32 {
        let level = self
            .volumes
            .get(&guild_id)
            .map(|v| *v)
            .unwrap_or(DEFAULT_VOLUME);
        f32::from(level) / 100.0
    }
}

#[async_trait]
impl LocalEngine for SongbirdEngine {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> PlaybackResult<()> {
        self.songbird
            .join(guild_id, channel_id)
            .await
            .map(|_| ())
            .map_err(|e| PlaybackError::TransportUnavailable(format!("voice join failed: {e:?}")))
    }

    async fn disconnect(&self, guild_id: GuildId) -> PlaybackResult<()> {
        if let Some((_, track)) = self.active.remove(&guild_id) {
            let _ = track.handle.stop();
        }
        self.volumes.remove(&guild_id);

        if self.songbird.get(guild_id).is_some() {
            self.songbird.remove(guild_id).await.map_err(|e| {
                PlaybackError::TransportUnavailable(format!("voice leave failed: {e:?}"))
            })?;
        }
        Ok(())
    }

    async fn play(
        &self,
        guild_id: GuildId,
        track: &TrackInfo,
        start: Duration,
        generation: u64,
    ) -> PlaybackResult<()> {
        let call = self.songbird.get(guild_id).ok_or_else(|| {
            PlaybackError::TransportUnavailable("not connected to a voice channel".into())
        })?;

        // Forget the old token first so its End event reads as "replaced".
        self.active.remove(&guild_id);

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let input = YoutubeDl::new(self.http.clone(), track.playable_source().to_string());

        let handle = {
            let mut call = call.lock().await;
            call.play_only_input(input.into())
        };
        handle
            .set_volume(self.volume_of(guild_id))
            .map_err(|e| PlaybackError::TransportUnavailable(format!("{e:?}")))?;
        if !start.is_zero() {
            // The seek lands once the input is playable, which may outlast this call.
            let pending = handle.seek(start);
            tokio::spawn(async move {
                if let Err(e) = pending.result_async().await {
                    warn!("⚠️ Start offset seek failed in guild {}: {:?}", guild_id, e);
                }
            });
        }

        for (event, kind) in [
            (TrackEvent::Play, ForwardKind::Start),
            (TrackEvent::End, ForwardKind::End),
            (TrackEvent::Error, ForwardKind::Error),
        ] {
            handle
                .add_event(
                    Event::Track(event),
                    TrackEventForwarder {
                        guild_id,
                        token,
                        generation,
                        track: track.identifier.clone(),
                        kind,
                        active: self.active.clone(),
                        relay: self.relay.clone(),
                    },
                )
                .map_err(|e| {
                    PlaybackError::TransportUnavailable(format!("track event hookup failed: {e:?}"))
                })?;
        }

        self.active.insert(guild_id, ActiveTrack { token, handle });
        debug!("▶️ Local playback of {} in guild {}", track.title, guild_id);
        Ok(())
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> PlaybackResult<()> {
        let handle = self.current_handle(guild_id)?;
        let result = if paused { handle.pause() } else { handle.play() };
        result.map_err(|e| PlaybackError::TransportUnavailable(format!("{e:?}")))
    }

    async fn stop(&self, guild_id: GuildId) -> PlaybackResult<()> {
        if let Some((_, track)) = self.active.remove(&guild_id) {
            let _ = track.handle.stop();
        }
        Ok(())
    }

    async fn seek(&self, guild_id: GuildId, position: Duration) -> PlaybackResult<()> {
        let handle = self.current_handle(guild_id)?;
        handle
            .seek_async(position)
            .await
            .map(|_| ())
            .map_err(|e| PlaybackError::TransportUnavailable(format!("seek failed: {e:?}")))
    }

    async fn set_volume(&self, guild_id: GuildId, volume: u8) -> PlaybackResult<()> {
        self.volumes.insert(guild_id, volume);
        if let Some(track) = self.active.get(&guild_id) {
            track
                .handle
                .set_volume(f32::from(volume) / 100.0)
                .map_err(|e| PlaybackError::TransportUnavailable(format!("{e:?}")))?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum ForwardKind {
    Start,
    End,
    Error,
}

struct TrackEventForwarder {
    guild_id: GuildId,
    token: u64,
    generation: u64,
    track: String,
    kind: ForwardKind,
    active: Arc<DashMap<GuildId, ActiveTrack>>,
    relay: Arc<EventRelay>,
}

impl TrackEventForwarder {
    /// Clears the guild's active track if it is still ours.
    fn claim(&self) -> bool {
        self.active
            .remove_if(&self.guild_id, |_, active| active.token == self.token)
            .is_some()
    }
}

#[async_trait]
impl VoiceEventHandler for TrackEventForwarder {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let mut events = Vec::new();

        match self.kind {
            ForwardKind::Start => events.push(PlayerEvent::TrackStart {
                generation: self.generation,
                track: self.track.clone(),
            }),
            ForwardKind::End => {
                let reason = if self.claim() {
                    TrackEndReason::Finished
                } else {
                    TrackEndReason::Replaced
                };
                events.push(PlayerEvent::TrackEnd {
                    generation: self.generation,
                    track: self.track.clone(),
                    reason,
                });
            }
            ForwardKind::Error => {
                if !self.claim() {
                    debug!("Ignoring error from replaced track in guild {}", self.guild_id);
                    return None;
                }
                let message = match ctx {
                    EventContext::Track(states) => states
                        .iter()
                        .find_map(|(state, _)| match &state.playing {
                            PlayMode::Errored(e) => Some(format!("{e:?}")),
                            _ => None,
                        })
                        .unwrap_or_else(|| "playback error".to_string()),
                    _ => "playback error".to_string(),
                };
                warn!("❌ Local track error in guild {}: {}", self.guild_id, message);
                events.push(PlayerEvent::TrackException {
                    generation: self.generation,
                    track: self.track.clone(),
                    error: TrackException {
                        kind: ExceptionKind::Fault,
                        message,
                    },
                });
                events.push(PlayerEvent::TrackEnd {
                    generation: self.generation,
                    track: self.track.clone(),
                    reason: TrackEndReason::LoadFailed,
                });
            }
        }

        // Don't stall the driver's event thread on a busy player.
        let relay = self.relay.clone();
        let guild_id = self.guild_id;
        tokio::spawn(async move {
            for event in events {
                relay.emit(guild_id, event).await;
            }
        });

        None
    }
}

//! # Guild Player
//!
//! One [`GuildPlayer`] per guild. It owns the guild's [`TrackQueue`] and drives
//! the transport through a [`PlayerHandle`]. Every mutation, whether it comes
//! from a command or from an engine callback, runs under the same per-guild
//! mutex, so a skip and a track end can never both advance the queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::events::{deliver, PlayerEvent, TrackEndReason, TrackEventListener, TrackException};
use super::facade::{AudioConnectionFacade, PlayerHandle, TransportRoute};
use super::queue::{RepeatMode, TrackQueue};
use super::track::QueuedTrack;
use crate::error::{PlaybackError, PlaybackResult};

pub const DEFAULT_VOLUME: u8 = 100;
pub const MAX_VOLUME: u8 = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlayerState {
    NotConnected,
    Connecting,
    Playing,
    Paused,
    /// Connected, with nothing left to play.
    Idle,
    Destroyed,
}

/// Things that happen to a player outside any command's control flow.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerNotice {
    TrackStarted {
        guild_id: GuildId,
        title: String,
    },
    TrackFailed {
        guild_id: GuildId,
        title: String,
        reason: String,
    },
    QueueFinished {
        guild_id: GuildId,
    },
    Resumed {
        guild_id: GuildId,
        route: TransportRoute,
        position_ms: u64,
    },
    TransportLost {
        guild_id: GuildId,
        reason: String,
    },
}

/// Result of a play/pause style command that may legitimately do nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Changed,
    AlreadyInState,
    NotConnected,
    NothingPlaying,
    NotSeekable,
}

#[derive(Debug, Clone)]
pub enum VoteSkip {
    Registered { votes: usize, required: usize },
    AlreadyVoted { votes: usize, required: usize },
    Skipped { track: Arc<QueuedTrack> },
    NothingPlaying,
}

impl PartialEq for VoteSkip {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Skipped { track: a }, Self::Skipped { track: b }) => Arc::ptr_eq(a, b),
            (
                Self::Registered { votes: a, required: x },
                Self::Registered { votes: b, required: y },
            )
            | (
                Self::AlreadyVoted { votes: a, required: x },
                Self::AlreadyVoted { votes: b, required: y },
            ) => a == b && x == y,
            (Self::NothingPlaying, Self::NothingPlaying) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Enqueued {
    pub track: Arc<QueuedTrack>,
    /// 0-based position among the upcoming tracks, `None` when it started
    /// playing straight away.
    pub position: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct PlayerSettings {
    pub default_volume: u8,
    pub history_size: usize,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            default_volume: DEFAULT_VOLUME,
            history_size: super::queue::DEFAULT_HISTORY_SIZE,
        }
    }
}

/// Point-in-time view for queue and now-playing displays.
#[derive(Debug, Clone)]
pub struct PlayerSnapshot {
    pub state: PlayerState,
    pub current: Option<Arc<QueuedTrack>>,
    pub upcoming: Vec<Arc<QueuedTrack>>,
    pub history: Vec<Arc<QueuedTrack>>,
    pub position_ms: Option<u64>,
    pub volume: u8,
    pub repeat: RepeatMode,
    pub shuffled: bool,
    pub channel_id: Option<ChannelId>,
    pub route: Option<TransportRoute>,
    pub total_duration: Duration,
}

struct PlayerInner {
    queue: TrackQueue,
    volume: u8,
    paused: bool,
    channel_id: Option<ChannelId>,
    route: Option<TransportRoute>,
    skip_votes: HashSet<UserId>,
    /// Last offset reported for the current track.
    position_ms: Option<u64>,
    /// Bumped on every `play`. Track events from older plays are stale.
    generation: u64,
}

impl PlayerInner {
    /// The current track, if `generation` and `track` name the play in
    /// progress.
    fn current_play(&self, generation: u64, track: &str) -> Option<Arc<QueuedTrack>> {
        if generation != self.generation {
            return None;
        }
        self.queue
            .current()
            .filter(|current| current.identifier() == track)
            .cloned()
    }
}

pub struct GuildPlayer {
    guild_id: GuildId,
    inner: Mutex<PlayerInner>,
    state: watch::Sender<PlayerState>,
    destroyed: AtomicBool,
    facade: Arc<AudioConnectionFacade>,
    handle: PlayerHandle,
    notices: broadcast::Sender<PlayerNotice>,
}

impl GuildPlayer {
    pub fn new(
        guild_id: GuildId,
        facade: Arc<AudioConnectionFacade>,
        settings: PlayerSettings,
        notices: broadcast::Sender<PlayerNotice>,
    ) -> Self {
        let (state, _) = watch::channel(PlayerState::NotConnected);
        Self {
            guild_id,
            inner: Mutex::new(PlayerInner {
                queue: TrackQueue::new(settings.history_size),
                volume: settings.default_volume.min(MAX_VOLUME),
                paused: false,
                channel_id: None,
                route: None,
                skip_votes: HashSet::new(),
                position_ms: None,
                generation: 0,
            }),
            state,
            destroyed: AtomicBool::new(false),
            handle: facade.create_player_handle(guild_id),
            facade,
            notices,
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn state(&self) -> PlayerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.state.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Connects to (or moves to) `channel_id` and starts whatever is queued.
    pub async fn join(&self, channel_id: ChannelId) -> PlaybackResult<PlayerState> {
        self.ensure_alive()?;
        if self.state() == PlayerState::Connecting {
            return Err(PlaybackError::ConnectInProgress);
        }

        let mut inner = self.lock().await?;
        if inner.channel_id == Some(channel_id) && inner.route.is_some() {
            debug!("Guild {} already in channel {}", self.guild_id, channel_id);
            return Ok(self.state());
        }

        self.set_state(PlayerState::Connecting);
        let route = match self.facade.open_connection(self.guild_id, channel_id).await {
            Ok(route) => route,
            Err(e) => {
                warn!("❌ Guild {} failed to join {}: {}", self.guild_id, channel_id, e);
                // Also drops the connection to the channel we were in.
                self.close_transport(&mut inner).await;
                self.set_state(PlayerState::NotConnected);
                return Err(e);
            }
        };

        inner.channel_id = Some(channel_id);
        inner.route = Some(route);
        if inner.volume != DEFAULT_VOLUME {
            let applied = self.handle.set_volume(inner.volume).await;
            self.checked(&mut inner, applied).await?;
        }

        if inner.queue.current().is_none() {
            inner.queue.advance(true);
        }
        let start = inner.position_ms.unwrap_or(0);
        self.play_current(&mut inner, start).await
    }

    /// Adds a track; starts it immediately if the player was idle.
    pub async fn queue(&self, track: QueuedTrack) -> PlaybackResult<Enqueued> {
        let mut inner = self.lock().await?;
        let (track, position) = inner.queue.enqueue(track);

        if self.state() != PlayerState::Idle {
            return Ok(Enqueued {
                track,
                position: Some(position),
            });
        }

        inner.queue.advance(true);
        self.play_current(&mut inner, 0).await?;
        let started = inner
            .queue
            .current()
            .is_some_and(|current| Arc::ptr_eq(current, &track));
        Ok(Enqueued {
            track,
            position: (!started).then_some(position),
        })
    }

    /// Queues several tracks in one critical section.
    pub async fn queue_all(&self, tracks: Vec<QueuedTrack>) -> PlaybackResult<usize> {
        let mut inner = self.lock().await?;
        let count = tracks.len();
        for track in tracks {
            inner.queue.enqueue(track);
        }

        if count > 0 && self.state() == PlayerState::Idle {
            inner.queue.advance(true);
            self.play_current(&mut inner, 0).await?;
        }
        Ok(count)
    }

    /// Resumes a paused player, or starts the queue on an idle one.
    pub async fn play(&self) -> PlaybackResult<ControlOutcome> {
        let mut inner = self.lock().await?;
        match self.state() {
            PlayerState::Paused => self.resume_locked(&mut inner).await,
            PlayerState::Idle if inner.queue.has_upcoming() => {
                inner.queue.advance(true);
                self.play_current(&mut inner, 0).await?;
                Ok(ControlOutcome::Changed)
            }
            PlayerState::Idle => Ok(ControlOutcome::NothingPlaying),
            PlayerState::Playing => Ok(ControlOutcome::AlreadyInState),
            _ => Ok(ControlOutcome::NotConnected),
        }
    }

    pub async fn pause(&self) -> PlaybackResult<ControlOutcome> {
        let mut inner = self.lock().await?;
        match self.state() {
            PlayerState::Playing => {
                let paused = self.handle.set_paused(true).await;
                self.checked(&mut inner, paused).await?;
                inner.paused = true;
                self.set_state(PlayerState::Paused);
                info!("⏸️ Paused in guild {}", self.guild_id);
                Ok(ControlOutcome::Changed)
            }
            PlayerState::Paused => Ok(ControlOutcome::AlreadyInState),
            PlayerState::Idle => Ok(ControlOutcome::NothingPlaying),
            _ => Ok(ControlOutcome::NotConnected),
        }
    }

    pub async fn unpause(&self) -> PlaybackResult<ControlOutcome> {
        let mut inner = self.lock().await?;
        match self.state() {
            PlayerState::Paused => self.resume_locked(&mut inner).await,
            PlayerState::Playing => Ok(ControlOutcome::AlreadyInState),
            PlayerState::Idle => Ok(ControlOutcome::NothingPlaying),
            _ => Ok(ControlOutcome::NotConnected),
        }
    }

    async fn resume_locked(&self, inner: &mut PlayerInner) -> PlaybackResult<ControlOutcome> {
        let resumed = self.handle.set_paused(false).await;
        self.checked(inner, resumed).await?;
        inner.paused = false;
        self.set_state(PlayerState::Playing);
        info!("▶️ Resumed in guild {}", self.guild_id);
        Ok(ControlOutcome::Changed)
    }

    /// Skips the current track. Permission checks belong to the caller.
    pub async fn skip(&self) -> PlaybackResult<Option<Arc<QueuedTrack>>> {
        let mut inner = self.lock().await?;
        self.skip_locked(&mut inner).await
    }

    /// Records a vote to skip. The track is skipped once at least half of the
    /// human listeners (rounded up) have voted.
    pub async fn voteskip(&self, voter: UserId, human_listeners: usize) -> PlaybackResult<VoteSkip> {
        let mut inner = self.lock().await?;
        if inner.queue.current().is_none() {
            return Ok(VoteSkip::NothingPlaying);
        }

        let required = vote_threshold(human_listeners);
        let fresh = inner.skip_votes.insert(voter);
        let votes = inner.skip_votes.len();
        debug!(
            "🗳️ Skip vote in guild {}: {}/{} (fresh: {})",
            self.guild_id, votes, required, fresh
        );

        if votes >= required {
            return match self.skip_locked(&mut inner).await? {
                Some(track) => Ok(VoteSkip::Skipped { track }),
                None => Ok(VoteSkip::NothingPlaying),
            };
        }

        Ok(if fresh {
            VoteSkip::Registered { votes, required }
        } else {
            VoteSkip::AlreadyVoted { votes, required }
        })
    }

    async fn skip_locked(
        &self,
        inner: &mut PlayerInner,
    ) -> PlaybackResult<Option<Arc<QueuedTrack>>> {
        let Some(skipped) = inner.queue.current().cloned() else {
            return Ok(None);
        };
        info!("⏭️ Skipping {} in guild {}", skipped.title(), self.guild_id);

        inner.queue.skip();
        inner.skip_votes.clear();
        inner.position_ms = None;

        if inner.route.is_none() {
            return Ok(Some(skipped));
        }

        if inner.queue.current().is_none() {
            self.stop_audio(inner).await;
            self.set_state(PlayerState::Idle);
            self.notify(PlayerNotice::QueueFinished {
                guild_id: self.guild_id,
            });
        } else {
            self.play_current(inner, 0).await?;
        }
        Ok(Some(skipped))
    }

    pub async fn seek(&self, position_ms: u64) -> PlaybackResult<ControlOutcome> {
        let mut inner = self.lock().await?;
        let Some(current) = inner.queue.current().cloned() else {
            return Ok(ControlOutcome::NothingPlaying);
        };
        if inner.route.is_none() {
            return Ok(ControlOutcome::NotConnected);
        }
        if current.track().is_stream {
            return Ok(ControlOutcome::NotSeekable);
        }

        let target = match current.track().duration {
            Some(length) => position_ms.min(length.as_millis() as u64),
            None => position_ms,
        };
        let sought = self.handle.seek(target).await;
        self.checked(&mut inner, sought).await?;
        inner.position_ms = Some(target);
        debug!("⏩ Guild {} seeked to {}ms", self.guild_id, target);
        Ok(ControlOutcome::Changed)
    }

    /// Sets the volume, clamped to `0..=150`, and returns the applied level.
    pub async fn set_volume(&self, level: u16) -> PlaybackResult<u8> {
        let mut inner = self.lock().await?;
        let level = level.min(u16::from(MAX_VOLUME)) as u8;
        if inner.route.is_some() {
            let applied = self.handle.set_volume(level).await;
            self.checked(&mut inner, applied).await?;
        }
        inner.volume = level;
        info!("🔊 Guild {} volume set to {}", self.guild_id, level);
        Ok(level)
    }

    pub async fn set_shuffle(&self, enabled: bool) -> PlaybackResult<()> {
        self.lock().await?.queue.set_shuffle(enabled);
        Ok(())
    }

    pub async fn reshuffle(&self) -> PlaybackResult<()> {
        self.lock().await?.queue.reshuffle();
        Ok(())
    }

    pub async fn set_repeat(&self, mode: RepeatMode) -> PlaybackResult<()> {
        self.lock().await?.queue.set_repeat(mode);
        Ok(())
    }

    /// Removes the upcoming track at `index` (0-based).
    pub async fn remove(&self, index: usize) -> PlaybackResult<Arc<QueuedTrack>> {
        self.lock()
            .await?
            .queue
            .remove(index)
            .ok_or(PlaybackError::InvalidQueuePosition(index))
    }

    /// Empties the upcoming list; the current track keeps playing.
    pub async fn clear(&self) -> PlaybackResult<usize> {
        Ok(self.lock().await?.queue.clear_upcoming())
    }

    /// Clears everything and stops audio, staying connected.
    pub async fn stop(&self) -> PlaybackResult<usize> {
        let mut inner = self.lock().await?;
        let cleared = inner.queue.clear();
        inner.skip_votes.clear();
        inner.position_ms = None;
        inner.paused = false;

        if inner.route.is_some() {
            self.stop_audio(&mut inner).await;
            self.set_state(PlayerState::Idle);
        }
        info!("⏹️ Stopped guild {} ({} tracks cleared)", self.guild_id, cleared);
        Ok(cleared)
    }

    /// Closes the voice connection but keeps the queue for a later `join`.
    pub async fn leave(&self) -> PlaybackResult<()> {
        let mut inner = self.lock().await?;
        self.close_transport(&mut inner).await;
        self.set_state(PlayerState::NotConnected);
        info!("👋 Guild {} left voice", self.guild_id);
        Ok(())
    }

    /// Tears the player down. Callbacks that arrive afterwards are dropped.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut inner = self.inner.lock().await;
        inner.queue.clear();
        inner.skip_votes.clear();
        self.close_transport(&mut inner).await;
        self.set_state(PlayerState::Destroyed);
        info!("💥 Player for guild {} destroyed", self.guild_id);
    }

    pub async fn snapshot(&self) -> PlayerSnapshot {
        let inner = self.inner.lock().await;
        PlayerSnapshot {
            state: self.state(),
            current: inner.queue.current().cloned(),
            upcoming: inner.queue.upcoming(),
            history: inner.queue.history(),
            position_ms: inner.position_ms,
            volume: inner.volume,
            repeat: inner.queue.repeat(),
            shuffled: inner.queue.is_shuffled(),
            channel_id: inner.channel_id,
            route: inner.route.clone(),
            total_duration: inner.queue.total_duration(),
        }
    }

    pub async fn queued_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Entry point for events relayed from the transport layer.
    pub async fn handle_event(&self, event: PlayerEvent) {
        deliver(self, event).await;
    }

    async fn lock(&self) -> PlaybackResult<MutexGuard<'_, PlayerInner>> {
        self.ensure_alive()?;
        let guard = self.inner.lock().await;
        self.ensure_alive()?;
        Ok(guard)
    }

    /// Like [`lock`](Self::lock) but for callbacks, which are dropped
    /// silently once the player is gone.
    async fn lock_for_event(&self, what: &str) -> Option<MutexGuard<'_, PlayerInner>> {
        if self.is_destroyed() {
            debug!("🗑️ Dropping {} for destroyed player {}", what, self.guild_id);
            return None;
        }
        let guard = self.inner.lock().await;
        if self.is_destroyed() {
            debug!("🗑️ Dropping {} for destroyed player {}", what, self.guild_id);
            return None;
        }
        Some(guard)
    }

    fn ensure_alive(&self) -> PlaybackResult<()> {
        if self.is_destroyed() {
            Err(PlaybackError::PlayerDestroyed)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, next: PlayerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("🔄 Guild {} {:?} -> {:?}", self.guild_id, previous, next);
        }
    }

    fn notify(&self, notice: PlayerNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    /// Plays the queue's current track from `start_ms`. Tracks the node
    /// refuses are reported and skipped; losing the transport drops the
    /// player to `NotConnected`.
    async fn play_current(
        &self,
        inner: &mut PlayerInner,
        mut start_ms: u64,
    ) -> PlaybackResult<PlayerState> {
        loop {
            let Some(track) = inner.queue.current().cloned() else {
                inner.position_ms = None;
                self.set_state(PlayerState::Idle);
                return Ok(PlayerState::Idle);
            };

            inner.generation += 1;
            let generation = inner.generation;
            match self.handle.play(track.track(), start_ms, generation).await {
                Ok(()) => {
                    inner.paused = false;
                    inner.skip_votes.clear();
                    inner.position_ms = (start_ms > 0).then_some(start_ms);
                    self.set_state(PlayerState::Playing);
                    info!("🎵 Guild {} playing: {}", self.guild_id, track.title());
                    return Ok(PlayerState::Playing);
                }
                Err(PlaybackError::Remote { message, .. }) => {
                    let failure = PlaybackError::TrackLoadFailure {
                        title: track.title().to_string(),
                        reason: message,
                    };
                    warn!("⚠️ Guild {}: {}", self.guild_id, failure);
                    self.notify(PlayerNotice::TrackFailed {
                        guild_id: self.guild_id,
                        title: track.title().to_string(),
                        reason: failure.to_string(),
                    });
                    inner.queue.advance(false);
                    start_ms = 0;
                }
                Err(e) => {
                    self.lose_transport(inner, &e).await;
                    return Err(e);
                }
            }
        }
    }

    /// Drops the player to `NotConnected` when a control call found the
    /// transport gone.
    async fn checked(
        &self,
        inner: &mut PlayerInner,
        result: PlaybackResult<()>,
    ) -> PlaybackResult<()> {
        if let Err(e) = &result {
            if e.is_transport_failure() {
                self.lose_transport(inner, e).await;
            }
        }
        result
    }

    async fn stop_audio(&self, inner: &mut PlayerInner) {
        if let Err(e) = self.handle.stop().await {
            warn!("⚠️ Stop failed in guild {}: {}", self.guild_id, e);
            if e.is_transport_failure() {
                self.lose_transport(inner, &e).await;
            }
        }
    }

    async fn close_transport(&self, inner: &mut PlayerInner) {
        if inner.route.take().is_some() {
            if let Err(e) = self.facade.close_connection(self.guild_id).await {
                warn!("⚠️ Closing voice for guild {} failed: {}", self.guild_id, e);
            }
        }
        inner.channel_id = None;
        inner.paused = false;
    }

    async fn lose_transport(&self, inner: &mut PlayerInner, cause: &PlaybackError) {
        warn!("🔌 Guild {} lost its transport: {}", self.guild_id, cause);
        self.close_transport(inner).await;
        self.set_state(PlayerState::NotConnected);
        self.notify(PlayerNotice::TransportLost {
            guild_id: self.guild_id,
            reason: cause.to_string(),
        });
    }
}

/// Votes needed to skip: half the human listeners, rounded up, at least one.
pub fn vote_threshold(human_listeners: usize) -> usize {
    human_listeners.div_ceil(2).max(1)
}

#[async_trait]
impl TrackEventListener for GuildPlayer {
    async fn on_track_start(&self, generation: u64, track: String) {
        let Some(inner) = self.lock_for_event("track start").await else {
            return;
        };
        if let Some(current) = inner.current_play(generation, &track) {
            self.notify(PlayerNotice::TrackStarted {
                guild_id: self.guild_id,
                title: current.title().to_string(),
            });
        }
    }

    async fn on_track_end(&self, generation: u64, track: String, reason: TrackEndReason) {
        if !reason.may_start_next() {
            debug!("Ignoring {:?} end of {} in guild {}", reason, track, self.guild_id);
            return;
        }
        let Some(mut inner) = self.lock_for_event("track end").await else {
            return;
        };

        if inner.current_play(generation, &track).is_none() || inner.route.is_none() {
            debug!(
                "Ignoring stale end of {} (play {}) in guild {}",
                track, generation, self.guild_id
            );
            return;
        }

        let finished_ok = reason == TrackEndReason::Finished;
        inner.queue.advance(finished_ok);
        inner.skip_votes.clear();
        inner.position_ms = None;

        match self.play_current(&mut inner, 0).await {
            Ok(PlayerState::Idle) => self.notify(PlayerNotice::QueueFinished {
                guild_id: self.guild_id,
            }),
            Ok(_) => {}
            Err(e) => warn!("⚠️ Guild {} could not start next track: {}", self.guild_id, e),
        }
    }

    async fn on_track_exception(&self, generation: u64, track: String, error: TrackException) {
        let Some(inner) = self.lock_for_event("track exception").await else {
            return;
        };
        let Some(current) = inner.current_play(generation, &track) else {
            return;
        };

        let failure = PlaybackError::TrackLoadFailure {
            title: current.title().to_string(),
            reason: error.message,
        };
        warn!("❌ Guild {}: {} ({:?})", self.guild_id, failure, error.kind);
        self.notify(PlayerNotice::TrackFailed {
            guild_id: self.guild_id,
            title: current.title().to_string(),
            reason: failure.to_string(),
        });
    }

    async fn on_position_update(&self, generation: u64, position_ms: u64) {
        let Some(mut inner) = self.lock_for_event("position update").await else {
            return;
        };
        if generation == inner.generation && inner.queue.current().is_some() {
            inner.position_ms = Some(position_ms);
        } else {
            debug!(
                "Ignoring position from play {} in guild {}",
                generation, self.guild_id
            );
        }
    }

    async fn on_node_disconnect(&self, fallback: Option<TransportRoute>) {
        let Some(mut inner) = self.lock_for_event("node disconnect").await else {
            return;
        };
        let Some(channel_id) = inner.channel_id else {
            debug!("Guild {} not in voice, nothing to resume", self.guild_id);
            return;
        };

        let Some(route) = fallback else {
            let cause = PlaybackError::TransportUnavailable("no healthy audio node left".into());
            self.lose_transport(&mut inner, &cause).await;
            return;
        };

        let was_paused = inner.paused;
        let resume_at = inner.position_ms.unwrap_or(0);
        info!(
            "♻️ Guild {} reconnecting via {:?}, resuming at {}ms",
            self.guild_id, route, resume_at
        );

        let reconnect = async {
            let route = self.facade.open_connection(self.guild_id, channel_id).await?;
            inner.route = Some(route.clone());
            if inner.volume != DEFAULT_VOLUME {
                self.handle.set_volume(inner.volume).await?;
            }
            let state = self.play_current(&mut inner, resume_at).await?;
            if was_paused && state == PlayerState::Playing {
                self.handle.set_paused(true).await?;
                inner.paused = true;
                self.set_state(PlayerState::Paused);
            }
            Ok::<_, PlaybackError>(route)
        };

        match reconnect.await {
            Ok(route) => self.notify(PlayerNotice::Resumed {
                guild_id: self.guild_id,
                route,
                position_ms: resume_at,
            }),
            Err(e) => {
                if self.state() != PlayerState::NotConnected {
                    self.lose_transport(&mut inner, &e).await;
                }
            }
        }
    }
}

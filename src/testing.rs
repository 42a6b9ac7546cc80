//! In-memory stand-ins for the transport layer, shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId};
use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use crate::audio::events::{PlayerEvent, PlayerEventSink};
use crate::audio::facade::LocalEngine;
use crate::audio::track::TrackInfo;
use crate::error::{PlaybackError, PlaybackResult};
use crate::nodes::client::{NodeClient, NodeClientError, NodeOp, NodeStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Connect(GuildId, ChannelId),
    Disconnect(GuildId),
    /// Guild, track, start offset in ms, generation.
    Play(GuildId, String, u64, u64),
    Pause(GuildId, bool),
    Stop(GuildId),
    Seek(GuildId, u64),
    Volume(GuildId, u8),
}

/// Records every call; `connect`, `play` and `seek` can be told to fail.
#[derive(Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<EngineCall>>,
    fail_connect: AtomicBool,
    fail_play: AtomicBool,
    fail_seek: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

impl FakeEngine {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn plays(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                EngineCall::Play(_, id, _, _) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Generation handed to the most recent `play`.
    pub fn last_generation(&self) -> u64 {
        self.calls
            .lock()
            .iter()
            .rev()
            .find_map(|call| match call {
                EngineCall::Play(_, _, _, generation) => Some(*generation),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_play(&self, fail: bool) {
        self.fail_play.store(fail, Ordering::SeqCst);
    }

    pub fn fail_seek(&self, fail: bool) {
        self.fail_seek.store(fail, Ordering::SeqCst);
    }

    pub fn delay_connect(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl LocalEngine for FakeEngine {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> PlaybackResult<()> {
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(PlaybackError::TransportUnavailable("voice gateway down".into()));
        }
        self.record(EngineCall::Connect(guild_id, channel_id));
        Ok(())
    }

    async fn disconnect(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.record(EngineCall::Disconnect(guild_id));
        Ok(())
    }

    async fn play(
        &self,
        guild_id: GuildId,
        track: &TrackInfo,
        start: Duration,
        generation: u64,
    ) -> PlaybackResult<()> {
        if self.fail_play.load(Ordering::SeqCst) {
            return Err(PlaybackError::TransportUnavailable("driver gone".into()));
        }
        self.record(EngineCall::Play(
            guild_id,
            track.identifier.clone(),
            start.as_millis() as u64,
            generation,
        ));
        Ok(())
    }

    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> PlaybackResult<()> {
        self.record(EngineCall::Pause(guild_id, paused));
        Ok(())
    }

    async fn stop(&self, guild_id: GuildId) -> PlaybackResult<()> {
        self.record(EngineCall::Stop(guild_id));
        Ok(())
    }

    async fn seek(&self, guild_id: GuildId, position: Duration) -> PlaybackResult<()> {
        if self.fail_seek.load(Ordering::SeqCst) {
            return Err(PlaybackError::TransportUnavailable("seek failed: track gone".into()));
        }
        self.record(EngineCall::Seek(guild_id, position.as_millis() as u64));
        Ok(())
    }

    async fn set_volume(&self, guild_id: GuildId, volume: u8) -> PlaybackResult<()> {
        self.record(EngineCall::Volume(guild_id, volume));
        Ok(())
    }
}

/// Scriptable remote node.
pub struct FakeNode {
    up: AtomicBool,
    delay: Mutex<Option<Duration>>,
    pings: AtomicUsize,
    sent: Mutex<Vec<NodeOp>>,
}

impl Default for FakeNode {
    fn default() -> Self {
        Self {
            up: AtomicBool::new(true),
            delay: Mutex::new(None),
            pings: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }
}

impl FakeNode {
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<NodeOp> {
        self.sent.lock().clone()
    }

    async fn wait(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl NodeClient for FakeNode {
    async fn send(&self, op: NodeOp) -> Result<(), NodeClientError> {
        self.wait().await;
        if !self.up.load(Ordering::SeqCst) {
            return Err(NodeClientError::Unreachable("connection refused".into()));
        }
        self.sent.lock().push(op);
        Ok(())
    }

    async fn ping(&self) -> Result<NodeStats, NodeClientError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.wait().await;
        if !self.up.load(Ordering::SeqCst) {
            return Err(NodeClientError::Unreachable("connection refused".into()));
        }
        Ok(NodeStats::default())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<(GuildId, PlayerEvent)>>,
}

impl RecordingSink {
    pub fn events_for(&self, guild_id: GuildId) -> Vec<PlayerEvent> {
        self.seen
            .lock()
            .iter()
            .filter(|(guild, _)| *guild == guild_id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn events_for_all(&self) -> Vec<(GuildId, PlayerEvent)> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl PlayerEventSink for RecordingSink {
    async fn dispatch(&self, guild_id: GuildId, event: PlayerEvent) {
        self.seen.lock().push((guild_id, event));
    }
}

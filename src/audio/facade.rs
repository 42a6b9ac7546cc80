use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use super::track::TrackInfo;
use crate::error::{PlaybackError, PlaybackResult};
use crate::nodes::client::{NodeClientError, NodeOp};
use crate::nodes::{NodeId, NodeManager};

/// Which transport carries a guild's audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportRoute {
    Local,
    Remote(NodeId),
}

/// In-process playback engine used when no remote nodes are configured.
#[async_trait]
pub trait LocalEngine: Send + Sync {
    async fn connect(&self, guild_id: GuildId, channel_id: ChannelId) -> PlaybackResult<()>;
    async fn disconnect(&self, guild_id: GuildId) -> PlaybackResult<()>;
    /// Starts `track` at `start`. Events for this play report `generation`.
    async fn play(
        &self,
        guild_id: GuildId,
        track: &TrackInfo,
        start: Duration,
        generation: u64,
    ) -> PlaybackResult<()>;
    async fn set_paused(&self, guild_id: GuildId, paused: bool) -> PlaybackResult<()>;
    async fn stop(&self, guild_id: GuildId) -> PlaybackResult<()>;
    async fn seek(&self, guild_id: GuildId, position: Duration) -> PlaybackResult<()>;
    async fn set_volume(&self, guild_id: GuildId, volume: u8) -> PlaybackResult<()>;
}

/// Process-wide transport mode, fixed at startup.
#[derive(Clone)]
pub enum TransportBackend {
    Local(Arc<dyn LocalEngine>),
    Remote(Arc<NodeManager>),
}

/// Routes a guild's voice connection either to the local engine or to a
/// remote node. It never caches a node between calls; remote operations look
/// the guild's node up each time through the [`NodeManager`].
pub struct AudioConnectionFacade {
    backend: TransportBackend,
    op_timeout: Duration,
}

impl AudioConnectionFacade {
    pub fn new(backend: TransportBackend, op_timeout: Duration) -> Self {
        match &backend {
            TransportBackend::Local(_) => info!("🔊 Audio transport: local engine"),
            TransportBackend::Remote(_) => info!("🎼 Audio transport: remote nodes"),
        }
        Self {
            backend,
            op_timeout,
        }
    }

    pub fn node_manager(&self) -> Option<&Arc<NodeManager>> {
        match &self.backend {
            TransportBackend::Remote(manager) => Some(manager),
            TransportBackend::Local(_) => None,
        }
    }

    /// Opens (or moves) the guild's voice connection.
    pub async fn open_connection(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> PlaybackResult<TransportRoute> {
        match &self.backend {
            TransportBackend::Local(engine) => {
                with_timeout(
                    "connect",
                    self.op_timeout,
                    engine.connect(guild_id, channel_id),
                )
                .await?;
                info!("🔗 Guild {} connected locally to {}", guild_id, channel_id);
                Ok(TransportRoute::Local)
            }
            TransportBackend::Remote(manager) => {
                let node = manager.assign(guild_id)?;
                let result = send_to_node(
                    manager,
                    guild_id,
                    NodeOp::connect(guild_id, channel_id),
                    self.op_timeout,
                )
                .await;

                match result {
                    Ok(connected_via) => {
                        info!(
                            "🔗 Guild {} connected to {} via node {}",
                            guild_id, channel_id, connected_via
                        );
                        Ok(TransportRoute::Remote(connected_via))
                    }
                    Err(e) => {
                        warn!("⚠️ Connect via node {} failed: {}", node, e);
                        manager.release(guild_id);
                        Err(e)
                    }
                }
            }
        }
    }

    pub async fn close_connection(&self, guild_id: GuildId) -> PlaybackResult<()> {
        match &self.backend {
            TransportBackend::Local(engine) => {
                with_timeout("disconnect", self.op_timeout, engine.disconnect(guild_id)).await
            }
            TransportBackend::Remote(manager) => {
                let result = match manager.client_for(guild_id) {
                    Some(_) => send_to_node(
                        manager,
                        guild_id,
                        NodeOp::Destroy {
                            guild_id: guild_id.get(),
                        },
                        self.op_timeout,
                    )
                    .await
                    .map(|_| ()),
                    None => Ok(()),
                };
                manager.release(guild_id);
                debug!("👋 Guild {} disconnected", guild_id);
                result
            }
        }
    }

    pub fn create_player_handle(&self, guild_id: GuildId) -> PlayerHandle {
        PlayerHandle {
            guild_id,
            backend: self.backend.clone(),
            op_timeout: self.op_timeout,
        }
    }
}

/// Playback control for one guild that hides local-vs-remote.
#[derive(Clone)]
pub struct PlayerHandle {
    guild_id: GuildId,
    backend: TransportBackend,
    op_timeout: Duration,
}

impl PlayerHandle {
    pub async fn play(
        &self,
        track: &TrackInfo,
        start_offset_ms: u64,
        generation: u64,
    ) -> PlaybackResult<()> {
        match &self.backend {
            TransportBackend::Local(engine) => {
                let start = Duration::from_millis(start_offset_ms);
                with_timeout(
                    "play",
                    self.op_timeout,
                    engine.play(self.guild_id, track, start, generation),
                )
                .await
            }
            TransportBackend::Remote(manager) => {
                self.remote(manager, NodeOp::Play {
                    guild_id: self.guild_id.get(),
                    track: track.identifier.clone(),
                    start_offset_ms,
                    generation,
                })
                .await
            }
        }
    }

    pub async fn set_paused(&self, paused: bool) -> PlaybackResult<()> {
        match &self.backend {
            TransportBackend::Local(engine) => {
                with_timeout(
                    "pause",
                    self.op_timeout,
                    engine.set_paused(self.guild_id, paused),
                )
                .await
            }
            TransportBackend::Remote(manager) => {
                self.remote(manager, NodeOp::Pause {
                    guild_id: self.guild_id.get(),
                    paused,
                })
                .await
            }
        }
    }

    pub async fn stop(&self) -> PlaybackResult<()> {
        match &self.backend {
            TransportBackend::Local(engine) => {
                with_timeout("stop", self.op_timeout, engine.stop(self.guild_id)).await
            }
            TransportBackend::Remote(manager) => {
                self.remote(manager, NodeOp::Stop {
                    guild_id: self.guild_id.get(),
                })
                .await
            }
        }
    }

    pub async fn seek(&self, position_ms: u64) -> PlaybackResult<()> {
        match &self.backend {
            TransportBackend::Local(engine) => {
                with_timeout(
                    "seek",
                    self.op_timeout,
                    engine.seek(self.guild_id, Duration::from_millis(position_ms)),
                )
                .await
            }
            TransportBackend::Remote(manager) => {
                self.remote(manager, NodeOp::Seek {
                    guild_id: self.guild_id.get(),
                    position_ms,
                })
                .await
            }
        }
    }

    pub async fn set_volume(&self, volume: u8) -> PlaybackResult<()> {
        match &self.backend {
            TransportBackend::Local(engine) => {
                with_timeout(
                    "setVolume",
                    self.op_timeout,
                    engine.set_volume(self.guild_id, volume),
                )
                .await
            }
            TransportBackend::Remote(manager) => {
                self.remote(manager, NodeOp::SetVolume {
                    guild_id: self.guild_id.get(),
                    volume,
                })
                .await
            }
        }
    }

    async fn remote(&self, manager: &NodeManager, op: NodeOp) -> PlaybackResult<()> {
        send_to_node(manager, self.guild_id, op, self.op_timeout)
            .await
            .map(|_| ())
    }
}

/// Sends `op` to whichever node owns the guild right now.
async fn send_to_node(
    manager: &NodeManager,
    guild_id: GuildId,
    op: NodeOp,
    timeout: Duration,
) -> PlaybackResult<NodeId> {
    let (node, client) = manager.client_for(guild_id).ok_or_else(|| {
        PlaybackError::TransportUnavailable(format!("guild {guild_id} has no audio node"))
    })?;
    let operation = op.name();

    match tokio::time::timeout(timeout, client.send(op)).await {
        Ok(Ok(())) => Ok(node),
        Ok(Err(NodeClientError::Unreachable(reason))) => {
            debug!("Node {} unreachable during {}: {}", node, operation, reason);
            Err(PlaybackError::NodeUnreachable(node))
        }
        Ok(Err(e)) => Err(PlaybackError::Remote {
            node,
            operation,
            message: e.to_string(),
        }),
        Err(_) => Err(PlaybackError::Timeout {
            operation,
            after: timeout,
        }),
    }
}

async fn with_timeout<T>(
    operation: &'static str,
    after: Duration,
    fut: impl Future<Output = PlaybackResult<T>>,
) -> PlaybackResult<T> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| PlaybackError::Timeout { operation, after })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::events::EventRelay;
    use crate::nodes::client::{MockNodeClient, NodeClient};
    use crate::nodes::HealthPolicy;
    use crate::testing::{EngineCall, FakeEngine, FakeNode};
    use pretty_assertions::assert_eq;
    use url::Url;

    fn remote_facade(nodes: Vec<(&str, Arc<dyn NodeClient>)>) -> AudioConnectionFacade {
        let manager = Arc::new(NodeManager::new(
            HealthPolicy::default(),
            Arc::new(EventRelay::new()),
        ));
        for (name, client) in nodes {
            let endpoint = Url::parse(&format!("http://{name}:2333")).unwrap();
            manager.register(NodeId::from(name), endpoint, client);
        }
        AudioConnectionFacade::new(
            TransportBackend::Remote(manager),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_local_mode_routes_to_engine() {
        let engine = Arc::new(FakeEngine::default());
        let facade = AudioConnectionFacade::new(
            TransportBackend::Local(engine.clone()),
            Duration::from_secs(1),
        );
        let guild = GuildId::new(1);

        let route = facade.open_connection(guild, ChannelId::new(2)).await.unwrap();
        facade
            .create_player_handle(guild)
            .play(&TrackInfo::new("a", "A"), 0, 1)
            .await
            .unwrap();

        assert_eq!(route, TransportRoute::Local);
        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::Connect(guild, ChannelId::new(2)),
                EngineCall::Play(guild, "a".into(), 0, 1),
            ]
        );
    }

    #[tokio::test]
    async fn test_remote_connect_rejection_releases_assignment() {
        let mut client = MockNodeClient::new();
        client.expect_send().returning(|_| {
            Err(NodeClientError::Rejected {
                status: 400,
                message: "unknown channel".into(),
            })
        });
        let client: Arc<dyn NodeClient> = Arc::new(client);
        let facade = remote_facade(vec![("eu", client)]);
        let guild = GuildId::new(3);

        let err = facade
            .open_connection(guild, ChannelId::new(4))
            .await
            .unwrap_err();

        assert!(matches!(err, PlaybackError::Remote { operation: "connect", .. }));
        assert_eq!(facade.node_manager().unwrap().node_for(guild), None);
    }

    #[tokio::test]
    async fn test_remote_timeout_is_distinct() {
        let slow = Arc::new(FakeNode::default());
        slow.set_delay(Duration::from_secs(5));
        let facade = remote_facade(vec![("slow", slow as Arc<dyn NodeClient>)]);

        let err = facade
            .open_connection(GuildId::new(3), ChannelId::new(4))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            PlaybackError::Timeout {
                operation: "connect",
                after: Duration::from_millis(100),
            }
        );
    }

    #[tokio::test]
    async fn test_remote_ops_follow_reassignment() {
        let first = Arc::new(FakeNode::default());
        let second = Arc::new(FakeNode::default());
        let facade = remote_facade(vec![
            ("a", first.clone() as Arc<dyn NodeClient>),
            ("b", second.clone() as Arc<dyn NodeClient>),
        ]);
        let manager = facade.node_manager().unwrap().clone();
        let guild = GuildId::new(8);

        facade.open_connection(guild, ChannelId::new(1)).await.unwrap();
        let handle = facade.create_player_handle(guild);
        handle.set_volume(80).await.unwrap();

        manager.release(guild);
        manager.assign(GuildId::new(99)).unwrap();
        manager.assign(guild).unwrap();
        handle.set_volume(90).await.unwrap();

        assert_eq!(first.sent().len(), 2);
        assert_eq!(
            second.sent(),
            vec![NodeOp::SetVolume { guild_id: 8, volume: 90 }]
        );
    }
}

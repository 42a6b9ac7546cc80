//! # Orchestrator
//!
//! Root object built once at startup. It wires the transport, the player
//! registry, the search selection cache and admission limits together, runs
//! the background tasks, and is handed to serenity handlers through the
//! client's type map.

use futures::future::join_all;
use parking_lot::Mutex;
use serenity::{
    model::id::{GuildId, UserId},
    prelude::TypeMapKey,
};
use songbird::Songbird;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audio::events::EventRelay;
use crate::audio::facade::{AudioConnectionFacade, TransportBackend};
use crate::audio::limits::{LimitTable, PlayerLimitManager, ServiceTier};
use crate::audio::local::SongbirdEngine;
use crate::audio::player::PlayerSettings;
use crate::audio::registry::PlayerRegistry;
use crate::audio::track::{QueuedTrack, TrackInfo};
use crate::cache::{parse_selection, SearchSelectionCache, SelectionPrompt};
use crate::config::Config;
use crate::error::{PlaybackError, PlaybackResult};
use crate::nodes::client::HttpNodeClient;
use crate::nodes::{NodeId, NodeManager};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub op_timeout: Duration,
    pub player: PlayerSettings,
    pub limits: LimitTable,
    pub selection_ttl: Duration,
    pub selection_sweep: Duration,
    pub health_interval: Duration,
}

impl OrchestratorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            op_timeout: config.connect_timeout(),
            player: config.player_settings(),
            limits: config.limit_table(),
            selection_ttl: config.selection_ttl(),
            selection_sweep: config.selection_sweep_interval(),
            health_interval: config.health_check_interval(),
        }
    }
}

/// What happened to a batch of tracks handed to [`Orchestrator::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueReport {
    pub queued: Vec<TrackInfo>,
    pub rejected: Vec<(TrackInfo, String)>,
}

pub struct Orchestrator {
    registry: Arc<PlayerRegistry>,
    facade: Arc<AudioConnectionFacade>,
    selections: SearchSelectionCache,
    limits: PlayerLimitManager,
    event_streams: Vec<(NodeId, Arc<HttpNodeClient>)>,
    options: OrchestratorOptions,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TypeMapKey for Orchestrator {
    type Value = Arc<Orchestrator>;
}

impl Orchestrator {
    /// Builds the local songbird transport when no audio nodes are
    /// configured, otherwise a node pool reached over HTTP.
    pub fn from_config(
        config: &Config,
        songbird: Arc<Songbird>,
        http: reqwest::Client,
    ) -> Self {
        let relay = Arc::new(EventRelay::new());
        let options = OrchestratorOptions::from_config(config);
        let mut event_streams = Vec::new();

        let backend = if config.uses_local_transport() {
            TransportBackend::Local(Arc::new(SongbirdEngine::new(
                songbird,
                http,
                relay.clone(),
            )))
        } else {
            let manager = Arc::new(NodeManager::new(config.health_policy(), relay.clone()));
            for node in &config.audio_nodes {
                let client = Arc::new(HttpNodeClient::new(
                    http.clone(),
                    node.url.clone(),
                    node.password.clone(),
                ));
                let id = NodeId::from(node.name.as_str());
                manager.register(id.clone(), node.url.clone(), client.clone());
                event_streams.push((id, client));
            }
            TransportBackend::Remote(manager)
        };

        Self::new(backend, relay, options, event_streams)
    }

    pub fn new(
        backend: TransportBackend,
        relay: Arc<EventRelay>,
        options: OrchestratorOptions,
        event_streams: Vec<(NodeId, Arc<HttpNodeClient>)>,
    ) -> Self {
        let facade = Arc::new(AudioConnectionFacade::new(backend, options.op_timeout));
        let registry = PlayerRegistry::new(facade.clone(), options.player, &relay);

        Self {
            registry,
            facade,
            selections: SearchSelectionCache::new(options.selection_ttl),
            limits: PlayerLimitManager::new(options.limits),
            event_streams,
            options,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PlayerRegistry> {
        &self.registry
    }

    pub fn selections(&self) -> &SearchSelectionCache {
        &self.selections
    }

    pub fn limits(&self) -> &PlayerLimitManager {
        &self.limits
    }

    pub fn node_manager(&self) -> Option<&Arc<NodeManager>> {
        self.facade.node_manager()
    }

    /// Spawns the health monitor, node event listeners and selection sweeper.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("⚠️ Orchestrator already started");
            return;
        }

        if let Some(manager) = self.facade.node_manager() {
            tasks.push(
                manager.spawn_health_monitor(self.options.health_interval, self.cancel.clone()),
            );
            for (id, client) in &self.event_streams {
                tasks.push(tokio::spawn(client.clone().listen(
                    id.clone(),
                    manager.clone(),
                    self.cancel.clone(),
                )));
            }
        }

        tasks.push(
            self.selections
                .spawn_sweeper(self.options.selection_sweep, self.cancel.clone()),
        );
        info!("🚀 Orchestrator started ({} background tasks)", tasks.len());
    }

    /// Runs admission for `tracks` and queues the ones that fit.
    pub async fn enqueue(
        &self,
        guild_id: GuildId,
        tier: ServiceTier,
        requested_by: UserId,
        tracks: Vec<TrackInfo>,
    ) -> PlaybackResult<EnqueueReport> {
        let player = self.registry.get_or_create(guild_id);
        let queued = player.queued_len().await;
        let batch = self.limits.admit_batch(guild_id, tier, queued, tracks);

        if batch.accepted.is_empty() {
            if let Some((_, reason)) = batch.rejected.first() {
                return Err(PlaybackError::QueueLimitExceeded(reason.clone()));
            }
            return Ok(EnqueueReport::default());
        }

        let entries = batch
            .accepted
            .iter()
            .cloned()
            .map(|track| QueuedTrack::new(track, requested_by))
            .collect();
        player.queue_all(entries).await?;

        Ok(EnqueueReport {
            queued: batch.accepted,
            rejected: batch.rejected,
        })
    }

    /// Shows `candidates` to `user_id` in `guild_id`, returning the prompt it
    /// replaces.
    pub fn offer_selection(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        candidates: Vec<TrackInfo>,
        prompt: SelectionPrompt,
    ) -> Option<SelectionPrompt> {
        self.selections.put(guild_id, user_id, candidates, prompt)
    }

    /// Resolves a typed answer ("2", "1 3") to a pending selection and queues
    /// the picks.
    pub async fn select(
        &self,
        guild_id: GuildId,
        tier: ServiceTier,
        user_id: UserId,
        input: &str,
    ) -> PlaybackResult<EnqueueReport> {
        let choices = parse_selection(input)?;
        let picks = self.selections.consume_many(guild_id, user_id, &choices)?;
        self.enqueue(guild_id, tier, user_id, picks).await
    }

    /// Stops background tasks and destroys every player.
    pub async fn shutdown(&self) {
        info!("🛑 Shutting down orchestrator");
        self.cancel.cancel();
        self.registry.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("⚠️ Background task ended badly: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::limits::TierLimits;
    use crate::audio::player::PlayerState;
    use crate::error::SelectionError;
    use crate::testing::FakeEngine;
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, MessageId};

    fn orchestrator(max_queue: usize) -> (Orchestrator, Arc<FakeEngine>) {
        let engine = Arc::new(FakeEngine::default());
        let tier = TierLimits {
            max_queue_len: Some(max_queue),
            max_track_duration: Some(Duration::from_secs(600)),
            allow_streams: true,
        };
        let options = OrchestratorOptions {
            op_timeout: Duration::from_secs(1),
            player: PlayerSettings::default(),
            limits: LimitTable {
                free: tier,
                supporter: tier,
                premium: TierLimits::UNLIMITED,
            },
            selection_ttl: Duration::from_secs(60),
            selection_sweep: Duration::from_secs(10),
            health_interval: Duration::from_secs(15),
        };
        let orchestrator = Orchestrator::new(
            TransportBackend::Local(engine.clone()),
            Arc::new(EventRelay::new()),
            options,
            Vec::new(),
        );
        (orchestrator, engine)
    }

    fn song(id: &str) -> TrackInfo {
        TrackInfo::new(id, id.to_uppercase()).with_duration(Duration::from_secs(120))
    }

    fn prompt() -> SelectionPrompt {
        SelectionPrompt {
            channel_id: ChannelId::new(1),
            message_id: MessageId::new(2),
        }
    }

    #[tokio::test]
    async fn test_enqueue_stops_at_queue_cap() {
        let (orchestrator, _) = orchestrator(2);
        let guild = GuildId::new(1);

        let report = orchestrator
            .enqueue(
                guild,
                ServiceTier::Free,
                UserId::new(1),
                vec![song("a"), song("b"), song("c")],
            )
            .await
            .unwrap();

        assert_eq!(report.queued, vec![song("a"), song("b")]);
        assert_eq!(report.rejected.len(), 1);

        let err = orchestrator
            .enqueue(guild, ServiceTier::Free, UserId::new(1), vec![song("d")])
            .await
            .unwrap_err();
        assert!(matches!(err, PlaybackError::QueueLimitExceeded(_)));
    }

    #[tokio::test]
    async fn test_select_queues_the_chosen_candidate() {
        let (orchestrator, engine) = orchestrator(10);
        let guild = GuildId::new(1);
        let user = UserId::new(5);
        orchestrator
            .registry()
            .get_or_create(guild)
            .join(ChannelId::new(3))
            .await
            .unwrap();
        orchestrator.offer_selection(guild, user, vec![song("a"), song("b"), song("c")], prompt());

        let report = orchestrator
            .select(guild, ServiceTier::Free, user, "2")
            .await
            .unwrap();

        assert_eq!(report.queued, vec![song("b")]);
        assert_eq!(engine.plays(), vec!["b".to_string()]);
        assert_eq!(
            orchestrator
                .select(guild, ServiceTier::Free, user, "1")
                .await
                .unwrap_err(),
            PlaybackError::Selection(SelectionError::NoActiveSelection)
        );
    }

    #[tokio::test]
    async fn test_bad_selection_input_keeps_prompt() {
        let (orchestrator, _) = orchestrator(10);
        let user = UserId::new(5);
        orchestrator.offer_selection(GuildId::new(1), user, vec![song("a")], prompt());

        let err = orchestrator
            .select(GuildId::new(1), ServiceTier::Free, user, "7")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            PlaybackError::Selection(SelectionError::IndexOutOfRange { index: 7, available: 1 })
        );
        assert!(orchestrator.selections().peek(GuildId::new(1), user).is_some());
    }

    #[tokio::test]
    async fn test_answer_from_another_guild_is_not_accepted() {
        let (orchestrator, engine) = orchestrator(10);
        let user = UserId::new(5);
        let shown_in = GuildId::new(1);
        let answered_in = GuildId::new(2);
        orchestrator.offer_selection(shown_in, user, vec![song("a"), song("b")], prompt());

        let err = orchestrator
            .select(answered_in, ServiceTier::Free, user, "1")
            .await
            .unwrap_err();

        assert_eq!(err, PlaybackError::Selection(SelectionError::NoActiveSelection));
        assert!(orchestrator.registry().get_existing(answered_in).is_none());
        assert!(engine.calls().is_empty());
        assert!(orchestrator.selections().peek(shown_in, user).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_destroys_players_and_stops_tasks() {
        let (orchestrator, _) = orchestrator(10);
        orchestrator.start();
        let player = orchestrator.registry().get_or_create(GuildId::new(9));

        orchestrator.shutdown().await;

        assert_eq!(player.state(), PlayerState::Destroyed);
        assert!(orchestrator.registry().is_empty());
        assert!(orchestrator.tasks.lock().is_empty());
    }
}

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serenity::model::id::GuildId;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::events::{EventRelay, PlayerEvent, PlayerEventSink};
use super::facade::AudioConnectionFacade;
use super::player::{GuildPlayer, PlayerNotice, PlayerSettings, PlayerState};

const NOTICE_CAPACITY: usize = 256;

/// Owns every [`GuildPlayer`]. Callers look players up per operation and
/// never keep them around.
pub struct PlayerRegistry {
    players: DashMap<GuildId, Arc<GuildPlayer>>,
    facade: Arc<AudioConnectionFacade>,
    settings: PlayerSettings,
    notices: broadcast::Sender<PlayerNotice>,
}

impl PlayerRegistry {
    /// Builds the registry and binds it as the sink for `relay`.
    pub fn new(
        facade: Arc<AudioConnectionFacade>,
        settings: PlayerSettings,
        relay: &EventRelay,
    ) -> Arc<Self> {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let registry = Arc::new(Self {
            players: DashMap::new(),
            facade,
            settings,
            notices,
        });

        let sink: Arc<dyn PlayerEventSink> = registry.clone();
        relay.bind(Arc::downgrade(&sink));
        registry
    }

    /// Returns the guild's player, creating it on first use. Concurrent
    /// first calls for one guild all get the same instance.
    pub fn get_or_create(&self, guild_id: GuildId) -> Arc<GuildPlayer> {
        self.players
            .entry(guild_id)
            .or_insert_with(|| {
                debug!("🆕 Creating player for guild {}", guild_id);
                Arc::new(GuildPlayer::new(
                    guild_id,
                    self.facade.clone(),
                    self.settings,
                    self.notices.clone(),
                ))
            })
            .value()
            .clone()
    }

    pub fn get_existing(&self, guild_id: GuildId) -> Option<Arc<GuildPlayer>> {
        self.players.get(&guild_id).map(|player| player.value().clone())
    }

    /// Unregisters and destroys the guild's player.
    pub async fn remove(&self, guild_id: GuildId) -> bool {
        let Some((_, player)) = self.players.remove(&guild_id) else {
            return false;
        };
        player.destroy().await;
        true
    }

    pub fn all_playing(&self) -> Vec<Arc<GuildPlayer>> {
        self.players
            .iter()
            .filter(|entry| entry.value().state() == PlayerState::Playing)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<PlayerNotice> {
        self.notices.subscribe()
    }

    pub fn facade(&self) -> &Arc<AudioConnectionFacade> {
        &self.facade
    }

    /// Destroys every player.
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.players.iter().map(|entry| *entry.key()).collect();
        let players: Vec<Arc<GuildPlayer>> = guilds
            .into_iter()
            .filter_map(|guild_id| self.players.remove(&guild_id).map(|(_, player)| player))
            .collect();

        info!("🛑 Shutting down {} players", players.len());
        join_all(players.iter().map(|player| player.destroy())).await;
    }
}

#[async_trait]
impl PlayerEventSink for PlayerRegistry {
    async fn dispatch(&self, guild_id: GuildId, event: PlayerEvent) {
        match self.get_existing(guild_id) {
            Some(player) => player.handle_event(event).await,
            None => debug!("No player for guild {}, dropping {:?}", guild_id, event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::events::TrackEndReason;
    use crate::audio::facade::TransportBackend;
    use crate::audio::track::{QueuedTrack, TrackInfo};
    use crate::testing::FakeEngine;
    use serenity::model::id::{ChannelId, UserId};
    use std::time::Duration;

    fn registry() -> (Arc<PlayerRegistry>, Arc<FakeEngine>, Arc<EventRelay>) {
        let engine = Arc::new(FakeEngine::default());
        let facade = Arc::new(AudioConnectionFacade::new(
            TransportBackend::Local(engine.clone()),
            Duration::from_secs(1),
        ));
        let relay = Arc::new(EventRelay::new());
        let registry = PlayerRegistry::new(facade, PlayerSettings::default(), &relay);
        (registry, engine, relay)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_yields_one_instance() {
        let (registry, _, _) = registry();
        let guild = GuildId::new(42);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.get_or_create(guild) })
            })
            .collect();
        let players: Vec<Arc<GuildPlayer>> = join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(registry.len(), 1);
        assert!(players.iter().all(|p| Arc::ptr_eq(p, &players[0])));
    }

    #[tokio::test]
    async fn test_get_existing_never_creates() {
        let (registry, _, _) = registry();

        assert!(registry.get_existing(GuildId::new(1)).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_destroys_player() {
        let (registry, _, _) = registry();
        let player = registry.get_or_create(GuildId::new(1));

        assert!(registry.remove(GuildId::new(1)).await);

        assert_eq!(player.state(), PlayerState::Destroyed);
        assert!(registry.get_existing(GuildId::new(1)).is_none());
        assert!(!registry.remove(GuildId::new(1)).await);
    }

    #[tokio::test]
    async fn test_relayed_events_reach_the_owning_player() {
        let (registry, engine, relay) = registry();
        let guild = GuildId::new(3);
        let player = registry.get_or_create(guild);
        for id in ["a", "b"] {
            player
                .queue(QueuedTrack::new(TrackInfo::new(id, id), UserId::new(1)))
                .await
                .unwrap();
        }
        player.join(ChannelId::new(9)).await.unwrap();

        relay
            .emit(
                guild,
                PlayerEvent::TrackEnd {
                    generation: engine.last_generation(),
                    track: "a".into(),
                    reason: TrackEndReason::Finished,
                },
            )
            .await;

        assert_eq!(engine.plays(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(registry.all_playing().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_destroys_everything() {
        let (registry, _, _) = registry();
        let players: Vec<_> = (1..=3)
            .map(|id| registry.get_or_create(GuildId::new(id)))
            .collect();

        registry.shutdown().await;

        assert!(registry.is_empty());
        assert!(players.iter().all(|p| p.is_destroyed()));
    }
}

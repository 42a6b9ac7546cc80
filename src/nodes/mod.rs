//! # Nodes Module
//!
//! Remote audio-processing nodes and the guild → node assignment map.
//!
//! The [`NodeManager`] owns every [`RemoteNode`] and the assignment table.
//! Nothing outside this module keeps a node reference across calls: each
//! transport operation asks [`NodeManager::client_for`] again, so a guild
//! moved by a health check is observed on its very next operation.
//!
//! ## Health model
//!
//! Nodes are pinged on a fixed interval with their own timeout:
//!
//! - consecutive failures walk a node `Healthy → Degraded → Unreachable`
//! - a successful ping walks it one step back
//! - entering `Unreachable` moves all its guilds to the least-loaded healthy
//!   node, or strands them when none is left
//! - after enough failures a node is retired and only
//!   [`NodeManager::reinstate`] brings it back

pub mod client;

use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::audio::events::{EventRelay, PlayerEvent};
use crate::audio::facade::TransportRoute;
use crate::error::{PlaybackError, PlaybackResult};
use client::{NodeClient, NodeClientError, NodeEvent};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    Healthy,
    Degraded,
    Unreachable,
}

/// Failure thresholds and ping timeout for the health cycle.
#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    pub degraded_after: u32,
    pub unreachable_after: u32,
    pub retire_after: u32,
    pub ping_timeout: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            degraded_after: 1,
            unreachable_after: 3,
            retire_after: 20,
            ping_timeout: Duration::from_secs(3),
        }
    }
}

struct RemoteNode {
    id: NodeId,
    endpoint: Url,
    client: Arc<dyn NodeClient>,
    health: NodeHealth,
    consecutive_failures: u32,
    retired: bool,
    /// Guilds currently assigned here.
    load: usize,
    reported_load: Option<u32>,
}

impl RemoteNode {
    fn is_assignable(&self) -> bool {
        self.health == NodeHealth::Healthy && !self.retired
    }
}

#[derive(Default)]
struct NodeTable {
    nodes: Vec<RemoteNode>,
    assignments: HashMap<GuildId, usize>,
}

impl NodeTable {
    /// Least-loaded healthy node; ties go to the earliest registered.
    fn pick(&self, exclude: Option<usize>) -> Option<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(index, node)| node.is_assignable() && Some(*index) != exclude)
            .min_by_key(|(index, node)| (node.load, *index))
            .map(|(index, _)| index)
    }

    fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|node| &node.id == id)
    }
}

/// Point-in-time view of a node for status commands and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: NodeId,
    pub endpoint: Url,
    pub health: NodeHealth,
    pub load: usize,
    pub reported_load: Option<u32>,
    pub retired: bool,
}

/// Outcome of one health cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub transitions: Vec<(NodeId, NodeHealth)>,
    pub reassigned: Vec<(GuildId, NodeId)>,
    pub stranded: Vec<GuildId>,
    pub retired: Vec<NodeId>,
}

pub struct NodeManager {
    table: RwLock<NodeTable>,
    policy: HealthPolicy,
    relay: Arc<EventRelay>,
}

impl NodeManager {
    pub fn new(policy: HealthPolicy, relay: Arc<EventRelay>) -> Self {
        Self {
            table: RwLock::new(NodeTable::default()),
            policy,
            relay,
        }
    }

    /// Adds a node at startup. Registration order breaks load ties.
    pub fn register(&self, id: NodeId, endpoint: Url, client: Arc<dyn NodeClient>) {
        info!("🎼 Registering audio node {} at {}", id, endpoint);
        self.table.write().nodes.push(RemoteNode {
            id,
            endpoint,
            client,
            health: NodeHealth::Healthy,
            consecutive_failures: 0,
            retired: false,
            load: 0,
            reported_load: None,
        });
    }

    /// Returns the guild's node, assigning the least-loaded healthy node
    /// when the guild has none yet.
    pub fn assign(&self, guild_id: GuildId) -> PlaybackResult<NodeId> {
        let mut table = self.table.write();

        if let Some(&index) = table.assignments.get(&guild_id) {
            let node = &table.nodes[index];
            if node.health != NodeHealth::Unreachable && !node.retired {
                return Ok(node.id.clone());
            }
        }

        let index = table.pick(None).ok_or_else(|| {
            PlaybackError::TransportUnavailable("no healthy audio node is available".into())
        })?;

        if let Some(previous) = table.assignments.insert(guild_id, index) {
            let node = &mut table.nodes[previous];
            node.load = node.load.saturating_sub(1);
        }
        table.nodes[index].load += 1;

        let id = table.nodes[index].id.clone();
        debug!("📌 Guild {} assigned to node {}", guild_id, id);
        Ok(id)
    }

    pub fn release(&self, guild_id: GuildId) -> Option<NodeId> {
        let mut table = self.table.write();
        let index = table.assignments.remove(&guild_id)?;
        let node = &mut table.nodes[index];
        node.load = node.load.saturating_sub(1);
        debug!("📤 Guild {} released from node {}", guild_id, node.id);
        Some(node.id.clone())
    }

    pub fn node_for(&self, guild_id: GuildId) -> Option<NodeId> {
        let table = self.table.read();
        table
            .assignments
            .get(&guild_id)
            .map(|&index| table.nodes[index].id.clone())
    }

    /// One lookup per operation: the node and its client as of right now.
    pub fn client_for(&self, guild_id: GuildId) -> Option<(NodeId, Arc<dyn NodeClient>)> {
        let table = self.table.read();
        table.assignments.get(&guild_id).map(|&index| {
            let node = &table.nodes[index];
            (node.id.clone(), node.client.clone())
        })
    }

    pub fn health(&self, id: &NodeId) -> Option<NodeHealth> {
        let table = self.table.read();
        table.index_of(id).map(|index| table.nodes[index].health)
    }

    pub fn assigned_guilds(&self, id: &NodeId) -> Vec<GuildId> {
        let table = self.table.read();
        let Some(index) = table.index_of(id) else {
            return Vec::new();
        };
        table
            .assignments
            .iter()
            .filter(|&(_, &assigned)| assigned == index)
            .map(|(guild, _)| *guild)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<NodeStatus> {
        self.table
            .read()
            .nodes
            .iter()
            .map(|node| NodeStatus {
                id: node.id.clone(),
                endpoint: node.endpoint.clone(),
                health: node.health,
                load: node.load,
                reported_load: node.reported_load,
                retired: node.retired,
            })
            .collect()
    }

    /// Operator action: bring a retired node back as healthy.
    pub fn reinstate(&self, id: &NodeId) -> bool {
        let mut table = self.table.write();
        let Some(index) = table.index_of(id) else {
            return false;
        };
        let node = &mut table.nodes[index];
        node.retired = false;
        node.consecutive_failures = 0;
        node.health = NodeHealth::Healthy;
        info!("♻️ Node {} reinstated by operator", id);
        true
    }

    /// Pings every live node, applies health transitions, moves guilds off
    /// nodes that just became unreachable and notifies their players.
    pub async fn health_check(&self) -> HealthReport {
        let targets: Vec<(usize, Arc<dyn NodeClient>)> = {
            let table = self.table.read();
            table
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| !node.retired)
                .map(|(index, node)| (index, node.client.clone()))
                .collect()
        };

        let timeout = self.policy.ping_timeout;
        let results = join_all(targets.into_iter().map(|(index, client)| async move {
            let outcome = match tokio::time::timeout(timeout, client.ping()).await {
                Ok(result) => result,
                Err(_) => Err(NodeClientError::Unreachable(format!(
                    "ping timed out after {timeout:?}"
                ))),
            };
            (index, outcome)
        }))
        .await;

        let report = self.apply_ping_results(results);
        self.notify_moved_guilds(&report).await;
        report
    }

    fn apply_ping_results(
        &self,
        results: Vec<(usize, Result<client::NodeStats, NodeClientError>)>,
    ) -> HealthReport {
        let mut report = HealthReport::default();
        let mut newly_unreachable = Vec::new();
        let mut table = self.table.write();

        for (index, outcome) in results {
            let node = &mut table.nodes[index];
            let before = node.health;

            match outcome {
                Ok(stats) => {
                    node.consecutive_failures = 0;
                    node.reported_load = Some(stats.load);
                    node.health = match node.health {
                        NodeHealth::Unreachable => NodeHealth::Degraded,
                        _ => NodeHealth::Healthy,
                    };
                }
                Err(e) => {
                    node.consecutive_failures += 1;
                    let failures = node.consecutive_failures;
                    debug!("Ping to node {} failed ({}x): {}", node.id, failures, e);

                    if failures >= self.policy.unreachable_after {
                        node.health = NodeHealth::Unreachable;
                    } else if failures >= self.policy.degraded_after {
                        node.health = NodeHealth::Degraded;
                    }
                    if failures >= self.policy.retire_after && !node.retired {
                        node.retired = true;
                        error!(
                            "🪦 Node {} retired after {} failed pings, operator action required",
                            node.id, failures
                        );
                        report.retired.push(node.id.clone());
                    }
                }
            }

            if node.health != before {
                match node.health {
                    NodeHealth::Healthy => info!("✅ Node {} is healthy again", node.id),
                    NodeHealth::Degraded => warn!("⚠️ Node {} degraded", node.id),
                    NodeHealth::Unreachable => error!("❌ Node {} unreachable", node.id),
                }
                report.transitions.push((node.id.clone(), node.health));
                if node.health == NodeHealth::Unreachable {
                    newly_unreachable.push(index);
                }
            }
        }

        for dead in newly_unreachable {
            let guilds: Vec<GuildId> = table
                .assignments
                .iter()
                .filter(|&(_, &assigned)| assigned == dead)
                .map(|(guild, _)| *guild)
                .collect();

            for guild_id in guilds {
                let node = &mut table.nodes[dead];
                node.load = node.load.saturating_sub(1);
                match table.pick(Some(dead)) {
                    Some(target) => {
                        table.assignments.insert(guild_id, target);
                        table.nodes[target].load += 1;
                        let id = table.nodes[target].id.clone();
                        info!("🔀 Guild {} moved to node {}", guild_id, id);
                        report.reassigned.push((guild_id, id));
                    }
                    None => {
                        table.assignments.remove(&guild_id);
                        warn!("🚫 No healthy node left for guild {}", guild_id);
                        report.stranded.push(guild_id);
                    }
                }
            }
        }

        report
    }

    async fn notify_moved_guilds(&self, report: &HealthReport) {
        let moved = report.reassigned.iter().map(|(guild_id, node)| {
            self.relay.emit(
                *guild_id,
                PlayerEvent::NodeDisconnected {
                    fallback: Some(TransportRoute::Remote(node.clone())),
                },
            )
        });
        let stranded = report.stranded.iter().map(|guild_id| {
            self.relay
                .emit(*guild_id, PlayerEvent::NodeDisconnected { fallback: None })
        });

        join_all(moved).await;
        join_all(stranded).await;
    }

    /// Runs [`health_check`](Self::health_check) every `interval` until
    /// `cancel` fires.
    pub fn spawn_health_monitor(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("🩺 Node health monitor started ({:?} interval)", interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = manager.health_check().await;
                        if !report.transitions.is_empty() {
                            debug!("Health cycle: {:?}", report);
                        }
                    }
                }
            }
            info!("🩺 Node health monitor stopped");
        })
    }

    /// Translates an event pushed by `node` and forwards it to the guild's
    /// player. Events from a node the guild no longer uses are stale.
    pub async fn handle_node_event(&self, node: &NodeId, event: NodeEvent) {
        let Some(guild_id) = event.guild_id() else {
            warn!("⚠️ Node {} sent an event without a guild: {:?}", node, event);
            return;
        };

        if self.node_for(guild_id).as_ref() != Some(node) {
            debug!(
                "Ignoring stale event from node {} for guild {}: {:?}",
                node, guild_id, event
            );
            return;
        }

        let event = match event {
            NodeEvent::TrackStart {
                generation, track, ..
            } => PlayerEvent::TrackStart { generation, track },
            NodeEvent::TrackEnd {
                generation,
                track,
                reason,
                ..
            } => PlayerEvent::TrackEnd {
                generation,
                track,
                reason,
            },
            NodeEvent::TrackException {
                generation,
                track,
                exception,
                ..
            } => PlayerEvent::TrackException {
                generation,
                track,
                error: exception,
            },
            NodeEvent::PlayerUpdate {
                generation,
                position_ms,
                ..
            } => PlayerEvent::PositionUpdate {
                generation,
                position_ms,
            },
            NodeEvent::NodeDisconnected { .. } => PlayerEvent::NodeDisconnected {
                fallback: Some(TransportRoute::Remote(node.clone())),
            },
        };

        self.relay.emit(guild_id, event).await;
    }
}

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};
use url::Url;

use crate::audio::limits::{LimitTable, TierLimits};
use crate::audio::player::{PlayerSettings, MAX_VOLUME};
use crate::nodes::HealthPolicy;

/// One remote audio node from `AUDIO_NODES`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeConfig {
    pub name: String,
    pub url: Url,
    #[serde(skip_serializing)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    #[serde(skip_serializing)]
    pub discord_token: String,

    // Runtime
    pub worker_threads: usize,

    // Player
    pub default_volume: u8,
    pub history_size: usize,

    // Transport (no nodes = local songbird engine)
    pub audio_nodes: Vec<NodeConfig>,
    pub connect_timeout_ms: u64,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_ms: u64,
    pub node_degraded_after: u32,
    pub node_unreachable_after: u32,
    pub node_retire_after: u32,

    // Search selection
    pub selection_ttl_secs: u64,
    pub selection_sweep_secs: u64,

    // Tier limits (0 = unlimited)
    pub free_max_queue_size: usize,
    pub free_max_song_duration: u64,
    pub supporter_max_queue_size: usize,
    pub supporter_max_song_duration: u64,
    pub premium_max_queue_size: usize,
    pub premium_max_song_duration: u64,
    pub allow_streams_free: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            discord_token: std::env::var("DISCORD_TOKEN").context("DISCORD_TOKEN is not set")?,

            worker_threads: match std::env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => {
                    val.parse().context("WORKER_THREADS must be a number")?
                }
                _ => num_cpus::get(),
            },

            default_volume: env_or("DEFAULT_VOLUME", defaults.default_volume)?,
            history_size: env_or("HISTORY_SIZE", defaults.history_size)?,

            audio_nodes: parse_nodes(&std::env::var("AUDIO_NODES").unwrap_or_default())?,
            connect_timeout_ms: env_or("CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms)?,
            health_check_interval_secs: env_or(
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval_secs,
            )?,
            health_check_timeout_ms: env_or(
                "HEALTH_CHECK_TIMEOUT_MS",
                defaults.health_check_timeout_ms,
            )?,
            node_degraded_after: env_or("NODE_DEGRADED_AFTER", defaults.node_degraded_after)?,
            node_unreachable_after: env_or(
                "NODE_UNREACHABLE_AFTER",
                defaults.node_unreachable_after,
            )?,
            node_retire_after: env_or("NODE_RETIRE_AFTER", defaults.node_retire_after)?,

            selection_ttl_secs: env_or("SELECTION_TTL_SECS", defaults.selection_ttl_secs)?,
            selection_sweep_secs: env_or("SELECTION_SWEEP_SECS", defaults.selection_sweep_secs)?,

            free_max_queue_size: env_or("FREE_MAX_QUEUE_SIZE", defaults.free_max_queue_size)?,
            free_max_song_duration: env_or(
                "FREE_MAX_SONG_DURATION",
                defaults.free_max_song_duration,
            )?,
            supporter_max_queue_size: env_or(
                "SUPPORTER_MAX_QUEUE_SIZE",
                defaults.supporter_max_queue_size,
            )?,
            supporter_max_song_duration: env_or(
                "SUPPORTER_MAX_SONG_DURATION",
                defaults.supporter_max_song_duration,
            )?,
            premium_max_queue_size: env_or(
                "PREMIUM_MAX_QUEUE_SIZE",
                defaults.premium_max_queue_size,
            )?,
            premium_max_song_duration: env_or(
                "PREMIUM_MAX_SONG_DURATION",
                defaults.premium_max_song_duration,
            )?,
            allow_streams_free: env_or("ALLOW_STREAMS_FREE", defaults.allow_streams_free)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0 and 150
    /// - Timeouts and intervals must be non-zero
    /// - Node thresholds must be ordered: degraded <= unreachable <= retire
    /// - Node names must be unique
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > MAX_VOLUME {
            bail!(
                "Default volume must be between 0 and {}, got: {}",
                MAX_VOLUME,
                self.default_volume
            );
        }

        if self.worker_threads == 0 {
            bail!("Worker threads must be greater than 0");
        }

        if self.connect_timeout_ms == 0 || self.health_check_timeout_ms == 0 {
            bail!("Timeouts must be greater than 0");
        }

        if self.health_check_interval_secs == 0 || self.selection_sweep_secs == 0 {
            bail!("Background intervals must be greater than 0");
        }

        if self.selection_ttl_secs == 0 {
            bail!("Selection TTL must be greater than 0");
        }

        if self.node_degraded_after == 0 {
            bail!("NODE_DEGRADED_AFTER must be at least 1");
        }

        if self.node_unreachable_after < self.node_degraded_after {
            bail!(
                "NODE_UNREACHABLE_AFTER ({}) cannot be lower than NODE_DEGRADED_AFTER ({})",
                self.node_unreachable_after,
                self.node_degraded_after
            );
        }

        if self.node_retire_after < self.node_unreachable_after {
            bail!(
                "NODE_RETIRE_AFTER ({}) cannot be lower than NODE_UNREACHABLE_AFTER ({})",
                self.node_retire_after,
                self.node_unreachable_after
            );
        }

        for (i, node) in self.audio_nodes.iter().enumerate() {
            if self.audio_nodes[..i].iter().any(|other| other.name == node.name) {
                bail!("Duplicate audio node name: {}", node.name);
            }
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Tokens and node passwords are never included.
    pub fn summary(&self) -> String {
        let transport = if self.uses_local_transport() {
            "local songbird engine".to_string()
        } else {
            let names: Vec<String> = self
                .audio_nodes
                .iter()
                .map(|node| format!("{} ({})", node.name, node.url))
                .collect();
            format!("{} node(s): {}", names.len(), names.join(", "))
        };

        format!(
            "Config Summary:\n  \
            Runtime: {} worker threads\n  \
            Player: {}% vol, {} history\n  \
            Transport: {}\n  \
            Health: every {}s, {}ms timeout, {}/{}/{} failures to degrade/drop/retire\n  \
            Selection: {}s TTL\n  \
            Limits: free {}, supporter {}, premium {}",
            self.worker_threads,
            self.default_volume,
            self.history_size,
            transport,
            self.health_check_interval_secs,
            self.health_check_timeout_ms,
            self.node_degraded_after,
            self.node_unreachable_after,
            self.node_retire_after,
            self.selection_ttl_secs,
            describe_tier(self.free_max_queue_size, self.free_max_song_duration),
            describe_tier(self.supporter_max_queue_size, self.supporter_max_song_duration),
            describe_tier(self.premium_max_queue_size, self.premium_max_song_duration),
        )
    }

    pub fn uses_local_transport(&self) -> bool {
        self.audio_nodes.is_empty()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn selection_ttl(&self) -> Duration {
        Duration::from_secs(self.selection_ttl_secs)
    }

    pub fn selection_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.selection_sweep_secs)
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            degraded_after: self.node_degraded_after,
            unreachable_after: self.node_unreachable_after,
            retire_after: self.node_retire_after,
            ping_timeout: Duration::from_millis(self.health_check_timeout_ms),
        }
    }

    pub fn player_settings(&self) -> PlayerSettings {
        PlayerSettings {
            default_volume: self.default_volume,
            history_size: self.history_size,
        }
    }

    pub fn limit_table(&self) -> LimitTable {
        LimitTable {
            free: tier_limits(
                self.free_max_queue_size,
                self.free_max_song_duration,
                self.allow_streams_free,
            ),
            supporter: tier_limits(
                self.supporter_max_queue_size,
                self.supporter_max_song_duration,
                true,
            ),
            premium: tier_limits(
                self.premium_max_queue_size,
                self.premium_max_song_duration,
                true,
            ),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: String::new(),
            worker_threads: num_cpus::get(),

            default_volume: 100,
            history_size: 50,

            audio_nodes: Vec::new(),
            connect_timeout_ms: 10_000,
            health_check_interval_secs: 15,
            health_check_timeout_ms: 3_000,
            node_degraded_after: 1,
            node_unreachable_after: 3,
            node_retire_after: 20,

            selection_ttl_secs: 60,
            selection_sweep_secs: 10,

            free_max_queue_size: 1000,
            free_max_song_duration: 3600, // 1 hour
            supporter_max_queue_size: 5000,
            supporter_max_song_duration: 3 * 3600,
            premium_max_queue_size: 0,
            premium_max_song_duration: 0,
            allow_streams_free: true,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(val) if !val.trim().is_empty() => val
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {val}")),
        _ => Ok(default),
    }
}

/// Parses `name|url|password` entries separated by commas.
pub fn parse_nodes(raw: &str) -> Result<Vec<NodeConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, '|');
            let (Some(name), Some(url), Some(password)) = (parts.next(), parts.next(), parts.next())
            else {
                bail!("Audio node entry must be name|url|password, got: {entry}");
            };

            let url = Url::parse(url.trim())
                .with_context(|| format!("Audio node {name} has an invalid url"))?;
            if !matches!(url.scheme(), "http" | "https") {
                bail!("Audio node {name} must use http or https, got: {}", url.scheme());
            }

            Ok(NodeConfig {
                name: name.trim().to_string(),
                url,
                password: password.to_string(),
            })
        })
        .collect()
}

fn tier_limits(max_queue: usize, max_duration_secs: u64, allow_streams: bool) -> TierLimits {
    TierLimits {
        max_queue_len: (max_queue > 0).then_some(max_queue),
        max_track_duration: (max_duration_secs > 0).then(|| Duration::from_secs(max_duration_secs)),
        allow_streams,
    }
}

fn describe_tier(max_queue: usize, max_duration_secs: u64) -> String {
    let queue = match max_queue {
        0 => "unlimited queue".to_string(),
        n => format!("{n} tracks"),
    };
    let duration = match max_duration_secs {
        0 => "any length".to_string(),
        secs => humantime::format_duration(Duration::from_secs(secs)).to_string(),
    };
    format!("{queue}/{duration}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_nodes() {
        let nodes =
            parse_nodes("eu|http://eu.audio:2333|secret, us|https://us.audio/|p|w").unwrap();

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].name, "eu");
        assert_eq!(nodes[0].url.as_str(), "http://eu.audio:2333/");
        assert_eq!(nodes[1].password, "p|w");
        assert!(parse_nodes("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_nodes_rejects_malformed_entries() {
        assert!(parse_nodes("eu|http://eu.audio").is_err());
        assert!(parse_nodes("eu|not a url|x").is_err());
        assert!(parse_nodes("eu|ftp://eu.audio|x").is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();

        assert!(config.validate().is_ok());
        assert!(config.uses_local_transport());
        assert_eq!(config.limit_table().premium, TierLimits::UNLIMITED);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let loud = Config {
            default_volume: 200,
            ..Config::default()
        };
        let inverted = Config {
            node_degraded_after: 3,
            node_unreachable_after: 2,
            ..Config::default()
        };
        let node = parse_nodes("a|http://a:1|x").unwrap().remove(0);
        let duplicated = Config {
            audio_nodes: vec![node.clone(), node],
            ..Config::default()
        };

        assert!(loud.validate().is_err());
        assert!(inverted.validate().is_err());
        assert!(duplicated.validate().is_err());
    }

    #[test]
    fn test_summary_hides_secrets() {
        let config = Config {
            discord_token: "very-secret-token".into(),
            audio_nodes: parse_nodes("eu|http://eu.audio:2333|hunter2").unwrap(),
            ..Config::default()
        };

        let summary = config.summary();

        assert!(summary.contains("1 node(s): eu (http://eu.audio:2333/)"));
        assert!(summary.contains("free 1000 tracks/1h"));
        assert!(!summary.contains("very-secret-token"));
        assert!(!summary.contains("hunter2"));
    }
}

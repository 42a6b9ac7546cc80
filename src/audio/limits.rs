use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::time::Duration;
use tracing::debug;

use super::track::TrackInfo;
use crate::error::PlaybackError;

/// Service level of a guild, deciding its admission limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceTier {
    #[default]
    Free,
    Supporter,
    Premium,
}

/// Caps for one tier. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub max_queue_len: Option<usize>,
    pub max_track_duration: Option<Duration>,
    pub allow_streams: bool,
}

impl TierLimits {
    pub const UNLIMITED: Self = Self {
        max_queue_len: None,
        max_track_duration: None,
        allow_streams: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitTable {
    pub free: TierLimits,
    pub supporter: TierLimits,
    pub premium: TierLimits,
}

impl Default for LimitTable {
    fn default() -> Self {
        Self {
            free: TierLimits {
                max_queue_len: Some(1000),
                max_track_duration: Some(Duration::from_secs(3600)),
                allow_streams: true,
            },
            supporter: TierLimits {
                max_queue_len: Some(5000),
                max_track_duration: Some(Duration::from_secs(3 * 3600)),
                allow_streams: true,
            },
            premium: TierLimits::UNLIMITED,
        }
    }
}

impl LimitTable {
    pub fn for_tier(&self, tier: ServiceTier) -> &TierLimits {
        match tier {
            ServiceTier::Free => &self.free,
            ServiceTier::Supporter => &self.supporter,
            ServiceTier::Premium => &self.premium,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { reason: String },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn into_result(self) -> Result<(), PlaybackError> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied { reason } => Err(PlaybackError::QueueLimitExceeded(reason)),
        }
    }
}

/// Result of admitting a playlist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchAdmission {
    pub accepted: Vec<TrackInfo>,
    pub rejected: Vec<(TrackInfo, String)>,
}

/// Stateless admission control: a function of the tier table and its inputs.
#[derive(Debug, Clone, Default)]
pub struct PlayerLimitManager {
    limits: LimitTable,
}

impl PlayerLimitManager {
    pub fn new(limits: LimitTable) -> Self {
        Self { limits }
    }

    pub fn limits(&self, tier: ServiceTier) -> &TierLimits {
        self.limits.for_tier(tier)
    }

    /// Decides whether `candidate` may join a queue currently holding
    /// `queued` tracks.
    pub fn check_admission(
        &self,
        guild_id: GuildId,
        tier: ServiceTier,
        queued: usize,
        candidate: &TrackInfo,
    ) -> Admission {
        let limits = self.limits.for_tier(tier);

        if let Some(max) = limits.max_queue_len {
            if queued >= max {
                debug!("🚫 Guild {} queue full ({}/{})", guild_id, queued, max);
                return Admission::Denied {
                    reason: format!("The queue is full (maximum {max} tracks)."),
                };
            }
        }

        if let Some(max) = limits.max_track_duration {
            if candidate.is_stream {
                if !limits.allow_streams {
                    return Admission::Denied {
                        reason: "Live streams are not available on this server's plan.".into(),
                    };
                }
            } else if let Some(length) = candidate.duration {
                if length > max {
                    debug!("🚫 Guild {} rejected {} ({:?})", guild_id, candidate.title, length);
                    return Admission::Denied {
                        reason: format!(
                            "**{}** is too long ({}); the limit is {}.",
                            candidate.title,
                            humantime::format_duration(length),
                            humantime::format_duration(max)
                        ),
                    };
                }
            }
        }

        Admission::Allowed
    }

    /// Admits playlist entries in order while there is room; the rest are
    /// reported back with their reasons.
    pub fn admit_batch(
        &self,
        guild_id: GuildId,
        tier: ServiceTier,
        queued: usize,
        candidates: Vec<TrackInfo>,
    ) -> BatchAdmission {
        let mut batch = BatchAdmission::default();

        for candidate in candidates {
            let queued_now = queued + batch.accepted.len();
            match self.check_admission(guild_id, tier, queued_now, &candidate) {
                Admission::Allowed => batch.accepted.push(candidate),
                Admission::Denied { reason } => batch.rejected.push((candidate, reason)),
            }
        }

        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager(max_queue: usize, max_secs: u64) -> PlayerLimitManager {
        let tier = TierLimits {
            max_queue_len: Some(max_queue),
            max_track_duration: Some(Duration::from_secs(max_secs)),
            allow_streams: false,
        };
        PlayerLimitManager::new(LimitTable {
            free: tier,
            supporter: tier,
            premium: TierLimits::UNLIMITED,
        })
    }

    fn song(secs: u64) -> TrackInfo {
        TrackInfo::new("id", "Song").with_duration(Duration::from_secs(secs))
    }

    #[test]
    fn test_queue_at_maximum_is_denied_one_below_is_allowed() {
        let limits = manager(10, 600);
        let guild = GuildId::new(1);

        assert!(matches!(
            limits.check_admission(guild, ServiceTier::Free, 10, &song(60)),
            Admission::Denied { .. }
        ));
        assert_eq!(
            limits.check_admission(guild, ServiceTier::Free, 9, &song(60)),
            Admission::Allowed
        );
    }

    #[test]
    fn test_long_tracks_are_denied_with_reason() {
        let limits = manager(10, 600);

        let admission = limits.check_admission(GuildId::new(1), ServiceTier::Free, 0, &song(601));

        assert_eq!(
            admission,
            Admission::Denied {
                reason: "**Song** is too long (10m 1s); the limit is 10m.".into()
            }
        );
    }

    #[test]
    fn test_premium_is_unlimited() {
        let limits = manager(1, 1);
        let stream = TrackInfo::new("live", "Radio").as_stream();

        assert!(limits
            .check_admission(GuildId::new(1), ServiceTier::Premium, 50_000, &song(99_999))
            .is_allowed());
        assert!(limits
            .check_admission(GuildId::new(1), ServiceTier::Premium, 0, &stream)
            .is_allowed());
        assert!(!limits
            .check_admission(GuildId::new(1), ServiceTier::Free, 0, &stream)
            .is_allowed());
    }

    #[test]
    fn test_batch_admits_prefix_that_fits() {
        let limits = manager(3, 600);

        let batch = limits.admit_batch(
            GuildId::new(1),
            ServiceTier::Free,
            1,
            vec![song(10), song(700), song(20), song(30)],
        );

        assert_eq!(batch.accepted, vec![song(10), song(20)]);
        assert_eq!(batch.rejected.len(), 2);
    }

    #[test]
    fn test_denial_maps_to_queue_limit_error() {
        let err = Admission::Denied { reason: "full".into() }.into_result().unwrap_err();
        assert_eq!(err, PlaybackError::QueueLimitExceeded("full".into()));
    }
}

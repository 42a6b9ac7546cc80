use dashmap::{mapref::entry::Entry, DashMap};
use regex::Regex;
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use std::{
    sync::{Arc, LazyLock},
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::audio::track::TrackInfo;
use crate::error::SelectionError;

/// Most candidates a single search prompt offers.
pub const MAX_CANDIDATES: usize = 5;

static SPLIT_SELECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+(?:[\s,]+\d+)*\s*$").expect("valid selection regex"));

/// The chat message that shows a selection prompt, so it can be edited away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SelectionPrompt {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone)]
pub struct SearchSelection {
    pub candidates: Vec<TrackInfo>,
    pub prompt: SelectionPrompt,
    created_at: Instant,
}

impl SearchSelection {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }
}

/// Pending search results waiting for a user to pick one by number.
///
/// One live entry per member, so a prompt shown in one guild can only be
/// answered in that guild. Entries die on first use or after the TTL.
#[derive(Debug, Clone)]
pub struct SearchSelectionCache {
    entries: Arc<DashMap<(GuildId, UserId), SearchSelection>>,
    ttl: Duration,
}

impl SearchSelectionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Stores a new prompt for `user_id` in `guild_id`, returning the
    /// previous unconsumed prompt so the caller can retract it.
    pub fn put(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        mut candidates: Vec<TrackInfo>,
        prompt: SelectionPrompt,
    ) -> Option<SelectionPrompt> {
        candidates.truncate(MAX_CANDIDATES);
        let selection = SearchSelection {
            candidates,
            prompt,
            created_at: Instant::now(),
        };

        let retracted = self
            .entries
            .insert((guild_id, user_id), selection)
            .map(|old| old.prompt);
        if retracted.is_some() {
            debug!(
                "🔁 Replaced pending selection for user {} in guild {}",
                user_id, guild_id
            );
        }
        retracted
    }

    /// Takes candidate number `choice` (1-based, as typed by the user) and
    /// drops the entry. An out-of-range number leaves the entry in place.
    pub fn consume(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        choice: usize,
    ) -> Result<TrackInfo, SelectionError> {
        self.consume_many(guild_id, user_id, &[choice])
            .map(|mut picked| picked.remove(0))
    }

    /// Like [`consume`](Self::consume) for several numbers at once. Picks
    /// come back in the order given, without duplicates.
    pub fn consume_many(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        choices: &[usize],
    ) -> Result<Vec<TrackInfo>, SelectionError> {
        self.consume_many_at(guild_id, user_id, choices, Instant::now())
    }

    fn consume_many_at(
        &self,
        guild_id: GuildId,
        user_id: UserId,
        choices: &[usize],
        now: Instant,
    ) -> Result<Vec<TrackInfo>, SelectionError> {
        let Entry::Occupied(entry) = self.entries.entry((guild_id, user_id)) else {
            return Err(SelectionError::NoActiveSelection);
        };

        if entry.get().is_expired(self.ttl, now) {
            entry.remove();
            return Err(SelectionError::Expired);
        }
        if choices.is_empty() {
            return Err(SelectionError::Unparsable(String::new()));
        }

        let available = entry.get().candidates.len();
        if let Some(&bad) = choices.iter().find(|&&c| c == 0 || c > available) {
            return Err(SelectionError::IndexOutOfRange {
                index: bad,
                available,
            });
        }

        let selection = entry.remove();
        let mut picked: Vec<usize> = Vec::with_capacity(choices.len());
        for &choice in choices {
            if !picked.contains(&choice) {
                picked.push(choice);
            }
        }

        Ok(picked
            .into_iter()
            .map(|choice| selection.candidates[choice - 1].clone())
            .collect())
    }

    pub fn peek(&self, guild_id: GuildId, user_id: UserId) -> Option<SearchSelection> {
        self.entries
            .get(&(guild_id, user_id))
            .filter(|entry| !entry.is_expired(self.ttl, Instant::now()))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes expired entries and returns their prompts.
    pub fn sweep(&self) -> Vec<SelectionPrompt> {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> Vec<SelectionPrompt> {
        let mut removed = Vec::new();
        self.entries.retain(|_, selection| {
            let keep = !selection.is_expired(self.ttl, now);
            if !keep {
                removed.push(selection.prompt);
            }
            keep
        });

        if !removed.is_empty() {
            debug!("🧹 Swept {} expired search selections", removed.len());
        }
        removed
    }

    pub fn spawn_sweeper(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            info!("🧹 Search selection sweeper started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cache.sweep();
                    }
                }
            }
        })
    }
}

/// Parses "2", "1 3" or "1,4" into selection numbers.
pub fn parse_selection(input: &str) -> Result<Vec<usize>, SelectionError> {
    if !SPLIT_SELECT.is_match(input) {
        return Err(SelectionError::Unparsable(input.trim().to_string()));
    }

    input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<usize>()
                .map_err(|_| SelectionError::Unparsable(part.to_string()))
        })
        .collect()
}

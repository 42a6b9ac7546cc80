use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tracing::{debug, info};

use super::track::QueuedTrack;

pub const DEFAULT_HISTORY_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    Single,
    All,
}

/// Queue entry plus its insertion sequence, so shuffle can be undone.
#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    track: Arc<QueuedTrack>,
}

/// Ordered upcoming tracks, the track currently playing, and a bounded
/// history of finished tracks.
///
/// The currently playing track is held apart from the upcoming list, which
/// is how it stays out of every shuffle and reshuffle.
#[derive(Debug)]
pub struct TrackQueue {
    items: VecDeque<Slot>,
    current: Option<Arc<QueuedTrack>>,
    history: VecDeque<Arc<QueuedTrack>>,
    history_limit: usize,
    repeat: RepeatMode,
    shuffle: bool,
    next_seq: u64,
}

impl Default for TrackQueue {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_SIZE)
    }
}

impl TrackQueue {
    pub fn new(history_limit: usize) -> Self {
        Self {
            items: VecDeque::new(),
            current: None,
            history: VecDeque::new(),
            history_limit,
            repeat: RepeatMode::Off,
            shuffle: false,
            next_seq: 0,
        }
    }

    /// Appends a track and returns the shared entry with its 0-based
    /// position among the upcoming tracks. In shuffle mode the track lands
    /// at a random upcoming position.
    pub fn enqueue(&mut self, track: QueuedTrack) -> (Arc<QueuedTrack>, usize) {
        let track = Arc::new(track);
        let slot = self.slot(track.clone());

        let position = if self.shuffle && !self.items.is_empty() {
            let index = rand::thread_rng().gen_range(0..=self.items.len());
            self.items.insert(index, slot);
            index
        } else {
            self.items.push_back(slot);
            self.items.len() - 1
        };

        info!("➕ Queued: {}", track.title());
        (track, position)
    }

    /// Removes and returns the next upcoming track.
    pub fn dequeue_next(&mut self) -> Option<Arc<QueuedTrack>> {
        self.items.pop_front().map(|slot| slot.track)
    }

    pub fn peek_next(&self) -> Option<&Arc<QueuedTrack>> {
        self.items.front().map(|slot| &slot.track)
    }

    /// Removes the upcoming track at `index` (0-based).
    pub fn remove(&mut self, index: usize) -> Option<Arc<QueuedTrack>> {
        let removed = self.items.remove(index).map(|slot| slot.track);
        if let Some(track) = &removed {
            debug!("❌ Removed {} from position {}", track.title(), index);
        }
        removed
    }

    /// Pushes a finished track onto the history, dropping the oldest entry
    /// once the limit is reached.
    pub fn move_to_history(&mut self, track: Arc<QueuedTrack>) {
        if self.history_limit == 0 {
            return;
        }
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(track);
    }

    /// Nothing playing and nothing upcoming.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.current.is_none()
    }

    pub fn has_upcoming(&self) -> bool {
        !self.items.is_empty()
    }

    /// Number of upcoming tracks (the current one excluded).
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn current(&self) -> Option<&Arc<QueuedTrack>> {
        self.current.as_ref()
    }

    /// Moves on after the current track ended.
    ///
    /// A successful end honours the repeat mode; a failed one always advances
    /// as if repeat were off. Returns the track that should play next.
    pub fn advance(&mut self, finished_ok: bool) -> Option<Arc<QueuedTrack>> {
        let mode = if finished_ok { self.repeat } else { RepeatMode::Off };
        self.advance_with(mode)
    }

    /// Skips the current track. Repeat-single never holds a skipped track;
    /// repeat-all still sends it to the tail.
    pub fn skip(&mut self) -> Option<Arc<QueuedTrack>> {
        let mode = match self.repeat {
            RepeatMode::Single => RepeatMode::Off,
            other => other,
        };
        self.advance_with(mode)
    }

    fn advance_with(&mut self, mode: RepeatMode) -> Option<Arc<QueuedTrack>> {
        if let Some(finished) = self.current.take() {
            match mode {
                RepeatMode::Single => {
                    info!("🔂 Repeating: {}", finished.title());
                    self.current = Some(finished.clone());
                    return Some(finished);
                }
                RepeatMode::All => {
                    self.move_to_history(finished.clone());
                    let slot = self.slot(finished);
                    self.items.push_back(slot);
                }
                RepeatMode::Off => self.move_to_history(finished),
            }
        }

        self.current = self.dequeue_next();
        match &self.current {
            Some(next) => debug!("➡️ Next up: {}", next.title()),
            None => info!("📭 Queue finished"),
        }
        self.current.clone()
    }

    /// Drops every upcoming track and the current one. Returns how many
    /// upcoming tracks were removed.
    pub fn clear(&mut self) -> usize {
        self.current = None;
        self.clear_upcoming()
    }

    /// Drops the upcoming tracks but leaves the current one alone.
    pub fn clear_upcoming(&mut self) -> usize {
        let cleared = self.items.len();
        self.items.clear();
        info!("🗑️ Queue cleared ({} tracks)", cleared);
        cleared
    }

    pub fn repeat(&self) -> RepeatMode {
        self.repeat
    }

    pub fn set_repeat(&mut self, mode: RepeatMode) {
        self.repeat = mode;
        match mode {
            RepeatMode::Off => info!("➡️ Repeat off"),
            RepeatMode::Single => info!("🔂 Repeat single"),
            RepeatMode::All => info!("🔁 Repeat all"),
        }
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle
    }

    /// Turning shuffle on permutes the upcoming tracks; turning it off puts
    /// them back in insertion order.
    pub fn set_shuffle(&mut self, enabled: bool) {
        if self.shuffle == enabled {
            return;
        }
        self.shuffle = enabled;
        if enabled {
            self.permute();
            info!("🔀 Shuffle on");
        } else {
            self.items.make_contiguous().sort_by_key(|slot| slot.seq);
            info!("➡️ Shuffle off");
        }
    }

    /// Draws a fresh uniform permutation of the upcoming tracks. The track
    /// currently playing is not part of the pool.
    pub fn reshuffle(&mut self) {
        self.permute();
        info!("🔀 Queue reshuffled ({} tracks)", self.items.len());
    }

    fn permute(&mut self) {
        // SliceRandom::shuffle is a Fisher-Yates shuffle.
        self.items
            .make_contiguous()
            .shuffle(&mut rand::thread_rng());
    }

    pub fn upcoming(&self) -> Vec<Arc<QueuedTrack>> {
        self.items.iter().map(|slot| slot.track.clone()).collect()
    }

    pub fn history(&self) -> Vec<Arc<QueuedTrack>> {
        self.history.iter().cloned().collect()
    }

    pub fn total_duration(&self) -> Duration {
        let upcoming: Duration = self
            .items
            .iter()
            .filter_map(|slot| slot.track.track().duration)
            .sum();
        let current = self
            .current
            .as_ref()
            .and_then(|track| track.track().duration)
            .unwrap_or_default();
        upcoming + current
    }

    fn slot(&mut self, track: Arc<QueuedTrack>) -> Slot {
        let seq = self.next_seq;
        self.next_seq += 1;
        Slot { seq, track }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::track::TrackInfo;
    use pretty_assertions::assert_eq;
    use serenity::model::id::UserId;

    fn queued(title: &str) -> QueuedTrack {
        QueuedTrack::new(TrackInfo::new(title, title), UserId::new(7))
    }

    fn titles(tracks: &[Arc<QueuedTrack>]) -> Vec<String> {
        tracks.iter().map(|t| t.title().to_string()).collect()
    }

    fn queue_of(names: &[&str]) -> TrackQueue {
        let mut queue = TrackQueue::new(10);
        for name in names {
            queue.enqueue(queued(name));
        }
        queue
    }

    #[test]
    fn test_track_end_with_repeat_off_moves_to_history() {
        let mut queue = queue_of(&["A", "B", "C"]);
        assert_eq!(queue.advance(true).unwrap().title(), "A");

        let next = queue.advance(true).unwrap();

        assert_eq!(next.title(), "B");
        assert_eq!(queue.current().unwrap().title(), "B");
        assert_eq!(queue.peek_next().unwrap().title(), "C");
        assert_eq!(titles(&queue.history()), vec!["A"]);
    }

    #[test]
    fn test_repeat_all_requeues_finished_track_once_at_tail() {
        let mut queue = queue_of(&["A", "B", "C"]);
        queue.set_repeat(RepeatMode::All);
        let a = queue.advance(true).unwrap();

        queue.advance(true);

        let upcoming = queue.upcoming();
        assert_eq!(titles(&upcoming), vec!["C", "A"]);
        assert_eq!(
            upcoming.iter().filter(|t| Arc::ptr_eq(t, &a)).count(),
            1
        );
    }

    #[test]
    fn test_repeat_single_replays_without_touching_queue() {
        let mut queue = queue_of(&["A", "B", "C"]);
        queue.set_repeat(RepeatMode::Single);
        let a = queue.advance(true).unwrap();

        let again = queue.advance(true).unwrap();

        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(titles(&queue.upcoming()), vec!["B", "C"]);
        assert!(queue.history().is_empty());
    }

    #[test]
    fn test_failed_track_advances_as_repeat_off() {
        let mut queue = queue_of(&["A", "B"]);
        queue.set_repeat(RepeatMode::Single);
        queue.advance(true);

        let next = queue.advance(false).unwrap();

        assert_eq!(next.title(), "B");
        assert_eq!(titles(&queue.history()), vec!["A"]);
    }

    #[test]
    fn test_skip_ignores_repeat_single() {
        let mut queue = queue_of(&["A", "B"]);
        queue.set_repeat(RepeatMode::Single);
        queue.advance(true);

        assert_eq!(queue.skip().unwrap().title(), "B");
    }

    #[test]
    fn test_reshuffle_keeps_current_track() {
        let mut queue = queue_of(&["A", "B", "C", "D", "E", "F"]);
        let playing = queue.advance(true).unwrap();

        for _ in 0..25 {
            queue.reshuffle();
            assert!(Arc::ptr_eq(queue.current().unwrap(), &playing));
            assert!(!queue.upcoming().iter().any(|t| Arc::ptr_eq(t, &playing)));
            assert_eq!(queue.len(), 5);
        }
    }

    #[test]
    fn test_shuffle_off_restores_insertion_order() {
        let mut queue = queue_of(&["A", "B", "C", "D", "E"]);
        queue.set_shuffle(true);
        queue.enqueue(queued("F"));

        queue.set_shuffle(false);

        assert_eq!(titles(&queue.upcoming()), vec!["A", "B", "C", "D", "E", "F"]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut queue = TrackQueue::new(2);
        for name in ["A", "B", "C"] {
            queue.move_to_history(Arc::new(queued(name)));
        }

        assert_eq!(titles(&queue.history()), vec!["B", "C"]);
    }

    #[test]
    fn test_remove_out_of_range_returns_none() {
        let mut queue = queue_of(&["A"]);
        assert!(queue.remove(3).is_none());
        assert_eq!(queue.remove(0).unwrap().title(), "A");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_total_duration_counts_current_and_upcoming() {
        let mut queue = TrackQueue::new(5);
        for secs in [60, 90] {
            let info = TrackInfo::new("id", "t").with_duration(Duration::from_secs(secs));
            queue.enqueue(QueuedTrack::new(info, UserId::new(1)));
        }
        queue.advance(true);

        assert_eq!(queue.total_duration(), Duration::from_secs(150));
    }
}

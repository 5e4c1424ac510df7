//! Per-process bookkeeping of players seen by the check-in processor
//!
//! This module tracks two pieces of state that live for the lifetime of the
//! server process:
//! - The set of player IDs that have checked in, used for aggregate counts
//! - The time of the last configuration push decided for each player
//!
//! Neither map evicts entries. Their size is bounded by the number of
//! distinct physical players a single process ever hears from.

use log::debug;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Minimum interval between two configuration pushes to the same player
pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of asking the registry whether a push may go out now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    Allow,
    Suppress { since_last: Duration },
}

/// Active players and per-player push timestamps
///
/// Shared across connection tasks behind an `Arc<RwLock<_>>`, the same way
/// connection state is shared.
pub struct PlayerRegistry {
    /// Players that checked in at least once in this process
    active: HashSet<String>,
    /// When the last push was allowed, per player ID
    last_push: HashMap<String, Instant>,
    push_interval: Duration,
}

impl PlayerRegistry {
    /// Creates an empty registry with the given minimum push spacing
    ///
    /// A zero interval lets every push through.
    pub fn new(push_interval: Duration) -> Self {
        Self {
            active: HashSet::new(),
            last_push: HashMap::new(),
            push_interval,
        }
    }

    /// Minimum time between two non-priority pushes to one player
    pub fn push_interval(&self) -> Duration {
        self.push_interval
    }

    /// Records that a player has checked in
    ///
    /// Returns true the first time a given ID is seen.
    pub fn mark_active(&mut self, player_id: &str) -> bool {
        self.active.insert(player_id.to_string())
    }

    /// Checks whether a player has checked in during this process
    pub fn is_active(&self, player_id: &str) -> bool {
        self.active.contains(player_id)
    }

    /// Number of distinct players that have checked in
    ///
    /// Never decreases; disconnects do not remove players from the set.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Decides whether a configuration push may go out at `now`
    ///
    /// Allowed when the player never had one, when at least the push
    /// interval has elapsed, or unconditionally for priority requests.
    /// An allowed push records `now` as the player's last push time.
    pub fn try_push(&mut self, player_id: &str, priority: bool, now: Instant) -> Throttle {
        if let Some(last) = self.last_push.get(player_id) {
            let since_last = now.saturating_duration_since(*last);
            if since_last < self.push_interval && !priority {
                debug!(
                    "Push to {} suppressed, last one {:.1}s ago",
                    player_id,
                    since_last.as_secs_f32()
                );
                return Throttle::Suppress { since_last };
            }
        }

        self.last_push.insert(player_id.to_string(), now);
        Throttle::Allow
    }

    /// When the last allowed push for this player was decided, if ever
    pub fn last_push(&self, player_id: &str) -> Option<Instant> {
        self.last_push.get(player_id).copied()
    }
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_PUSH_INTERVAL)
    }
}

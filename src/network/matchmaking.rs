//! Matchmaking Queue
//!
//! Waiting players in arrival order. The queue itself is plain data; the
//! lobby keeps it behind a single mutex and runs every operation, plus the
//! periodic sweep, under that lock.
//!
//! Pairing policy:
//! 1. Same tag, oldest first. When several tags have a pair ready, the pair
//!    whose first entry arrived earliest wins.
//! 2. Widen: an entry that has waited `widen_after` with no same-tag partner
//!    pairs with the oldest other entry of any tag.
//! 3. Expiry: entries older than `max_wait` are dropped.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::game::state::PlayerId;
use crate::network::protocol::Difficulty;
use crate::network::registry::ConnectionHandle;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Matchmaking timing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchmakingConfig {
    /// Wait before an entry may pair across difficulty tags
    pub widen_after: Duration,
    /// Wait before an entry is dropped from the queue
    pub max_wait: Duration,
    /// Period of the background pairing/expiry sweep
    pub sweep_interval: Duration,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            widen_after: Duration::from_secs(10),
            max_wait: Duration::from_secs(120),
            sweep_interval: Duration::from_millis(500),
        }
    }
}

impl MatchmakingConfig {
    /// Load from environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            widen_after: env_secs("GRIS_WIDEN_AFTER_SECS").unwrap_or(defaults.widen_after),
            max_wait: env_secs("GRIS_QUEUE_MAX_WAIT_SECS").unwrap_or(defaults.max_wait),
            sweep_interval: std::env::var("GRIS_MATCHMAKING_SWEEP_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.sweep_interval),
        }
    }
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
}

// =============================================================================
// QUEUE ENTRY
// =============================================================================

/// Correlation id for one stay in the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueTicket(pub Uuid);

impl QueueTicket {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueueTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0.as_bytes()[..4]))
    }
}

/// A waiting player.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub handle: ConnectionHandle,
    pub difficulty: Difficulty,
    pub ticket: QueueTicket,
    pub enqueued_at: Instant,
    seq: u64,
}

impl QueueEntry {
    #[inline]
    pub fn player_id(&self) -> PlayerId {
        self.handle.player_id()
    }

    /// Arrival order.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    pub fn waited(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

/// Queue errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("player {0} is already queued")]
    AlreadyQueued(PlayerId),
}

// =============================================================================
// QUEUE
// =============================================================================

/// FIFO matchmaking queue. Entries stay sorted by arrival sequence.
#[derive(Debug)]
pub struct MatchmakingQueue {
    entries: VecDeque<QueueEntry>,
    next_seq: u64,
    config: MatchmakingConfig,
}

impl MatchmakingQueue {
    pub fn new(config: MatchmakingConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 0,
            config,
        }
    }

    pub fn config(&self) -> &MatchmakingConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, player: PlayerId) -> bool {
        self.entries.iter().any(|e| e.player_id() == player)
    }

    /// 1-based position of a player and total waiting.
    pub fn position(&self, player: PlayerId) -> Option<(usize, usize)> {
        self.entries
            .iter()
            .position(|e| e.player_id() == player)
            .map(|i| (i + 1, self.entries.len()))
    }

    /// Entries in arrival order.
    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Add a player at the back of the queue.
    pub fn enqueue(
        &mut self,
        handle: ConnectionHandle,
        difficulty: Difficulty,
        now: Instant,
    ) -> Result<QueueTicket, QueueError> {
        if self.contains(handle.player_id()) {
            return Err(QueueError::AlreadyQueued(handle.player_id()));
        }

        let ticket = QueueTicket::new();
        self.entries.push_back(QueueEntry {
            handle,
            difficulty,
            ticket,
            enqueued_at: now,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        Ok(ticket)
    }

    /// Remove `handle`'s entry. A different connection of the same player is
    /// left alone. `None` if the entry is gone (paired, expired, cancelled).
    pub fn cancel(&mut self, handle: &ConnectionHandle) -> Option<QueueEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.handle.same_connection(handle))?;
        self.entries.remove(index)
    }

    /// Put a previously removed entry back at its original position.
    pub fn requeue(&mut self, entry: QueueEntry) {
        if self.contains(entry.player_id()) {
            return;
        }
        let index = self.entries.partition_point(|e| e.seq < entry.seq);
        self.entries.insert(index, entry);
    }

    /// Pop the next pair to play, earlier arrival first.
    pub fn try_pair(&mut self, now: Instant) -> Option<(QueueEntry, QueueEntry)> {
        let (i, j) = self.same_tag_pair().or_else(|| self.widened_pair(now))?;
        // Remove the later index first so the earlier one stays valid
        let second = self.entries.remove(j)?;
        let first = self.entries.remove(i)?;
        Some((first, second))
    }

    /// Drop every entry that has waited at least `max_wait`.
    pub fn expire(&mut self, now: Instant) -> Vec<QueueEntry> {
        let max_wait = self.config.max_wait;
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.waited(now) >= max_wait {
                expired.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        expired
    }

    fn same_tag_pair(&self) -> Option<(usize, usize)> {
        for (i, first) in self.entries.iter().enumerate() {
            let partner = self
                .entries
                .iter()
                .enumerate()
                .skip(i + 1)
                .find(|(_, e)| e.difficulty == first.difficulty);
            if let Some((j, _)) = partner {
                return Some((i, j));
            }
        }
        None
    }

    fn widened_pair(&self, now: Instant) -> Option<(usize, usize)> {
        if self.entries.len() < 2 {
            return None;
        }
        let widen_after = self.config.widen_after;
        let i = self.entries.iter().position(|e| e.waited(now) >= widen_after)?;
        // Oldest other entry
        let j = if i == 0 { 1 } else { 0 };
        Some((i.min(j), i.max(j)))
    }
}

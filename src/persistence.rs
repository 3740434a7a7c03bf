//! Persistence Gateway
//!
//! The live-match core only needs two things from storage: resolve a username
//! to an identity, and record a finished match. Both sit behind
//! [`PersistenceGateway`]. [`MemoryStore`] is the in-process implementation
//! used by the binary and the tests.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::game::state::{PlayerId, Side};
use crate::network::session::SessionId;

// =============================================================================
// ERRORS
// =============================================================================

/// Persistence errors.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("invalid team name: {0}")]
    InvalidTeam(String),

    #[error("username already exists: {0}")]
    DuplicateUsername(String),

    #[error("unknown player: {0}")]
    UnknownPlayer(PlayerId),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("failed to read users file: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed users file: {0}")]
    Format(#[from] serde_json::Error),
}

// =============================================================================
// IDENTITY
// =============================================================================

/// The four teams a user can join.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Team {
    #[serde(rename = "HACKTIVISTS")]
    Hacktivists,
    #[serde(rename = "BUG BUSTERS")]
    BugBusters,
    #[serde(rename = "LOGIC LEAGUE")]
    LogicLeague,
    #[serde(rename = "CODE ALLIANCE")]
    CodeAlliance,
}

impl Team {
    pub const ALL: [Team; 4] = [
        Team::Hacktivists,
        Team::BugBusters,
        Team::LogicLeague,
        Team::CodeAlliance,
    ];

    /// Display name, as users type it.
    pub fn name(self) -> &'static str {
        match self {
            Team::Hacktivists => "HACKTIVISTS",
            Team::BugBusters => "BUG BUSTERS",
            Team::LogicLeague => "LOGIC LEAGUE",
            Team::CodeAlliance => "CODE ALLIANCE",
        }
    }

    /// Parse a team name, ignoring case.
    pub fn parse(name: &str) -> Result<Self, PersistenceError> {
        let upper = name.trim().to_uppercase();
        Team::ALL
            .into_iter()
            .find(|team| team.name() == upper)
            .ok_or_else(|| PersistenceError::InvalidTeam(name.to_string()))
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A resolved user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub player_id: PlayerId,
    pub username: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<Team>,
}

// =============================================================================
// MATCH RESULT
// =============================================================================

/// Why a session finished.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    /// A player reached the win score.
    Completed,
    /// A player left the match.
    Forfeit { player: PlayerId },
    /// A disconnected player did not return in time.
    GraceExpired { player: PlayerId },
    /// The session broke an internal invariant.
    Fatal { detail: String },
}

impl TerminationReason {
    /// Player who lost by walking away, if any.
    pub fn forfeiting_player(&self) -> Option<PlayerId> {
        match self {
            TerminationReason::Forfeit { player }
            | TerminationReason::GraceExpired { player } => Some(*player),
            _ => None,
        }
    }
}

/// Outcome of a finished session. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub session_id: SessionId,
    pub winner_id: PlayerId,
    pub loser_id: PlayerId,
    pub winner_score: u32,
    pub loser_score: u32,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Simulated ticks.
    pub ticks: u32,
    pub reason: TerminationReason,
    pub ended_at: DateTime<Utc>,
}

impl MatchResult {
    /// Build a result from slot-ordered players and scores.
    pub fn from_slots(
        session_id: SessionId,
        players: [PlayerId; 2],
        score: [u32; 2],
        winner: Side,
        ticks: u32,
        duration_ms: u64,
        reason: TerminationReason,
    ) -> Self {
        let loser = winner.opponent();
        Self {
            session_id,
            winner_id: players[winner.index()],
            loser_id: players[loser.index()],
            winner_score: score[winner.index()],
            loser_score: score[loser.index()],
            duration_ms,
            ticks,
            reason,
            ended_at: Utc::now(),
        }
    }

    /// Score as shown to players, winner first ("5-3").
    pub fn score_line(&self) -> String {
        format!("{}-{}", self.winner_score, self.loser_score)
    }
}

// =============================================================================
// GATEWAY
// =============================================================================

/// Storage the live-match core depends on.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Record a finished match. Called exactly once per session.
    async fn record_match_result(&self, result: &MatchResult) -> Result<(), PersistenceError>;

    /// Resolve a username.
    async fn get_user_identity(&self, username: &str) -> Result<Option<Identity>, PersistenceError>;
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Per-player aggregate stats.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub wins: u32,
    pub losses: u32,
    pub games_played: u32,
    pub points_for: u32,
    pub points_against: u32,
}

/// User record as found in a users seed file.
#[derive(Clone, Debug, Deserialize)]
pub struct NewUser {
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub team: String,
}

#[derive(Default)]
struct StoreInner {
    next_id: u64,
    users: BTreeMap<String, Identity>,
    stats: BTreeMap<PlayerId, PlayerStats>,
    history: Vec<MatchResult>,
}

/// In-memory gateway.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a user and its empty stats row.
    pub async fn create_user(
        &self,
        username: &str,
        display_name: &str,
        team: &str,
    ) -> Result<Identity, PersistenceError> {
        let team = Team::parse(team)?;

        let mut inner = self.inner.write().await;
        if inner.users.contains_key(username) {
            return Err(PersistenceError::DuplicateUsername(username.to_string()));
        }

        inner.next_id += 1;
        let identity = Identity {
            player_id: PlayerId(inner.next_id),
            username: username.to_string(),
            display_name: display_name.to_string(),
            team: Some(team),
        };
        inner.users.insert(username.to_string(), identity.clone());
        inner.stats.insert(identity.player_id, PlayerStats::default());

        debug!("Created user {} ({}) on {}", username, identity.player_id, team);
        Ok(identity)
    }

    /// Seed users from a JSON array of `{username, display_name?, team}`.
    pub async fn load_users_json(&self, json: &str) -> Result<usize, PersistenceError> {
        let users: Vec<NewUser> = serde_json::from_str(json)?;
        let count = users.len();
        for user in users {
            let display = user.display_name.as_deref().unwrap_or(&user.username);
            self.create_user(&user.username, display, &user.team).await?;
        }
        Ok(count)
    }

    /// Seed users from a file.
    pub async fn load_users_file(&self, path: impl AsRef<Path>) -> Result<usize, PersistenceError> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        let count = self.load_users_json(&json).await?;
        info!("Loaded {} users from {}", count, path.as_ref().display());
        Ok(count)
    }

    /// Stats for a player.
    pub async fn stats(&self, player: PlayerId) -> Option<PlayerStats> {
        self.inner.read().await.stats.get(&player).cloned()
    }

    /// Every recorded result, oldest first.
    pub async fn history(&self) -> Vec<MatchResult> {
        self.inner.read().await.history.clone()
    }

    /// Results involving a player, newest first.
    pub async fn history_for(&self, player: PlayerId) -> Vec<MatchResult> {
        self.inner
            .read()
            .await
            .history
            .iter()
            .rev()
            .filter(|r| r.winner_id == player || r.loser_id == player)
            .cloned()
            .collect()
    }

    /// Usernames on a team.
    pub async fn team_roster(&self, team: Team) -> Vec<String> {
        self.inner
            .read()
            .await
            .users
            .values()
            .filter(|identity| identity.team == Some(team))
            .map(|identity| identity.username.clone())
            .collect()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn record_match_result(&self, result: &MatchResult) -> Result<(), PersistenceError> {
        let mut inner = self.inner.write().await;

        for player in [result.winner_id, result.loser_id] {
            if !inner.stats.contains_key(&player) {
                return Err(PersistenceError::UnknownPlayer(player));
            }
        }

        if let Some(stats) = inner.stats.get_mut(&result.winner_id) {
            stats.wins += 1;
            stats.games_played += 1;
            stats.points_for += result.winner_score;
            stats.points_against += result.loser_score;
        }
        if let Some(stats) = inner.stats.get_mut(&result.loser_id) {
            stats.losses += 1;
            stats.games_played += 1;
            stats.points_for += result.loser_score;
            stats.points_against += result.winner_score;
        }
        inner.history.push(result.clone());

        Ok(())
    }

    async fn get_user_identity(&self, username: &str) -> Result<Option<Identity>, PersistenceError> {
        Ok(self.inner.read().await.users.get(username).cloned())
    }
}

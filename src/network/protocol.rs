//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every message is a JSON object tagged by `type`.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::game::events::GameEvent;
use crate::game::input::PaddleDirection;
use crate::game::state::{PlayerId, PongState, Side};
use crate::network::matchmaking::QueueTicket;
use crate::network::session::SessionId;
use crate::persistence::{Identity, MatchResult, TerminationReason};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server. Must be the first message.
    Auth { token: String },

    /// Request to join matchmaking.
    JoinQueue {
        #[serde(default)]
        difficulty: Difficulty,
    },

    /// Leave matchmaking.
    CancelQueue,

    /// Paddle intent for the current match.
    Input { direction: PaddleDirection },

    /// Leave the queue or forfeit the current match.
    Leave,

    /// Ping for latency measurement.
    Ping { timestamp: u64 },
}

/// Matchmaking difficulty tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    #[default]
    Normal,
    Hard,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Matchmaking status update.
    QueueStatus(QueueStatus),

    /// Paired into a session, or resumed into one.
    MatchFound(MatchFoundInfo),

    /// Authoritative state for one tick.
    StateUpdate(StateUpdate),

    /// Session finished.
    MatchEnded(MatchEndedInfo),

    /// Opponent disconnected; the match waits for them.
    SessionPaused {
        session_id: SessionId,
        player_id: PlayerId,
        grace_ms: u64,
    },

    /// Opponent is back.
    SessionResumed {
        session_id: SessionId,
        player_id: PlayerId,
    },

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Authentication result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Resolved identity if successful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// Error message if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// Queue state reported to a waiting player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// Waiting for an opponent.
    Searching,
    /// Removed after waiting too long.
    TimedOut,
}

/// Matchmaking status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Correlation id for this queue entry.
    pub ticket: QueueTicket,
    pub status: QueueState,
    pub difficulty: Difficulty,
    /// 1-based position among all waiting entries.
    pub position: usize,
    /// Total entries waiting.
    pub waiting: usize,
}

/// Information about a found match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFoundInfo {
    pub session_id: SessionId,
    /// The recipient's side.
    pub side: Side,
    pub opponent: Identity,
    /// Points needed to win.
    pub win_score: u32,
    /// Simulation ticks per second.
    pub tick_rate: u32,
    /// True when rejoining a paused session.
    #[serde(default)]
    pub resumed: bool,
}

/// Game state update (sent every tick).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub session_id: SessionId,
    /// Server tick; the first update of a session is tick 0.
    pub tick: u32,
    /// Ball position (Fixed as i32).
    pub ball: [i32; 2],
    /// Ball velocity in units/sec (Fixed as i32).
    pub ball_velocity: [i32; 2],
    /// Paddle centers, left then right (Fixed as i32).
    pub paddles: [i32; 2],
    /// Score, left then right.
    pub score: [u32; 2],
    /// Events produced by this tick.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<GameEvent>,
}

impl StateUpdate {
    /// Snapshot a session's state.
    pub fn from_state(session_id: SessionId, state: &PongState, events: Vec<GameEvent>) -> Self {
        Self {
            session_id,
            tick: state.tick,
            ball: state.ball.position.to_array(),
            ball_velocity: state.ball.velocity.to_array(),
            paddles: [state.paddles[0].y, state.paddles[1].y],
            score: state.score,
            events,
        }
    }
}

/// Match end information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchEndedInfo {
    pub session_id: SessionId,
    pub winner: PlayerId,
    pub loser: PlayerId,
    /// Winner's score first, e.g. "5-3".
    pub score: String,
    pub reason: TerminationReason,
    pub duration_ms: u64,
}

impl From<&MatchResult> for MatchEndedInfo {
    fn from(result: &MatchResult) -> Self {
        Self {
            session_id: result.session_id,
            winner: result.winner_id,
            loser: result.loser_id,
            score: result.score_line(),
            reason: result.reason.clone(),
            duration_ms: result.duration_ms,
        }
    }
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Message could not be parsed.
    InvalidMessage,
    /// Authentication failed.
    AuthFailed,
    /// Not authenticated.
    NotAuthenticated,
    /// JWT token has expired.
    TokenExpired,
    /// Invalid JWT token (signature, format, claims).
    InvalidToken,
    /// Token named a user that does not exist.
    UnknownUser,
    /// Already waiting in the queue.
    AlreadyQueued,
    /// Already in match.
    AlreadyInMatch,
    /// Not in match.
    NotInMatch,
    /// Not waiting in the queue.
    NotQueued,
    /// Connection replaced by a newer login.
    Superseded,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

impl ServerMessage {
    /// Shorthand for an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError {
            code,
            message: message.into(),
        })
    }

    /// Session this message belongs to, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            ServerMessage::MatchFound(info) => Some(info.session_id),
            ServerMessage::StateUpdate(update) => Some(update.session_id),
            ServerMessage::MatchEnded(info) => Some(info.session_id),
            ServerMessage::SessionPaused { session_id, .. }
            | ServerMessage::SessionResumed { session_id, .. } => Some(*session_id),
            _ => None,
        }
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

/// A client message that could not be decoded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("binary frames are not supported")]
    BinaryFrame,
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(s)?)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

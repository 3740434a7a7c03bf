//! Network Layer
//!
//! WebSocket server, lobby and live sessions.
//! This layer is **non-deterministic** - all game logic runs through `game/`.

pub mod auth;
pub mod broadcast;
pub mod lobby;
pub mod matchmaking;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use auth::{authenticate, AuthConfig, AuthError, TokenClaims};
pub use broadcast::EventBroadcaster;
pub use lobby::{Lobby, LobbyError};
pub use matchmaking::{MatchmakingConfig, MatchmakingQueue, QueueTicket};
pub use protocol::{ClientMessage, Difficulty, ErrorCode, ServerMessage};
pub use registry::{ConnectionHandle, ConnectionRegistry, ConnectionState};
pub use server::{GameServer, GameServerError, ServerConfig};
pub use session::{MatchSession, SessionConfig, SessionError, SessionId, SessionManager};

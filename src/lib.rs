//! # GRIS PONG Game Server
//!
//! Matchmaking and authoritative live matches for two-player Pong.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    GRIS PONG SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── fixed.rs    - Q16.16 fixed-point and court constants    │
//! │  ├── vec2.rs     - 2D vector with fixed-point                │
//! │  └── rng.rs      - Xorshift128+ PRNG, session seeds          │
//! │                                                              │
//! │  game/           - Pong simulation (deterministic)           │
//! │  ├── input.rs    - Paddle intents                            │
//! │  ├── state.rs    - Ball, paddles, score, invariants          │
//! │  ├── tick.rs     - Authoritative simulation step             │
//! │  └── events.rs   - Serves, hits, points, wins                │
//! │                                                              │
//! │  network/        - Networking (non-deterministic)            │
//! │  ├── registry.rs - Connections and their lobby state         │
//! │  ├── matchmaking.rs - Difficulty-tagged FIFO queue           │
//! │  ├── session.rs  - Match sessions and their drivers          │
//! │  ├── broadcast.rs- Best-effort event fan-out                 │
//! │  ├── lobby.rs    - Connect, queue, leave, disconnect         │
//! │  ├── auth.rs     - Token validation                          │
//! │  ├── protocol.rs - Message types                             │
//! │  └── server.rs   - WebSocket server                          │
//! │                                                              │
//! │  persistence.rs  - Identity lookup and match results         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Determinism
//!
//! `core/` and `game/` use no floats, no system time and no unseeded
//! randomness. A session seed plus the per-tick paddle intents reproduce a
//! match exactly.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod persistence;

// Re-export commonly used types
pub use core::fixed::{Fixed, FIXED_ONE, FIXED_HALF, FIXED_SCALE};
pub use core::vec2::FixedVec2;
pub use core::rng::DeterministicRng;
pub use game::{GameConfig, PaddleDirection, PlayerId, PongState, Side};
pub use network::{GameServer, ServerConfig, SessionId};
pub use persistence::{Identity, MatchResult, MemoryStore, PersistenceGateway};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Simulation tick rate (Hz)
pub const TICK_RATE: u32 = 60;

/// Points needed to win a match
pub const WIN_SCORE: u32 = 5;

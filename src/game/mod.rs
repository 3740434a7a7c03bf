//! Game Logic Module
//!
//! Pong simulation. 100% deterministic.
//!
//! ## Module Structure
//!
//! - `input`: Paddle intents
//! - `state`: Match state, sides, invariants
//! - `tick`: Authoritative simulation step
//! - `events`: Game events forwarded to clients

pub mod input;
pub mod state;
pub mod tick;
pub mod events;

// Re-export key types
pub use input::PaddleDirection;
pub use state::{PongState, PlayerId, Side, MatchPhase, InvariantViolation};
pub use tick::{tick, GameConfig, TickResult};
pub use events::{GameEvent, GameEventData};

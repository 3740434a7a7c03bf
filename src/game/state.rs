//! Game State Definitions
//!
//! Everything a single Pong match needs between ticks: ball, both paddles,
//! score, serve countdown and the session RNG.

use std::fmt;
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::fixed::{
    Fixed, BALL_RADIUS, COURT_HALF_HEIGHT, PADDLE_HALF_HEIGHT,
    MAX_BALL_SPEED, FIXED_ONE,
};
use crate::core::vec2::FixedVec2;
use crate::core::rng::DeterministicRng;

// =============================================================================
// PLAYER ID
// =============================================================================

/// Numeric player identifier, as stored by the persistence layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u64);

impl PlayerId {
    /// Raw id.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// SIDE
// =============================================================================

/// Which end of the court a player defends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Both sides in slot order.
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    /// Slot index (left = 0).
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }

    /// The other side.
    #[inline]
    pub const fn opponent(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// Sign of the X direction pointing into this side's goal.
    #[inline]
    pub const fn goal_sign(self) -> i32 {
        match self {
            Side::Left => -1,
            Side::Right => 1,
        }
    }
}

// =============================================================================
// MATCH PHASE
// =============================================================================

/// Current phase of the match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPhase {
    /// Ball resting at center, launches when the countdown hits zero.
    Serving {
        ticks_remaining: u32,
        toward: Side,
    },
    /// Ball in play.
    Rally,
    /// Score threshold reached.
    Ended {
        winner: Side,
    },
}

// =============================================================================
// BALL / PADDLE
// =============================================================================

/// The ball. Velocity is in units per second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ball {
    pub position: FixedVec2,
    pub velocity: FixedVec2,
}

impl Ball {
    /// Ball at rest on the center spot.
    pub const fn centered() -> Self {
        Self {
            position: FixedVec2::ZERO,
            velocity: FixedVec2::ZERO,
        }
    }
}

/// A paddle, identified by its side. Only Y moves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paddle {
    pub y: Fixed,
}

/// Largest |y| a paddle center may reach.
#[inline]
pub const fn paddle_travel_limit() -> Fixed {
    COURT_HALF_HEIGHT - PADDLE_HALF_HEIGHT
}

// =============================================================================
// INVARIANTS
// =============================================================================

/// A broken simulation invariant. Ends the session as a fatal termination.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("ball left the court at {0}")]
    BallOutOfCourt(FixedVec2),

    #[error("{side:?} paddle out of bounds at {y}")]
    PaddleOutOfBounds { side: Side, y: Fixed },

    #[error("ball speed {0} exceeds cap")]
    BallTooFast(Fixed),

    #[error("score {score:?} passed win score {win_score}")]
    ScoreOverrun { score: [u32; 2], win_score: u32 },
}

// =============================================================================
// PONG STATE
// =============================================================================

/// Complete match state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PongState {
    /// Ticks simulated so far. The initial broadcast carries tick 0.
    pub tick: u32,

    pub ball: Ball,

    /// Paddles in slot order (left, right).
    pub paddles: [Paddle; 2],

    /// Points in slot order (left, right).
    pub score: [u32; 2],

    pub phase: MatchPhase,

    /// Paddle hits since the last serve.
    pub rally_hits: u32,

    pub rng: DeterministicRng,
}

impl PongState {
    /// Fresh match. The first serve direction comes from the seed.
    pub fn new(seed: u64, serve_delay_ticks: u32) -> Self {
        let mut rng = DeterministicRng::new(seed);
        let toward = if rng.next_bool() { Side::Left } else { Side::Right };

        Self {
            tick: 0,
            ball: Ball::centered(),
            paddles: [Paddle::default(); 2],
            score: [0, 0],
            phase: MatchPhase::Serving {
                ticks_remaining: serve_delay_ticks,
                toward,
            },
            rally_hits: 0,
            rng,
        }
    }

    #[inline]
    pub fn paddle(&self, side: Side) -> &Paddle {
        &self.paddles[side.index()]
    }

    #[inline]
    pub fn score_of(&self, side: Side) -> u32 {
        self.score[side.index()]
    }

    /// Side with more points, if any.
    pub fn leader(&self) -> Option<Side> {
        match self.score[0].cmp(&self.score[1]) {
            std::cmp::Ordering::Greater => Some(Side::Left),
            std::cmp::Ordering::Less => Some(Side::Right),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Winner if the match has ended.
    pub fn winner(&self) -> Option<Side> {
        match self.phase {
            MatchPhase::Ended { winner } => Some(winner),
            _ => None,
        }
    }

    #[inline]
    pub fn is_ended(&self) -> bool {
        matches!(self.phase, MatchPhase::Ended { .. })
    }

    /// Reset the ball to center and start the serve countdown.
    pub fn reset_for_serve(&mut self, toward: Side, serve_delay_ticks: u32) {
        self.ball = Ball::centered();
        self.rally_hits = 0;
        self.phase = MatchPhase::Serving {
            ticks_remaining: serve_delay_ticks,
            toward,
        };
    }

    /// Check the invariants that must hold after every tick.
    pub fn check_invariants(&self, win_score: u32) -> Result<(), InvariantViolation> {
        // Goals reset the ball, so anything past a goal line by more
        // than the radius is a bug
        if !self.ball.position.is_in_court(BALL_RADIUS + FIXED_ONE) {
            return Err(InvariantViolation::BallOutOfCourt(self.ball.position));
        }

        let limit = paddle_travel_limit();
        for side in Side::BOTH {
            let y = self.paddle(side).y;
            if y < -limit || y > limit {
                return Err(InvariantViolation::PaddleOutOfBounds { side, y });
            }
        }

        let vx = self.ball.velocity.x.abs();
        if vx > MAX_BALL_SPEED {
            return Err(InvariantViolation::BallTooFast(vx));
        }

        if self.score.iter().any(|s| *s > win_score) {
            return Err(InvariantViolation::ScoreOverrun {
                score: self.score,
                win_score,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixed::COURT_HALF_WIDTH;

    #[test]
    fn test_new_state() {
        let state = PongState::new(42, 60);
        assert_eq!(state.tick, 0);
        assert_eq!(state.score, [0, 0]);
        assert_eq!(state.ball, Ball::centered());
        assert!(matches!(state.phase, MatchPhase::Serving { ticks_remaining: 60, .. }));
        assert!(state.check_invariants(5).is_ok());
    }

    #[test]
    fn test_same_seed_same_serve() {
        let a = PongState::new(7, 10);
        let b = PongState::new(7, 10);
        assert_eq!(a.phase, b.phase);
    }

    #[test]
    fn test_leader() {
        let mut state = PongState::new(1, 0);
        assert_eq!(state.leader(), None);
        state.score = [2, 1];
        assert_eq!(state.leader(), Some(Side::Left));
        state.score = [2, 4];
        assert_eq!(state.leader(), Some(Side::Right));
    }

    #[test]
    fn test_side_helpers() {
        assert_eq!(Side::Left.opponent(), Side::Right);
        assert_eq!(Side::Right.index(), 1);
        assert_eq!(Side::Left.goal_sign(), -1);
    }

    #[test]
    fn test_invariant_paddle_out_of_bounds() {
        let mut state = PongState::new(1, 0);
        state.paddles[1].y = COURT_HALF_HEIGHT;
        assert!(matches!(
            state.check_invariants(5),
            Err(InvariantViolation::PaddleOutOfBounds { side: Side::Right, .. })
        ));
    }

    #[test]
    fn test_invariant_score_overrun() {
        let mut state = PongState::new(1, 0);
        state.score = [6, 0];
        assert!(matches!(
            state.check_invariants(5),
            Err(InvariantViolation::ScoreOverrun { .. })
        ));
    }

    #[test]
    fn test_invariant_ball_out_of_court() {
        let mut state = PongState::new(1, 0);
        state.ball.position = FixedVec2::new(COURT_HALF_WIDTH * 2, 0);
        assert!(state.check_invariants(5).is_err());
    }
}

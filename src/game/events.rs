//! Game Events
//!
//! Events generated during simulation. The session driver forwards them to
//! clients alongside the state update of the tick that produced them.

use serde::{Serialize, Deserialize};

use crate::core::vec2::FixedVec2;
use crate::game::state::Side;

/// Game event data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GameEventData {
    /// Ball left the center spot.
    BallServed {
        toward: Side,
        velocity: FixedVec2,
    },

    /// Ball bounced off a paddle face.
    PaddleHit {
        side: Side,
        rally_hits: u32,
    },

    /// Ball bounced off the top or bottom wall.
    WallBounce,

    /// Ball crossed a goal line.
    PointScored {
        scorer: Side,
        score: [u32; 2],
    },

    /// Score threshold reached.
    MatchWon {
        winner: Side,
        score: [u32; 2],
    },
}

/// A game event with the tick it happened on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEvent {
    /// Tick when event occurred
    pub tick: u32,

    /// Event data
    #[serde(flatten)]
    pub data: GameEventData,
}

impl GameEvent {
    /// Create a new event.
    pub fn new(tick: u32, data: GameEventData) -> Self {
        Self { tick, data }
    }

    /// Create ball served event.
    pub fn ball_served(tick: u32, toward: Side, velocity: FixedVec2) -> Self {
        Self::new(tick, GameEventData::BallServed { toward, velocity })
    }

    /// Create paddle hit event.
    pub fn paddle_hit(tick: u32, side: Side, rally_hits: u32) -> Self {
        Self::new(tick, GameEventData::PaddleHit { side, rally_hits })
    }

    /// Create point scored event.
    pub fn point_scored(tick: u32, scorer: Side, score: [u32; 2]) -> Self {
        Self::new(tick, GameEventData::PointScored { scorer, score })
    }

    /// Create match won event.
    pub fn match_won(tick: u32, winner: Side, score: [u32; 2]) -> Self {
        Self::new(tick, GameEventData::MatchWon { winner, score })
    }

    /// Whether this event changed the score.
    pub fn is_score_change(&self) -> bool {
        matches!(
            self.data,
            GameEventData::PointScored { .. } | GameEventData::MatchWon { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = GameEvent::point_scored(42, Side::Left, [1, 0]);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["tick"], 42);
        assert_eq!(json["event"], "point_scored");
        assert_eq!(json["scorer"], "left");
    }

    #[test]
    fn test_score_change() {
        assert!(GameEvent::match_won(1, Side::Right, [2, 5]).is_score_change());
        assert!(!GameEvent::paddle_hit(1, Side::Right, 3).is_score_change());
        assert!(!GameEvent::new(1, GameEventData::WallBounce).is_score_change());
    }
}

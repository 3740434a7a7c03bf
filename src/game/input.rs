//! Paddle Input
//!
//! A player's input is an intent: move the paddle up, down, or hold still.
//! The intent stays in effect until the next input replaces it.

use serde::{Serialize, Deserialize};

use crate::core::fixed::Fixed;

/// Paddle movement intent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddleDirection {
    /// Move towards +Y.
    Up,
    /// Move towards -Y.
    Down,
    /// Hold position.
    #[default]
    Stop,
}

impl PaddleDirection {
    /// Sign of the movement along Y.
    #[inline]
    pub fn sign(self) -> i32 {
        match self {
            PaddleDirection::Up => 1,
            PaddleDirection::Down => -1,
            PaddleDirection::Stop => 0,
        }
    }

    /// Signed displacement for a per-tick step.
    #[inline]
    pub fn displacement(self, step: Fixed) -> Fixed {
        step.wrapping_mul(self.sign())
    }

    /// Direction that moves a paddle at `from` towards `target`,
    /// holding still inside `dead_zone`.
    pub fn toward(from: Fixed, target: Fixed, dead_zone: Fixed) -> Self {
        let delta = target.wrapping_sub(from);
        if delta > dead_zone {
            PaddleDirection::Up
        } else if delta < -dead_zone {
            PaddleDirection::Down
        } else {
            PaddleDirection::Stop
        }
    }
}

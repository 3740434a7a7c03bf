//! Fixed-Point 2D Vector
//!
//! Ball position and velocity, in Q16.16 court units.

use std::fmt;
use std::ops::{Add, Sub};
use serde::{Serialize, Deserialize};

use super::fixed::{Fixed, to_float, COURT_HALF_WIDTH, COURT_HALF_HEIGHT};

/// 2D vector with fixed-point components.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FixedVec2 {
    pub x: Fixed,
    pub y: Fixed,
}

impl FixedVec2 {
    pub const ZERO: Self = Self { x: 0, y: 0 };

    #[inline]
    pub const fn new(x: Fixed, y: Fixed) -> Self {
        Self { x, y }
    }

    /// Whether the point lies inside the court, widened by `margin` on every edge.
    #[inline]
    pub fn is_in_court(self, margin: Fixed) -> bool {
        let hw = COURT_HALF_WIDTH.saturating_add(margin);
        let hh = COURT_HALF_HEIGHT.saturating_add(margin);
        (-hw..=hw).contains(&self.x) && (-hh..=hh).contains(&self.y)
    }

    /// Raw `[x, y]` as sent in state updates.
    #[inline]
    pub fn to_array(self) -> [i32; 2] {
        [self.x, self.y]
    }
}

impl Add for FixedVec2 {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x.wrapping_add(rhs.x), self.y.wrapping_add(rhs.y))
    }
}

impl Sub for FixedVec2 {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x.wrapping_sub(rhs.x), self.y.wrapping_sub(rhs.y))
    }
}

impl fmt::Debug for FixedVec2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vec2({:.3}, {:.3})", to_float(self.x), to_float(self.y))
    }
}

impl fmt::Display for FixedVec2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3})", to_float(self.x), to_float(self.y))
    }
}

//! Q16.16 Fixed-Point Arithmetic
//!
//! Deterministic fixed-point math for the Pong simulation.
//! All gameplay operations use integer arithmetic only.
//!
//! ## Format: Q16.16
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Bit Layout: Q16.16 (32-bit signed integer)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  [S][IIIIIIIIIIIIIIII][FFFFFFFFFFFFFFFF]                    │
//! │   │  └──── 16 bits ────┘└──── 16 bits ────┘                 │
//! │   └─ Sign bit                                               │
//! │                                                             │
//! │  Range: -32768.0 to +32767.99998 (approx)                   │
//! │  Precision: 1/65536 ≈ 0.000015 units                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both clients of a session receive the same integer positions, so the
//! court looks identical in every browser regardless of float rounding.

/// Q16.16 fixed-point number stored as i32.
pub type Fixed = i32;

/// Number of fractional bits (16)
pub const FIXED_SCALE: i32 = 16;

/// 1.0 in fixed-point (65536)
pub const FIXED_ONE: Fixed = 1 << FIXED_SCALE;

/// 0.5 in fixed-point (32768)
pub const FIXED_HALF: Fixed = FIXED_ONE >> 1;

// =============================================================================
// COURT CONSTANTS (integer literals, no float conversion at runtime)
// =============================================================================

/// Court half-width: 50.0 = 50 * 65536
pub const COURT_HALF_WIDTH: Fixed = 3276800;

/// Court half-height: 30.0 = 30 * 65536
pub const COURT_HALF_HEIGHT: Fixed = 1966080;

/// Paddle face distance from center: 46.0
pub const PADDLE_X: Fixed = 3014656;

/// Paddle half-height: 5.0
pub const PADDLE_HALF_HEIGHT: Fixed = 327680;

/// Paddle thickness: 1.0
pub const PADDLE_DEPTH: Fixed = 65536;

/// Paddle speed: 60.0 units/sec
pub const PADDLE_SPEED: Fixed = 3932160;

/// Ball radius: 1.0
pub const BALL_RADIUS: Fixed = 65536;

/// Serve speed: 30.0 units/sec
pub const SERVE_SPEED: Fixed = 1966080;

/// Ball speed cap: 70.0 units/sec
pub const MAX_BALL_SPEED: Fixed = 4587520;

/// Horizontal speed-up per paddle hit: 1.05x
pub const HIT_SPEEDUP: Fixed = 68812;

/// Vertical speed cap as a fraction of horizontal speed: 0.5x
pub const MAX_VERTICAL_RATIO: Fixed = FIXED_HALF;

// =============================================================================
// CORE OPERATIONS
// =============================================================================

/// Convert a compile-time float to fixed-point.
///
/// # Warning
/// Only use at compile-time or initialization. NEVER in tick loop.
///
/// # Example
/// ```
/// use gris_pong::core::fixed::{to_fixed, FIXED_ONE};
/// const MY_VALUE: i32 = to_fixed(2.5);
/// assert_eq!(MY_VALUE, FIXED_ONE * 2 + FIXED_ONE / 2);
/// ```
#[inline]
pub const fn to_fixed(f: f64) -> Fixed {
    (f * (FIXED_ONE as f64)) as Fixed
}

/// Convert fixed-point to float for display.
#[inline]
pub fn to_float(f: Fixed) -> f32 {
    f as f32 / FIXED_ONE as f32
}

/// Convert an integer to fixed-point.
#[inline]
pub const fn from_int(i: i32) -> Fixed {
    i << FIXED_SCALE
}

/// Multiply two fixed-point numbers.
///
/// Uses i64 intermediate to prevent overflow, then truncates.
#[inline]
pub fn fixed_mul(a: Fixed, b: Fixed) -> Fixed {
    let wide = (a as i64) * (b as i64);
    (wide >> FIXED_SCALE) as Fixed
}

/// Divide two fixed-point numbers.
///
/// Returns 0 on divide-by-zero instead of panicking.
#[inline]
pub fn fixed_div(a: Fixed, b: Fixed) -> Fixed {
    if b == 0 {
        return 0;
    }
    let wide = (a as i64) << FIXED_SCALE;
    (wide / b as i64) as Fixed
}

/// Absolute value of a fixed-point number.
#[inline]
pub fn fixed_abs(x: Fixed) -> Fixed {
    if x < 0 { x.wrapping_neg() } else { x }
}

/// Clamp a fixed-point number to a range.
#[inline]
pub fn fixed_clamp(value: Fixed, min: Fixed, max: Fixed) -> Fixed {
    value.max(min).min(max)
}

/// Distance covered in one tick at `speed` units/sec for the given tick rate.
#[inline]
pub fn per_tick(speed: Fixed, tick_rate: u32) -> Fixed {
    if tick_rate == 0 {
        return 0;
    }
    speed / tick_rate as Fixed
}

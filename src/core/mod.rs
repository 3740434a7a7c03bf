//! Core deterministic primitives.
//!
//! Fixed-point numbers, vectors and the seeded RNG the Pong simulation is
//! built on.

pub mod fixed;
pub mod vec2;
pub mod rng;

// Re-export core types
pub use fixed::{Fixed, FIXED_ONE, FIXED_HALF, FIXED_SCALE};
pub use vec2::FixedVec2;
pub use rng::DeterministicRng;

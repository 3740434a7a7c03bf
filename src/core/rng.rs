//! Deterministic Random Number Generator
//!
//! Xorshift128+ seeded per session. Serve angles and serve sides come from
//! here, so a session replays identically from its seed and inputs.

use serde::{Serialize, Deserialize};
use sha2::{Sha256, Digest};

use super::fixed::Fixed;

/// Deterministic PRNG using Xorshift128+ algorithm.
///
/// # Example
///
/// ```
/// use gris_pong::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(12345);
/// let mut b = DeterministicRng::new(12345);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Seed the generator. The two state words are expanded from `seed`
    /// with SplitMix64.
    pub fn new(seed: u64) -> Self {
        let mut cursor = seed;
        match [splitmix64(&mut cursor), splitmix64(&mut cursor)] {
            [0, 0] => Self { state: [1, 1] },
            state => Self { state },
        }
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let [a, b] = self.state;
        let out = a.wrapping_add(b);
        let mixed = a ^ b;
        self.state = [a.rotate_left(24) ^ mixed ^ (mixed << 16), mixed.rotate_left(37)];
        out
    }

    /// Uniform value in `[0, max)`; zero when `max` is not positive.
    #[inline]
    pub fn next_fixed(&mut self, max: Fixed) -> Fixed {
        if max <= 0 {
            return 0;
        }
        let high = self.next_u64() >> 32;
        ((high as i64 * max as i64) >> 32) as Fixed
    }

    /// Uniform value in `[min, max)`. Serve angles are drawn from here.
    #[inline]
    pub fn next_fixed_range(&mut self, min: Fixed, max: Fixed) -> Fixed {
        if min >= max {
            return min;
        }
        min.wrapping_add(self.next_fixed(max.wrapping_sub(min)))
    }

    /// Fair coin flip.
    #[inline]
    pub fn next_bool(&mut self) -> bool {
        self.next_u64() >> 63 == 1
    }
}

/// SplitMix64 for seed initialization.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive a session seed from the session id and both player ids.
///
/// Player ids are hashed in slot order (left, right).
pub fn derive_session_seed(session_id: &[u8; 16], player_ids: &[u64]) -> u64 {
    let mut hasher = Sha256::new();

    hasher.update(b"GRIS_PONG_SEED_V1");
    hasher.update(session_id);
    for pid in player_ids {
        hasher.update(pid.to_le_bytes());
    }

    let hash = hasher.finalize();

    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(seed)
}

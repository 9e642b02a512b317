//! Pseudorandom number generation.
//!
//! A small splitmix64 generator behind a spin lock. Not cryptographic;
//! callers are PID assignment and TLB victim selection, which only need
//! cheap, well-spread draws.

use spin::Mutex;

/// Shared pseudorandom source.
pub struct Rand {
    state: Mutex<u64>,
}

impl Rand {
    pub const fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(seed),
        }
    }

    /// Next 64-bit value (splitmix64 step).
    pub fn next_u64(&self) -> u64 {
        let mut state = self.state.lock();
        *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = *state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform-ish draw in `[0, n)`. Modulo bias is irrelevant at the
    /// ranges the kernel uses (PID space, TLB slots).
    pub fn below(&self, n: u64) -> u64 {
        assert!(n > 0);
        self.next_u64() % n
    }
}

// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Entropy Pool
//!
//! A process-wide pseudo random generator used to seed per-aspace ASLR
//! generators. Boot code seeds it once with hardware entropy through
//! [`init`]; if nothing seeds it, the first use falls back to a fixed seed.

use ::rand::rngs::SmallRng;
use ::rand::{RngCore, SeedableRng};
use spin::{Mutex, Once};

/// Seed used when the pool is read before [`init`] ran
const FALLBACK_SEED: u64 = 0x5275_7374_7578_564d;

static POOL: Once<Mutex<SmallRng>> = Once::new();

fn pool() -> &'static Mutex<SmallRng> {
    POOL.call_once(|| Mutex::new(SmallRng::seed_from_u64(FALLBACK_SEED)))
}

/// Seed the entropy pool
///
/// Returns `false` if the pool was already seeded (or already used), in
/// which case the seed is ignored.
pub fn init(seed: u64) -> bool {
    let mut seeded = false;
    POOL.call_once(|| {
        seeded = true;
        Mutex::new(SmallRng::seed_from_u64(seed))
    });
    seeded
}

/// Get a random u64 value
pub fn get_random_u64() -> u64 {
    pool().lock().next_u64()
}

/// Get a random u32 value
pub fn get_random_u32() -> u32 {
    pool().lock().next_u32()
}

/// Create a generator for a new consumer, seeded from the pool
pub fn fork_rng() -> SmallRng {
    SmallRng::seed_from_u64(get_random_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_produces_values() {
        let a = get_random_u64();
        let b = get_random_u64();
        assert_ne!(a, b);
    }

    #[test]
    fn test_forked_generators_diverge() {
        let mut a = fork_rng();
        let mut b = fork_rng();
        assert_ne!(a.next_u64(), b.next_u64());
    }
}

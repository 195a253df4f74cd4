//! Per-Agent Seeds
//!
//! Every agent evaluation gets a generator seeded only from simulation
//! coordinates: the agent's stable identity hash, the step's lower bound,
//! the round within the step and the sample number. Thread count, scheduling
//! and node placement never enter the seed, so parallel runs reproduce
//! sequential ones.

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use sim_types::{Identity, TimeInterval, TimePoint};

/// Deterministic random source handed to `act` and message handlers.
pub struct Seed {
    words: [u64; 4],
    rng: SmallRng,
}

impl Seed {
    pub fn new(identity_hash: u64, lower: TimePoint, round: u64, sample: u64) -> Self {
        let words = [identity_hash, lower, round, sample];
        Self {
            words,
            rng: SmallRng::seed_from_u64(mix(&words)),
        }
    }

    /// Seed for `identity` in `round` of the step covering `interval`.
    pub fn for_agent(identity: &Identity, interval: TimeInterval, round: u64, sample: u64) -> Self {
        Self::new(identity.stable_hash(), interval.lower, round, sample)
    }

    /// The four inputs the generator was seeded from.
    pub fn words(&self) -> [u64; 4] {
        self.words
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }
}

impl RngCore for Seed {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

// splitmix64 over the words
fn mix(words: &[u64; 4]) -> u64 {
    let mut state: u64 = 0x9e37_79b9_7f4a_7c15;
    for word in words {
        state ^= *word;
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        state = z ^ (z >> 31);
    }
    state
}

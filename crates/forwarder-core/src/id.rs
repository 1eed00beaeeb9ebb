//! Request-id generation.
//!
//! Request ids are plain random `u64`s rather than a shared monotonic
//! counter, so that generating one never requires contending on a
//! forwarder-wide atomic from every listener task. Collisions against the
//! live pending table are handled by resampling, not by reserving bits of
//! the id for a listener or shard index.

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Draws random `u64` request ids from a private, non-cryptographic RNG.
///
/// One instance is owned by each forwarder; it is not `Sync` and is not
/// meant to be shared across tasks.
pub struct RequestIdGenerator {
	rng: SmallRng,
}

impl RequestIdGenerator {
	pub fn new() -> Self {
		Self {
			rng: SmallRng::from_os_rng(),
		}
	}

	/// Draws ids until `is_taken` reports one unused. With 64 bits of
	/// entropy and a pending table that stays small relative to 2^64, this
	/// is expected to resample zero or one extra times.
	pub fn generate_unique(&mut self, mut is_taken: impl FnMut(u64) -> bool) -> u64 {
		loop {
			let candidate = self.rng.random::<u64>();
			if !is_taken(candidate) {
				return candidate;
			}
		}
	}
}

impl Default for RequestIdGenerator {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
impl RequestIdGenerator {
	fn from_seed(seed: u64) -> Self {
		Self {
			rng: SmallRng::seed_from_u64(seed),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use super::*;

	#[test]
	fn generated_ids_avoid_the_taken_set() {
		let mut gen = RequestIdGenerator::new();
		let mut taken: HashSet<u64> = HashSet::new();
		for _ in 0..1000 {
			let id = gen.generate_unique(|candidate| taken.contains(&candidate));
			assert!(taken.insert(id), "generator returned a duplicate id");
		}
	}

	#[test]
	fn resamples_past_a_forced_collision() {
		let mut gen = RequestIdGenerator::from_seed(42);
		let first = gen.generate_unique(|_| false);

		let mut calls = 0;
		let second = gen.generate_unique(|candidate| {
			calls += 1;
			candidate == first
		});
		assert_ne!(second, first);
		assert!(calls >= 1);
	}
}

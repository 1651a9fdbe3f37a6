//! Per-party evaluation context.

use rand::{RngCore, SeedableRng};

use crate::RngType;

/// The immutable per-party context handed into every protocol round: our id,
/// the party count and a randomness source. Constructed once per party and
/// passed by reference through the call graph; there are no process-wide
/// registries.
pub struct ResourcePool {
    my_id: usize,
    num_parties: usize,
    rng: RngType,
}

impl ResourcePool {
    /// Create a pool with an entropy-seeded RNG.
    pub fn new(my_id: usize, num_parties: usize) -> Self {
        Self {
            my_id,
            num_parties,
            rng: RngType::from_entropy(),
        }
    }

    /// Create a pool with a deterministic RNG. Only sensible for tests and
    /// reproducible runs.
    pub fn from_seed(my_id: usize, num_parties: usize, seed: u64) -> Self {
        Self {
            my_id,
            num_parties,
            rng: RngType::seed_from_u64(seed),
        }
    }

    /// The id of this party.
    pub fn my_id(&self) -> usize {
        self.my_id
    }

    /// The number of parties in the computation.
    pub fn num_parties(&self) -> usize {
        self.num_parties
    }

    /// The randomness source of this party.
    pub fn rng(&mut self) -> &mut impl RngCore {
        &mut self.rng
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("my_id", &self.my_id)
            .field("num_parties", &self.num_parties)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_pools_are_deterministic() {
        let mut a = ResourcePool::from_seed(1, 3, 42);
        let mut b = ResourcePool::from_seed(1, 3, 42);
        assert_eq!(a.rng().next_u64(), b.rng().next_u64());
        assert_eq!(a.my_id(), 1);
        assert_eq!(a.num_parties(), 3);
    }
}

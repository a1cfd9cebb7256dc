//! Packet correlation tags.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of 32-bit packet tags.
pub trait TagSource: Send {
    fn next_tag(&mut self) -> i32;
}

/// Tags drawn from an entropy-seeded RNG.
pub struct RandomTags(StdRng);

impl RandomTags {
    pub fn new() -> Self {
        Self(StdRng::from_entropy())
    }

    /// Deterministic sequence, for reproducing a session.
    pub fn seeded(seed: u64) -> Self {
        Self(StdRng::seed_from_u64(seed))
    }
}

impl Default for RandomTags {
    fn default() -> Self {
        Self::new()
    }
}

impl TagSource for RandomTags {
    fn next_tag(&mut self) -> i32 {
        self.0.r#gen()
    }
}

impl<F: FnMut() -> i32 + Send> TagSource for F {
    fn next_tag(&mut self) -> i32 {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_tags_repeat() {
        let mut a = RandomTags::seeded(7);
        let mut b = RandomTags::seeded(7);
        let xs: Vec<i32> = (0..4).map(|_| a.next_tag()).collect();
        let ys: Vec<i32> = (0..4).map(|_| b.next_tag()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_closure_tags() {
        let mut n = 0;
        let mut tags = move || {
            n += 1;
            n
        };
        assert_eq!(tags.next_tag(), 1);
        assert_eq!(tags.next_tag(), 2);
    }
}

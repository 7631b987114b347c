use crate::chain::Edge;
use rand::Rng;

/// Draw one edge with probability proportional to its value.
/// Zero-weight edges are never chosen; an empty or all-zero list yields `None`.
pub fn weighted_random<'a, R: Rng + ?Sized>(choices: &'a [Edge], rng: &mut R) -> Option<&'a Edge> {
    let total: u64 = choices.iter().map(|c| c.value).sum();
    if total == 0 {
        return None;
    }
    let mut r = rng.gen_range(0..total);
    for choice in choices {
        if r < choice.value {
            return Some(choice);
        }
        r -= choice.value;
    }
    None
}

/// Single-pass weighted selection over a stream whose length is not known up front.
///
/// Each offered item replaces the current pick with probability `weight / total_so_far`,
/// which leaves every item selected with probability `weight / total`.
pub struct Reservoir<T> {
    picked: Option<T>,
    total: u64,
}

impl<T> Reservoir<T> {
    pub fn new() -> Self {
        Reservoir {
            picked: None,
            total: 0,
        }
    }

    pub fn offer<R: Rng + ?Sized>(&mut self, item: T, weight: u64, rng: &mut R) {
        if weight == 0 {
            return;
        }
        self.total += weight;
        if rng.gen_range(0..self.total) < weight {
            self.picked = Some(item);
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn finish(self) -> Option<T> {
        self.picked
    }
}

impl<T> Default for Reservoir<T> {
    fn default() -> Self {
        Self::new()
    }
}

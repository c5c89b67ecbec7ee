use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{Lane, LaneWeights};

/// Decides the order in which lanes are tried on each dequeue.
///
/// Weighted mode draws a random permutation where each remaining lane is picked with
/// probability proportional to its weight; the broker then pops from the first
/// non-empty lane. With every lane populated, the lane served is therefore the first
/// draw, so service converges to the weight ratio (critical=6 vs low=1 gives 6:1).
///
/// Strict mode always tries lanes by descending weight (priority preemption).
pub struct LaneSelector {
    lanes: Vec<(Lane, u32)>,
    strict: bool,
    rng: Mutex<StdRng>,
}

impl LaneSelector {
    pub fn new(weights: &LaneWeights, strict: bool) -> Self {
        Self::with_rng(weights, strict, StdRng::from_entropy())
    }

    /// Deterministic selector for tests.
    pub fn seeded(weights: &LaneWeights, strict: bool, seed: u64) -> Self {
        Self::with_rng(weights, strict, StdRng::seed_from_u64(seed))
    }

    fn with_rng(weights: &LaneWeights, strict: bool, rng: StdRng) -> Self {
        let mut lanes = weights.served();
        if strict {
            // stable: equal weights keep priority order
            lanes.sort_by(|a, b| b.1.cmp(&a.1));
        }
        Self {
            lanes,
            strict,
            rng: Mutex::new(rng),
        }
    }

    /// Lanes with a positive weight.
    pub fn lanes(&self) -> Vec<Lane> {
        self.lanes.iter().map(|&(lane, _)| lane).collect()
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Lane order for the next dequeue.
    pub fn order(&self) -> Vec<Lane> {
        if self.strict || self.lanes.len() < 2 {
            return self.lanes();
        }

        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let mut remaining = self.lanes.clone();
        let mut order = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let total: u64 = remaining.iter().map(|&(_, w)| u64::from(w)).sum();
            let mut pick = rng.gen_range(0..total);
            let index = remaining
                .iter()
                .position(|&(_, w)| {
                    if pick < u64::from(w) {
                        true
                    } else {
                        pick -= u64::from(w);
                        false
                    }
                })
                .unwrap_or(remaining.len() - 1);
            order.push(remaining.remove(index).0);
        }
        order
    }
}

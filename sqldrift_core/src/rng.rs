use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::Serialize;

/// One recorded random decision: what it was for, and the value it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Draw {
    pub label: &'static str,
    pub value: u64,
}

/// Deterministic random source threaded through every stochastic decision of a trial.
///
/// A context is identified by `(seed, stream)`: the run seed and the trial index.
/// Two contexts built from the same pair produce the same draws in the same order,
/// which is what makes a trial replayable. Every draw is appended to a trail that
/// ends up in the candidate's provenance.
#[derive(Debug, Clone)]
pub struct RngContext {
    seed: u64,
    stream: u64,
    rng: ChaCha8Rng,
    trail: Vec<Draw>,
}

impl RngContext {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        rng.set_stream(stream);
        Self {
            seed,
            stream,
            rng,
            trail: Vec::new(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn stream(&self) -> u64 {
        self.stream
    }

    fn record(&mut self, label: &'static str, value: u64) {
        self.trail.push(Draw { label, value });
    }

    /// Uniform index in `0..bound`. A zero bound yields 0 without consuming randomness.
    pub fn below(&mut self, label: &'static str, bound: usize) -> usize {
        if bound <= 1 {
            self.record(label, 0);
            return 0;
        }
        let value = self.rng.random_range(0..bound);
        self.record(label, value as u64);
        value
    }

    pub fn range_inclusive(&mut self, label: &'static str, low: i64, high: i64) -> i64 {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        let value = self.rng.random_range(low..=high);
        self.record(label, value as u64);
        value
    }

    /// Bernoulli draw. Probabilities outside `[0, 1]` are clamped, NaN counts as 0.
    pub fn chance(&mut self, label: &'static str, probability: f64) -> bool {
        let p = if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        };
        let value = self.rng.random_bool(p);
        self.record(label, u64::from(value));
        value
    }

    pub fn unit(&mut self, label: &'static str) -> f64 {
        let value: f64 = self.rng.random();
        self.record(label, value.to_bits());
        value
    }

    pub fn choose<'a, T>(&mut self, label: &'static str, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        let index = self.below(label, items.len());
        items.get(index)
    }

    /// Picks an index with probability proportional to its weight.
    ///
    /// Non-finite and negative weights count as zero. Returns `None` when no
    /// weight is positive.
    pub fn weighted(&mut self, label: &'static str, weights: &[f64]) -> Option<usize> {
        let usable = |w: f64| if w.is_finite() && w > 0.0 { w } else { 0.0 };
        let total: f64 = weights.iter().copied().map(usable).sum();
        if total <= 0.0 {
            return None;
        }
        let target = self.rng.random::<f64>() * total;
        let mut acc = 0.0;
        let mut chosen = None;
        for (index, weight) in weights.iter().copied().map(usable).enumerate() {
            if weight == 0.0 {
                continue;
            }
            chosen = Some(index);
            acc += weight;
            if target < acc {
                break;
            }
        }
        if let Some(index) = chosen {
            self.record(label, index as u64);
        }
        chosen
    }

    pub fn trail(&self) -> &[Draw] {
        &self.trail
    }

    pub fn take_trail(&mut self) -> Vec<Draw> {
        std::mem::take(&mut self.trail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(ctx: &mut RngContext) -> Vec<u64> {
        let mut out = Vec::new();
        out.push(ctx.below("a", 17) as u64);
        out.push(ctx.range_inclusive("b", -5, 5) as u64);
        out.push(u64::from(ctx.chance("c", 0.5)));
        out.push(ctx.weighted("d", &[1.0, 0.0, 3.0]).unwrap_or(99) as u64);
        out.push(ctx.unit("e").to_bits());
        out
    }

    #[test]
    fn same_seed_and_stream_replay_exactly() {
        let mut first = RngContext::new(1, 7);
        let mut second = RngContext::new(1, 7);
        assert_eq!(exercise(&mut first), exercise(&mut second));
        assert_eq!(first.trail(), second.trail());
        assert_eq!(first.trail().len(), 5);
    }

    #[test]
    fn different_streams_diverge() {
        let mut first = RngContext::new(1, 1);
        let mut second = RngContext::new(1, 2);
        let a: Vec<u64> = (0..16).map(|_| first.below("x", 1 << 20) as u64).collect();
        let b: Vec<u64> = (0..16).map(|_| second.below("x", 1 << 20) as u64).collect();
        assert_ne!(a, b);
    }

    #[test]
    fn weighted_never_picks_zero_weight() {
        let mut ctx = RngContext::new(3, 0);
        for _ in 0..200 {
            let picked = ctx.weighted("w", &[0.0, 2.0, 0.0, f64::NAN, 1.0]);
            assert!(matches!(picked, Some(1) | Some(4)), "picked {picked:?}");
        }
        assert_eq!(ctx.weighted("w", &[0.0, -1.0]), None);
    }

    #[test]
    fn chance_clamps_out_of_range_probabilities() {
        let mut ctx = RngContext::new(9, 0);
        assert!(ctx.chance("p", 4.0));
        assert!(!ctx.chance("p", -1.0));
        assert!(!ctx.chance("p", f64::NAN));
    }

    #[test]
    fn choose_on_empty_slice_is_none() {
        let mut ctx = RngContext::new(0, 0);
        let empty: [u8; 0] = [];
        assert!(ctx.choose("c", &empty).is_none());
        assert_eq!(ctx.choose("c", &[42]), Some(&42));
    }
}

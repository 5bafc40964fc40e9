use crate::corpus::{Corpus, CorpusError};
use crate::rng::RngContext;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during scheduler operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Indicates that the corpus is empty, and therefore no parent can be scheduled.
    #[error("Corpus is empty, cannot schedule a parent")]
    CorpusEmpty,
    /// Wraps an error originating from the corpus encountered during selection.
    #[error("Corpus interaction failed within scheduler: {0}")]
    CorpusInteractionError(#[from] CorpusError),
}

/// How the next candidate of a trial is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Mutate,
    Generate,
}

/// Draws the strategy for one trial.
///
/// Mutation needs a parent, so an empty corpus always means generation. The
/// coin is drawn either way so the draw trail has the same shape regardless of
/// corpus contents.
pub fn choose_strategy(
    corpus: &Corpus,
    mutation_probability: f64,
    rng: &mut RngContext,
) -> Strategy {
    let mutate = rng.chance("strategy", mutation_probability);
    if mutate && !corpus.is_empty() {
        Strategy::Mutate
    } else {
        Strategy::Generate
    }
}

/// Which parent-selection policy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParentSelection {
    Uniform,
    #[default]
    Rarity,
}

/// A `Scheduler` selects the corpus entry to mutate next.
///
/// Schedulers are shared by concurrent trials and read the corpus through a
/// possibly stale snapshot, so they take `&self` and keep no mutable state;
/// whatever feedback they use is kept by the corpus itself.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Selects and returns the index of the next parent in the corpus.
    ///
    /// # Arguments
    /// * `corpus`: The corpus to select from.
    /// * `rng`: The trial's random context; the selection is recorded in its trail.
    ///
    /// # Returns
    /// The index (equal to the sequence id) of the selected entry, or a
    /// `SchedulerError` if the corpus is empty.
    fn next(&self, corpus: &Corpus, rng: &mut RngContext) -> Result<usize, SchedulerError>;
}

/// Selects parents uniformly at random, ignoring feedback.
#[derive(Default, Debug, Clone, Copy)]
pub struct RandomScheduler;

impl RandomScheduler {
    pub fn new() -> Self {
        RandomScheduler
    }
}

impl Scheduler for RandomScheduler {
    fn name(&self) -> &'static str {
        "uniform"
    }

    fn next(&self, corpus: &Corpus, rng: &mut RngContext) -> Result<usize, SchedulerError> {
        if corpus.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        Ok(rng.below("parent", corpus.len()))
    }
}

/// Favors entries covering units that are still rare across observed executions.
///
/// Each entry gets energy `1 / hits^exponent`, where `hits` is the hit count of
/// the rarest unit in its signature. With path granularity and a large exponent
/// this is the exponential power schedule of AFLFast: entries on frequently
/// exercised paths fade quickly, entries on rare paths keep being picked.
#[derive(Debug, Clone, Copy)]
pub struct RarityScheduler {
    exponent: f64,
}

impl RarityScheduler {
    pub fn new(exponent: f64) -> Self {
        Self { exponent }
    }

    /// Selection energy of the entry at `index`.
    pub fn energy(&self, corpus: &Corpus, index: usize) -> Result<f64, SchedulerError> {
        let hits = corpus.rarest_hits(index)? as f64;
        Ok(1.0 / hits.powf(self.exponent))
    }
}

impl Scheduler for RarityScheduler {
    fn name(&self) -> &'static str {
        "rarity"
    }

    fn next(&self, corpus: &Corpus, rng: &mut RngContext) -> Result<usize, SchedulerError> {
        if corpus.is_empty() {
            return Err(SchedulerError::CorpusEmpty);
        }
        let weights = (0..corpus.len())
            .map(|i| self.energy(corpus, i))
            .collect::<Result<Vec<f64>, _>>()?;
        // Energies can underflow to zero for very popular entries; fall back
        // to a uniform pick rather than failing the trial.
        match rng.weighted("parent", &weights) {
            Some(index) => Ok(index),
            None => Ok(rng.below("parent", corpus.len())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::CoverageSignature;
    use crate::input::Candidate;
    use std::sync::Arc;

    fn corpus_with(signatures: &[&[&str]]) -> Corpus {
        let mut corpus = Corpus::new();
        for (i, units) in signatures.iter().enumerate() {
            let mut ctx = RngContext::new(0, 0);
            let candidate = Arc::new(Candidate::seed(format!("SELECT {i}"), 0, &mut ctx));
            corpus.admit(candidate, CoverageSignature::from_units(units.iter().copied()));
        }
        corpus
    }

    #[test]
    fn schedulers_reject_empty_corpus() {
        let corpus = Corpus::new();
        let mut rng = RngContext::new(0, 0);
        assert_eq!(
            RandomScheduler::new().next(&corpus, &mut rng),
            Err(SchedulerError::CorpusEmpty)
        );
        assert_eq!(
            RarityScheduler::new(1.0).next(&corpus, &mut rng),
            Err(SchedulerError::CorpusEmpty)
        );
    }

    #[test]
    fn empty_corpus_forces_generation() {
        let corpus = Corpus::new();
        let mut rng = RngContext::new(5, 0);
        for _ in 0..20 {
            assert_eq!(choose_strategy(&corpus, 1.0, &mut rng), Strategy::Generate);
        }
    }

    #[test]
    fn strategy_follows_probability_extremes() {
        let corpus = corpus_with(&[&["a"]]);
        let mut rng = RngContext::new(5, 0);
        assert_eq!(choose_strategy(&corpus, 1.0, &mut rng), Strategy::Mutate);
        assert_eq!(choose_strategy(&corpus, 0.0, &mut rng), Strategy::Generate);
    }

    #[test]
    fn rarity_prefers_entries_with_rare_units() {
        // Entry 0 covers a unit seen many times; entry 1 covers a unit seen once.
        let mut corpus = corpus_with(&[&["common"], &["rare"]]);
        let mut ctx = RngContext::new(0, 0);
        for i in 0..20 {
            let candidate = Arc::new(Candidate::seed(format!("SELECT {i}"), 0, &mut ctx));
            corpus.admit(candidate, CoverageSignature::from_units(["common"]));
        }
        let scheduler = RarityScheduler::new(2.0);
        let rare = scheduler.energy(&corpus, 1).expect("energy");
        let common = scheduler.energy(&corpus, 0).expect("energy");
        assert!(rare > common);

        let mut rng = RngContext::new(42, 0);
        let picks_rare = (0..200)
            .filter(|_| scheduler.next(&corpus, &mut rng) == Ok(1))
            .count();
        assert!(picks_rare > 150, "rare entry picked only {picks_rare} times");
    }

    #[test]
    fn uniform_selection_stays_in_bounds() {
        let corpus = corpus_with(&[&["a"], &["b"], &["c"]]);
        let mut rng = RngContext::new(1, 0);
        for _ in 0..100 {
            let index = RandomScheduler::new().next(&corpus, &mut rng).expect("next");
            assert!(index < 3);
        }
    }
}

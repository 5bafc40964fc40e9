use crate::feedback::CoverageSignature;
use crate::input::Candidate;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Defines errors that can arise during corpus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorpusError {
    /// The requested entry index was not found within the corpus.
    #[error("Entry index {0} not found in corpus")]
    EntryNotFound(usize),

    /// An operation could not be performed because the corpus is empty.
    #[error("Corpus is empty, cannot select an entry")]
    CorpusIsEmpty,
}

/// A candidate that earned its place in the corpus.
#[derive(Debug, Clone)]
pub struct CorpusEntry {
    /// Monotonically increasing sequence id, starting at 0.
    pub id: u64,
    pub candidate: Arc<Candidate>,
    /// The signature that justified admission.
    pub signature: CoverageSignature,
}

/// The evolving population of interesting candidates and the coverage they represent.
///
/// The corpus owns three pieces of cumulative state:
/// * the coverage **frontier**, the union of the signatures of every admitted
///   entry. It only ever grows and it alone decides admission.
/// * the **grammar frontier**, the union of grammar rules seen in executed
///   candidates. It never gates admission; the generator reads it to steer
///   toward unexercised rules.
/// * per-unit **hit counts** over every observed execution, which the rarity
///   scheduler turns into selection energy.
///
/// Entries are never evicted.
#[derive(Debug, Default)]
pub struct Corpus {
    entries: Vec<CorpusEntry>,
    frontier: HashSet<String>,
    grammar_frontier: BTreeSet<&'static str>,
    unit_hits: HashMap<String, u64>,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers a candidate for admission.
    ///
    /// Computes `novel = signature \ frontier`. When `novel` is non-empty it is
    /// unioned into the frontier and a new entry is appended. Whether or not the
    /// candidate is admitted, its units count toward hit frequencies and its
    /// grammar rules join the grammar frontier.
    ///
    /// # Arguments
    /// * `candidate`: The candidate that produced `signature`.
    /// * `signature`: Coverage of the primary engine's execution of `candidate`.
    ///
    /// # Returns
    /// `true` if the candidate was admitted, `false` if it was discarded as not novel.
    pub fn admit(&mut self, candidate: Arc<Candidate>, signature: CoverageSignature) -> bool {
        self.observe(&signature);
        let novel: Vec<String> = signature
            .units()
            .iter()
            .filter(|u| !self.frontier.contains(*u))
            .cloned()
            .collect();
        if novel.is_empty() {
            return false;
        }
        self.frontier.extend(novel);
        let id = self.entries.len() as u64;
        self.entries.push(CorpusEntry {
            id,
            candidate,
            signature,
        });
        true
    }

    fn observe(&mut self, signature: &CoverageSignature) {
        for unit in signature.units() {
            *self.unit_hits.entry(unit.clone()).or_insert(0) += 1;
        }
        self.grammar_frontier
            .extend(signature.grammar_rules().iter().copied());
    }

    /// Retrieves an entry by its position, which equals its sequence id.
    pub fn get(&self, index: usize) -> Result<&CorpusEntry, CorpusError> {
        self.entries
            .get(index)
            .ok_or(CorpusError::EntryNotFound(index))
    }

    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&CorpusEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn frontier(&self) -> &HashSet<String> {
        &self.frontier
    }

    pub fn grammar_frontier(&self) -> &BTreeSet<&'static str> {
        &self.grammar_frontier
    }

    /// How many observed executions covered `unit`.
    pub fn hits(&self, unit: &str) -> u64 {
        self.unit_hits.get(unit).copied().unwrap_or(0)
    }

    /// Hit count of the rarest unit in the entry's signature.
    ///
    /// An entry with an empty signature counts as maximally rare.
    pub fn rarest_hits(&self, index: usize) -> Result<u64, CorpusError> {
        let entry = self.get(index)?;
        Ok(entry
            .signature
            .units()
            .iter()
            .map(|u| self.hits(u))
            .min()
            .unwrap_or(1)
            .max(1))
    }
}

/// The corpus shared between concurrent trials.
///
/// Admission takes the write lock, so the check-novel-then-union step is
/// atomic across trials. Readers (parent selection, grammar bias) take the read
/// lock and may observe a slightly stale corpus. A poisoned lock is recovered:
/// admission mutates state only after every check has passed, so a panicking
/// holder cannot leave the corpus half-updated.
#[derive(Debug, Clone, Default)]
pub struct SharedCorpus {
    inner: Arc<RwLock<Corpus>>,
}

impl SharedCorpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Corpus> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Corpus> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits under the write lock. Returns the new entry's id when admitted.
    pub fn admit(&self, candidate: Arc<Candidate>, signature: CoverageSignature) -> Option<u64> {
        let mut corpus = self.write();
        if corpus.admit(candidate, signature) {
            corpus.last().map(|e| e.id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::RngContext;
    use std::thread;

    fn candidate(sql: &str) -> Arc<Candidate> {
        let mut ctx = RngContext::new(0, 0);
        Arc::new(Candidate::seed(sql.to_string(), 0, &mut ctx))
    }

    #[test]
    fn admits_only_novel_signatures() {
        let mut corpus = Corpus::new();
        assert!(corpus.admit(candidate("SELECT 1"), CoverageSignature::from_units(["a", "b"])));
        assert!(!corpus.admit(candidate("SELECT 2"), CoverageSignature::from_units(["a"])));
        assert!(!corpus.admit(candidate("SELECT 3"), CoverageSignature::new()));
        assert!(corpus.admit(candidate("SELECT 4"), CoverageSignature::from_units(["b", "c"])));

        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.frontier().len(), 3);
        let ids: Vec<u64> = corpus.entries().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn frontier_never_shrinks() {
        let mut corpus = Corpus::new();
        let mut previous = 0;
        for (i, units) in [vec!["a"], vec!["a"], vec!["b", "c"], vec![], vec!["c", "d"]]
            .into_iter()
            .enumerate()
        {
            corpus.admit(candidate(&format!("SELECT {i}")), CoverageSignature::from_units(units));
            assert!(corpus.frontier().len() >= previous);
            previous = corpus.frontier().len();
        }
        assert_eq!(previous, 4);
    }

    #[test]
    fn hit_counts_include_rejected_executions() {
        let mut corpus = Corpus::new();
        corpus.admit(candidate("SELECT 1"), CoverageSignature::from_units(["a", "b"]));
        corpus.admit(candidate("SELECT 2"), CoverageSignature::from_units(["a"]));
        corpus.admit(candidate("SELECT 3"), CoverageSignature::from_units(["a"]));
        assert_eq!(corpus.hits("a"), 3);
        assert_eq!(corpus.hits("b"), 1);
        assert_eq!(corpus.rarest_hits(0), Ok(1));
        assert_eq!(corpus.rarest_hits(5), Err(CorpusError::EntryNotFound(5)));
    }

    #[test]
    fn grammar_rules_do_not_gate_admission() {
        let mut corpus = Corpus::new();
        let sig = CoverageSignature::new().with_grammar_rules(["select.where"]);
        assert!(!corpus.admit(candidate("SELECT 1"), sig));
        assert!(corpus.grammar_frontier().contains("select.where"));
        assert!(corpus.is_empty());
    }

    #[test]
    fn concurrent_admission_never_double_admits() {
        let shared = SharedCorpus::new();
        let admitted: usize = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let shared = shared.clone();
                    scope.spawn(move || {
                        let sig = CoverageSignature::from_units(["same-unit"]);
                        shared.admit(candidate(&format!("SELECT {i}")), sig).is_some()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap_or(false)))
                .sum()
        });
        assert_eq!(admitted, 1);
        assert_eq!(shared.read().len(), 1);
    }
}

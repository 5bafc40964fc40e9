use crate::config::{SetupError, SqlDriftConfig};
use crate::corpus::SharedCorpus;
use crate::executor::{CommandEngine, DifferentialExecutor, ExecutionError};
use crate::feedback::{CoverageSignature, Granularity};
use crate::grammar::{self, GenerationError, GrammarGenerator};
use crate::input::Candidate;
use crate::mutator::Mutator;
use crate::oracle::{DifferentialOracle, NormalReason, Verdict, VerdictKind};
use crate::reducer::Reducer;
use crate::report::{BugReport, ReportSink};
use crate::rng::RngContext;
use crate::scheduler::{RarityScheduler, Scheduler, Strategy, choose_strategy};
use crate::schema::SeedDatabase;
use crate::sql;
use chrono::Local;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Upper bound on corpus entries offered to one mutation as splice donors.
pub const MAX_DONORS: usize = 8;
/// File name of the run statistics written next to the bundles.
pub const STATS_FILE_NAME: &str = "stats.json";

#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("Setup failed: {0}")]
    Setup(#[from] SetupError),
    #[error("Failed to read seed query file {path:?}: {source}")]
    SeedQuery {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write run statistics to {path:?}: {source}")]
    Stats {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FuzzerOptions {
    pub seed: u64,
    pub trials: u64,
    /// 1 runs trials sequentially and deterministically.
    pub threads: usize,
    pub mutation_probability: f64,
    pub granularity: Granularity,
    pub grammar_coverage: bool,
    pub reduce: bool,
    /// Where to write `stats.json`; `None` skips it.
    pub stats_path: Option<PathBuf>,
}

impl Default for FuzzerOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            trials: 1000,
            threads: 1,
            mutation_probability: 0.5,
            granularity: Granularity::Statement,
            grammar_coverage: false,
            reduce: true,
            stats_path: None,
        }
    }
}

/// Where a trial's candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrialSource {
    Seed,
    Generate,
    Mutate,
}

/// What became of a trial's candidate. Every completed trial ends in exactly one.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialDisposition {
    /// Normal verdict with novel coverage; the candidate joined the corpus.
    Admitted { entry: u64 },
    /// Normal verdict without novel coverage; the candidate was discarded.
    NotNovel,
    /// Bug verdict; the bundle path is `None` if writing it failed.
    Reported { kind: VerdictKind, bundle: Option<PathBuf> },
    /// No candidate could be produced (GenerationFailure).
    Skipped { reason: String },
    /// The engines could not be run for this candidate.
    ExecutionFailed { reason: String },
}

#[derive(Debug, Clone)]
pub struct TrialRecord {
    pub index: u64,
    pub source: TrialSource,
    /// Mutation was chosen but produced nothing, so the trial generated instead.
    pub mutation_fallback: bool,
    pub candidate: Option<Arc<Candidate>>,
    pub verdict: Option<VerdictKind>,
    pub normal_reason: Option<NormalReason>,
    pub disposition: TrialDisposition,
}

/// Counts reported at the end of a run and written to `stats.json`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub seed: u64,
    pub trials_requested: u64,
    pub trials_run: u64,
    pub interrupted: bool,
    pub seeded: u64,
    pub generated: u64,
    pub mutated: u64,
    pub mutation_fallbacks: u64,
    pub admitted: u64,
    pub not_novel: u64,
    pub skipped: u64,
    pub execution_failures: u64,
    /// Bug verdicts by kind label.
    pub bugs: BTreeMap<String, u64>,
    /// Normal verdicts by reason label.
    pub normal: BTreeMap<String, u64>,
    pub corpus_size: usize,
    pub frontier_size: usize,
    pub grammar_rules_covered: usize,
    pub grammar_coverage_percent: f64,
    pub output_dir: PathBuf,
    pub bundles: Vec<PathBuf>,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn bugs_found(&self) -> u64 {
        self.bugs.values().sum()
    }

    /// Trials whose candidate is accounted for by an admission, oracle or skip decision.
    pub fn accounted(&self) -> u64 {
        self.admitted + self.not_novel + self.skipped + self.execution_failures + self.bugs_found()
    }

    fn record(&mut self, record: &TrialRecord) {
        self.trials_run += 1;
        match record.source {
            TrialSource::Seed => self.seeded += 1,
            TrialSource::Generate => self.generated += 1,
            TrialSource::Mutate => self.mutated += 1,
        }
        if record.mutation_fallback {
            self.mutation_fallbacks += 1;
        }
        if let Some(reason) = record.normal_reason {
            *self.normal.entry(reason.label().to_string()).or_insert(0) += 1;
        }
        match &record.disposition {
            TrialDisposition::Admitted { .. } => self.admitted += 1,
            TrialDisposition::NotNovel => self.not_novel += 1,
            TrialDisposition::Reported { kind, bundle } => {
                *self.bugs.entry(kind.label().to_string()).or_insert(0) += 1;
                self.bundles.extend(bundle.iter().cloned());
            }
            TrialDisposition::Skipped { .. } => self.skipped += 1,
            TrialDisposition::ExecutionFailed { .. } => self.execution_failures += 1,
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.trials_run += other.trials_run;
        self.seeded += other.seeded;
        self.generated += other.generated;
        self.mutated += other.mutated;
        self.mutation_fallbacks += other.mutation_fallbacks;
        self.admitted += other.admitted;
        self.not_novel += other.not_novel;
        self.skipped += other.skipped;
        self.execution_failures += other.execution_failures;
        for (kind, count) in other.bugs {
            *self.bugs.entry(kind).or_insert(0) += count;
        }
        for (reason, count) in other.normal {
            *self.normal.entry(reason).or_insert(0) += count;
        }
        self.bundles.extend(other.bundles);
    }
}

pub fn write_stats(summary: &RunSummary, path: &Path) -> Result<(), FuzzError> {
    let stats_error = |source| FuzzError::Stats {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(stats_error)?;
    }
    let json = serde_json::to_string_pretty(summary).map_err(|e| stats_error(io::Error::other(e)))?;
    fs::write(path, json).map_err(stats_error)
}

/// Splits a seed query file into statements. Text the lexer rejects is kept whole.
fn split_seed_queries(text: &str) -> Vec<String> {
    match sql::parse_script(text) {
        Ok(statements) => statements.iter().map(|s| s.render()).filter(|s| !s.is_empty()).collect(),
        Err(e) => {
            debug!("Seed query file is kept as a single query: {e}");
            let text = text.trim();
            if text.is_empty() {
                Vec::new()
            } else {
                vec![text.to_string()]
            }
        }
    }
}

struct MutationPlan {
    parent: Arc<Candidate>,
    parent_id: u64,
    donors: Vec<Arc<Candidate>>,
}

/// The feedback-driven trial loop.
///
/// Each trial draws from its own `RngContext` (run seed, trial index), so a
/// sequential run is fully determined by its seed, its configuration and the
/// engines' behavior. With several threads trials still get their own streams,
/// but the corpus they observe depends on scheduling.
pub struct Fuzzer {
    options: FuzzerOptions,
    databases: Vec<SeedDatabase>,
    seed_queries: Vec<String>,
    generator: GrammarGenerator,
    mutator: Mutator,
    scheduler: Box<dyn Scheduler>,
    executor: DifferentialExecutor,
    oracle: DifferentialOracle,
    reducer: Reducer,
    sink: ReportSink,
    corpus: SharedCorpus,
    stop: Arc<AtomicBool>,
}

impl Fuzzer {
    pub fn new(
        options: FuzzerOptions,
        databases: Vec<SeedDatabase>,
        executor: DifferentialExecutor,
        sink: ReportSink,
    ) -> Self {
        Self {
            options,
            databases,
            seed_queries: Vec::new(),
            generator: GrammarGenerator::default(),
            mutator: Mutator::default(),
            scheduler: Box::new(RarityScheduler::new(1.0)),
            executor,
            oracle: DifferentialOracle::default(),
            reducer: Reducer::default(),
            sink,
            corpus: SharedCorpus::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Validates `config` and assembles a fuzzer driving the configured engine binaries.
    pub fn from_config(config: &SqlDriftConfig) -> Result<Self, FuzzError> {
        config.validate()?;
        let mut seed_queries = Vec::new();
        for path in &config.corpus.seed_queries {
            let text = fs::read_to_string(path).map_err(|source| FuzzError::SeedQuery {
                path: path.clone(),
                source,
            })?;
            seed_queries.extend(split_seed_queries(&text));
        }

        let primary =
            CommandEngine::new(config.engines.primary_config()).with_probe(config.probe());
        let reference = CommandEngine::new(config.engines.reference_config());
        let executor = DifferentialExecutor::new(Arc::new(primary), Arc::new(reference))
            .confirm_crash_with_reference(config.oracle.confirm_crash_with_reference);

        let options = FuzzerOptions {
            seed: config.fuzzer.seed,
            trials: config.fuzzer.trials,
            threads: config.fuzzer.threads,
            mutation_probability: config.fuzzer.mutation_probability,
            granularity: config.coverage.granularity,
            grammar_coverage: config.coverage.grammar_coverage,
            reduce: config.reducer.enabled,
            stats_path: config
                .report
                .write_stats
                .then(|| config.report.output_dir.join(STATS_FILE_NAME)),
        };
        Ok(Self::new(
            options,
            config.seed_databases.clone(),
            executor,
            ReportSink::new(&config.report.output_dir),
        )
        .with_seed_queries(seed_queries)
        .with_generator(GrammarGenerator::new(config.grammar_config()))
        .with_mutator(Mutator::new(config.mutator_config()))
        .with_scheduler(config.scheduler())
        .with_oracle(DifferentialOracle::new(config.oracle_config()))
        .with_reducer(Reducer::new(config.reducer_config())))
    }

    pub fn with_seed_queries(mut self, seed_queries: Vec<String>) -> Self {
        self.seed_queries = seed_queries;
        self
    }

    pub fn with_generator(mut self, generator: GrammarGenerator) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_mutator(mut self, mutator: Mutator) -> Self {
        self.mutator = mutator;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_oracle(mut self, oracle: DifferentialOracle) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_reducer(mut self, reducer: Reducer) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn options(&self) -> &FuzzerOptions {
        &self.options
    }

    pub fn corpus(&self) -> &SharedCorpus {
        &self.corpus
    }

    /// Setting the returned flag stops the run: no new trials start and
    /// in-flight engine processes are killed.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn run(&self) -> Result<RunSummary, FuzzError> {
        self.run_with(|_| {})
    }

    /// Runs the configured trial budget, calling `on_trial` after every completed trial.
    ///
    /// Abandoned trials (interrupt) are not counted. Per-trial failures are
    /// contained in their trial; only writing the statistics can fail the run.
    pub fn run_with<F>(&self, on_trial: F) -> Result<RunSummary, FuzzError>
    where
        F: Fn(&TrialRecord) + Sync,
    {
        let start = Instant::now();
        let threads = self.options.threads.max(1);
        info!(
            seed = self.options.seed,
            trials = self.options.trials,
            threads,
            granularity = ?self.options.granularity,
            grammar_coverage = self.options.grammar_coverage,
            scheduler = self.scheduler.name(),
            "Starting fuzzing run"
        );

        let mut summary = if threads == 1 {
            let mut summary = RunSummary::default();
            for index in 0..self.options.trials {
                let Some(record) = self.run_trial(index) else {
                    break;
                };
                summary.record(&record);
                on_trial(&record);
            }
            summary
        } else {
            let next = AtomicU64::new(0);
            let (next, on_trial) = (&next, &on_trial);
            thread::scope(|scope| {
                let workers: Vec<_> = (0..threads)
                    .map(|_| {
                        scope.spawn(move || {
                            let mut local = RunSummary::default();
                            loop {
                                let index = next.fetch_add(1, Ordering::Relaxed);
                                if index >= self.options.trials {
                                    break;
                                }
                                let Some(record) = self.run_trial(index) else {
                                    break;
                                };
                                local.record(&record);
                                on_trial(&record);
                            }
                            local
                        })
                    })
                    .collect();
                let mut merged = RunSummary::default();
                for worker in workers {
                    match worker.join() {
                        Ok(local) => merged.merge(local),
                        Err(_) => warn!("A trial worker panicked, its counts are lost"),
                    }
                }
                merged
            })
        };

        {
            let corpus = self.corpus.read();
            summary.corpus_size = corpus.len();
            summary.frontier_size = corpus.frontier().len();
            summary.grammar_rules_covered = corpus.grammar_frontier().len();
            summary.grammar_coverage_percent = grammar::grammar_coverage(corpus.grammar_frontier());
        }
        summary.seed = self.options.seed;
        summary.trials_requested = self.options.trials;
        summary.interrupted =
            summary.trials_run < self.options.trials && self.stop.load(Ordering::Relaxed);
        summary.output_dir = self.sink.root().to_path_buf();
        summary.elapsed_secs = start.elapsed().as_secs_f64();

        info!(
            trials = summary.trials_run,
            corpus = summary.corpus_size,
            frontier = summary.frontier_size,
            bugs = summary.bugs_found(),
            interrupted = summary.interrupted,
            "Fuzzing run finished"
        );
        if let Some(path) = &self.options.stats_path {
            write_stats(&summary, path)?;
        }
        Ok(summary)
    }

    /// Runs one trial. `None` means the trial was abandoned because the run is stopping.
    fn run_trial(&self, index: u64) -> Option<TrialRecord> {
        if self.stop.load(Ordering::Relaxed) {
            return None;
        }
        let mut rng = RngContext::new(self.options.seed, index);
        let (source, candidate, mutation_fallback) = match self.produce(index, &mut rng) {
            Ok(produced) => produced,
            Err(e) => {
                warn!(trial = index, "Generation failed, skipping trial: {e}");
                return Some(TrialRecord {
                    index,
                    source: TrialSource::Generate,
                    mutation_fallback: false,
                    candidate: None,
                    verdict: None,
                    normal_reason: None,
                    disposition: TrialDisposition::Skipped { reason: e.to_string() },
                });
            }
        };
        let candidate = Arc::new(candidate);
        let mut record = TrialRecord {
            index,
            source,
            mutation_fallback,
            candidate: Some(candidate.clone()),
            verdict: None,
            normal_reason: None,
            disposition: TrialDisposition::NotNovel,
        };
        let Some(database) = self.databases.get(candidate.database()) else {
            record.disposition = TrialDisposition::Skipped {
                reason: format!("no seed database {}", candidate.database()),
            };
            return Some(record);
        };

        let outcome = match self.executor.run(candidate.sql(), &database.path, &self.stop) {
            Ok(outcome) => outcome,
            Err(ExecutionError::Cancelled) => {
                debug!(trial = index, "Trial abandoned");
                return None;
            }
            Err(e) => {
                warn!(trial = index, "Execution failed: {e}");
                record.disposition = TrialDisposition::ExecutionFailed { reason: e.to_string() };
                return Some(record);
            }
        };
        let verdict = self.oracle.classify(candidate.sql(), outcome);
        record.verdict = Some(verdict.kind);
        record.normal_reason = verdict.reason;
        debug!(
            trial = index,
            source = ?source,
            verdict = %verdict.kind,
            sql = candidate.sql(),
            "Trial classified"
        );

        record.disposition = if verdict.kind.is_bug() {
            let kind = verdict.kind;
            let Ok(bundle) = self.file_bug(index, &candidate, database, verdict) else {
                debug!(trial = index, "Trial abandoned during reduction");
                return None;
            };
            TrialDisposition::Reported { kind, bundle }
        } else {
            let coverage = &verdict.outcome.primary.coverage;
            let signature = CoverageSignature::from_trace(coverage, self.options.granularity)
                .with_grammar_rules(candidate.grammar_rules().iter().copied());
            match self.corpus.admit(candidate.clone(), signature) {
                Some(entry) => {
                    debug!(trial = index, entry, "Candidate admitted to corpus");
                    TrialDisposition::Admitted { entry }
                }
                None => TrialDisposition::NotNovel,
            }
        };
        Some(record)
    }

    /// Produces the trial's candidate: a seed query, a mutation or a generated query.
    fn produce(
        &self,
        index: u64,
        rng: &mut RngContext,
    ) -> Result<(TrialSource, Candidate, bool), GenerationError> {
        if let Some(seed) = usize::try_from(index).ok().and_then(|i| self.seed_queries.get(i)) {
            let database = usize::try_from(index).unwrap_or(0) % self.databases.len().max(1);
            return Ok((TrialSource::Seed, Candidate::seed(seed.clone(), database, rng), false));
        }

        let plan = {
            let corpus = self.corpus.read();
            match choose_strategy(&corpus, self.options.mutation_probability, rng) {
                Strategy::Mutate => match self.scheduler.next(&corpus, rng) {
                    Ok(parent_index) => corpus.get(parent_index).ok().map(|entry| {
                        let donors = (0..MAX_DONORS.min(corpus.len()))
                            .filter_map(|_| corpus.get(rng.below("donor", corpus.len())).ok())
                            .map(|donor| donor.candidate.clone())
                            .collect();
                        MutationPlan {
                            parent: entry.candidate.clone(),
                            parent_id: entry.id,
                            donors,
                        }
                    }),
                    Err(e) => {
                        debug!("Parent selection failed: {e}");
                        None
                    }
                },
                Strategy::Generate => None,
            }
        };

        let mut mutation_fallback = false;
        if let Some(plan) = plan {
            let schema = self.databases.get(plan.parent.database()).map(|db| &db.schema);
            if let Some(schema) = schema {
                if let Some(candidate) = self
                    .mutator
                    .mutate(&plan.parent, plan.parent_id, schema, &plan.donors, rng)
                {
                    return Ok((TrialSource::Mutate, candidate, false));
                }
            }
            debug!(parent = plan.parent_id, "No mutation applied, generating instead");
            mutation_fallback = true;
        }

        let frontier = if self.options.grammar_coverage {
            self.corpus.read().grammar_frontier().clone()
        } else {
            BTreeSet::new()
        };
        let database = rng.below("database", self.databases.len());
        let schema = self
            .databases
            .get(database)
            .map(|db| &db.schema)
            .ok_or(GenerationError::NoUsableTable(database))?;
        let candidate = self.generator.generate(database, schema, &frontier, rng)?;
        Ok((TrialSource::Generate, candidate, mutation_fallback))
    }

    /// Reduces a failing candidate and writes its bundle.
    ///
    /// Fails with [`ExecutionError::Cancelled`] when the run is stopped while
    /// the reducer is still replaying; nothing is written in that case.
    fn file_bug(
        &self,
        index: u64,
        candidate: &Arc<Candidate>,
        database: &SeedDatabase,
        verdict: Verdict,
    ) -> Result<Option<PathBuf>, ExecutionError> {
        let kind = verdict.kind;
        info!(
            trial = index,
            kind = %kind,
            detail = verdict.detail.lines().next().unwrap_or_default(),
            "Bug found"
        );
        let reduced_sql = if self.options.reduce {
            let mut cancelled = false;
            let reduction = self.reducer.reduce(candidate.sql(), kind, |sql| {
                match self.executor.run(sql, &database.path, &self.stop) {
                    Ok(outcome) => Some(self.oracle.classify(sql, outcome).kind),
                    Err(ExecutionError::Cancelled) => {
                        cancelled = true;
                        None
                    }
                    Err(_) => None,
                }
            });
            if cancelled || self.stop.load(Ordering::Relaxed) {
                return Err(ExecutionError::Cancelled);
            }
            if reduction.made_progress() {
                debug!(
                    trial = index,
                    attempts = reduction.attempts,
                    accepted = reduction.accepted,
                    "Reduced failing query"
                );
            } else {
                debug!(trial = index, "Reduction exhausted, reporting the original query");
            }
            reduction.sql
        } else {
            candidate.sql().to_string()
        };

        let report = BugReport {
            kind,
            detail: verdict.detail,
            original: candidate.as_ref().clone(),
            reduced: Candidate::reduced(candidate, reduced_sql),
            snapshot: database.path.clone(),
            engine_version: self.executor.primary().version().to_string(),
            reference_version: self.executor.reference().version().to_string(),
            timestamp: Local::now(),
            outcome: verdict.outcome,
        };
        match self.sink.write(&report) {
            Ok(bundle) => Ok(Some(bundle)),
            Err(e) => {
                warn!(trial = index, "Failed to write bug report: {e}");
                Ok(None)
            }
        }
    }
}

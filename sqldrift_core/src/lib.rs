pub mod config;
pub mod corpus;
pub mod executor;
pub mod feedback;
pub mod fuzzer;
pub mod grammar;
pub mod input;
pub mod mutator;
pub mod observer;
pub mod oracle;
pub mod reducer;
pub mod report;
pub mod rng;
pub mod scheduler;
pub mod schema;
pub mod sql;

pub use config::{SetupError, SqlDriftConfig};
pub use corpus::{Corpus, CorpusEntry, CorpusError, SharedCorpus};
pub use executor::{
    CommandEngine, CommandEngineConfig, DifferentialExecutor, DifferentialOutcome, Engine,
    EngineStatus, ExecutionError, ExecutionOutcome, InProcessEngine,
};
pub use feedback::{CoverageSignature, Granularity};
pub use fuzzer::{
    FuzzError, Fuzzer, FuzzerOptions, RunSummary, TrialDisposition, TrialRecord, TrialSource,
};
pub use grammar::{GenerationError, GrammarConfig, GrammarGenerator};
pub use input::{Candidate, Origin, Provenance};
pub use mutator::{MutationOperator, Mutator, MutatorConfig};
pub use observer::{CoverageProbe, GcovProbe, NoCoverageProbe, TraceFileProbe};
pub use oracle::{DifferentialOracle, NormalReason, OracleConfig, Verdict, VerdictKind};
pub use reducer::{Reducer, ReducerConfig, Reduction};
pub use report::{BugReport, ReportError, ReportSink};
pub use rng::RngContext;
pub use scheduler::{ParentSelection, RandomScheduler, RarityScheduler, Scheduler, SchedulerError};
pub use schema::{Schema, SeedDatabase};

use crate::executor::{CommandEngineConfig, InputDelivery};
use crate::feedback::Granularity;
use crate::grammar::GrammarConfig;
use crate::mutator::{DEFAULT_MAX_MUTATIONS, DEFAULT_MIN_MUTATIONS, MutatorConfig};
use crate::observer::{CoverageProbe, GcovProbe, NoCoverageProbe, TraceFileProbe};
use crate::oracle::{DEFAULT_FLOAT_DIGITS, DEFAULT_IGNORABLE_ERRORS, OracleConfig, UnorderedLimit};
use crate::reducer::{DEFAULT_MAX_ATTEMPTS, ReducerConfig};
use crate::scheduler::{ParentSelection, RandomScheduler, RarityScheduler, Scheduler};
use crate::schema::SeedDatabase;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Environment-level problems found before any trial runs. These abort the run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SetupError {
    #[error("No seed databases configured")]
    NoSeedDatabases,
    #[error("Seed database '{name}' snapshot not found at {path:?}")]
    MissingSnapshot { name: String, path: PathBuf },
    #[error("Seed database '{0}' declares no table with columns")]
    EmptySchema(String),
    #[error("The {0} engine command is empty")]
    EmptyCommand(&'static str),
    #[error("The {role} engine binary '{program}' was not found")]
    EngineNotFound { role: &'static str, program: String },
    #[error("Seed query file not found at {0:?}")]
    MissingSeedQuery(PathBuf),
    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },
}

fn invalid(name: &'static str, reason: impl Into<String>) -> SetupError {
    SetupError::InvalidSetting {
        name,
        reason: reason.into(),
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_trials")]
    pub trials: u64,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default = "default_mutation_probability")]
    pub mutation_probability: f64,
    #[serde(default = "default_min_mutations")]
    pub min_mutations: usize,
    #[serde(default = "default_max_mutations")]
    pub max_mutations: usize,
    #[serde(default = "default_boundary_literal_probability")]
    pub boundary_literal_probability: f64,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default)]
    pub parent_selection: ParentSelection,
    /// Exponent of the rarity energy; defaults by granularity when unset.
    #[serde(default)]
    pub rarity_exponent: Option<f64>,
}

pub fn default_trials() -> u64 {
    1000
}
pub fn default_threads() -> usize {
    1
}
fn default_mutation_probability() -> f64 {
    0.5
}
fn default_min_mutations() -> usize {
    DEFAULT_MIN_MUTATIONS
}
fn default_max_mutations() -> usize {
    DEFAULT_MAX_MUTATIONS
}
fn default_boundary_literal_probability() -> f64 {
    0.3
}
fn default_max_depth() -> usize {
    3
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            trials: default_trials(),
            threads: default_threads(),
            mutation_probability: default_mutation_probability(),
            min_mutations: default_min_mutations(),
            max_mutations: default_max_mutations(),
            boundary_literal_probability: default_boundary_literal_probability(),
            max_depth: default_max_depth(),
            parent_selection: ParentSelection::default(),
            rarity_exponent: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeType {
    None,
    #[default]
    TraceFile,
    Gcov,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageSettings {
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default)]
    pub grammar_coverage: bool,
    #[serde(default)]
    pub probe: ProbeType,
    #[serde(default = "default_trace_env_var")]
    pub trace_env_var: String,
    #[serde(default = "default_trace_file")]
    pub trace_file: String,
    #[serde(default)]
    pub gcov_object_dir: Option<PathBuf>,
    #[serde(default)]
    pub gcov_source: Option<PathBuf>,
    #[serde(default = "default_gcov_binary")]
    pub gcov_binary: PathBuf,
}

fn default_trace_env_var() -> String {
    "SQLDRIFT_TRACE".to_string()
}
fn default_trace_file() -> String {
    "coverage.trace".to_string()
}
fn default_gcov_binary() -> PathBuf {
    PathBuf::from("gcov")
}

impl Default for CoverageSettings {
    fn default() -> Self {
        Self {
            granularity: Granularity::default(),
            grammar_coverage: false,
            probe: ProbeType::default(),
            trace_env_var: default_trace_env_var(),
            trace_file: default_trace_file(),
            gcov_object_dir: None,
            gcov_source: None,
            gcov_binary: default_gcov_binary(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Program and arguments; `{db}` and `{query}` are substituted per execution.
    pub command: Vec<String>,
    pub version: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EnginesSettings {
    pub primary: EngineSettings,
    pub reference: EngineSettings,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub input_delivery: InputDelivery,
    #[serde(default = "default_ok_exit_codes")]
    pub ok_exit_codes: Vec<i32>,
    #[serde(default = "default_true")]
    pub wrap_in_transaction: bool,
    #[serde(default = "default_column_separator")]
    pub column_separator: String,
}

fn default_timeout_ms() -> u64 {
    5000
}
fn default_ok_exit_codes() -> Vec<i32> {
    vec![0, 1]
}
fn default_true() -> bool {
    true
}
fn default_column_separator() -> String {
    "|".to_string()
}

impl EnginesSettings {
    fn engine_config(&self, engine: &EngineSettings) -> CommandEngineConfig {
        CommandEngineConfig {
            command: engine.command.clone(),
            version: engine.version.clone(),
            input_delivery: self.input_delivery,
            timeout: Duration::from_millis(self.timeout_ms),
            ok_exit_codes: self.ok_exit_codes.clone(),
            wrap_in_transaction: self.wrap_in_transaction,
            column_separator: self.column_separator.clone(),
        }
    }

    pub fn primary_config(&self) -> CommandEngineConfig {
        self.engine_config(&self.primary)
    }

    pub fn reference_config(&self) -> CommandEngineConfig {
        self.engine_config(&self.reference)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleSettings {
    #[serde(default = "default_float_digits")]
    pub float_digits: usize,
    #[serde(default)]
    pub unordered_limit: UnorderedLimit,
    #[serde(default = "default_ignorable_errors")]
    pub ignorable_errors: Vec<String>,
    /// Run the reference engine after a primary crash; a shared crash is not filed.
    #[serde(default)]
    pub confirm_crash_with_reference: bool,
}

fn default_float_digits() -> usize {
    DEFAULT_FLOAT_DIGITS
}
fn default_ignorable_errors() -> Vec<String> {
    DEFAULT_IGNORABLE_ERRORS.iter().map(|s| s.to_string()).collect()
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            float_digits: default_float_digits(),
            unordered_limit: UnorderedLimit::default(),
            ignorable_errors: default_ignorable_errors(),
            confirm_crash_with_reference: false,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReducerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

fn default_max_attempts() -> usize {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for ReducerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReportSettings {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_true")]
    pub write_stats: bool,
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("./sqldrift-out")
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            write_stats: true,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusSettings {
    /// Files of `;`-separated queries run as the first trials.
    #[serde(default)]
    pub seed_queries: Vec<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SqlDriftConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub coverage: CoverageSettings,
    pub engines: EnginesSettings,
    #[serde(default)]
    pub oracle: OracleSettings,
    #[serde(default)]
    pub reducer: ReducerSettings,
    #[serde(default)]
    pub report: ReportSettings,
    #[serde(default)]
    pub corpus: CorpusSettings,
    #[serde(default)]
    pub seed_databases: Vec<SeedDatabase>,
}

impl SqlDriftConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let mut config: SqlDriftConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config.resolve_relative_paths(path.parent().unwrap_or(Path::new(".")));
        Ok(config)
    }

    /// Makes file paths relative to the config file's directory absolute.
    fn resolve_relative_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        for db in &mut self.seed_databases {
            resolve(&mut db.path);
        }
        for query in &mut self.corpus.seed_queries {
            resolve(query);
        }
        resolve(&mut self.report.output_dir);
    }

    /// Startup checks. Any failure here is fatal and aborts the run before the first trial.
    pub fn validate(&self) -> Result<(), SetupError> {
        let fuzzer = &self.fuzzer;
        if fuzzer.threads == 0 {
            return Err(invalid("fuzzer.threads", "must be at least 1"));
        }
        for (name, p) in [
            ("fuzzer.mutation-probability", fuzzer.mutation_probability),
            ("fuzzer.boundary-literal-probability", fuzzer.boundary_literal_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(invalid(name, format!("{p} is not a probability")));
            }
        }
        if fuzzer.min_mutations == 0 || fuzzer.min_mutations > fuzzer.max_mutations {
            return Err(invalid(
                "fuzzer.min-mutations",
                format!(
                    "need 1 <= min ({}) <= max ({})",
                    fuzzer.min_mutations, fuzzer.max_mutations
                ),
            ));
        }
        if let Some(exponent) = fuzzer.rarity_exponent {
            if !exponent.is_finite() || exponent < 0.0 {
                return Err(invalid(
                    "fuzzer.rarity-exponent",
                    format!("{exponent} is not a non-negative number"),
                ));
            }
        }
        if self.engines.timeout_ms == 0 {
            return Err(invalid("engines.timeout-ms", "must be positive"));
        }
        if !(1..=17).contains(&self.oracle.float_digits) {
            return Err(invalid("oracle.float-digits", "must be between 1 and 17"));
        }

        let roles = [("primary", &self.engines.primary), ("reference", &self.engines.reference)];
        for (role, engine) in roles {
            let program = engine.command.first().ok_or(SetupError::EmptyCommand(role))?;
            if !program_exists(program) {
                return Err(SetupError::EngineNotFound {
                    role,
                    program: program.clone(),
                });
            }
        }

        if self.coverage.probe == ProbeType::Gcov {
            if fuzzer.threads != 1 {
                return Err(invalid("coverage.probe", "gcov coverage requires threads = 1"));
            }
            if self.coverage.gcov_object_dir.is_none() || self.coverage.gcov_source.is_none() {
                return Err(invalid("coverage.probe", "gcov needs gcov-object-dir and gcov-source"));
            }
        }

        if self.seed_databases.is_empty() {
            return Err(SetupError::NoSeedDatabases);
        }
        for db in &self.seed_databases {
            if !db.path.is_file() {
                return Err(SetupError::MissingSnapshot {
                    name: db.name.clone(),
                    path: db.path.clone(),
                });
            }
            if db.schema.usable_tables().is_empty() {
                return Err(SetupError::EmptySchema(db.name.clone()));
            }
        }
        for query in &self.corpus.seed_queries {
            if !query.is_file() {
                return Err(SetupError::MissingSeedQuery(query.clone()));
            }
        }
        Ok(())
    }

    pub fn grammar_config(&self) -> GrammarConfig {
        GrammarConfig {
            max_depth: self.fuzzer.max_depth,
            boundary_literal_probability: self.fuzzer.boundary_literal_probability,
            grammar_coverage: self.coverage.grammar_coverage,
        }
    }

    pub fn mutator_config(&self) -> MutatorConfig {
        MutatorConfig {
            min_mutations: self.fuzzer.min_mutations,
            max_mutations: self.fuzzer.max_mutations,
            boundary_literal_probability: self.fuzzer.boundary_literal_probability,
        }
    }

    pub fn oracle_config(&self) -> OracleConfig {
        OracleConfig {
            float_digits: self.oracle.float_digits,
            unordered_limit: self.oracle.unordered_limit,
            ignorable_errors: self.oracle.ignorable_errors.clone(),
        }
    }

    pub fn reducer_config(&self) -> ReducerConfig {
        ReducerConfig {
            max_attempts: self.reducer.max_attempts,
        }
    }

    /// The rarity exponent: the configured one, else 5 for path coverage
    /// (AFL-fast's exponential schedule) and 1 for statement coverage.
    pub fn rarity_exponent(&self) -> f64 {
        self.fuzzer
            .rarity_exponent
            .unwrap_or(match self.coverage.granularity {
                Granularity::Path => 5.0,
                Granularity::Statement => 1.0,
            })
    }

    pub fn scheduler(&self) -> Box<dyn Scheduler> {
        match self.fuzzer.parent_selection {
            ParentSelection::Uniform => Box::new(RandomScheduler::new()),
            ParentSelection::Rarity => Box::new(RarityScheduler::new(self.rarity_exponent())),
        }
    }

    pub fn probe(&self) -> Arc<dyn CoverageProbe> {
        let coverage = &self.coverage;
        match (&coverage.probe, &coverage.gcov_object_dir, &coverage.gcov_source) {
            (ProbeType::None, _, _) => Arc::new(NoCoverageProbe),
            (ProbeType::TraceFile, _, _) => {
                Arc::new(TraceFileProbe::new(&coverage.trace_env_var, &coverage.trace_file))
            }
            (ProbeType::Gcov, Some(object_dir), Some(source)) => Arc::new(GcovProbe::new(
                object_dir.clone(),
                source.clone(),
                coverage.gcov_binary.clone(),
            )),
            // Rejected by validate().
            (ProbeType::Gcov, _, _) => Arc::new(NoCoverageProbe),
        }
    }
}

/// Whether `program` names an existing file, directly or through `PATH`.
fn program_exists(program: &str) -> bool {
    let path = Path::new(program);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file();
    }
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

use sqldrift_core::config::SqlDriftConfig;
use sqldrift_core::feedback::Granularity;
use sqldrift_core::fuzzer::{Fuzzer, RunSummary, TrialDisposition, TrialRecord};
use sqldrift_core::oracle::VerdictKind;

use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "sqldrift.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Coverage-guided differential SQL fuzzer", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./sqldrift.toml).
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Run seed; the same seed and configuration replay the same sequential run.
    #[clap(short, long)]
    seed: Option<u64>,
    /// Trial budget.
    #[clap(short, long)]
    trials: Option<u64>,
    /// Count control-flow paths instead of covered statements.
    #[clap(long)]
    path_coverage: bool,
    /// Reward queries that exercise unseen grammar rules.
    #[clap(long)]
    grammar_coverage: bool,
    #[clap(long)]
    threads: Option<usize>,
    /// Where bug bundles and stats.json are written.
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    /// Skip reducing failing queries.
    #[clap(long)]
    no_reduce: bool,
    /// Log per-trial decisions.
    #[clap(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn load_config(cli: &Cli) -> Result<SqlDriftConfig, anyhow::Error> {
    let config_path = cli
        .config_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    if cli.config_file.is_none() && !config_path.exists() {
        anyhow::bail!(
            "No config file specified and default '{DEFAULT_CONFIG_FILE}' not found; \
             the engines to compare must be configured"
        );
    }
    info!("Loading configuration from {config_path:?}");
    let mut config = SqlDriftConfig::load_from_file(&config_path)?;

    if let Some(seed) = cli.seed {
        config.fuzzer.seed = seed;
    }
    if let Some(trials) = cli.trials {
        config.fuzzer.trials = trials;
    }
    if let Some(threads) = cli.threads {
        config.fuzzer.threads = threads;
    }
    if cli.path_coverage {
        config.coverage.granularity = Granularity::Path;
    }
    if cli.grammar_coverage {
        config.coverage.grammar_coverage = true;
    }
    if let Some(output_dir) = &cli.output_dir {
        config.report.output_dir = output_dir.clone();
    }
    if cli.no_reduce {
        config.reducer.enabled = false;
    }
    Ok(config)
}

fn print_summary(summary: &RunSummary) {
    let status = if summary.interrupted { "interrupted" } else { "finished" };
    println!(
        "\nFuzzing {status} after {} of {} trials in {:.2}s (seed {}).",
        summary.trials_run, summary.trials_requested, summary.elapsed_secs, summary.seed
    );
    println!(
        "Candidates: {} seeded, {} generated, {} mutated ({} mutation fallbacks)",
        summary.seeded, summary.generated, summary.mutated, summary.mutation_fallbacks
    );
    println!(
        "Discards: {} not novel, {} skipped, {} execution failures",
        summary.not_novel, summary.skipped, summary.execution_failures
    );
    println!(
        "Corpus: {} entries, {} coverage units, grammar coverage {:.1}% ({} rules)",
        summary.corpus_size,
        summary.frontier_size,
        summary.grammar_coverage_percent,
        summary.grammar_rules_covered
    );
    println!("Bugs found: {}", summary.bugs_found());
    for kind in VerdictKind::BUGS {
        let count = summary.bugs.get(kind.label()).copied().unwrap_or(0);
        println!("  {:<16} {count}", kind.label());
    }
    if summary.bundles.is_empty() {
        println!("No reproducer bundles written.");
    } else {
        println!("Reproducer bundles under {}:", summary.output_dir.display());
        for bundle in &summary.bundles {
            println!("  {}", bundle.display());
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    tracing::debug!("Effective configuration: {config:#?}");

    let fuzzer = Fuzzer::from_config(&config).context("Refusing to start fuzzing")?;
    let stop = fuzzer.stop_handle();
    ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
    })
    .context("Failed to install the interrupt handler")?;

    let total = config.fuzzer.trials;
    let progress_every = (total / 100).max(1);
    let completed = AtomicU64::new(0);
    let bugs = AtomicU64::new(0);
    let start_time = Instant::now();

    let summary = fuzzer.run_with(|record: &TrialRecord| {
        if let TrialDisposition::Reported { kind, bundle } = &record.disposition {
            bugs.fetch_add(1, Ordering::Relaxed);
            match bundle {
                Some(path) => info!("Found {kind} at trial {}: {}", record.index, path.display()),
                None => warn!(
                    "Found {kind} at trial {} but its bundle was not written",
                    record.index
                ),
            }
        }
        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
        if done % progress_every == 0 {
            let elapsed = start_time.elapsed().as_secs_f32();
            let per_sec = if elapsed > 0.0 { done as f32 / elapsed } else { 0.0 };
            print!(
                "\rTrials: {done}/{total}, Corpus: {}, Bugs: {}, Trials/sec: {per_sec:.2}   ",
                fuzzer.corpus().read().len(),
                bugs.load(Ordering::Relaxed)
            );
            let _ = std::io::stdout().flush();
        }
    })?;

    print_summary(&summary);
    Ok(())
}

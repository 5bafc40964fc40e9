use sqldrift_core::executor::{DifferentialExecutor, Engine, InProcessEngine, Row};
use sqldrift_core::fuzzer::{Fuzzer, FuzzerOptions, TrialDisposition, TrialRecord};
use sqldrift_core::oracle::VerdictKind;
use sqldrift_core::report::ReportSink;
use sqldrift_core::schema::{Schema, SeedDatabase};

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;

/// Coverage units of the toy engine: one per distinct keyword-like word.
fn keyword_units(sql: &str) -> Vec<String> {
    sql.split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| w.len() > 1 && w.chars().all(|c| c.is_ascii_uppercase()))
        .map(|w| format!("kw:{w}"))
        .collect()
}

/// A seed query whose `WHERE` clause the crashing engines trip over.
const WHERE_QUERY: &str = "SELECT name, email FROM users WHERE age > 30 ORDER BY name LIMIT 5";

fn engine<F>(version: &str, harness: F) -> Arc<dyn Engine>
where
    F: Fn(&str, &mut Vec<String>) -> Result<Vec<Row>, String> + Send + Sync + 'static,
{
    Arc::new(InProcessEngine::new(version, harness))
}

fn agreeing_engine(version: &str) -> Arc<dyn Engine> {
    engine(version, |sql: &str, coverage: &mut Vec<String>| {
        coverage.extend(keyword_units(sql));
        Ok(vec![vec![sql.len().to_string()]])
    })
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    fn database(&self) -> SeedDatabase {
        let path = self.dir.path().join("storefront.db");
        fs::write(&path, b"snapshot").expect("write snapshot");
        SeedDatabase {
            name: "storefront".to_string(),
            path,
            schema: Schema::storefront(),
        }
    }

    fn output(&self) -> std::path::PathBuf {
        self.dir.path().join("out")
    }

    fn fuzzer(
        &self,
        options: FuzzerOptions,
        primary: Arc<dyn Engine>,
        reference: Arc<dyn Engine>,
    ) -> Fuzzer {
        Fuzzer::new(
            options,
            vec![self.database()],
            DifferentialExecutor::new(primary, reference),
            ReportSink::new(self.output()),
        )
    }
}

fn options(seed: u64, trials: u64) -> FuzzerOptions {
    FuzzerOptions {
        seed,
        trials,
        ..FuzzerOptions::default()
    }
}

fn executed_sql(record: &TrialRecord) -> Option<String> {
    record.candidate.as_ref().map(|c| c.sql().to_string())
}

fn bundle_files(bundle: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(bundle)
        .expect("read bundle")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn fifty_trials_complete_with_a_grounded_frontier() {
    let ws = Workspace::new();
    let fuzzer = ws.fuzzer(options(1, 50), agreeing_engine("3.45.0"), agreeing_engine("3.39.0"));
    let exercised = Mutex::new(Vec::new());
    let summary = fuzzer
        .run_with(|record| {
            if let Some(sql) = executed_sql(record) {
                exercised.lock().expect("lock").push(sql);
            }
        })
        .expect("run");

    assert_eq!(summary.trials_run, 50);
    assert_eq!(summary.accounted(), 50);
    assert!(!summary.interrupted);
    assert_eq!(summary.bugs_found(), 0);

    let reachable: HashSet<String> = exercised
        .lock()
        .expect("lock")
        .iter()
        .flat_map(|sql| keyword_units(sql))
        .collect();
    let corpus = fuzzer.corpus().read();
    assert!(!corpus.frontier().is_empty());
    assert!(corpus.frontier().is_subset(&reachable));
    assert_eq!(summary.corpus_size, corpus.len());
}

#[test]
fn same_seed_replays_the_same_run() {
    let run = |seed: u64| {
        let ws = Workspace::new();
        let fuzzer = ws.fuzzer(options(seed, 60), agreeing_engine("a"), agreeing_engine("b"));
        let trials = Mutex::new(Vec::new());
        fuzzer
            .run_with(|record| {
                let sql = executed_sql(record);
                let entry = (record.index, record.source, sql, record.disposition.clone());
                trials.lock().expect("lock").push(entry);
            })
            .expect("run");
        trials.into_inner().expect("lock")
    };

    let first = run(7);
    assert_eq!(first.len(), 60);
    assert_eq!(first, run(7));
    assert_ne!(first, run(8));
}

#[test]
fn frontier_never_shrinks_and_admissions_add_units() {
    let ws = Workspace::new();
    let fuzzer = ws.fuzzer(options(3, 80), agreeing_engine("a"), agreeing_engine("b"));
    let sizes = Mutex::new(Vec::new());
    fuzzer
        .run_with(|record| {
            let frontier = fuzzer.corpus().read().frontier().len();
            let admitted = matches!(record.disposition, TrialDisposition::Admitted { .. });
            sizes.lock().expect("lock").push((frontier, admitted));
        })
        .expect("run");

    let sizes = sizes.into_inner().expect("lock");
    let mut previous = 0;
    for (frontier, admitted) in sizes {
        assert!(frontier >= previous);
        if admitted {
            assert!(frontier > previous);
        } else {
            assert_eq!(frontier, previous);
        }
        previous = frontier;
    }
}

#[test]
fn seed_queries_run_first() {
    let ws = Workspace::new();
    let seeds = vec![
        "SELECT name FROM users WHERE age > 30".to_string(),
        "SELECT COUNT(*) FROM orders".to_string(),
    ];
    let fuzzer = ws
        .fuzzer(options(5, 10), agreeing_engine("a"), agreeing_engine("b"))
        .with_seed_queries(seeds.clone());
    let first = Mutex::new(Vec::new());
    let summary = fuzzer
        .run_with(|record| {
            if record.index < 2 {
                first.lock().expect("lock").push(executed_sql(record).expect("candidate"));
            }
        })
        .expect("run");
    assert_eq!(first.into_inner().expect("lock"), seeds);
    assert_eq!(summary.seeded, 2);
    assert_eq!(summary.generated + summary.mutated, 8);
}

#[test]
fn crashes_are_reduced_and_bundled() {
    let ws = Workspace::new();
    let crashing = engine("3.45.0", |sql: &str, _: &mut Vec<String>| {
        if sql.contains("WHERE") {
            panic!("assertion failed in where.c");
        }
        Ok(vec![vec!["1".to_string()]])
    });
    let fuzzer = ws
        .fuzzer(options(1, 1), crashing, agreeing_engine("3.39.0"))
        .with_seed_queries(vec![WHERE_QUERY.to_string()]);
    let summary = fuzzer.run().expect("run");

    assert_eq!(summary.bugs.get("crash"), Some(&1));
    assert_eq!(summary.bundles.len(), 1);
    let bundle = &summary.bundles[0];
    assert!(bundle.starts_with(ws.output().join("3.45.0").join("crashes")));
    assert_eq!(
        bundle_files(bundle),
        vec!["README.md", "original_test.sql", "reduced_test.sql", "test.db", "version.txt"]
    );
    let original = fs::read_to_string(bundle.join("original_test.sql")).expect("original");
    let reduced = fs::read_to_string(bundle.join("reduced_test.sql")).expect("reduced");
    assert!(reduced.contains("WHERE"));
    assert!(reduced.len() < original.len());
    assert_eq!(fs::read(bundle.join("test.db")).expect("db"), b"snapshot");
    assert_eq!(fs::read_to_string(bundle.join("version.txt")).expect("version").trim(), "3.45.0");
}

#[test]
fn interrupt_during_reduction_abandons_the_trial() {
    let ws = Workspace::new();
    let stop: Arc<OnceLock<Arc<AtomicBool>>> = Arc::new(OnceLock::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let crashing = {
        let (stop, calls) = (stop.clone(), calls.clone());
        engine("3.45.0", move |sql: &str, _: &mut Vec<String>| {
            // The first replay of the failing query interrupts the run.
            if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                if let Some(stop) = stop.get() {
                    stop.store(true, Ordering::SeqCst);
                }
            }
            if sql.contains("WHERE") {
                panic!("assertion failed in where.c");
            }
            Ok(vec![vec!["1".to_string()]])
        })
    };
    let fuzzer = ws
        .fuzzer(options(1, 1), crashing, agreeing_engine("3.39.0"))
        .with_seed_queries(vec![WHERE_QUERY.to_string()]);
    stop.set(fuzzer.stop_handle()).expect("stop handle set once");
    let summary = fuzzer.run().expect("run");

    assert!(calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(summary.trials_run, 0);
    assert_eq!(summary.bugs_found(), 0);
    assert!(summary.bundles.is_empty());
    assert!(summary.interrupted);
    assert!(!ws.output().join("3.45.0").join("crashes").exists());
}

#[test]
fn disagreeing_results_are_logic_bugs() {
    let ws = Workspace::new();
    let primary = engine("new", |_: &str, _: &mut Vec<String>| Ok(vec![vec!["1".to_string()]]));
    let reference = engine("old", |_: &str, _: &mut Vec<String>| Ok(vec![vec!["2".to_string()]]));
    let mut opts = options(2, 1);
    opts.reduce = false;
    let fuzzer = ws
        .fuzzer(opts, primary, reference)
        .with_seed_queries(vec!["SELECT id FROM users".to_string()]);
    let summary = fuzzer.run().expect("run");

    assert_eq!(summary.bugs.get("logic_bug"), Some(&1));
    let bundle = &summary.bundles[0];
    assert!(bundle.starts_with(ws.output().join("new").join("logic_bugs")));
    let reduced = fs::read_to_string(bundle.join("reduced_test.sql")).expect("reduced");
    assert_eq!(reduced.trim(), "SELECT id FROM users");
}

#[test]
fn row_order_without_order_by_is_not_a_bug() {
    let ws = Workspace::new();
    let row = |v: &str| vec![v.to_string()];
    let primary = engine("new", move |_: &str, _: &mut Vec<String>| {
        Ok(vec![row("alice"), row("bob")])
    });
    let reference = engine("old", move |_: &str, _: &mut Vec<String>| {
        Ok(vec![row("bob"), row("alice")])
    });
    let fuzzer = ws
        .fuzzer(options(4, 1), primary, reference)
        .with_seed_queries(vec!["SELECT name FROM users".to_string()]);
    let summary = fuzzer.run().expect("run");

    assert_eq!(summary.bugs_found(), 0);
    assert_eq!(summary.normal.get("agreed"), Some(&1));
    assert!(summary.bundles.is_empty());
}

#[test]
fn interrupt_stops_before_the_budget() {
    let ws = Workspace::new();
    let fuzzer = ws.fuzzer(options(9, 100), agreeing_engine("a"), agreeing_engine("b"));
    let stop = fuzzer.stop_handle();
    let summary = fuzzer
        .run_with(|record| {
            if record.index == 4 {
                stop.store(true, Ordering::SeqCst);
            }
        })
        .expect("run");
    assert_eq!(summary.trials_run, 5);
    assert!(summary.interrupted);
}

#[test]
fn threaded_runs_account_for_every_trial() {
    let ws = Workspace::new();
    let mut opts = options(11, 64);
    opts.threads = 4;
    let fuzzer = ws.fuzzer(opts, agreeing_engine("a"), agreeing_engine("b"));
    let summary = fuzzer.run().expect("run");
    assert_eq!(summary.trials_run, 64);
    assert_eq!(summary.accounted(), 64);
    let corpus = fuzzer.corpus().read();
    assert_eq!(corpus.len() as u64, summary.admitted);
}

#[test]
fn stats_are_written_when_requested() {
    let ws = Workspace::new();
    let mut opts = options(6, 12);
    opts.grammar_coverage = true;
    opts.stats_path = Some(ws.output().join("stats.json"));
    let fuzzer = ws.fuzzer(opts, agreeing_engine("a"), agreeing_engine("b"));
    let summary = fuzzer.run().expect("run");

    let text = fs::read_to_string(ws.output().join("stats.json")).expect("stats");
    let stats: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(stats["trials_run"], 12);
    assert!(summary.grammar_rules_covered > 0);
    assert!(summary.grammar_coverage_percent > 0.0);
}

#[cfg(unix)]
#[test]
fn hangs_are_filed_apart_from_crashes() {
    use sqldrift_core::executor::{CommandEngine, CommandEngineConfig};
    use std::time::Duration;

    let ws = Workspace::new();
    let script = ws.dir.path().join("hang.sh");
    fs::write(&script, "cat > /dev/null\nsleep 10\n").expect("write script");
    let mut config = CommandEngineConfig::new(
        vec!["/bin/sh".to_string(), script.display().to_string(), "{db}".to_string()],
        "3.45.0",
    );
    config.timeout = Duration::from_millis(300);
    let mut opts = options(1, 1);
    opts.reduce = false;
    let fuzzer = ws
        .fuzzer(opts, Arc::new(CommandEngine::new(config)), agreeing_engine("3.39.0"))
        .with_seed_queries(vec![
            "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT x FROM c"
                .to_string(),
        ]);
    let verdicts = Mutex::new(Vec::new());
    let summary = fuzzer
        .run_with(|record| verdicts.lock().expect("lock").push(record.verdict))
        .expect("run");

    assert_eq!(verdicts.into_inner().expect("lock"), vec![Some(VerdictKind::Hang)]);
    assert_eq!(summary.bugs.get("hang"), Some(&1));
    assert_eq!(summary.bugs.get("crash"), None);
    let bundle = &summary.bundles[0];
    assert!(bundle.starts_with(ws.output().join("3.45.0").join("hangs")));
    assert!(!ws.output().join("3.45.0").join("crashes").exists());
}

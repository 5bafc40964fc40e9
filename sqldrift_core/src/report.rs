use crate::executor::{DifferentialOutcome, ExecutionOutcome};
use crate::input::Candidate;
use crate::oracle::VerdictKind;
use chrono::{DateTime, Local};
use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Files of a reproducer bundle.
pub const README_FILE: &str = "README.md";
pub const ORIGINAL_QUERY_FILE: &str = "original_test.sql";
pub const REDUCED_QUERY_FILE: &str = "reduced_test.sql";
pub const DATABASE_FILE: &str = "test.db";
pub const VERSION_FILE: &str = "version.txt";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";
const STAGING_PREFIX: &str = ".staging-";
const MAX_NAME_COLLISIONS: usize = 1000;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write bundle file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("A {kind} report cannot be filed, it is not a bug")]
    NotABug { kind: VerdictKind },
    #[error("Could not find a free bundle name for {0:?}")]
    NameExhausted(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> ReportError + '_ {
    move |source| ReportError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A bug bound to the exact database snapshot it was found on.
#[derive(Debug, Clone)]
pub struct BugReport {
    pub kind: VerdictKind,
    pub detail: String,
    pub original: Candidate,
    pub reduced: Candidate,
    /// The snapshot the triggering execution ran against.
    pub snapshot: PathBuf,
    pub engine_version: String,
    pub reference_version: String,
    pub timestamp: DateTime<Local>,
    pub outcome: DifferentialOutcome,
}

impl BugReport {
    /// MD5 of the reduced query text, used to recognise duplicates across bundles.
    pub fn fingerprint(&self) -> String {
        format!("{:x}", md5::compute(self.reduced.sql().as_bytes()))
    }

    /// Directory name of the bundle: kind, engine version and timestamp.
    pub fn bundle_name(&self) -> String {
        format!(
            "{}_{}_{}",
            self.kind.label(),
            path_component(&self.engine_version),
            self.timestamp.format(TIMESTAMP_FORMAT)
        )
    }

    /// The human-readable description stored as the bundle's README.
    pub fn describe(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BugReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let provenance = self.original.provenance();
        writeln!(f, "# {} in {}\n", title(self.kind), self.engine_version)?;
        writeln!(f, "- Kind: {}", self.kind)?;
        writeln!(f, "- Engine version: {}", self.engine_version)?;
        writeln!(f, "- Reference version: {}", self.reference_version)?;
        writeln!(f, "- Found: {}", self.timestamp.to_rfc3339())?;
        writeln!(f, "- Fingerprint: {}", self.fingerprint())?;
        writeln!(f, "- Origin: {}", provenance.origin)?;
        writeln!(f, "- Seed: {} (trial stream {})", provenance.seed, provenance.stream)?;
        if let Some(parent) = provenance.parent {
            writeln!(f, "- Parent corpus entry: {parent}")?;
        }
        if !provenance.operators.is_empty() {
            writeln!(f, "- Mutation operators: {}", provenance.operators.join(", "))?;
        }
        writeln!(f, "\n## Description\n\n{}\n", self.detail)?;
        writeln!(f, "## Reduced query\n\n```sql\n{}\n```\n", self.reduced.sql())?;
        writeln!(f, "## Original query\n\n```sql\n{}\n```\n", self.original.sql())?;
        describe_outcome(f, "Primary engine", &self.outcome.primary)?;
        match &self.outcome.reference {
            Some(reference) => describe_outcome(f, "Reference engine", reference)?,
            None => writeln!(f, "## Reference engine\n\nNot run.\n")?,
        }
        writeln!(f, "## Reproduce\n")?;
        writeln!(
            f,
            "Run `{REDUCED_QUERY_FILE}` against a copy of `{DATABASE_FILE}` \
             with both engine versions."
        )
    }
}

fn title(kind: VerdictKind) -> &'static str {
    match kind {
        VerdictKind::Crash => "Crash",
        VerdictKind::Hang => "Hang",
        VerdictKind::ReferenceError => "Reference engine failure",
        VerdictKind::LogicBug => "Logic bug",
        VerdictKind::Normal => "Normal execution",
    }
}

fn describe_outcome(
    f: &mut fmt::Formatter<'_>,
    heading: &str,
    outcome: &ExecutionOutcome,
) -> fmt::Result {
    writeln!(f, "## {heading} ({})\n", outcome.engine_version)?;
    writeln!(f, "- Status: {}", outcome.status)?;
    writeln!(f, "- Elapsed: {} ms", outcome.elapsed.as_millis())?;
    if let Some(rows) = &outcome.rows {
        writeln!(f, "- Rows: {}", rows.len())?;
    }
    if let Some(error) = &outcome.error {
        writeln!(f, "- Error: {error}")?;
    }
    writeln!(f)
}

fn name_taken(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::AlreadyExists | ErrorKind::DirectoryNotEmpty)
}

/// Replaces characters that do not belong in a directory name.
fn path_component(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Persists bug reports as reproducer bundles.
///
/// Layout: `<root>/<engine version>/<category>/<kind>_<version>_<timestamp>/`,
/// with category one of `crashes`, `hangs`, `logic_bugs`, `reference_errors`.
/// A bundle is assembled in a hidden staging directory next to the categories
/// and renamed into place, so a reader either sees a complete bundle or none.
#[derive(Debug, Clone)]
pub struct ReportSink {
    root: PathBuf,
}

impl ReportSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes `report` as a bundle.
    ///
    /// # Returns
    /// The final bundle directory.
    pub fn write(&self, report: &BugReport) -> Result<PathBuf, ReportError> {
        if !report.kind.is_bug() {
            return Err(ReportError::NotABug { kind: report.kind });
        }
        let version_dir = self.root.join(path_component(&report.engine_version));
        let category_dir = version_dir.join(report.kind.category_dir());
        fs::create_dir_all(&category_dir).map_err(io_error(&category_dir))?;

        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&version_dir)
            .map_err(io_error(&version_dir))?;
        let files = [
            (README_FILE, report.describe()),
            (ORIGINAL_QUERY_FILE, format!("{}\n", report.original.sql())),
            (REDUCED_QUERY_FILE, format!("{}\n", report.reduced.sql())),
            (VERSION_FILE, format!("{}\n", report.engine_version)),
        ];
        for (name, content) in files {
            let path = staging.path().join(name);
            fs::write(&path, content).map_err(io_error(&path))?;
        }
        let db_path = staging.path().join(DATABASE_FILE);
        fs::copy(&report.snapshot, &db_path).map_err(io_error(&report.snapshot))?;

        let base = report.bundle_name();
        for attempt in 0..MAX_NAME_COLLISIONS {
            let name = if attempt == 0 {
                base.clone()
            } else {
                format!("{base}_{attempt}")
            };
            let target = category_dir.join(&name);
            if target.exists() {
                continue;
            }
            match fs::rename(staging.path(), &target) {
                Ok(()) => {
                    info!(kind = %report.kind, bundle = %target.display(), "Bug report written");
                    return Ok(target);
                }
                // Another writer claimed the name between the check and the rename.
                Err(e) if name_taken(&e) => continue,
                Err(e) => return Err(io_error(&target)(e)),
            }
        }
        Err(ReportError::NameExhausted(category_dir.join(base)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::EngineStatus;
    use crate::rng::RngContext;
    use chrono::TimeZone;
    use std::time::Duration;

    fn outcome(version: &str, status: EngineStatus) -> ExecutionOutcome {
        ExecutionOutcome {
            engine_version: version.to_string(),
            crashed: !matches!(status, EngineStatus::Exited(0) | EngineStatus::TimedOut),
            timed_out: status == EngineStatus::TimedOut,
            status,
            rows: None,
            error: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::from_millis(12),
            coverage: Vec::new(),
        }
    }

    fn report(kind: VerdictKind, snapshot: PathBuf) -> BugReport {
        let mut rng = RngContext::new(1, 7);
        let original =
            Candidate::seed("SELECT name, age FROM users WHERE age > 30".to_string(), 0, &mut rng);
        let reduced =
            Candidate::reduced(&original, "SELECT age FROM users WHERE age > 30".to_string());
        BugReport {
            kind,
            detail: "Primary engine terminated by signal 11".to_string(),
            original,
            reduced,
            snapshot,
            engine_version: "3.45.0".to_string(),
            reference_version: "3.39.4".to_string(),
            timestamp: Local
                .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
                .single()
                .expect("valid timestamp"),
            outcome: DifferentialOutcome {
                primary: outcome("3.45.0", EngineStatus::Signaled(11)),
                reference: None,
            },
        }
    }

    fn snapshot(dir: &Path) -> PathBuf {
        let path = dir.join("seed.db");
        fs::write(&path, b"database-bytes").expect("write snapshot");
        path
    }

    #[test]
    fn writes_complete_bundle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = ReportSink::new(dir.path().join("out"));
        let report = report(VerdictKind::Crash, snapshot(dir.path()));
        let bundle = sink.write(&report).expect("write bundle");

        assert_eq!(
            bundle,
            dir.path()
                .join("out/3.45.0/crashes/crash_3.45.0_20240309_140507_000000")
        );
        let files = [
            README_FILE,
            ORIGINAL_QUERY_FILE,
            REDUCED_QUERY_FILE,
            DATABASE_FILE,
            VERSION_FILE,
        ];
        for file in files {
            assert!(bundle.join(file).is_file(), "missing {file}");
        }
        assert_eq!(fs::read(bundle.join(DATABASE_FILE)).expect("read db"), b"database-bytes");
        assert_eq!(
            fs::read_to_string(bundle.join(REDUCED_QUERY_FILE)).expect("read reduced"),
            "SELECT age FROM users WHERE age > 30\n"
        );
        assert_eq!(
            fs::read_to_string(bundle.join(VERSION_FILE)).expect("read version"),
            "3.45.0\n"
        );
        let readme = fs::read_to_string(bundle.join(README_FILE)).expect("read readme");
        assert!(readme.contains("signal 11"));
        assert!(readme.contains(&report.fingerprint()));
    }

    #[test]
    fn description_lists_sections_in_reading_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let text = report(VerdictKind::Crash, snapshot(dir.path())).describe();

        assert!(text.starts_with("# Crash in 3.45.0\n\n- Kind: "));
        let headings: Vec<&str> = text.lines().filter(|line| line.starts_with("## ")).collect();
        assert_eq!(
            headings,
            vec![
                "## Description",
                "## Reduced query",
                "## Original query",
                "## Primary engine (3.45.0)",
                "## Reference engine",
                "## Reproduce",
            ]
        );
        assert!(text.contains("```sql\nSELECT age FROM users WHERE age > 30\n```"));
        assert!(text.contains("- Elapsed: 12 ms\n"));
        assert!(text.contains("## Reference engine\n\nNot run.\n"));
        assert!(text.ends_with("with both engine versions.\n"));
    }

    #[test]
    fn leaves_no_staging_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = ReportSink::new(dir.path());
        sink.write(&report(VerdictKind::LogicBug, snapshot(dir.path())))
            .expect("write bundle");
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("3.45.0"))
            .expect("read version dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(STAGING_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
        assert!(dir.path().join("3.45.0/logic_bugs").is_dir());
    }

    #[test]
    fn same_timestamp_gets_distinct_bundles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = ReportSink::new(dir.path());
        let report = report(VerdictKind::Hang, snapshot(dir.path()));
        let first = sink.write(&report).expect("first");
        let second = sink.write(&report).expect("second");
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_1"));
        assert_eq!(first.parent(), Some(dir.path().join("3.45.0/hangs").as_path()));
    }

    #[test]
    fn failed_bundle_is_not_visible() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = ReportSink::new(dir.path());
        let report = report(VerdictKind::Crash, dir.path().join("missing.db"));
        assert!(matches!(sink.write(&report), Err(ReportError::Io { .. })));
        let crashes = fs::read_dir(dir.path().join("3.45.0/crashes")).expect("read crashes");
        assert_eq!(crashes.count(), 0);
    }

    #[test]
    fn normal_verdicts_are_not_filed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = ReportSink::new(dir.path());
        let report = report(VerdictKind::Normal, snapshot(dir.path()));
        assert!(matches!(sink.write(&report), Err(ReportError::NotABug { .. })));
    }

    #[test]
    fn versions_are_sanitised_for_paths() {
        assert_eq!(path_component("3.45.0 (debug)/x"), "3.45.0__debug__x");
        assert_eq!(path_component(".."), "unknown");
    }
}

use crate::observer::{CoverageProbe, ProbeError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// One result row, one string per column, as the engine printed it.
pub type Row = Vec<String>;

/// Name of the private snapshot copy inside an execution's working directory.
pub const DATABASE_FILE_NAME: &str = "test.db";
/// Name of the query file for file delivery.
pub const QUERY_FILE_NAME: &str = "query.sql";

const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Minimum time allowed for output pipes to close once the engine has exited.
const PIPE_GRACE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Engine command is empty")]
    EmptyCommand,
    #[error("Failed to prepare working directory: {0}")]
    Workspace(#[source] io::Error),
    #[error("Failed to copy database snapshot {path}: {source}")]
    Snapshot {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Error waiting for engine process: {0}")]
    Wait(#[source] io::Error),
    #[error("Coverage probe '{probe}' failed: {source}")]
    Probe {
        probe: &'static str,
        #[source]
        source: ProbeError,
    },
    #[error("Execution cancelled")]
    Cancelled,
}

/// How the query reaches the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputDelivery {
    /// Written to the engine's standard input.
    #[default]
    StdIn,
    /// Written to `query.sql` in the working directory; `{query}` in the
    /// command is replaced with its path.
    File,
}

/// How an engine run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineStatus {
    Exited(i32),
    Signaled(i32),
    /// An in-process engine panicked.
    Panicked(String),
    TimedOut,
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineStatus::Exited(code) => write!(f, "exited with code {code}"),
            EngineStatus::Signaled(signal) => write!(f, "terminated by signal {signal}"),
            EngineStatus::Panicked(msg) => write!(f, "panicked: {msg}"),
            EngineStatus::TimedOut => f.write_str("timed out"),
        }
    }
}

/// What one engine did with one query.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub engine_version: String,
    pub status: EngineStatus,
    /// The engine terminated abnormally: a signal, a panic or an exit code
    /// outside the accepted set.
    pub crashed: bool,
    pub timed_out: bool,
    /// Result rows; `None` when the engine reported an error, crashed or timed out.
    pub rows: Option<Vec<Row>>,
    /// SQL error text reported by the engine.
    pub error: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    /// Covered units in report order, empty unless a probe is attached.
    #[serde(skip)]
    pub coverage: Vec<String>,
}

impl ExecutionOutcome {
    /// The engine ran to completion, whether it returned rows or an error.
    pub fn completed(&self) -> bool {
        !self.crashed && !self.timed_out
    }
}

/// A query execution against one engine.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub sql: &'a str,
    /// The database snapshot; engines work on a private copy.
    pub snapshot: &'a Path,
    /// Set from outside to abandon the execution.
    pub cancel: &'a AtomicBool,
}

/// A database engine the fuzzer can run queries against.
pub trait Engine: Send + Sync {
    fn version(&self) -> &str;

    /// Runs one query to completion, timeout, or cancellation.
    ///
    /// # Returns
    /// The outcome of the run. Engine faults and timeouts are outcomes, not
    /// errors; `Err` means the run could not take place or was cancelled.
    fn execute(&self, request: &ExecutionRequest<'_>) -> Result<ExecutionOutcome, ExecutionError>;
}

#[derive(Debug, Clone)]
pub struct CommandEngineConfig {
    /// Program and arguments. `{db}` is replaced with the private snapshot
    /// copy and `{query}` with the query file (file delivery only).
    pub command: Vec<String>,
    pub version: String,
    pub input_delivery: InputDelivery,
    pub timeout: Duration,
    /// Exit codes of a normal completion; an SQL error usually exits with 1.
    pub ok_exit_codes: Vec<i32>,
    pub wrap_in_transaction: bool,
    /// Column separator in the engine's row output.
    pub column_separator: String,
}

impl CommandEngineConfig {
    pub fn new(command: Vec<String>, version: impl Into<String>) -> Self {
        Self {
            command,
            version: version.into(),
            input_delivery: InputDelivery::StdIn,
            timeout: Duration::from_secs(5),
            ok_exit_codes: vec![0, 1],
            wrap_in_transaction: true,
            column_separator: "|".to_string(),
        }
    }
}

/// Wraps a query so the engine never commits to its snapshot copy.
pub fn wrap_in_transaction(sql: &str) -> String {
    format!("BEGIN TRANSACTION;\n{sql}\n;\nROLLBACK;\n")
}

/// Kills and reaps the child on every exit path that did not wait for it.
struct ChildGuard {
    child: Option<Child>,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self { child: Some(child) }
    }

    fn get(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!("Failed to kill engine process: {e}");
            }
            let _ = child.wait();
        }
    }

    fn release(&mut self) {
        self.child = None;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

/// Joins a pipe thread unless it is still running at `deadline`.
///
/// A background process started by the engine can hold a pipe open after the
/// engine itself exits. The thread is then left detached and `None` returned.
fn join_by<T>(handle: JoinHandle<T>, deadline: Instant) -> Option<T> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(POLL_INTERVAL);
    }
    handle.join().ok()
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>, deadline: Instant) -> Option<String> {
    match handle {
        Some(handle) => {
            join_by(handle, deadline).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        }
        None => Some(String::new()),
    }
}

/// Splits engine output into rows.
pub fn parse_rows(stdout: &str, separator: &str) -> Vec<Row> {
    stdout
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(|line| {
            if separator.is_empty() {
                vec![line.to_string()]
            } else {
                line.split(separator).map(str::to_string).collect()
            }
        })
        .collect()
}

/// An engine binary run as an external process, once per query.
///
/// Every execution gets a fresh temporary directory holding a private copy of
/// the snapshot. The directory and the process are released on every path,
/// including timeout, cancellation and panics unwinding through the trial.
pub struct CommandEngine {
    config: CommandEngineConfig,
    probe: Option<Arc<dyn CoverageProbe>>,
}

impl CommandEngine {
    pub fn new(config: CommandEngineConfig) -> Self {
        Self { config, probe: None }
    }

    pub fn with_probe(mut self, probe: Arc<dyn CoverageProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn config(&self) -> &CommandEngineConfig {
        &self.config
    }

    fn build_command(&self, workdir: &Path) -> Result<Command, ExecutionError> {
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or(ExecutionError::EmptyCommand)?;
        let db = workdir.join(DATABASE_FILE_NAME);
        let query = workdir.join(QUERY_FILE_NAME);
        let substitute = |arg: &str| {
            arg.replace("{db}", &db.to_string_lossy())
                .replace("{query}", &query.to_string_lossy())
        };
        let mut cmd = Command::new(substitute(program));
        cmd.args(args.iter().map(|a| substitute(a)));
        cmd.current_dir(workdir);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(match self.config.input_delivery {
            InputDelivery::StdIn => Stdio::piped(),
            InputDelivery::File => Stdio::null(),
        });
        Ok(cmd)
    }

    fn classify(&self, status: ExitStatus) -> EngineStatus {
        if let Some(code) = status.code() {
            return EngineStatus::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return EngineStatus::Signaled(signal);
            }
        }
        EngineStatus::Exited(-1)
    }

    fn timed_out(&self, elapsed: Duration) -> ExecutionOutcome {
        ExecutionOutcome {
            engine_version: self.config.version.clone(),
            status: EngineStatus::TimedOut,
            crashed: false,
            timed_out: true,
            rows: None,
            error: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed,
            coverage: Vec::new(),
        }
    }
}

impl Engine for CommandEngine {
    fn version(&self) -> &str {
        &self.config.version
    }

    fn execute(&self, request: &ExecutionRequest<'_>) -> Result<ExecutionOutcome, ExecutionError> {
        let workdir = tempfile::Builder::new()
            .prefix("sqldrift-exec-")
            .tempdir()
            .map_err(ExecutionError::Workspace)?;
        fs::copy(request.snapshot, workdir.path().join(DATABASE_FILE_NAME)).map_err(|source| {
            ExecutionError::Snapshot {
                path: request.snapshot.display().to_string(),
                source,
            }
        })?;

        let script = if self.config.wrap_in_transaction {
            wrap_in_transaction(request.sql)
        } else {
            format!("{}\n", request.sql)
        };
        if self.config.input_delivery == InputDelivery::File {
            fs::write(workdir.path().join(QUERY_FILE_NAME), &script)
                .map_err(ExecutionError::Workspace)?;
        }

        let mut cmd = self.build_command(workdir.path())?;
        if let Some(probe) = &self.probe {
            probe
                .pre_exec(workdir.path(), &mut cmd)
                .map_err(|source| ExecutionError::Probe {
                    probe: probe.name(),
                    source,
                })?;
        }

        let start = Instant::now();
        let child = cmd.spawn().map_err(|source| ExecutionError::Spawn {
            command: self.config.command.join(" "),
            source,
        })?;
        let mut guard = ChildGuard::new(child);
        let (stdin, stdout, stderr) = match guard.get() {
            Some(child) => (child.stdin.take(), child.stdout.take(), child.stderr.take()),
            None => (None, None, None),
        };
        // The engine may stop reading early; a broken pipe is not a delivery failure.
        let writer = stdin.map(|mut stdin| {
            let script = script.clone();
            thread::spawn(move || {
                let _ = stdin.write_all(script.as_bytes());
            })
        });
        let stdout = drain(stdout);
        let stderr = drain(stderr);

        let status = loop {
            if request.cancel.load(Ordering::Relaxed) {
                guard.kill();
                return Err(ExecutionError::Cancelled);
            }
            let Some(child) = guard.get() else {
                return Err(ExecutionError::Cancelled);
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    guard.release();
                    break Some(status);
                }
                Ok(None) if start.elapsed() > self.config.timeout => {
                    warn!(
                        engine = %self.config.version,
                        timeout_ms = self.config.timeout.as_millis() as u64,
                        "Engine timed out, killing"
                    );
                    guard.kill();
                    break None;
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(ExecutionError::Wait(e)),
            }
        };
        let elapsed = start.elapsed();

        let Some(status) = status else {
            // Readers may be held open by orphaned grandchildren; they are left detached.
            return Ok(self.timed_out(elapsed));
        };

        let deadline = (start + self.config.timeout).max(Instant::now() + PIPE_GRACE);
        if let Some(writer) = writer {
            let _ = join_by(writer, deadline);
        }
        let collected = (collect(stdout, deadline), collect(stderr, deadline));
        let (Some(stdout), Some(stderr)) = collected else {
            warn!(
                engine = %self.config.version,
                "Engine exited but its output stayed open past the timeout"
            );
            return Ok(self.timed_out(start.elapsed()));
        };
        let status = self.classify(status);
        let crashed = match &status {
            EngineStatus::Exited(code) => !self.config.ok_exit_codes.contains(code),
            _ => true,
        };

        let coverage = match &self.probe {
            Some(probe) => probe
                .post_exec(workdir.path())
                .map_err(|source| ExecutionError::Probe {
                    probe: probe.name(),
                    source,
                })?,
            None => Vec::new(),
        };

        let error = (!stderr.trim().is_empty()).then(|| stderr.trim().to_string());
        let rows = (!crashed && error.is_none())
            .then(|| parse_rows(&stdout, &self.config.column_separator));
        debug!(
            engine = %self.config.version,
            %status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Engine run finished"
        );
        Ok(ExecutionOutcome {
            engine_version: self.config.version.clone(),
            status,
            crashed,
            timed_out: false,
            rows,
            error,
            stdout,
            stderr,
            elapsed,
            coverage,
        })
    }
}

/// An engine implemented as a Rust closure, for tests and embedding.
///
/// The harness receives the query text and a sink for covered units. A panic
/// inside the harness is caught and reported as a crash.
pub struct InProcessEngine<F>
where
    F: Fn(&str, &mut Vec<String>) -> Result<Vec<Row>, String> + Send + Sync,
{
    version: String,
    harness_fn: F,
}

impl<F> InProcessEngine<F>
where
    F: Fn(&str, &mut Vec<String>) -> Result<Vec<Row>, String> + Send + Sync,
{
    pub fn new(version: impl Into<String>, harness_fn: F) -> Self {
        Self {
            version: version.into(),
            harness_fn,
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

impl<F> Engine for InProcessEngine<F>
where
    F: Fn(&str, &mut Vec<String>) -> Result<Vec<Row>, String> + Send + Sync,
{
    fn version(&self) -> &str {
        &self.version
    }

    fn execute(&self, request: &ExecutionRequest<'_>) -> Result<ExecutionOutcome, ExecutionError> {
        if request.cancel.load(Ordering::Relaxed) {
            return Err(ExecutionError::Cancelled);
        }
        let start = Instant::now();
        let mut coverage = Vec::new();
        let result =
            catch_unwind(AssertUnwindSafe(|| (self.harness_fn)(request.sql, &mut coverage)));
        let elapsed = start.elapsed();
        let mut outcome = ExecutionOutcome {
            engine_version: self.version.clone(),
            status: EngineStatus::Exited(0),
            crashed: false,
            timed_out: false,
            rows: None,
            error: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed,
            coverage,
        };
        match result {
            Ok(Ok(rows)) => outcome.rows = Some(rows),
            Ok(Err(message)) => {
                outcome.status = EngineStatus::Exited(1);
                outcome.stderr = message.clone();
                outcome.error = Some(message);
            }
            Err(payload) => {
                outcome.status = EngineStatus::Panicked(panic_message(payload.as_ref()));
                outcome.crashed = true;
            }
        }
        Ok(outcome)
    }
}

/// Outcomes of running one candidate on both engines.
#[derive(Debug, Clone, Serialize)]
pub struct DifferentialOutcome {
    pub primary: ExecutionOutcome,
    /// `None` when the primary's outcome made the reference run pointless.
    pub reference: Option<ExecutionOutcome>,
}

/// Runs candidates on the primary engine, then on the reference engine.
///
/// A primary hang is a verdict on its own, so the reference is skipped. A
/// primary crash skips it too unless crash confirmation is enabled, in which
/// case a reference crash on the same input turns the crash into a shared
/// failure.
#[derive(Clone)]
pub struct DifferentialExecutor {
    primary: Arc<dyn Engine>,
    reference: Arc<dyn Engine>,
    confirm_crash_with_reference: bool,
}

impl DifferentialExecutor {
    pub fn new(primary: Arc<dyn Engine>, reference: Arc<dyn Engine>) -> Self {
        Self {
            primary,
            reference,
            confirm_crash_with_reference: false,
        }
    }

    pub fn confirm_crash_with_reference(mut self, confirm: bool) -> Self {
        self.confirm_crash_with_reference = confirm;
        self
    }

    pub fn primary(&self) -> &dyn Engine {
        self.primary.as_ref()
    }

    pub fn reference(&self) -> &dyn Engine {
        self.reference.as_ref()
    }

    pub fn run(
        &self,
        sql: &str,
        snapshot: &Path,
        cancel: &AtomicBool,
    ) -> Result<DifferentialOutcome, ExecutionError> {
        let request = ExecutionRequest { sql, snapshot, cancel };
        let primary = self.primary.execute(&request)?;
        let skip_reference =
            primary.timed_out || (primary.crashed && !self.confirm_crash_with_reference);
        let reference = if skip_reference {
            None
        } else {
            Some(self.reference.execute(&request)?)
        };
        Ok(DifferentialOutcome { primary, reference })
    }
}

#[cfg(test)]
mod in_process_engine_tests {
    use super::*;

    fn request<'a>(sql: &'a str, cancel: &'a AtomicBool) -> ExecutionRequest<'a> {
        ExecutionRequest {
            sql,
            snapshot: Path::new("unused.db"),
            cancel,
        }
    }

    fn harness(sql: &str, coverage: &mut Vec<String>) -> Result<Vec<Row>, String> {
        coverage.push("parse".to_string());
        if sql.contains("boom") {
            panic!("Boom!");
        }
        if sql.contains("bad") {
            return Err("Error: near \"bad\": syntax error".to_string());
        }
        Ok(vec![vec!["1".to_string()]])
    }

    #[test]
    fn in_process_engine_returns_rows_and_coverage() {
        let engine = InProcessEngine::new("test-1", harness);
        let cancel = AtomicBool::new(false);
        let outcome = engine.execute(&request("SELECT 1", &cancel)).expect("execute");
        assert!(outcome.completed());
        assert_eq!(outcome.rows, Some(vec![vec!["1".to_string()]]));
        assert_eq!(outcome.coverage, vec!["parse".to_string()]);
    }

    #[test]
    fn in_process_engine_catches_panic() {
        let engine = InProcessEngine::new("test-1", harness);
        let cancel = AtomicBool::new(false);
        let outcome = engine.execute(&request("SELECT boom", &cancel)).expect("execute");
        assert!(outcome.crashed);
        assert!(outcome.rows.is_none());
        match outcome.status {
            EngineStatus::Panicked(msg) => assert!(msg.contains("Boom!")),
            other => panic!("Expected a panic status, got {other:?}"),
        }
    }

    #[test]
    fn in_process_engine_reports_sql_errors() {
        let engine = InProcessEngine::new("test-1", harness);
        let cancel = AtomicBool::new(false);
        let outcome = engine.execute(&request("SELECT bad", &cancel)).expect("execute");
        assert!(outcome.completed());
        assert!(outcome.rows.is_none());
        assert!(outcome.error.as_deref().is_some_and(|e| e.contains("syntax error")));
    }

    #[test]
    fn differential_skips_reference_after_primary_crash() {
        let primary: Arc<dyn Engine> = Arc::new(InProcessEngine::new("p", harness));
        let reference: Arc<dyn Engine> = Arc::new(InProcessEngine::new("r", harness));
        let cancel = AtomicBool::new(false);

        let executor = DifferentialExecutor::new(primary.clone(), reference.clone());
        let outcome = executor.run("SELECT boom", Path::new("x"), &cancel).expect("run");
        assert!(outcome.reference.is_none());

        let confirming =
            DifferentialExecutor::new(primary, reference).confirm_crash_with_reference(true);
        let outcome = confirming.run("SELECT boom", Path::new("x"), &cancel).expect("run");
        assert!(outcome.reference.is_some_and(|r| r.crashed));
    }

    #[test]
    fn cancelled_requests_do_not_run() {
        let engine = InProcessEngine::new("test-1", harness);
        let cancel = AtomicBool::new(true);
        assert!(matches!(
            engine.execute(&request("SELECT 1", &cancel)),
            Err(ExecutionError::Cancelled)
        ));
    }

    #[test]
    fn rows_split_on_separator() {
        let rows = parse_rows("1|alice\r\n\n2|\n", "|");
        assert_eq!(
            rows,
            vec![
                vec!["1".to_string(), "alice".to_string()],
                vec!["2".to_string(), String::new()],
            ]
        );
    }
}

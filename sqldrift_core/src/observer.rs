use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Coverage probe I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Coverage tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },
}

/// A `CoverageProbe` collects the code units the primary engine covered
/// while executing one candidate.
///
/// Probes are shared across concurrent trials, so they hold no per-execution
/// state of their own: everything an execution produces lives in the private
/// working directory the executor hands to both hooks.
pub trait CoverageProbe: Send + Sync {
    /// Returns a static name identifying the probe in logs.
    fn name(&self) -> &'static str;

    /// Called before the engine process is spawned.
    ///
    /// This is where a probe resets counters and wires the engine's command
    /// (environment variables, arguments) to report into `workdir`.
    ///
    /// # Arguments
    /// * `workdir`: The execution's private working directory.
    /// * `command`: The engine command about to be spawned.
    fn pre_exec(&self, workdir: &Path, command: &mut Command) -> Result<(), ProbeError>;

    /// Called after the engine process has exited (or was killed).
    ///
    /// # Returns
    /// The covered units in the order the engine reported them. The order only
    /// matters for path granularity.
    fn post_exec(&self, workdir: &Path) -> Result<Vec<String>, ProbeError>;
}

/// Collects no coverage. Every signature is empty, so nothing is admitted.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoCoverageProbe;

impl CoverageProbe for NoCoverageProbe {
    fn name(&self) -> &'static str {
        "none"
    }

    fn pre_exec(&self, _workdir: &Path, _command: &mut Command) -> Result<(), ProbeError> {
        Ok(())
    }

    fn post_exec(&self, _workdir: &Path) -> Result<Vec<String>, ProbeError> {
        Ok(Vec::new())
    }
}

/// Coverage reported by an instrumented engine through a trace file.
///
/// The engine is told where to write through an environment variable; it
/// writes one unit identifier per line, in execution order. A missing file
/// (for instance because the engine crashed before flushing) yields an empty
/// trace rather than an error.
#[derive(Debug, Clone)]
pub struct TraceFileProbe {
    env_var: String,
    file_name: String,
}

impl TraceFileProbe {
    pub fn new(env_var: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            env_var: env_var.into(),
            file_name: file_name.into(),
        }
    }

    fn trace_path(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.file_name)
    }
}

impl CoverageProbe for TraceFileProbe {
    fn name(&self) -> &'static str {
        "trace-file"
    }

    fn pre_exec(&self, workdir: &Path, command: &mut Command) -> Result<(), ProbeError> {
        let path = self.trace_path(workdir);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        command.env(&self.env_var, path);
        Ok(())
    }

    fn post_exec(&self, workdir: &Path) -> Result<Vec<String>, ProbeError> {
        let text = match fs::read_to_string(self.trace_path(workdir)) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Line coverage of a gcov-instrumented engine build.
///
/// gcov counters are process-external state in the object directory, so this
/// probe only works with one trial in flight at a time.
#[derive(Debug, Clone)]
pub struct GcovProbe {
    object_dir: PathBuf,
    source: PathBuf,
    gcov_binary: PathBuf,
}

impl GcovProbe {
    pub fn new(object_dir: PathBuf, source: PathBuf, gcov_binary: PathBuf) -> Self {
        Self {
            object_dir,
            source,
            gcov_binary,
        }
    }

    fn clear_counters(&self) -> Result<(), ProbeError> {
        for entry in fs::read_dir(&self.object_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "gcda") {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// Executed lines of a `.gcov` report as `file:line` units.
///
/// Each report line is `count:line:source`. A count of `-` marks a
/// non-executable line; `#####` and `=====` mark lines that never ran.
pub fn parse_gcov_report(file: &str, report: &str) -> Vec<String> {
    let mut units = Vec::new();
    for line in report.lines() {
        let mut parts = line.splitn(3, ':');
        let (Some(count), Some(number)) = (parts.next(), parts.next()) else {
            continue;
        };
        let count = count.trim().trim_end_matches('*');
        if count.is_empty() || count == "-" || count.starts_with('#') || count.starts_with('=') {
            continue;
        }
        let executed = count.parse::<u64>().map(|c| c > 0).unwrap_or(false);
        let Ok(number) = number.trim().parse::<u64>() else {
            continue;
        };
        if executed && number > 0 {
            units.push(format!("{file}:{number}"));
        }
    }
    units
}

impl CoverageProbe for GcovProbe {
    fn name(&self) -> &'static str {
        "gcov"
    }

    fn pre_exec(&self, _workdir: &Path, _command: &mut Command) -> Result<(), ProbeError> {
        self.clear_counters()
    }

    fn post_exec(&self, workdir: &Path) -> Result<Vec<String>, ProbeError> {
        let output = Command::new(&self.gcov_binary)
            .arg("-o")
            .arg(&self.object_dir)
            .arg(&self.source)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(ProbeError::ToolFailed {
                tool: self.gcov_binary.display().to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let mut units = Vec::new();
        for entry in fs::read_dir(workdir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "gcov") {
                continue;
            }
            let file = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let report = fs::read_to_string(&path)?;
            units.extend(parse_gcov_report(&file, &report));
        }
        units.sort();
        debug!(units = units.len(), "gcov report collected");
        Ok(units)
    }
}

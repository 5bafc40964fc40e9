use crate::executor::{DifferentialOutcome, ExecutionOutcome, Row};
use crate::sql;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Default number of significant digits non-integral reals are rounded to
/// before comparison.
pub const DEFAULT_FLOAT_DIGITS: usize = 12;

/// Default error fragments treated as version skew rather than a bug when only
/// one engine reports them.
pub const DEFAULT_IGNORABLE_ERRORS: &[&str] =
    &["syntax error", "no such function", "not currently supported"];

/// How many differing rows a LogicBug description lists per side.
const MAX_DIFF_ROWS: usize = 5;

/// The bug class of an execution, in classification priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Crash,
    Hang,
    ReferenceError,
    LogicBug,
    Normal,
}

impl VerdictKind {
    pub const BUGS: [VerdictKind; 4] = [
        VerdictKind::Crash,
        VerdictKind::Hang,
        VerdictKind::ReferenceError,
        VerdictKind::LogicBug,
    ];

    pub fn is_bug(self) -> bool {
        self != VerdictKind::Normal
    }

    /// Snake-case name used in bundle directory names and statistics.
    pub fn label(self) -> &'static str {
        match self {
            VerdictKind::Crash => "crash",
            VerdictKind::Hang => "hang",
            VerdictKind::ReferenceError => "reference_error",
            VerdictKind::LogicBug => "logic_bug",
            VerdictKind::Normal => "normal",
        }
    }

    /// Bundle category directory for this kind of bug.
    pub fn category_dir(self) -> &'static str {
        match self {
            VerdictKind::Crash => "crashes",
            VerdictKind::Hang => "hangs",
            VerdictKind::ReferenceError => "reference_errors",
            VerdictKind::LogicBug => "logic_bugs",
            VerdictKind::Normal => "normal",
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a `Normal` verdict was not a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalReason {
    /// Both engines returned equivalent results.
    Agreed,
    /// Both engines rejected the query with an error.
    RejectedByBoth,
    /// One engine rejected the query with an error known to stem from version skew.
    IgnoredError,
    /// Both engines terminated abnormally on the same input.
    SharedFailure,
    /// Only the primary engine ran and it completed normally.
    Unchecked,
}

impl NormalReason {
    pub fn label(self) -> &'static str {
        match self {
            NormalReason::Agreed => "agreed",
            NormalReason::RejectedByBoth => "rejected_by_both",
            NormalReason::IgnoredError => "ignored_error",
            NormalReason::SharedFailure => "shared_failure",
            NormalReason::Unchecked => "unchecked",
        }
    }
}

/// The classification of one differential execution.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub kind: VerdictKind,
    /// Set for `Normal` verdicts only.
    pub reason: Option<NormalReason>,
    /// Human-readable explanation, used in bug bundles.
    pub detail: String,
    pub outcome: DifferentialOutcome,
}

impl Verdict {
    fn bug(kind: VerdictKind, detail: String, outcome: DifferentialOutcome) -> Self {
        Self {
            kind,
            reason: None,
            detail,
            outcome,
        }
    }

    fn normal(reason: NormalReason, outcome: DifferentialOutcome) -> Self {
        Self {
            kind: VerdictKind::Normal,
            reason: Some(reason),
            detail: String::new(),
            outcome,
        }
    }
}

/// Policy for queries with LIMIT or OFFSET but no top-level ORDER BY, whose row
/// selection is not determined by the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnorderedLimit {
    /// Compare only the number of rows.
    #[default]
    CompareCounts,
    /// Compare row multisets like any other unordered query.
    Strict,
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub float_digits: usize,
    pub unordered_limit: UnorderedLimit,
    /// Lower-case fragments matched against one-sided error messages.
    pub ignorable_errors: Vec<String>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            float_digits: DEFAULT_FLOAT_DIGITS,
            unordered_limit: UnorderedLimit::default(),
            ignorable_errors: DEFAULT_IGNORABLE_ERRORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// A column value after type-aware normalization.
///
/// Engines print values as text, so the type is recovered from the text:
/// anything that reads as an integral number is an `Integer` (so `1`, `1.0`,
/// `1e0` and `-0` versus `0` compare equal), other numbers are rounded to a
/// fixed number of significant digits, and an empty field is `Null` because
/// list output does not distinguish NULL from the empty string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Null,
    Integer(i128),
    Real(String),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Real(v) => f.write_str(v),
            Value::Text(v) => write!(f, "'{v}'"),
        }
    }
}

/// Largest magnitude at which every integral `f64` is exactly representable as an integer.
const EXACT_INTEGRAL_LIMIT: f64 = 9.223_372_036_854_776e18;

pub fn canonical_value(raw: &str, float_digits: usize) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if let Ok(v) = raw.parse::<i128>() {
        return Value::Integer(v);
    }
    let looks_numeric = raw
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.'));
    match raw.parse::<f64>() {
        Ok(v) if looks_numeric && v.is_finite() => {
            if v.fract() == 0.0 && v.abs() < EXACT_INTEGRAL_LIMIT {
                Value::Integer(v as i128)
            } else {
                let digits = float_digits.max(1) - 1;
                Value::Real(format!("{v:.digits$e}"))
            }
        }
        _ => Value::Text(raw.to_string()),
    }
}

pub fn canonical_row(row: &Row, float_digits: usize) -> Vec<Value> {
    row.iter().map(|v| canonical_value(v, float_digits)).collect()
}

fn render_row(row: &[Value]) -> String {
    let cells: Vec<String> = row.iter().map(Value::to_string).collect();
    format!("({})", cells.join(", "))
}

/// Classifies differential executions into verdicts.
#[derive(Debug, Clone, Default)]
pub struct DifferentialOracle {
    config: OracleConfig,
}

impl DifferentialOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Classifies the outcome of running `sql` on both engines.
    ///
    /// The checks run in priority order: a primary crash, a primary hang, a
    /// reference failure, then result divergence. Both engines failing
    /// abnormally on the same input is a shared failure and not filed.
    ///
    /// # Arguments
    /// * `sql`: The executed query text; its ordering clauses select the comparison.
    /// * `outcome`: The primary and (optional) reference executions.
    ///
    /// # Returns
    /// A `Verdict` owning `outcome`.
    pub fn classify(&self, sql: &str, outcome: DifferentialOutcome) -> Verdict {
        let primary = &outcome.primary;
        let reference_abnormal = outcome
            .reference
            .as_ref()
            .is_some_and(|r| !r.completed());
        if primary.crashed {
            if reference_abnormal {
                return Verdict::normal(NormalReason::SharedFailure, outcome);
            }
            let detail = format!("Primary engine {} {}", primary.engine_version, primary.status);
            return Verdict::bug(VerdictKind::Crash, detail, outcome);
        }
        if primary.timed_out {
            let detail = format!(
                "Primary engine {} exceeded its timeout after {} ms",
                primary.engine_version,
                primary.elapsed.as_millis()
            );
            return Verdict::bug(VerdictKind::Hang, detail, outcome);
        }
        let Some(reference) = &outcome.reference else {
            return Verdict::normal(NormalReason::Unchecked, outcome);
        };
        if reference_abnormal {
            let detail =
                format!("Reference engine {} {}", reference.engine_version, reference.status);
            return Verdict::bug(VerdictKind::ReferenceError, detail, outcome);
        }

        match (&primary.error, &reference.error) {
            (Some(_), Some(_)) => return Verdict::normal(NormalReason::RejectedByBoth, outcome),
            (Some(error), None) | (None, Some(error)) => {
                if self.is_ignorable(error) {
                    return Verdict::normal(NormalReason::IgnoredError, outcome);
                }
                let (side, engine) = if primary.error.is_some() {
                    ("primary", &primary.engine_version)
                } else {
                    ("reference", &reference.engine_version)
                };
                let detail = format!("Only the {side} engine {engine} reported an error: {error}");
                return Verdict::bug(VerdictKind::LogicBug, detail, outcome);
            }
            (None, None) => {}
        }

        match self.compare(sql, primary, reference) {
            Some(detail) => Verdict::bug(VerdictKind::LogicBug, detail, outcome),
            None => Verdict::normal(NormalReason::Agreed, outcome),
        }
    }

    fn is_ignorable(&self, error: &str) -> bool {
        let lower = error.to_lowercase();
        self.config
            .ignorable_errors
            .iter()
            .any(|marker| lower.contains(&marker.to_lowercase()))
    }

    /// Compares result rows under canonical equivalence.
    ///
    /// # Returns
    /// `None` when equivalent, otherwise a description of the difference.
    pub fn compare(
        &self,
        sql: &str,
        primary: &ExecutionOutcome,
        reference: &ExecutionOutcome,
    ) -> Option<String> {
        let digits = self.config.float_digits;
        let canonical = |outcome: &ExecutionOutcome| -> Vec<Vec<Value>> {
            outcome
                .rows
                .iter()
                .flatten()
                .map(|row| canonical_row(row, digits))
                .collect()
        };
        let mut left = canonical(primary);
        let mut right = canonical(reference);
        let shape = sql::result_shape(sql);

        let compare_counts = self.config.unordered_limit == UnorderedLimit::CompareCounts;
        if shape.limited && !shape.ordered && compare_counts {
            return (left.len() != right.len()).then(|| {
                format!(
                    "Row counts differ under unordered LIMIT: \
                     primary returned {}, reference returned {}",
                    left.len(),
                    right.len()
                )
            });
        }

        if shape.ordered {
            if left == right {
                return None;
            }
            return Some(describe_sequence_difference(&left, &right));
        }

        left.sort();
        right.sort();
        if left == right {
            return None;
        }
        Some(describe_multiset_difference(&left, &right))
    }
}

fn describe_sequence_difference(left: &[Vec<Value>], right: &[Vec<Value>]) -> String {
    let mut detail = format!(
        "Ordered results differ: primary returned {} rows, reference returned {} rows",
        left.len(),
        right.len()
    );
    if let Some(index) = (0..left.len().min(right.len())).find(|&i| left[i] != right[i]) {
        detail.push_str(&format!(
            "\nFirst difference at row {index}: primary {} vs reference {}",
            render_row(&left[index]),
            render_row(&right[index])
        ));
    }
    detail
}

/// Both inputs must be sorted.
fn describe_multiset_difference(left: &[Vec<Value>], right: &[Vec<Value>]) -> String {
    let mut only_left = Vec::new();
    let mut only_right = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < left.len() || j < right.len() {
        let order = match (left.get(i), right.get(j)) {
            (Some(l), Some(r)) => l.cmp(r),
            (Some(_), None) => Ordering::Less,
            _ => Ordering::Greater,
        };
        match order {
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                only_left.push(&left[i]);
                i += 1;
            }
            Ordering::Greater => {
                only_right.push(&right[j]);
                j += 1;
            }
        }
    }
    let mut detail = format!(
        "Result multisets differ: primary returned {} rows, reference returned {} rows",
        left.len(),
        right.len()
    );
    for (side, rows) in [("primary", &only_left), ("reference", &only_right)] {
        if rows.is_empty() {
            continue;
        }
        let listed: Vec<String> = rows.iter().take(MAX_DIFF_ROWS).map(|r| render_row(r)).collect();
        let more = rows.len().saturating_sub(MAX_DIFF_ROWS);
        detail.push_str(&format!("\nOnly in {side}: {}", listed.join(" ")));
        if more > 0 {
            detail.push_str(&format!(" (+{more} more)"));
        }
    }
    detail
}

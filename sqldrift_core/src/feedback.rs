use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What a coverage unit identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Granularity {
    /// One unit per executed statement, line or basic block.
    #[default]
    Statement,
    /// One unit per distinct execution path.
    Path,
}

/// Coverage produced by one execution of the primary engine.
///
/// `units` is what gates corpus admission. `grammar_rules` records which
/// grammar productions the candidate exercised; it is tracked in its own
/// frontier and only biases generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageSignature {
    units: BTreeSet<String>,
    grammar_rules: BTreeSet<&'static str>,
}

impl CoverageSignature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_units<I, S>(units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            units: units.into_iter().map(Into::into).collect(),
            grammar_rules: BTreeSet::new(),
        }
    }

    /// Builds a signature from a raw probe trace.
    ///
    /// With statement granularity every distinct trace entry is a unit. With
    /// path granularity the whole trace collapses into a single `path:<digest>`
    /// unit: consecutive repeats are folded first so that loop iteration counts
    /// do not mint new paths.
    pub fn from_trace(trace: &[String], granularity: Granularity) -> Self {
        match granularity {
            Granularity::Statement => Self::from_units(trace.iter().cloned()),
            Granularity::Path => {
                if trace.is_empty() {
                    return Self::new();
                }
                let mut folded: Vec<&str> = Vec::with_capacity(trace.len());
                for unit in trace {
                    if folded.last() != Some(&unit.as_str()) {
                        folded.push(unit);
                    }
                }
                let digest = md5::compute(folded.join("\n").as_bytes());
                Self::from_units([format!("path:{digest:x}")])
            }
        }
    }

    pub fn with_grammar_rules(mut self, rules: impl IntoIterator<Item = &'static str>) -> Self {
        self.grammar_rules.extend(rules);
        self
    }

    pub fn units(&self) -> &BTreeSet<String> {
        &self.units
    }

    pub fn grammar_rules(&self) -> &BTreeSet<&'static str> {
        &self.grammar_rules
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }
}

use crate::rng::{Draw, RngContext};
use crate::sql;
use serde::Serialize;
use std::collections::BTreeSet;

/// How a candidate came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    Generated,
    Mutated,
    /// Read from an initial seed query file.
    Seed,
    /// Produced by the reducer from a failing candidate.
    Reduced,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Origin::Generated => "generated",
            Origin::Mutated => "mutated",
            Origin::Seed => "seed",
            Origin::Reduced => "reduced",
        };
        f.write_str(name)
    }
}

/// Everything needed to explain, and replay, how a candidate was built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Provenance {
    pub origin: Origin,
    /// Corpus sequence id of the parent, for mutated candidates.
    pub parent: Option<u64>,
    /// Mutation operators applied, in order.
    pub operators: Vec<String>,
    /// Run seed and trial stream of the `RngContext` that produced the candidate.
    pub seed: u64,
    pub stream: u64,
    pub draws: Vec<Draw>,
}

/// An SQL query plus where it came from. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    sql: String,
    database: usize,
    grammar_rules: BTreeSet<&'static str>,
    provenance: Provenance,
}

impl Candidate {
    fn build(
        sql: String,
        database: usize,
        grammar_rules: BTreeSet<&'static str>,
        origin: Origin,
        parent: Option<u64>,
        operators: Vec<String>,
        ctx: &mut RngContext,
    ) -> Self {
        Self {
            sql,
            database,
            grammar_rules,
            provenance: Provenance {
                origin,
                parent,
                operators,
                seed: ctx.seed(),
                stream: ctx.stream(),
                draws: ctx.take_trail(),
            },
        }
    }

    /// A freshly generated query. Consumes the draw trail recorded so far in `ctx`.
    pub fn generated(
        sql: String,
        database: usize,
        grammar_rules: BTreeSet<&'static str>,
        ctx: &mut RngContext,
    ) -> Self {
        Self::build(sql, database, grammar_rules, Origin::Generated, None, Vec::new(), ctx)
    }

    /// A mutation of corpus entry `parent`. The grammar rules of the parent carry over.
    pub fn mutated(
        sql: String,
        parent: &Candidate,
        parent_id: u64,
        operators: Vec<String>,
        ctx: &mut RngContext,
    ) -> Self {
        Self::build(
            sql,
            parent.database,
            parent.grammar_rules.clone(),
            Origin::Mutated,
            Some(parent_id),
            operators,
            ctx,
        )
    }

    pub fn seed(sql: String, database: usize, ctx: &mut RngContext) -> Self {
        Self::build(sql, database, BTreeSet::new(), Origin::Seed, None, Vec::new(), ctx)
    }

    /// A reduced variant of `original`, bound to the same database snapshot.
    pub fn reduced(original: &Candidate, sql: String) -> Self {
        Self {
            sql,
            database: original.database,
            grammar_rules: original.grammar_rules.clone(),
            provenance: Provenance {
                origin: Origin::Reduced,
                parent: original.provenance.parent,
                operators: original.provenance.operators.clone(),
                seed: original.provenance.seed,
                stream: original.provenance.stream,
                draws: Vec::new(),
            },
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Index into the configured seed databases.
    pub fn database(&self) -> usize {
        self.database
    }

    pub fn grammar_rules(&self) -> &BTreeSet<&'static str> {
        &self.grammar_rules
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub fn origin(&self) -> Origin {
        self.provenance.origin
    }

    /// Size used to order reductions: significant tokens, then bytes.
    pub fn size(&self) -> (usize, usize) {
        (sql::token_count(&self.sql), self.sql.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_candidate_captures_rng_trail() {
        let mut ctx = RngContext::new(11, 3);
        ctx.below("pick", 10);
        ctx.chance("coin", 0.5);
        let rules = BTreeSet::from(["stmt.select"]);
        let candidate = Candidate::generated("SELECT 1".to_string(), 0, rules, &mut ctx);

        let provenance = candidate.provenance();
        assert_eq!(provenance.origin, Origin::Generated);
        assert_eq!(provenance.seed, 11);
        assert_eq!(provenance.stream, 3);
        assert_eq!(provenance.draws.len(), 2);
        assert!(ctx.trail().is_empty(), "trail should be moved into the candidate");
    }

    #[test]
    fn mutated_candidate_inherits_database_and_rules() {
        let mut ctx = RngContext::new(1, 0);
        let parent = Candidate::generated(
            "SELECT a FROM t".to_string(),
            2,
            BTreeSet::from(["stmt.select", "select.from"]),
            &mut ctx,
        );
        let child = Candidate::mutated(
            "SELECT a FROM t LIMIT 1".to_string(),
            &parent,
            7,
            vec!["clause-insertion".to_string()],
            &mut ctx,
        );
        assert_eq!(child.database(), 2);
        assert_eq!(child.provenance().parent, Some(7));
        assert_eq!(child.grammar_rules(), parent.grammar_rules());
        assert_eq!(child.origin(), Origin::Mutated);
    }

    #[test]
    fn reduced_candidate_keeps_snapshot_binding() {
        let mut ctx = RngContext::new(1, 0);
        let original = Candidate::seed("SELECT 1, 2, 3".to_string(), 1, &mut ctx);
        let reduced = Candidate::reduced(&original, "SELECT 1".to_string());
        assert_eq!(reduced.database(), original.database());
        assert_eq!(reduced.origin(), Origin::Reduced);
        assert!(reduced.size() < original.size());
    }
}

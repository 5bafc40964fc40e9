use crate::oracle::VerdictKind;
use crate::sql::{self, ClauseKind, Statement, StatementKind, Token, TokenKind};
use std::ops::Range;
use tracing::debug;

/// Defines the default bound on re-executions spent minimizing one bug.
pub const DEFAULT_MAX_ATTEMPTS: usize = 200;

#[derive(Debug, Clone)]
pub struct ReducerConfig {
    pub max_attempts: usize,
}

impl Default for ReducerConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// The result of minimizing one failing query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reduction {
    pub sql: String,
    /// Re-executions spent.
    pub attempts: usize,
    /// Simplifications kept.
    pub accepted: usize,
    /// The attempt bound stopped the search before a fixpoint.
    pub exhausted_budget: bool,
}

impl Reduction {
    pub fn made_progress(&self) -> bool {
        self.accepted > 0
    }
}

/// Size used to order candidates: significant tokens first, then bytes.
pub fn size(sql: &str) -> (usize, usize) {
    (sql::token_count(sql), sql.len())
}

/// Greedy delta-debugging minimizer over the statement structure.
///
/// Each round enumerates single structural simplifications of the current
/// query (drop a statement, drop an optional clause, remove a WHERE conjunct,
/// remove a select item, unwrap a function call or parenthesis, shrink a
/// literal) and tries them in order. The first one that is strictly smaller
/// and still reproduces the same verdict kind replaces the current query and
/// the round restarts. The search stops at a fixpoint or when the attempt
/// bound is spent.
#[derive(Debug, Clone, Default)]
pub struct Reducer {
    config: ReducerConfig,
}

impl Reducer {
    pub fn new(config: ReducerConfig) -> Self {
        Self { config }
    }

    /// Minimizes `original` while preserving verdict `kind`.
    ///
    /// # Arguments
    /// * `original`: The failing query.
    /// * `kind`: The verdict kind every accepted simplification must reproduce.
    /// * `reproduce`: Re-executes a query against the triggering snapshot and
    ///   returns its verdict kind, or `None` if the execution itself failed.
    ///
    /// # Returns
    /// The smallest reproducing variant found; `original` unchanged if none was.
    pub fn reduce<F>(&self, original: &str, kind: VerdictKind, mut reproduce: F) -> Reduction
    where
        F: FnMut(&str) -> Option<VerdictKind>,
    {
        let mut current = original.to_string();
        let mut attempts = 0;
        let mut accepted = 0;
        let mut exhausted_budget = false;
        'rounds: loop {
            let current_size = size(&current);
            for variant in simplifications(&current) {
                if size(&variant) >= current_size {
                    continue;
                }
                if attempts >= self.config.max_attempts {
                    exhausted_budget = true;
                    break 'rounds;
                }
                attempts += 1;
                if reproduce(&variant) == Some(kind) {
                    debug!(attempts, tokens = size(&variant).0, "Reduction step kept");
                    current = variant;
                    accepted += 1;
                    continue 'rounds;
                }
            }
            break;
        }
        Reduction {
            sql: current,
            attempts,
            accepted,
            exhausted_budget,
        }
    }
}

/// All single-step simplifications of `sql`, most aggressive first.
fn simplifications(sql: &str) -> Vec<String> {
    let Ok(statements) = sql::parse_script(sql) else {
        return token_deletions(sql);
    };
    let mut out = Vec::new();
    if statements.len() > 1 {
        for skip in 0..statements.len() {
            let rest: Vec<Statement> = statements
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, s)| s.clone())
                .collect();
            out.push(sql::render_script(&rest));
        }
    }
    for (i, stmt) in statements.iter().enumerate() {
        for variant in statement_simplifications(stmt) {
            let mut copy = statements.clone();
            copy[i] = variant;
            out.push(sql::render_script(&copy));
        }
    }
    out
}

/// Fallback for text that does not parse: drop one token at a time.
fn token_deletions(sql: &str) -> Vec<String> {
    let Ok(tokens) = sql::significant_tokens(sql) else {
        return Vec::new();
    };
    if tokens.len() < 2 {
        return Vec::new();
    }
    (0..tokens.len())
        .rev()
        .map(|skip| {
            let rest: Vec<Token> = tokens
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, t)| t.clone())
                .collect();
            sql::render(&rest)
        })
        .collect()
}

fn statement_simplifications(stmt: &Statement) -> Vec<Statement> {
    let mut edits: Vec<(Range<usize>, Vec<Token>)> = Vec::new();

    for clause in stmt.clauses() {
        if clause.kind.is_optional() {
            edits.push((clause.range.clone(), Vec::new()));
        }
        if clause.kind == ClauseKind::GroupBy {
            if let Some(having) = stmt.clause(ClauseKind::Having) {
                edits.push((clause.range.start..having.range.end, Vec::new()));
            }
        }
    }

    if let Some(predicate) = stmt.where_predicate() {
        let conjuncts = stmt.conjuncts(predicate);
        if conjuncts.len() > 1 {
            for (k, conjunct) in conjuncts.iter().enumerate() {
                let range = if k == 0 {
                    conjunct.start..conjuncts[1].start
                } else {
                    conjuncts[k - 1].end..conjunct.end
                };
                edits.push((range, Vec::new()));
            }
        }
    }

    let items = stmt.select_items();
    if items.len() > 1 {
        for (k, item) in items.iter().enumerate() {
            let range = if k == 0 {
                item.start..items[1].start
            } else {
                items[k - 1].end..item.end
            };
            edits.push((range, Vec::new()));
        }
    }

    edits.extend(unwrappings(stmt));
    edits.extend(literal_shrinks(stmt));

    edits
        .into_iter()
        .filter_map(|(range, replacement)| stmt.splice(range, &replacement).ok())
        .filter(|s| s.kind() == stmt.kind() || stmt.kind() == StatementKind::Other)
        .collect()
}

fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// `f(x)` to `x` and `(x)` to `x`, within select items and the WHERE predicate.
fn unwrappings(stmt: &Statement) -> Vec<(Range<usize>, Vec<Token>)> {
    let tokens = stmt.tokens();
    let mut regions = stmt.select_items();
    regions.extend(stmt.where_predicate());
    let mut edits = Vec::new();
    for region in regions {
        for open in region.clone() {
            if tokens[open].kind != TokenKind::LParen {
                continue;
            }
            let Some(close) = matching_paren(tokens, open).filter(|c| *c < region.end) else {
                continue;
            };
            let inner = &tokens[open + 1..close];
            if inner.is_empty() || inner[0].is_keyword("SELECT") {
                continue;
            }
            let prev = open.checked_sub(1).map(|p| &tokens[p]);
            if prev.is_some_and(|p| p.is_keyword("IN") || p.is_keyword("EXISTS")) {
                continue;
            }
            let single_argument = !inner.iter().any(|t| t.kind == TokenKind::Comma);
            match prev {
                Some(p) if p.kind == TokenKind::Identifier => {
                    let bare_star = inner.len() == 1 && inner[0].is_operator("*");
                    if single_argument && !bare_star {
                        edits.push((open - 1..close + 1, inner.to_vec()));
                    }
                }
                _ if single_argument => edits.push((open..close + 1, inner.to_vec())),
                _ => {}
            }
        }
    }
    edits
}

fn literal_shrinks(stmt: &Statement) -> Vec<(Range<usize>, Vec<Token>)> {
    stmt.tokens()
        .iter()
        .enumerate()
        .filter_map(|(i, token)| {
            let smaller = match token.kind {
                TokenKind::Integer if token.text != "0" && token.text != "1" => {
                    Token::new(TokenKind::Integer, "0")
                }
                TokenKind::Float => Token::new(TokenKind::Integer, "0"),
                TokenKind::String if token.text != "''" => Token::new(TokenKind::String, "''"),
                TokenKind::Blob if token.text.len() > 3 => Token::new(TokenKind::Blob, "x''"),
                _ => return None,
            };
            Some((i..i + 1, vec![smaller]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{GrammarConfig, GrammarGenerator};
    use crate::rng::RngContext;
    use crate::schema::Schema;
    use std::collections::BTreeSet;

    #[test]
    fn reduces_to_the_failure_inducing_core() {
        let original = "SELECT name, age, email FROM users \
                        WHERE age > 30 AND name LIKE 'a%' ORDER BY name LIMIT 10";
        let reduction = Reducer::default().reduce(original, VerdictKind::LogicBug, |sql| {
            Some(if sql.contains("age > 30") {
                VerdictKind::LogicBug
            } else {
                VerdictKind::Normal
            })
        });
        assert_eq!(reduction.sql, "SELECT email FROM users WHERE age > 30");
        assert!(reduction.made_progress());
        assert!(!reduction.exhausted_budget);
    }

    #[test]
    fn keeps_original_when_nothing_reproduces() {
        let original = "select  name,age from users   where age > 30";
        let reduction = Reducer::default()
            .reduce(original, VerdictKind::Crash, |_| Some(VerdictKind::LogicBug));
        assert_eq!(reduction.sql, original);
        assert!(!reduction.made_progress());
        assert!(reduction.attempts > 0);
    }

    #[test]
    fn never_accepts_a_different_bug_class() {
        let original = "SELECT a, b FROM t WHERE a = 1 AND b = 2";
        let reduction = Reducer::default().reduce(original, VerdictKind::Crash, |sql| {
            if sql.contains("b = 2") {
                Some(VerdictKind::Crash)
            } else {
                Some(VerdictKind::Hang)
            }
        });
        assert!(reduction.sql.contains("b = 2"), "{}", reduction.sql);
    }

    #[test]
    fn respects_the_attempt_bound() {
        let reducer = Reducer::new(ReducerConfig { max_attempts: 3 });
        let mut calls = 0;
        let reduction = reducer.reduce(
            "SELECT a, b, c FROM t WHERE a = 1 AND b = 2 ORDER BY a LIMIT 5",
            VerdictKind::Crash,
            |_| {
                calls += 1;
                None
            },
        );
        assert_eq!(calls, 3);
        assert_eq!(reduction.attempts, 3);
        assert!(reduction.exhausted_budget);
    }

    #[test]
    fn unwraps_functions_and_shrinks_literals() {
        let original = "SELECT ABS(price) FROM products WHERE name = 'widget'";
        let reduction = Reducer::default().reduce(original, VerdictKind::Crash, |sql| {
            sql.contains("price").then_some(VerdictKind::Crash)
        });
        assert_eq!(reduction.sql, "SELECT price FROM products");
    }

    #[test]
    fn drops_whole_statements() {
        let original = "CREATE TABLE t(a INTEGER); INSERT INTO t VALUES (1); SELECT a FROM t";
        let reduction = Reducer::default().reduce(original, VerdictKind::Crash, |sql| {
            sql.contains("INSERT").then_some(VerdictKind::Crash)
        });
        assert_eq!(reduction.sql, "INSERT INTO t VALUES (1)");
    }

    #[test]
    fn falls_back_to_token_deletion_for_unparseable_text() {
        let reduction = Reducer::default().reduce("SELEC oops (", VerdictKind::Crash, |sql| {
            sql.contains("SELEC").then_some(VerdictKind::Crash)
        });
        assert_eq!(reduction.sql, "SELEC");
    }

    #[test]
    fn reduced_queries_stay_well_formed_and_never_grow() {
        let generator = GrammarGenerator::new(GrammarConfig::default());
        let schema = Schema::storefront();
        for stream in 0..40 {
            let mut rng = RngContext::new(9, stream);
            let candidate = generator
                .generate(0, &schema, &BTreeSet::new(), &mut rng)
                .expect("generate");
            let reduction = Reducer::default().reduce(candidate.sql(), VerdictKind::LogicBug, |_| {
                Some(VerdictKind::LogicBug)
            });
            assert!(size(&reduction.sql) <= size(candidate.sql()));
            assert!(sql::is_well_formed(&reduction.sql), "{}", reduction.sql);
        }
    }
}

use crate::grammar::{self, quote_identifier};
use crate::input::Candidate;
use crate::rng::RngContext;
use crate::schema::{ColumnType, Schema, Table};
use crate::sql::{self, ClauseKind, Statement, StatementKind, Token, TokenKind};
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;
use tracing::trace;

/// Defines the default lower bound on operators applied per mutation trial.
pub const DEFAULT_MIN_MUTATIONS: usize = 1;
/// Defines the default upper bound on operators applied per mutation trial.
pub const DEFAULT_MAX_MUTATIONS: usize = 3;

const COMPARISON_OPERATORS: &[&str] = &["=", "==", "<>", "!=", "<", "<=", ">", ">="];
const ARITHMETIC_OPERATORS: &[&str] = &["+", "-", "*", "/", "%"];
const WRAPPING_FUNCTIONS: &[&str] = &[
    "ABS", "LENGTH", "LOWER", "UPPER", "HEX", "TYPEOF", "ROUND", "QUOTE", "TRIM",
];

/// What an operator promises about its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guarantee {
    /// Output of a well-formed input passes the structural SQL check.
    pub well_formed: bool,
    /// Output has the same statement kind as the input.
    pub same_kind: bool,
}

/// Read-only material operators may draw on.
#[derive(Debug, Clone, Copy)]
pub struct MutationContext<'a> {
    /// Schema of the candidate's seed database.
    pub schema: &'a Schema,
    /// Other corpus candidates, for structural splicing.
    pub donors: &'a [Arc<Candidate>],
    pub boundary_literal_probability: f64,
}

/// The closed registry of query transformations.
///
/// Each operator pairs a predicate (`applies`) with a transform. Operators that
/// guarantee well-formed output validate their result and decline rather than
/// emit something malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationOperator {
    /// Swap a literal for an edge value of the same type.
    LiteralValue,
    /// Swap a comparison, arithmetic or logical operator for a compatible one.
    OperatorSubstitution,
    /// Add a missing WHERE, JOIN, ORDER BY or LIMIT.
    ClauseInsertion,
    /// Remove an optional clause.
    ClauseDeletion,
    /// Replace a column reference with another column from the schema.
    IdentifierSubstitution,
    /// Wrap an expression in a scalar function.
    FunctionWrap,
    /// Replace a predicate conjunct or select item with one taken from another corpus entry.
    StructuralSplice,
    /// Turn a string literal into a quoted identifier or back.
    QuoteFlip,
}

impl MutationOperator {
    pub const ALL: [MutationOperator; 8] = [
        MutationOperator::LiteralValue,
        MutationOperator::OperatorSubstitution,
        MutationOperator::ClauseInsertion,
        MutationOperator::ClauseDeletion,
        MutationOperator::IdentifierSubstitution,
        MutationOperator::FunctionWrap,
        MutationOperator::StructuralSplice,
        MutationOperator::QuoteFlip,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MutationOperator::LiteralValue => "literal-value",
            MutationOperator::OperatorSubstitution => "operator-substitution",
            MutationOperator::ClauseInsertion => "clause-insertion",
            MutationOperator::ClauseDeletion => "clause-deletion",
            MutationOperator::IdentifierSubstitution => "identifier-substitution",
            MutationOperator::FunctionWrap => "function-wrap",
            MutationOperator::StructuralSplice => "structural-splice",
            MutationOperator::QuoteFlip => "quote-flip",
        }
    }

    pub fn guarantee(self) -> Guarantee {
        match self {
            MutationOperator::QuoteFlip => Guarantee {
                well_formed: false,
                same_kind: true,
            },
            _ => Guarantee {
                well_formed: true,
                same_kind: true,
            },
        }
    }

    pub fn applies(self, stmt: &Statement, ctx: &MutationContext<'_>) -> bool {
        match self {
            MutationOperator::LiteralValue => !literal_sites(stmt).is_empty(),
            MutationOperator::OperatorSubstitution => !operator_sites(stmt).is_empty(),
            MutationOperator::ClauseInsertion => !missing_clauses(stmt, ctx.schema).is_empty(),
            MutationOperator::ClauseDeletion => !deletable_clauses(stmt).is_empty(),
            MutationOperator::IdentifierSubstitution => !column_sites(stmt, ctx.schema).is_empty(),
            MutationOperator::FunctionWrap => !wrap_sites(stmt, ctx.schema).is_empty(),
            MutationOperator::StructuralSplice => !splice_sites(stmt, ctx).is_empty(),
            MutationOperator::QuoteFlip => !quote_sites(stmt).is_empty(),
        }
    }

    /// Applies the operator to `stmt`.
    ///
    /// # Returns
    /// The tokens of the rewritten statement, or `None` if the operator does
    /// not apply or its result would break its guarantee.
    pub fn transform(
        self,
        stmt: &Statement,
        ctx: &MutationContext<'_>,
        rng: &mut RngContext,
    ) -> Option<Vec<Token>> {
        let tokens = match self {
            MutationOperator::LiteralValue => mutate_literal(stmt, ctx, rng)?,
            MutationOperator::OperatorSubstitution => substitute_operator(stmt, rng)?,
            MutationOperator::ClauseInsertion => insert_clause(stmt, ctx, rng)?,
            MutationOperator::ClauseDeletion => {
                let clauses = deletable_clauses(stmt);
                let range = rng.choose("mutation.site", &clauses)?.clone();
                replace(stmt.tokens(), range, &[])
            }
            MutationOperator::IdentifierSubstitution => substitute_identifier(stmt, ctx, rng)?,
            MutationOperator::FunctionWrap => wrap_in_function(stmt, ctx, rng)?,
            MutationOperator::StructuralSplice => {
                let sites = splice_sites(stmt, ctx);
                let (range, donor) = rng.choose("mutation.site", &sites)?.clone();
                replace(stmt.tokens(), range, &donor)
            }
            MutationOperator::QuoteFlip => flip_quotes(stmt, rng)?,
        };
        let guarantee = self.guarantee();
        if guarantee.well_formed {
            let rewritten = Statement::from_tokens(tokens.clone()).ok()?;
            if guarantee.same_kind && rewritten.kind() != stmt.kind() {
                return None;
            }
        }
        Some(tokens)
    }
}

fn replace(tokens: &[Token], range: Range<usize>, with: &[Token]) -> Vec<Token> {
    let mut out = Vec::with_capacity(tokens.len() + with.len());
    out.extend_from_slice(&tokens[..range.start]);
    out.extend_from_slice(with);
    out.extend_from_slice(&tokens[range.end..]);
    out
}

fn lex(text: &str) -> Option<Vec<Token>> {
    sql::significant_tokens(text).ok()
}

fn literal_sites(stmt: &Statement) -> Vec<usize> {
    stmt.tokens()
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_literal())
        .map(|(i, _)| i)
        .collect()
}

fn mutate_literal(
    stmt: &Statement,
    ctx: &MutationContext<'_>,
    rng: &mut RngContext,
) -> Option<Vec<Token>> {
    let sites = literal_sites(stmt);
    let index = *rng.choose("mutation.site", &sites)?;
    let token = &stmt.tokens()[index];
    let ty = match token.kind {
        TokenKind::Integer => ColumnType::Integer,
        TokenKind::Float => ColumnType::Real,
        TokenKind::String => ColumnType::Text,
        TokenKind::Blob => ColumnType::Blob,
        _ => {
            const TYPES: [ColumnType; 4] = [
                ColumnType::Integer,
                ColumnType::Real,
                ColumnType::Text,
                ColumnType::Blob,
            ];
            *rng.choose("mutation.literal-type", &TYPES)?
        }
    };
    let replacement = match (ty, token.text.parse::<i64>()) {
        (ColumnType::Integer, Ok(value))
            if !rng.chance("mutation.boundary", ctx.boundary_literal_probability) =>
        {
            let tweaks = [value.checked_add(1), value.checked_sub(1), value.checked_neg(), Some(0)];
            let picked = rng.choose("mutation.integer-tweak", &tweaks).copied().flatten();
            picked.map_or_else(|| "0".to_string(), |v| v.to_string())
        }
        _ => grammar::boundary_literal(ty, rng),
    };
    Some(replace(stmt.tokens(), index..index + 1, &lex(&replacement)?))
}

/// Indices of top-level ANDs that belong to a BETWEEN.
fn between_ands(stmt: &Statement) -> HashSet<usize> {
    let depths = stmt.depths();
    let mut pending: Vec<usize> = Vec::new();
    let mut owned = HashSet::new();
    for (i, token) in stmt.tokens().iter().enumerate() {
        if token.is_keyword("BETWEEN") {
            pending.push(depths[i]);
        } else if token.is_keyword("AND") && pending.last() == Some(&depths[i]) {
            pending.pop();
            owned.insert(i);
        }
    }
    owned
}

/// Whether the LIKE at `index` carries an `ESCAPE` suffix, which GLOB does not accept.
fn has_escape(tokens: &[Token], depths: &[usize], index: usize) -> bool {
    let depth = depths[index];
    for (token, &d) in tokens.iter().zip(depths).skip(index + 1) {
        if d > depth {
            continue;
        }
        if d < depth
            || matches!(token.kind, TokenKind::RParen | TokenKind::Comma | TokenKind::Semicolon)
            || token.is_keyword("LIKE")
            || token.is_keyword("GLOB")
        {
            return false;
        }
        if token.is_keyword("ESCAPE") {
            return true;
        }
    }
    false
}

fn operator_sites(stmt: &Statement) -> Vec<(usize, &'static [&'static str])> {
    const LOGICAL: &[&str] = &["AND", "OR"];
    const PATTERN: &[&str] = &["LIKE", "GLOB"];
    let owned = between_ands(stmt);
    let depths = stmt.depths();
    let tokens = stmt.tokens();
    let mut sites = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let binary = i > 0 && tokens[i - 1].ends_operand();
        let text = token.text.as_str();
        let class: Option<&'static [&'static str]> = match token.kind {
            TokenKind::Operator if binary && COMPARISON_OPERATORS.contains(&text) => {
                Some(COMPARISON_OPERATORS)
            }
            TokenKind::Operator if binary && ARITHMETIC_OPERATORS.contains(&text) => {
                Some(ARITHMETIC_OPERATORS)
            }
            TokenKind::Keyword
                if (token.is_keyword("AND") && !owned.contains(&i)) || token.is_keyword("OR") =>
            {
                Some(LOGICAL)
            }
            TokenKind::Keyword if token.is_keyword("LIKE") && !has_escape(tokens, &depths, i) => {
                Some(PATTERN)
            }
            TokenKind::Keyword if token.is_keyword("GLOB") => Some(PATTERN),
            _ => None,
        };
        if let Some(class) = class {
            sites.push((i, class));
        }
    }
    sites
}

fn substitute_operator(stmt: &Statement, rng: &mut RngContext) -> Option<Vec<Token>> {
    let sites = operator_sites(stmt);
    let (index, class) = *rng.choose("mutation.site", &sites)?;
    let current = &stmt.tokens()[index];
    let others: Vec<&str> = class
        .iter()
        .copied()
        .filter(|op| !op.eq_ignore_ascii_case(&current.text))
        .collect();
    let op = *rng.choose("mutation.operator", &others)?;
    let kind = if current.kind == TokenKind::Keyword {
        TokenKind::Keyword
    } else {
        TokenKind::Operator
    };
    Some(replace(stmt.tokens(), index..index + 1, &[Token::new(kind, op)]))
}

/// Schema tables the statement references by name.
fn referenced_tables<'s>(stmt: &Statement, schema: &'s Schema) -> Vec<&'s Table> {
    let mut tables: Vec<&Table> = Vec::new();
    for token in stmt.tokens() {
        if !matches!(token.kind, TokenKind::Identifier | TokenKind::QuotedIdentifier) {
            continue;
        }
        let name = unquote(&token.text);
        if let Some(table) = schema.table(&name) {
            if !tables.iter().any(|t| t.name == table.name) {
                tables.push(table);
            }
        }
    }
    tables
}

fn unquote(text: &str) -> String {
    let bytes = text.as_bytes();
    match (bytes.first(), bytes.last()) {
        (Some(b'"'), Some(b'"')) | (Some(b'`'), Some(b'`')) if text.len() >= 2 => {
            text[1..text.len() - 1].replace("\"\"", "\"")
        }
        (Some(b'['), Some(b']')) => text[1..text.len() - 1].to_string(),
        _ => text.to_string(),
    }
}

fn column_reference(tables: &[&Table], table: &Table, column: &str) -> String {
    if tables.len() > 1 {
        format!("{}.{}", quote_identifier(&table.name), quote_identifier(column))
    } else {
        quote_identifier(column)
    }
}

/// Number of result columns of a SELECT, when it can be told from the statement and schema.
///
/// A bare `*` is only expanded over a single referenced table; `t.*` needs `t`
/// to name a schema table rather than an alias.
fn output_width(stmt: &Statement, tables: &[&Table]) -> Option<usize> {
    let items = stmt.select_items();
    if items.is_empty() {
        return None;
    }
    let mut width = 0;
    for item in items {
        width += match &stmt.tokens()[item] {
            [star] if star.is_operator("*") => match tables {
                [table] => table.columns.len(),
                _ => return None,
            },
            [qualifier, dot, star] if dot.kind == TokenKind::Dot && star.is_operator("*") => tables
                .iter()
                .find(|t| t.name.eq_ignore_ascii_case(&unquote(&qualifier.text)))?
                .columns
                .len(),
            _ => 1,
        };
    }
    (width > 0).then_some(width)
}

/// Clauses a statement lacks that can be added: (kind, insertion point).
fn missing_clauses(stmt: &Statement, schema: &Schema) -> Vec<(ClauseKind, usize)> {
    let clauses = stmt.clauses();
    let has = |kind: ClauseKind| clauses.iter().any(|c| c.kind == kind);
    let end_of = |kinds: &[ClauseKind]| {
        clauses
            .iter()
            .filter(|c| kinds.contains(&c.kind))
            .map(|c| c.range.end)
            .max()
    };
    let mut missing = Vec::new();
    let tables = referenced_tables(stmt, schema);
    match stmt.kind() {
        StatementKind::Select => {
            let Some(from_end) = end_of(&[ClauseKind::From, ClauseKind::Join]) else {
                return missing;
            };
            if !has(ClauseKind::Where) && !tables.is_empty() {
                missing.push((ClauseKind::Where, from_end));
            }
            let joined =
                has(ClauseKind::Join) || has(ClauseKind::Compound) || has(ClauseKind::GroupBy);
            if !joined && tables.len() == 1 && schema.usable_tables().len() > 1 {
                missing.push((ClauseKind::Join, from_end));
            }
            let limit_at = clauses
                .iter()
                .find(|c| c.kind == ClauseKind::Limit)
                .map_or(stmt.tokens().len(), |c| c.range.start);
            if !has(ClauseKind::OrderBy) && output_width(stmt, &tables).is_some() {
                missing.push((ClauseKind::OrderBy, limit_at));
            }
            if !has(ClauseKind::Limit) {
                missing.push((ClauseKind::Limit, stmt.tokens().len()));
            }
        }
        StatementKind::Update | StatementKind::Delete
            if !has(ClauseKind::Where) && !tables.is_empty() =>
        {
            if let Some(at) = end_of(&[ClauseKind::Head, ClauseKind::From, ClauseKind::Set]) {
                missing.push((ClauseKind::Where, at));
            }
        }
        _ => {}
    }
    missing
}

fn insert_clause(
    stmt: &Statement,
    ctx: &MutationContext<'_>,
    rng: &mut RngContext,
) -> Option<Vec<Token>> {
    let missing = missing_clauses(stmt, ctx.schema);
    let (kind, at) = *rng.choose("mutation.site", &missing)?;
    let tables = referenced_tables(stmt, ctx.schema);
    let text = match kind {
        ClauseKind::Where => {
            let table = *rng.choose("mutation.table", &tables)?;
            let column = rng.choose("mutation.column", &table.columns)?;
            let op = rng.choose("mutation.operator", COMPARISON_OPERATORS)?;
            let literal = if rng.chance("mutation.boundary", ctx.boundary_literal_probability) {
                grammar::boundary_literal(column.column_type, rng)
            } else {
                grammar::ordinary_literal(column.column_type, rng)
            };
            format!(
                "WHERE {} {op} {literal}",
                column_reference(&tables, table, &column.name)
            )
        }
        ClauseKind::Join => {
            let first = *tables.first()?;
            let others: Vec<&Table> = ctx
                .schema
                .usable_tables()
                .into_iter()
                .filter(|t| t.name != first.name)
                .collect();
            let other = *rng.choose("mutation.table", &others)?;
            let left = rng.choose("mutation.column", &first.columns)?;
            let right = other
                .columns
                .iter()
                .find(|c| c.column_type == left.column_type)
                .or_else(|| other.columns.first())?;
            format!(
                "LEFT JOIN {other_name} ON {}.{} = {other_name}.{}",
                quote_identifier(&first.name),
                quote_identifier(&left.name),
                quote_identifier(&right.name),
                other_name = quote_identifier(&other.name),
            )
        }
        ClauseKind::OrderBy => grammar::total_order_by(output_width(stmt, &tables)?, rng),
        _ => {
            const LIMITS: &[i64] = &[0, 1, 2, 10, -1];
            format!("LIMIT {}", rng.choose("mutation.limit", LIMITS)?)
        }
    };
    Some(replace(stmt.tokens(), at..at, &lex(&text)?))
}

fn deletable_clauses(stmt: &Statement) -> Vec<Range<usize>> {
    let clauses = stmt.clauses();
    let mut ranges = Vec::new();
    for (n, clause) in clauses.iter().enumerate() {
        if !clause.kind.is_optional() || clause.kind == ClauseKind::Having {
            continue;
        }
        let mut range = clause.range.clone();
        // HAVING goes with its GROUP BY.
        if clause.kind == ClauseKind::GroupBy {
            if let Some(next) = clauses.get(n + 1).filter(|c| c.kind == ClauseKind::Having) {
                range.end = next.range.end;
            }
        }
        ranges.push(range);
    }
    if let Some(having) = clauses.iter().find(|c| c.kind == ClauseKind::Having) {
        ranges.push(having.range.clone());
    }
    ranges
}

/// Column identifiers: (token index, owning table).
fn column_sites<'s>(stmt: &Statement, schema: &'s Schema) -> Vec<(usize, &'s Table)> {
    let tables = referenced_tables(stmt, schema);
    let tokens = stmt.tokens();
    let mut sites = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        if !matches!(token.kind, TokenKind::Identifier | TokenKind::QuotedIdentifier) {
            continue;
        }
        if tokens.get(i + 1).is_some_and(|n| matches!(n.kind, TokenKind::LParen | TokenKind::Dot)) {
            continue;
        }
        let name = unquote(&token.text);
        let qualified = i >= 2 && tokens[i - 1].kind == TokenKind::Dot;
        let qualifier = qualified.then(|| unquote(&tokens[i - 2].text));
        let owner = match qualifier {
            Some(q) => tables.iter().find(|t| t.name.eq_ignore_ascii_case(&q)).copied(),
            None => tables.iter().find(|t| t.column(&name).is_some()).copied(),
        };
        if let Some(table) = owner.filter(|t| t.column(&name).is_some() && t.columns.len() > 1) {
            sites.push((i, table));
        }
    }
    sites
}

fn substitute_identifier(
    stmt: &Statement,
    ctx: &MutationContext<'_>,
    rng: &mut RngContext,
) -> Option<Vec<Token>> {
    let sites = column_sites(stmt, ctx.schema);
    let (index, table) = *rng.choose("mutation.site", &sites)?;
    let current = unquote(&stmt.tokens()[index].text);
    let current_type = table.column(&current).map(|c| c.column_type);
    let others: Vec<&str> = table
        .columns
        .iter()
        .filter(|c| !c.name.eq_ignore_ascii_case(&current))
        .map(|c| c.name.as_str())
        .collect();
    let same_type: Vec<&str> = others
        .iter()
        .copied()
        .filter(|name| table.column(name).map(|c| c.column_type) == current_type)
        .collect();
    let pool = if same_type.is_empty() { &others } else { &same_type };
    let name = *rng.choose("mutation.column", pool)?;
    Some(replace(stmt.tokens(), index..index + 1, &lex(&quote_identifier(name))?))
}

/// Expressions that can be wrapped: select items and column references in WHERE.
fn wrap_sites(stmt: &Statement, schema: &Schema) -> Vec<Range<usize>> {
    let tokens = stmt.tokens();
    let mut sites: Vec<Range<usize>> = stmt
        .select_items()
        .into_iter()
        .filter(|r| {
            let item = &tokens[r.clone()];
            !item.iter().any(|t| t.is_keyword("AS") || t.is_operator("*"))
        })
        .collect();
    if let Some(predicate) = stmt.where_predicate() {
        for (index, _) in column_sites(stmt, schema) {
            if predicate.contains(&index) {
                let qualified = index >= 2 && tokens[index - 1].kind == TokenKind::Dot;
                let start = if qualified { index - 2 } else { index };
                sites.push(start..index + 1);
            }
        }
    }
    sites
}

fn wrap_in_function(
    stmt: &Statement,
    ctx: &MutationContext<'_>,
    rng: &mut RngContext,
) -> Option<Vec<Token>> {
    let sites = wrap_sites(stmt, ctx.schema);
    let range = rng.choose("mutation.site", &sites)?.clone();
    let function = *rng.choose("mutation.function", WRAPPING_FUNCTIONS)?;
    let mut wrapped = vec![
        Token::new(TokenKind::Identifier, function),
        Token::new(TokenKind::LParen, "("),
    ];
    wrapped.extend_from_slice(&stmt.tokens()[range.clone()]);
    wrapped.push(Token::new(TokenKind::RParen, ")"));
    Some(replace(stmt.tokens(), range, &wrapped))
}

/// Whether every column reference in `piece` resolves against `tables`.
fn resolves(piece: &[Token], tables: &[&Table]) -> bool {
    piece.iter().enumerate().all(|(i, token)| {
        if !matches!(token.kind, TokenKind::Identifier | TokenKind::QuotedIdentifier) {
            return true;
        }
        if piece.get(i + 1).is_some_and(|n| matches!(n.kind, TokenKind::LParen | TokenKind::Dot)) {
            // Function name or table qualifier; qualifiers are checked with their column.
            return piece.get(i + 1).is_some_and(|n| n.kind == TokenKind::LParen)
                || tables.iter().any(|t| t.name.eq_ignore_ascii_case(&unquote(&token.text)));
        }
        let name = unquote(&token.text);
        tables.iter().any(|t| t.column(&name).is_some())
    })
}

/// Splice targets in `stmt`, each paired with a compatible donor piece.
fn splice_sites(stmt: &Statement, ctx: &MutationContext<'_>) -> Vec<(Range<usize>, Vec<Token>)> {
    let tables = referenced_tables(stmt, ctx.schema);
    if tables.is_empty() {
        return Vec::new();
    }
    let own_conjuncts = stmt
        .where_predicate()
        .map(|p| stmt.conjuncts(p))
        .unwrap_or_default();
    let own_items = stmt.select_items();
    let mut sites = Vec::new();
    for donor in ctx.donors {
        let Ok(statements) = sql::parse_script(donor.sql()) else {
            continue;
        };
        for other in &statements {
            if let Some(predicate) = other.where_predicate() {
                for conjunct in other.conjuncts(predicate) {
                    let piece = &other.tokens()[conjunct];
                    if piece.is_empty() || !resolves(piece, &tables) {
                        continue;
                    }
                    for target in &own_conjuncts {
                        if stmt.tokens()[target.clone()] != *piece {
                            sites.push((target.clone(), piece.to_vec()));
                        }
                    }
                }
            }
            for item in other.select_items() {
                let piece = &other.tokens()[item];
                let aliased = piece.iter().any(|t| t.is_operator("*") || t.is_keyword("AS"));
                if aliased || !resolves(piece, &tables) {
                    continue;
                }
                for target in &own_items {
                    if stmt.tokens()[target.clone()] != *piece {
                        sites.push((target.clone(), piece.to_vec()));
                    }
                }
            }
        }
    }
    sites
}

fn quote_sites(stmt: &Statement) -> Vec<usize> {
    stmt.tokens()
        .iter()
        .enumerate()
        .filter(|(_, t)| {
            t.kind == TokenKind::String
                || (t.kind == TokenKind::QuotedIdentifier && t.text.starts_with('"'))
        })
        .map(|(i, _)| i)
        .collect()
}

fn flip_quotes(stmt: &Statement, rng: &mut RngContext) -> Option<Vec<Token>> {
    let sites = quote_sites(stmt);
    let index = *rng.choose("mutation.site", &sites)?;
    let token = &stmt.tokens()[index];
    let body = token.text.get(1..token.text.len().checked_sub(1)?)?;
    let flipped = if token.kind == TokenKind::String {
        let raw = body.replace("''", "'");
        Token::new(TokenKind::QuotedIdentifier, format!("\"{}\"", raw.replace('"', "\"\"")))
    } else {
        let raw = body.replace("\"\"", "\"");
        Token::new(TokenKind::String, format!("'{}'", raw.replace('\'', "''")))
    };
    Some(replace(stmt.tokens(), index..index + 1, &[flipped]))
}

#[derive(Debug, Clone)]
pub struct MutatorConfig {
    pub min_mutations: usize,
    pub max_mutations: usize,
    pub boundary_literal_probability: f64,
}

impl Default for MutatorConfig {
    fn default() -> Self {
        Self {
            min_mutations: DEFAULT_MIN_MUTATIONS,
            max_mutations: DEFAULT_MAX_MUTATIONS,
            boundary_literal_probability: 0.3,
        }
    }
}

/// Applies a randomly drawn number of registry operators to a corpus candidate.
#[derive(Debug, Clone, Default)]
pub struct Mutator {
    config: MutatorConfig,
}

impl Mutator {
    pub fn new(config: MutatorConfig) -> Self {
        Self { config }
    }

    /// Mutates `parent` (corpus entry `parent_id`).
    ///
    /// The operator count is drawn first, then for each step a statement, an
    /// applicable operator and a site. All draws land in the returned
    /// candidate's provenance, together with the names of the operators that
    /// took effect.
    ///
    /// # Returns
    /// `None` when the parent does not parse or no operator applied, in which
    /// case the caller falls back to generation.
    pub fn mutate(
        &self,
        parent: &Candidate,
        parent_id: u64,
        schema: &Schema,
        donors: &[Arc<Candidate>],
        rng: &mut RngContext,
    ) -> Option<Candidate> {
        let mut statements: Vec<Vec<Token>> = sql::parse_script(parent.sql())
            .ok()?
            .into_iter()
            .map(|s| s.tokens().to_vec())
            .collect();
        let ctx = MutationContext {
            schema,
            donors,
            boundary_literal_probability: self.config.boundary_literal_probability,
        };
        let low = self.config.min_mutations.max(1) as i64;
        let high = self.config.max_mutations.max(self.config.min_mutations).max(1) as i64;
        let count = rng.range_inclusive("mutation.count", low, high);
        let mut applied = Vec::new();
        for _ in 0..count {
            let which = rng.below("mutation.statement", statements.len());
            // An earlier quote flip may have left the statement unparseable.
            let Ok(stmt) = Statement::from_tokens(statements[which].clone()) else {
                continue;
            };
            let applicable: Vec<MutationOperator> = MutationOperator::ALL
                .iter()
                .copied()
                .filter(|op| op.applies(&stmt, &ctx))
                .collect();
            let Some(op) = rng.choose("mutation.operator-choice", &applicable).copied() else {
                continue;
            };
            if let Some(tokens) = op.transform(&stmt, &ctx, rng) {
                statements[which] = tokens;
                applied.push(op.name().to_string());
            }
        }
        if applied.is_empty() {
            return None;
        }
        let sql = statements
            .iter()
            .map(|tokens| sql::render(tokens))
            .collect::<Vec<_>>()
            .join("; ");
        trace!(parent = parent_id, operators = ?applied, "mutated candidate");
        Some(Candidate::mutated(sql, parent, parent_id, applied, rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{GrammarConfig, GrammarGenerator};
    use crate::executor::{DifferentialOutcome, EngineStatus, ExecutionOutcome};
    use crate::input::Origin;
    use crate::oracle::{DifferentialOracle, VerdictKind};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn seed(sql: &str) -> Arc<Candidate> {
        let mut rng = RngContext::new(0, 0);
        Arc::new(Candidate::seed(sql.to_string(), 0, &mut rng))
    }

    fn corpus_queries(count: u64) -> Vec<Statement> {
        let generator = GrammarGenerator::new(GrammarConfig::default());
        let schema = Schema::storefront();
        (0..count)
            .map(|stream| {
                let mut rng = RngContext::new(77, stream);
                let candidate = generator
                    .generate(0, &schema, &BTreeSet::new(), &mut rng)
                    .expect("generate");
                Statement::parse(candidate.sql()).expect("generated query parses")
            })
            .collect()
    }

    fn outcome(version: &str, rows: Vec<Vec<String>>) -> ExecutionOutcome {
        ExecutionOutcome {
            engine_version: version.to_string(),
            status: EngineStatus::Exited(0),
            crashed: false,
            timed_out: false,
            rows: Some(rows),
            error: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::from_millis(2),
            coverage: Vec::new(),
        }
    }

    /// `(position, descending)` terms of the statement's ORDER BY.
    fn order_terms(sql: &str) -> Vec<(usize, bool)> {
        let (_, tail) = sql.split_once("ORDER BY ").expect("order by");
        let tail = tail.split(" LIMIT").next().unwrap_or(tail);
        tail.split(", ")
            .map(|term| {
                let desc = term.ends_with(" DESC");
                let position = term.trim_end_matches(" DESC").parse().expect("position");
                (position, desc)
            })
            .collect()
    }

    #[test]
    fn inserted_order_by_covers_every_output_column() {
        let schema = Schema::storefront();
        let ctx = MutationContext {
            schema: &schema,
            donors: &[],
            boundary_literal_probability: 0.3,
        };
        let stmt = Statement::parse("SELECT name, category FROM products").expect("parse");
        let ordered = (0..200)
            .find_map(|stream| {
                let mut rng = RngContext::new(5, stream);
                let tokens = MutationOperator::ClauseInsertion.transform(&stmt, &ctx, &mut rng)?;
                let text = sql::render(&tokens);
                text.contains("ORDER BY").then_some(text)
            })
            .expect("an ORDER BY insertion");
        let terms = order_terms(&ordered);
        assert_eq!(terms.iter().map(|t| t.0).collect::<Vec<_>>(), vec![1, 2]);

        // Both engines honor the ordering but scan ties on the first column in opposite order.
        let sort = |mut rows: Vec<Vec<String>>| {
            rows.sort_by(|a, b| {
                terms
                    .iter()
                    .map(|&(position, desc)| {
                        let order = a[position - 1].cmp(&b[position - 1]);
                        if desc { order.reverse() } else { order }
                    })
                    .find(|order| order.is_ne())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            rows
        };
        let row = |a: &str, b: &str| vec![a.to_string(), b.to_string()];
        let primary = sort(vec![row("pen", "a"), row("pen", "b")]);
        let reference = sort(vec![row("pen", "b"), row("pen", "a")]);
        let verdict = DifferentialOracle::default().classify(
            &ordered,
            DifferentialOutcome {
                primary: outcome("3.45.0", primary),
                reference: Some(outcome("3.39.4", reference)),
            },
        );
        assert_eq!(verdict.kind, VerdictKind::Normal);
    }

    #[test]
    fn order_by_is_not_offered_for_unknown_star_width() {
        let schema = Schema::storefront();
        let stmt = Statement::parse("SELECT * FROM users JOIN orders ON users.id = orders.user_id")
            .expect("parse");
        let tables = referenced_tables(&stmt, &schema);
        assert_eq!(output_width(&stmt, &tables), None);
        let missing = missing_clauses(&stmt, &schema);
        assert!(missing.iter().all(|(kind, _)| *kind != ClauseKind::OrderBy));

        let stmt = Statement::parse("SELECT *, name FROM users").expect("parse");
        let tables = referenced_tables(&stmt, &schema);
        assert_eq!(output_width(&stmt, &tables), Some(7));
    }

    #[test]
    fn like_with_escape_is_not_swapped_for_glob() {
        let stmt = Statement::parse(
            "SELECT name FROM users WHERE name LIKE 'a!%' ESCAPE '!' AND email LIKE '%@x'",
        )
        .expect("parse");
        let like_sites: Vec<usize> = operator_sites(&stmt)
            .into_iter()
            .filter(|(i, _)| stmt.tokens()[*i].is_keyword("LIKE"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(like_sites.len(), 1);
        assert_eq!(stmt.tokens()[like_sites[0] + 1].text, "'%@x'");

        let sql = "SELECT name FROM users WHERE (name LIKE 'a%') AND age > 1";
        let stmt = Statement::parse(sql).expect("parse");
        assert!(operator_sites(&stmt).iter().any(|(i, _)| stmt.tokens()[*i].is_keyword("LIKE")));
    }

    #[test]
    fn guaranteed_operators_keep_queries_well_formed() {
        let schema = Schema::storefront();
        let donors = vec![
            seed("SELECT name, age FROM users WHERE age > 30 AND name LIKE 'a%'"),
            seed("SELECT price FROM products WHERE stock BETWEEN 1 AND 5"),
        ];
        let ctx = MutationContext {
            schema: &schema,
            donors: &donors,
            boundary_literal_probability: 0.3,
        };
        let mut exercised = HashSet::new();
        for (n, stmt) in corpus_queries(150).iter().enumerate() {
            for op in MutationOperator::ALL {
                let guarantee = op.guarantee();
                if !guarantee.well_formed || !op.applies(stmt, &ctx) {
                    continue;
                }
                let mut rng = RngContext::new(n as u64, 1);
                if let Some(tokens) = op.transform(stmt, &ctx, &mut rng) {
                    exercised.insert(op);
                    let text = sql::render(&tokens);
                    let reparsed = Statement::parse(&text)
                        .unwrap_or_else(|e| panic!("{} produced malformed {text}: {e}", op.name()));
                    if guarantee.same_kind {
                        let name = op.name();
                        assert_eq!(reparsed.kind(), stmt.kind(), "{name} changed kind: {text}");
                    }
                }
            }
        }
        for op in MutationOperator::ALL.iter().filter(|op| op.guarantee().well_formed) {
            assert!(exercised.contains(op), "{} never applied", op.name());
        }
    }

    #[test]
    fn operator_substitution_leaves_between_intact() {
        let stmt = Statement::parse("SELECT a FROM t WHERE a BETWEEN 1 AND 5").expect("parse");
        assert!(operator_sites(&stmt).is_empty());
        let stmt =
            Statement::parse("SELECT a FROM t WHERE a BETWEEN 1 AND 5 AND b = 2").expect("parse");
        let sites: Vec<usize> = operator_sites(&stmt).into_iter().map(|(i, _)| i).collect();
        assert_eq!(sites.len(), 2, "outer AND and '=' only");
    }

    #[test]
    fn clause_deletion_drops_having_with_group_by() {
        let stmt = Statement::parse(
            "SELECT a, COUNT(*) FROM t GROUP BY a HAVING COUNT(*) > 1 ORDER BY 1",
        )
        .expect("parse");
        let texts: Vec<String> = deletable_clauses(&stmt)
            .into_iter()
            .map(|r| sql::render(&replace(stmt.tokens(), r, &[])))
            .collect();
        assert!(texts.contains(&"SELECT a, COUNT(*) FROM t ORDER BY 1".to_string()));
        assert!(texts.contains(&"SELECT a, COUNT(*) FROM t GROUP BY a ORDER BY 1".to_string()));
    }

    #[test]
    fn identifier_substitution_stays_within_the_table() {
        let schema = Schema::storefront();
        let ctx = MutationContext {
            schema: &schema,
            donors: &[],
            boundary_literal_probability: 0.0,
        };
        let stmt = Statement::parse("SELECT age FROM users").expect("parse");
        let users: HashSet<&str> = ["id", "name", "email", "joined_date", "score", "age"].into();
        for stream in 0..30 {
            let mut rng = RngContext::new(4, stream);
            let tokens = MutationOperator::IdentifierSubstitution
                .transform(&stmt, &ctx, &mut rng)
                .expect("applies");
            let column = &tokens[1].text;
            assert!(users.contains(column.as_str()) && column != "age", "{column}");
        }
    }

    #[test]
    fn structural_splice_uses_donor_predicates() {
        let schema = Schema::storefront();
        let donors = vec![seed("SELECT id FROM users WHERE score > 1.5")];
        let ctx = MutationContext {
            schema: &schema,
            donors: &donors,
            boundary_literal_probability: 0.3,
        };
        let stmt = Statement::parse("SELECT name FROM users WHERE age = 3").expect("parse");
        let mut rng = RngContext::new(0, 0);
        let mut outputs = HashSet::new();
        for _ in 0..20 {
            let spliced = MutationOperator::StructuralSplice.transform(&stmt, &ctx, &mut rng);
            if let Some(tokens) = spliced {
                outputs.insert(sql::render(&tokens));
            }
        }
        assert!(outputs.contains("SELECT name FROM users WHERE score > 1.5"), "{outputs:?}");
        assert!(outputs.contains("SELECT id FROM users WHERE age = 3"), "{outputs:?}");
    }

    #[test]
    fn splice_ignores_donors_from_other_tables() {
        let schema = Schema::storefront();
        let donors = vec![seed("SELECT price FROM products WHERE stock > 3")];
        let ctx = MutationContext {
            schema: &schema,
            donors: &donors,
            boundary_literal_probability: 0.3,
        };
        let stmt = Statement::parse("SELECT name FROM users WHERE age = 3").expect("parse");
        assert!(!MutationOperator::StructuralSplice.applies(&stmt, &ctx));
    }

    #[test]
    fn quote_flip_turns_strings_into_identifiers() {
        let stmt =
            Statement::parse("SELECT name FROM users WHERE name = 'O''Brien'").expect("parse");
        let mut rng = RngContext::new(0, 0);
        let ctx = MutationContext {
            schema: &Schema::storefront(),
            donors: &[],
            boundary_literal_probability: 0.3,
        };
        let tokens = MutationOperator::QuoteFlip
            .transform(&stmt, &ctx, &mut rng)
            .expect("applies");
        assert_eq!(sql::render(&tokens), "SELECT name FROM users WHERE name = \"O'Brien\"");
    }

    #[test]
    fn mutate_records_provenance_and_replays() {
        let schema = Schema::storefront();
        let parent = seed("SELECT name, age FROM users WHERE age > 30");
        let mutator = Mutator::default();
        let run = || {
            let mut rng = RngContext::new(12, 3);
            mutator
                .mutate(&parent, 0, &schema, &[], &mut rng)
                .expect("mutation applies")
        };
        let first = run();
        let second = run();
        assert_eq!(first, second);
        assert_eq!(first.origin(), Origin::Mutated);
        assert_eq!(first.provenance().parent, Some(0));
        assert!(!first.provenance().operators.is_empty());
        assert_eq!(first.provenance().draws[0].label, "mutation.count");
    }

    #[test]
    fn nothing_applies_to_transaction_control() {
        let schema = Schema::storefront();
        let parent = seed("BEGIN");
        let mut rng = RngContext::new(0, 0);
        assert!(Mutator::default().mutate(&parent, 0, &schema, &[], &mut rng).is_none());
        let unparseable = seed("SELEC oops (");
        assert!(Mutator::default().mutate(&unparseable, 0, &schema, &[], &mut rng).is_none());
    }
}

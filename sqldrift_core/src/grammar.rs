use crate::input::Candidate;
use crate::rng::RngContext;
use crate::schema::{ColumnType, Schema, Table};
use crate::sql;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("Seed database {0} has no table with columns to query")]
    NoUsableTable(usize),
}

#[derive(Debug, Clone, Copy)]
struct Alternative {
    id: &'static str,
    weight: f64,
}

const fn alt(id: &'static str, weight: f64) -> Alternative {
    Alternative { id, weight }
}

const STATEMENT: &[Alternative] = &[
    alt("stmt.select", 6.0),
    alt("stmt.insert", 1.0),
    alt("stmt.update", 1.0),
    alt("stmt.delete", 1.0),
    alt("stmt.ddl", 1.0),
];
const DISTINCT: &[Alternative] = &[alt("select.all", 4.0), alt("select.distinct", 1.0)];
const ITEMS: &[Alternative] = &[
    alt("items.star", 1.0),
    alt("items.columns", 3.0),
    alt("items.expressions", 2.0),
    alt("items.aggregate", 1.0),
];
const FROM: &[Alternative] = &[alt("from.single", 3.0), alt("from.join", 1.0)];
const JOIN: &[Alternative] = &[
    alt("join.inner", 2.0),
    alt("join.left", 2.0),
    alt("join.cross", 1.0),
];
const WHERE: &[Alternative] = &[alt("where.none", 1.0), alt("where.predicate", 3.0)];
const GROUP_BY: &[Alternative] = &[
    alt("group.none", 4.0),
    alt("group.by", 1.0),
    alt("group.having", 1.0),
];
const COMPOUND: &[Alternative] = &[
    alt("compound.none", 8.0),
    alt("compound.union", 1.0),
    alt("compound.union-all", 1.0),
    alt("compound.intersect", 1.0),
    alt("compound.except", 1.0),
];
const ORDER_BY: &[Alternative] = &[alt("order.none", 1.0), alt("order.by", 1.0)];
const LIMIT: &[Alternative] = &[
    alt("limit.none", 3.0),
    alt("limit.count", 1.0),
    alt("limit.offset", 1.0),
];
const EXPR: &[Alternative] = &[
    alt("expr.column", 4.0),
    alt("expr.literal", 2.0),
    alt("expr.arithmetic", 1.0),
    alt("expr.function", 1.0),
    alt("expr.case", 0.5),
    alt("expr.cast", 0.5),
];
const PREDICATE: &[Alternative] = &[
    alt("pred.compare", 4.0),
    alt("pred.null-check", 1.0),
    alt("pred.between", 1.0),
    alt("pred.in-list", 1.0),
    alt("pred.like", 1.0),
    alt("pred.and", 1.5),
    alt("pred.or", 1.0),
    alt("pred.not", 0.5),
    alt("pred.exists", 0.5),
    alt("pred.in-subquery", 0.5),
];
const INSERT: &[Alternative] = &[
    alt("insert.values", 3.0),
    alt("insert.multi-row", 1.0),
    alt("insert.select", 1.0),
];
const UPDATE: &[Alternative] = &[alt("update.where", 3.0), alt("update.all", 1.0)];
const DELETE: &[Alternative] = &[alt("delete.where", 3.0), alt("delete.all", 1.0)];
const DDL: &[Alternative] = &[
    alt("ddl.create-table", 1.0),
    alt("ddl.create-table-as", 1.0),
    alt("ddl.create-index", 1.0),
    alt("ddl.create-view", 1.0),
    alt("ddl.alter-add-column", 1.0),
];
const LITERAL: &[&str] = &["literal.ordinary", "literal.boundary"];

/// Grammar nonterminals with a choice between alternatives.
///
/// Every alternative carries a stable rule id, which is what grammar coverage
/// is measured in. For the recursive nonterminals the first alternative is
/// non-recursive and is forced once the depth limit is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nonterminal {
    Statement,
    Distinct,
    Items,
    From,
    Join,
    Where,
    GroupBy,
    Compound,
    OrderBy,
    Limit,
    Expr,
    Predicate,
    Insert,
    Update,
    Delete,
    Ddl,
}

impl Nonterminal {
    const ALL: [Nonterminal; 16] = [
        Nonterminal::Statement,
        Nonterminal::Distinct,
        Nonterminal::Items,
        Nonterminal::From,
        Nonterminal::Join,
        Nonterminal::Where,
        Nonterminal::GroupBy,
        Nonterminal::Compound,
        Nonterminal::OrderBy,
        Nonterminal::Limit,
        Nonterminal::Expr,
        Nonterminal::Predicate,
        Nonterminal::Insert,
        Nonterminal::Update,
        Nonterminal::Delete,
        Nonterminal::Ddl,
    ];

    fn alternatives(self) -> &'static [Alternative] {
        match self {
            Nonterminal::Statement => STATEMENT,
            Nonterminal::Distinct => DISTINCT,
            Nonterminal::Items => ITEMS,
            Nonterminal::From => FROM,
            Nonterminal::Join => JOIN,
            Nonterminal::Where => WHERE,
            Nonterminal::GroupBy => GROUP_BY,
            Nonterminal::Compound => COMPOUND,
            Nonterminal::OrderBy => ORDER_BY,
            Nonterminal::Limit => LIMIT,
            Nonterminal::Expr => EXPR,
            Nonterminal::Predicate => PREDICATE,
            Nonterminal::Insert => INSERT,
            Nonterminal::Update => UPDATE,
            Nonterminal::Delete => DELETE,
            Nonterminal::Ddl => DDL,
        }
    }

    fn is_recursive(self) -> bool {
        matches!(self, Nonterminal::Expr | Nonterminal::Predicate)
    }
}

/// Every rule id the generator can emit.
pub fn all_rules() -> Vec<&'static str> {
    Nonterminal::ALL
        .iter()
        .flat_map(|nt| nt.alternatives().iter().map(|a| a.id))
        .chain(LITERAL.iter().copied())
        .collect()
}

/// Fraction of all grammar rules present in `frontier`, in percent.
pub fn grammar_coverage(frontier: &BTreeSet<&'static str>) -> f64 {
    let all = all_rules();
    let covered = all.iter().filter(|r| frontier.contains(*r)).count();
    covered as f64 * 100.0 / all.len() as f64
}

const BOUNDARY_INTEGERS: &[&str] = &[
    "0",
    "-1",
    "1",
    "2147483647",
    "-2147483648",
    "9223372036854775807",
    "-9223372036854775808",
    "NULL",
];
const BOUNDARY_REALS: &[&str] = &[
    "0.0",
    "-0.0",
    "1.7976931348623157e308",
    "2.2250738585072014e-308",
    "-1e308",
    "1e-10",
    "NULL",
];
const BOUNDARY_TEXTS: &[&str] = &[
    "''",
    "' '",
    "'%'",
    "'_'",
    "'NULL'",
    "'O''Brien'",
    "'ünïcödé ✓'",
    "NULL",
];
const BOUNDARY_BLOBS: &[&str] = &["x''", "x'00'", "x'FF'", "x'DEADBEEF'", "NULL"];
const WORDS: &[&str] = &[
    "alice",
    "bob",
    "carol",
    "widget",
    "gadget",
    "books",
    "electronics",
    "2023-01-15",
    "great product",
    "a",
];

/// An edge-case literal of the given type: zero, extremes, empty, NULL and the like.
pub fn boundary_literal(ty: ColumnType, rng: &mut RngContext) -> String {
    let pool = match ty {
        ColumnType::Integer => BOUNDARY_INTEGERS,
        ColumnType::Real => BOUNDARY_REALS,
        ColumnType::Text => BOUNDARY_TEXTS,
        ColumnType::Blob => BOUNDARY_BLOBS,
    };
    rng.choose("literal.boundary", pool)
        .copied()
        .unwrap_or("NULL")
        .to_string()
}

/// An unremarkable literal of the given type.
pub fn ordinary_literal(ty: ColumnType, rng: &mut RngContext) -> String {
    match ty {
        ColumnType::Integer => rng.range_inclusive("literal.integer", -100, 1000).to_string(),
        ColumnType::Real => {
            let cents = rng.range_inclusive("literal.real", -10_000, 100_000);
            format!("{:.2}", cents as f64 / 100.0)
        }
        ColumnType::Text => {
            let word = rng.choose("literal.text", WORDS).copied().unwrap_or("a");
            format!("'{word}'")
        }
        ColumnType::Blob => {
            let len = rng.range_inclusive("literal.blob-len", 1, 4);
            let hex: String = (0..len)
                .map(|_| format!("{:02X}", rng.below("literal.blob-byte", 256)))
                .collect();
            format!("x'{hex}'")
        }
    }
}

/// Quotes `name` unless it is a plain, non-keyword identifier.
/// `ORDER BY` over every output position `1..=width`.
///
/// Ordering by all positions makes the row order total, so an ordered
/// comparison never trips over rows that tie on a prefix of the columns.
pub fn total_order_by(width: usize, rng: &mut RngContext) -> String {
    let terms: Vec<String> = (1..=width.max(1))
        .map(|position| {
            if rng.chance("order.desc", 0.3) {
                format!("{position} DESC")
            } else {
                position.to_string()
            }
        })
        .collect();
    format!("ORDER BY {}", terms.join(", "))
}

pub fn quote_identifier(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain && !sql::is_keyword(name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

#[derive(Debug, Clone)]
pub struct GrammarConfig {
    /// Expression nesting limit; past it recursive rules take their terminal alternative.
    pub max_depth: usize,
    pub boundary_literal_probability: f64,
    /// Steer choices toward rules absent from the grammar frontier.
    pub grammar_coverage: bool,
}

impl Default for GrammarConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            boundary_literal_probability: 0.3,
            grammar_coverage: false,
        }
    }
}

/// Synthesizes schema-valid SQL from the grammar.
#[derive(Debug, Clone, Default)]
pub struct GrammarGenerator {
    config: GrammarConfig,
}

impl GrammarGenerator {
    pub fn new(config: GrammarConfig) -> Self {
        Self { config }
    }

    /// Produces one candidate against `schema`.
    ///
    /// Fails only when the schema has no table with at least one column. The
    /// query may be semantically unsatisfiable (a constraint violation, an
    /// empty result); that is not an error.
    pub fn generate(
        &self,
        database: usize,
        schema: &Schema,
        frontier: &BTreeSet<&'static str>,
        rng: &mut RngContext,
    ) -> Result<Candidate, GenerationError> {
        let tables = schema.usable_tables();
        if tables.is_empty() {
            return Err(GenerationError::NoUsableTable(database));
        }
        let (sql, rules) = {
            let mut expansion = Expansion {
                config: &self.config,
                tables,
                frontier,
                rng: &mut *rng,
                rules: BTreeSet::new(),
            };
            let sql = expansion.statement();
            (sql, expansion.rules)
        };
        Ok(Candidate::generated(sql, database, rules, rng))
    }
}

/// Tables visible to an expression, and whether column names need qualifying.
#[derive(Clone)]
struct Scope<'a> {
    tables: Vec<&'a Table>,
}

impl Scope<'_> {
    fn qualify(&self) -> bool {
        self.tables.len() > 1
    }
}

struct Expansion<'a, 'r> {
    config: &'a GrammarConfig,
    tables: Vec<&'a Table>,
    frontier: &'a BTreeSet<&'static str>,
    rng: &'r mut RngContext,
    rules: BTreeSet<&'static str>,
}

impl<'a> Expansion<'a, '_> {
    fn expand(&mut self, nt: Nonterminal, depth: usize) -> &'static str {
        let alternatives = nt.alternatives();
        let index = if nt.is_recursive() && depth >= self.config.max_depth {
            0
        } else if self.config.grammar_coverage {
            let uncovered: Vec<usize> = alternatives
                .iter()
                .enumerate()
                .filter(|(_, a)| !self.frontier.contains(a.id) && !self.rules.contains(a.id))
                .map(|(i, _)| i)
                .collect();
            if uncovered.is_empty() {
                self.weighted(alternatives)
            } else {
                uncovered[self.rng.below("grammar.uncovered", uncovered.len())]
            }
        } else {
            self.weighted(alternatives)
        };
        let id = alternatives[index].id;
        self.rules.insert(id);
        id
    }

    fn weighted(&mut self, alternatives: &[Alternative]) -> usize {
        let weights: Vec<f64> = alternatives.iter().map(|a| a.weight).collect();
        self.rng.weighted("grammar", &weights).unwrap_or(0)
    }

    fn table(&mut self) -> &'a Table {
        let index = self.rng.below("table", self.tables.len());
        self.tables[index]
    }

    fn other_table(&mut self, not: &Table) -> Option<&'a Table> {
        let others: Vec<&'a Table> = self
            .tables
            .iter()
            .copied()
            .filter(|t| t.name != not.name)
            .collect();
        self.rng.choose("table.other", &others).copied()
    }

    fn column_ref(scope: &Scope<'_>, table: &Table, column: &str) -> String {
        if scope.qualify() {
            format!("{}.{}", quote_identifier(&table.name), quote_identifier(column))
        } else {
            quote_identifier(column)
        }
    }

    fn column(&mut self, scope: &Scope<'a>) -> (String, ColumnType) {
        let table = scope.tables[self.rng.below("scope.table", scope.tables.len())];
        let column = &table.columns[self.rng.below("scope.column", table.columns.len())];
        (Self::column_ref(scope, table, &column.name), column.column_type)
    }

    fn column_where(
        &mut self,
        scope: &Scope<'a>,
        pred: impl Fn(ColumnType) -> bool,
    ) -> Option<(String, ColumnType)> {
        let mut matching = Vec::new();
        for table in &scope.tables {
            for column in table.columns.iter().filter(|c| pred(c.column_type)) {
                matching.push((Self::column_ref(scope, table, &column.name), column.column_type));
            }
        }
        self.rng.choose("scope.typed-column", &matching).cloned()
    }

    fn literal(&mut self, ty: ColumnType) -> String {
        if self.rng.chance("literal.kind", self.config.boundary_literal_probability) {
            self.rules.insert("literal.boundary");
            boundary_literal(ty, self.rng)
        } else {
            self.rules.insert("literal.ordinary");
            ordinary_literal(ty, self.rng)
        }
    }

    fn any_type(&mut self) -> ColumnType {
        const TYPES: [ColumnType; 4] = [
            ColumnType::Integer,
            ColumnType::Real,
            ColumnType::Text,
            ColumnType::Blob,
        ];
        TYPES[self.rng.below("literal.type", TYPES.len())]
    }

    fn statement(&mut self) -> String {
        match self.expand(Nonterminal::Statement, 0) {
            "stmt.insert" => self.insert(),
            "stmt.update" => self.update(),
            "stmt.delete" => self.delete(),
            "stmt.ddl" => self.ddl(),
            _ => self.select(),
        }
    }

    fn expr(&mut self, scope: &Scope<'a>, depth: usize) -> (String, ColumnType) {
        match self.expand(Nonterminal::Expr, depth) {
            "expr.literal" => {
                let ty = self.any_type();
                (self.literal(ty), ty)
            }
            "expr.arithmetic" => {
                let (left, ty) = self.expr(scope, depth + 1);
                const OPS: &[&str] = &["+", "-", "*", "/", "%", "||"];
                let op = self.rng.choose("expr.op", OPS).copied().unwrap_or("+");
                if op == "||" {
                    let right = self.literal(ColumnType::Text);
                    (format!("({left} || {right})"), ColumnType::Text)
                } else {
                    let right_ty = if ty == ColumnType::Real {
                        ColumnType::Real
                    } else {
                        ColumnType::Integer
                    };
                    let right = self.literal(right_ty);
                    (format!("({left} {op} {right})"), right_ty)
                }
            }
            "expr.function" => self.function(scope, depth),
            "expr.case" => {
                let condition = self.predicate(scope, depth + 1);
                let (then, ty) = self.expr(scope, depth + 1);
                let otherwise = self.literal(ty);
                (format!("CASE WHEN {condition} THEN {then} ELSE {otherwise} END"), ty)
            }
            "expr.cast" => {
                let (inner, _) = self.expr(scope, depth + 1);
                let target = self.any_type();
                (format!("CAST({inner} AS {})", target.sql_name()), target)
            }
            _ => self.column(scope),
        }
    }

    fn function(&mut self, scope: &Scope<'a>, depth: usize) -> (String, ColumnType) {
        let (arg, ty) = self.expr(scope, depth + 1);
        let choice = self.rng.below("expr.function", 8);
        match choice {
            0 => (format!("ABS({arg})"), ty),
            1 => (format!("COALESCE({arg}, {})", self.literal(ty)), ty),
            2 => (format!("LENGTH({arg})"), ColumnType::Integer),
            3 => (format!("LOWER({arg})"), ColumnType::Text),
            4 => (format!("UPPER({arg})"), ColumnType::Text),
            5 => {
                let start = self.rng.range_inclusive("expr.substr", -2, 5);
                (format!("SUBSTR({arg}, {start}, 3)"), ColumnType::Text)
            }
            6 => (format!("TYPEOF({arg})"), ColumnType::Text),
            _ => {
                let digits = self.rng.range_inclusive("expr.round", 0, 3);
                (format!("ROUND({arg}, {digits})"), ColumnType::Real)
            }
        }
    }

    fn predicate(&mut self, scope: &Scope<'a>, depth: usize) -> String {
        match self.expand(Nonterminal::Predicate, depth) {
            "pred.null-check" => {
                let (column, _) = self.column(scope);
                let negate = if self.rng.chance("pred.negate", 0.5) { " NOT" } else { "" };
                format!("{column} IS{negate} NULL")
            }
            "pred.between" => {
                let (column, ty) = self.column(scope);
                let low = self.literal(ty);
                let high = self.literal(ty);
                let negate = if self.rng.chance("pred.negate", 0.3) { "NOT " } else { "" };
                format!("{column} {negate}BETWEEN {low} AND {high}")
            }
            "pred.in-list" => {
                let (column, ty) = self.column(scope);
                let count = self.rng.range_inclusive("pred.in-count", 1, 4);
                let items: Vec<String> = (0..count).map(|_| self.literal(ty)).collect();
                let negate = if self.rng.chance("pred.negate", 0.3) { "NOT " } else { "" };
                format!("{column} {negate}IN ({})", items.join(", "))
            }
            "pred.like" => {
                let (column, _) = self
                    .column_where(scope, |t| t == ColumnType::Text)
                    .unwrap_or_else(|| self.column(scope));
                const PATTERNS: &[&str] = &["'%a%'", "'a%'", "'%'", "'_'", "'%e'", "''"];
                let pattern = self.rng.choose("pred.pattern", PATTERNS).copied().unwrap_or("'%'");
                let op = if self.rng.chance("pred.glob", 0.2) { "GLOB" } else { "LIKE" };
                format!("{column} {op} {pattern}")
            }
            "pred.and" => {
                let left = self.predicate(scope, depth + 1);
                let right = self.predicate(scope, depth + 1);
                format!("({left} AND {right})")
            }
            "pred.or" => {
                let left = self.predicate(scope, depth + 1);
                let right = self.predicate(scope, depth + 1);
                format!("({left} OR {right})")
            }
            "pred.not" => format!("NOT ({})", self.predicate(scope, depth + 1)),
            "pred.exists" => {
                let table = self.table();
                let inner = Scope { tables: vec![table] };
                let condition = self.predicate(&inner, depth + 1);
                format!(
                    "EXISTS (SELECT 1 FROM {} WHERE {condition})",
                    quote_identifier(&table.name)
                )
            }
            "pred.in-subquery" => {
                let (column, _) = self.column(scope);
                let table = self.table();
                let inner = Scope { tables: vec![table] };
                let (inner_column, _) = self.column(&inner);
                format!(
                    "{column} IN (SELECT {inner_column} FROM {})",
                    quote_identifier(&table.name)
                )
            }
            _ => {
                let (column, ty) = self.column(scope);
                const OPS: &[&str] = &["=", "<>", "!=", "<", "<=", ">", ">=", "IS", "IS NOT"];
                let op = self.rng.choose("pred.op", OPS).copied().unwrap_or("=");
                let right = if self.rng.chance("pred.column-rhs", 0.2) {
                    self.column_where(scope, |t| t == ty)
                        .map(|(c, _)| c)
                        .unwrap_or_else(|| self.literal(ty))
                } else {
                    self.literal(ty)
                };
                format!("{column} {op} {right}")
            }
        }
    }

    fn aggregate(&mut self, scope: &Scope<'a>) -> String {
        let numeric = self.column_where(scope, ColumnType::is_numeric);
        match (self.rng.below("aggregate", 6), numeric) {
            (1, Some((c, _))) => format!("SUM({c})"),
            (2, Some((c, _))) => format!("AVG({c})"),
            (3, Some((c, _))) => format!("TOTAL({c})"),
            (4, _) => format!("MIN({})", self.column(scope).0),
            (5, _) => format!("MAX({})", self.column(scope).0),
            _ => {
                if self.rng.chance("aggregate.count-star", 0.5) {
                    "COUNT(*)".to_string()
                } else {
                    format!("COUNT({})", self.column(scope).0)
                }
            }
        }
    }

    fn select(&mut self) -> String {
        let first = self.table();
        let mut from = quote_identifier(&first.name);
        let mut scope = Scope { tables: vec![first] };
        let second = if self.tables.len() > 1 {
            match self.expand(Nonterminal::From, 0) {
                "from.join" => self.other_table(first),
                _ => None,
            }
        } else {
            self.rules.insert("from.single");
            None
        };
        if let Some(second) = second {
            scope.tables.push(second);
            let join = self.expand(Nonterminal::Join, 0);
            let name = quote_identifier(&second.name);
            if join == "join.cross" {
                from = format!("{from} CROSS JOIN {name}");
            } else {
                let left = Scope { tables: vec![first] };
                let right = Scope { tables: vec![second] };
                let (left_column, ty) = self.column(&left);
                let right_column = self
                    .column_where(&right, |t| t == ty)
                    .unwrap_or_else(|| self.column(&right))
                    .0;
                let kind = if join == "join.left" { "LEFT JOIN" } else { "JOIN" };
                from = format!(
                    "{from} {kind} {name} ON {}.{left_column} = {name}.{right_column}",
                    quote_identifier(&first.name),
                );
            }
        }

        let distinct = match self.expand(Nonterminal::Distinct, 0) {
            "select.distinct" => "DISTINCT ",
            _ => "",
        };
        let group = self.expand(Nonterminal::GroupBy, 0);
        let (items, width, group_clause) = if group == "group.none" {
            let (items, width) = self.select_items(&scope);
            (items, width, String::new())
        } else {
            let key_count = self.rng.range_inclusive("group.keys", 1, 2);
            let keys: Vec<String> = (0..key_count).map(|_| self.column(&scope).0).collect();
            let mut items = keys.clone();
            items.push(self.aggregate(&scope));
            let width = items.len();
            let mut clause = format!(" GROUP BY {}", keys.join(", "));
            if group == "group.having" {
                let aggregate = self.aggregate(&scope);
                let threshold = self.literal(ColumnType::Integer);
                clause.push_str(&format!(" HAVING {aggregate} > {threshold}"));
            }
            (items.join(", "), width, clause)
        };

        let where_clause = match self.expand(Nonterminal::Where, 0) {
            "where.predicate" => format!(" WHERE {}", self.predicate(&scope, 1)),
            _ => String::new(),
        };

        let mut sql = format!("SELECT {distinct}{items} FROM {from}{where_clause}{group_clause}");

        let compound = self.expand(Nonterminal::Compound, 0);
        if compound != "compound.none" {
            let keyword = match compound {
                "compound.union" => "UNION",
                "compound.union-all" => "UNION ALL",
                "compound.intersect" => "INTERSECT",
                _ => "EXCEPT",
            };
            let arm = self.compound_arm(width);
            sql = format!("{sql} {keyword} {arm}");
        }

        if self.expand(Nonterminal::OrderBy, 0) == "order.by" {
            sql = format!("{sql} {}", total_order_by(width, self.rng));
        }

        match self.expand(Nonterminal::Limit, 0) {
            "limit.count" => {
                let count = self.limit_value();
                sql = format!("{sql} LIMIT {count}");
            }
            "limit.offset" => {
                let count = self.limit_value();
                let offset = self.rng.range_inclusive("limit.offset", 0, 5);
                sql = format!("{sql} LIMIT {count} OFFSET {offset}");
            }
            _ => {}
        }
        sql
    }

    fn limit_value(&mut self) -> i64 {
        if self.rng.chance("limit.boundary", self.config.boundary_literal_probability) {
            const EDGES: &[i64] = &[0, 1, -1];
            self.rng.choose("limit.edge", EDGES).copied().unwrap_or(1)
        } else {
            self.rng.range_inclusive("limit.count", 1, 20)
        }
    }

    /// Select list and its width (number of output columns).
    fn select_items(&mut self, scope: &Scope<'a>) -> (String, usize) {
        match self.expand(Nonterminal::Items, 0) {
            "items.star" => {
                let width = scope.tables.iter().map(|t| t.columns.len()).sum();
                ("*".to_string(), width)
            }
            "items.expressions" => {
                let count = self.rng.range_inclusive("items.count", 1, 3) as usize;
                let items: Vec<String> = (0..count).map(|_| self.expr(scope, 1).0).collect();
                (items.join(", "), count)
            }
            "items.aggregate" => {
                let count = self.rng.range_inclusive("items.count", 1, 2) as usize;
                let items: Vec<String> = (0..count).map(|_| self.aggregate(scope)).collect();
                (items.join(", "), count)
            }
            _ => {
                let count = self.rng.range_inclusive("items.count", 1, 3) as usize;
                let items: Vec<String> = (0..count).map(|_| self.column(scope).0).collect();
                (items.join(", "), count)
            }
        }
    }

    /// A simple SELECT producing exactly `width` columns.
    fn compound_arm(&mut self, width: usize) -> String {
        let table = self.table();
        let scope = Scope { tables: vec![table] };
        let items: Vec<String> = (0..width)
            .map(|i| match table.columns.get(i) {
                Some(c) => quote_identifier(&c.name),
                None => self.literal(ColumnType::Integer),
            })
            .collect();
        let mut arm = format!("SELECT {} FROM {}", items.join(", "), quote_identifier(&table.name));
        if self.rng.chance("compound.where", 0.5) {
            arm = format!("{arm} WHERE {}", self.predicate(&scope, 1));
        }
        arm
    }

    fn insert(&mut self) -> String {
        let table = self.table();
        let name = quote_identifier(&table.name);
        let width = table.columns.len();
        let count = self.rng.range_inclusive("insert.columns", 1, width as i64) as usize;
        let offset = self.rng.below("insert.first-column", width - count + 1);
        let columns = &table.columns[offset..offset + count];
        let column_list = columns
            .iter()
            .map(|c| quote_identifier(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        match self.expand(Nonterminal::Insert, 0) {
            "insert.select" => {
                let scope = Scope { tables: vec![table] };
                let condition = self.predicate(&scope, 1);
                format!(
                    "INSERT INTO {name} ({column_list}) \
                     SELECT {column_list} FROM {name} WHERE {condition}"
                )
            }
            rule => {
                let rows = if rule == "insert.multi-row" {
                    self.rng.range_inclusive("insert.rows", 2, 3)
                } else {
                    1
                };
                let values: Vec<String> = (0..rows)
                    .map(|_| {
                        let row: Vec<String> =
                            columns.iter().map(|c| self.literal(c.column_type)).collect();
                        format!("({})", row.join(", "))
                    })
                    .collect();
                format!("INSERT INTO {name} ({column_list}) VALUES {}", values.join(", "))
            }
        }
    }

    fn update(&mut self) -> String {
        let table = self.table();
        let scope = Scope { tables: vec![table] };
        let column = &table.columns[self.rng.below("update.column", table.columns.len())];
        let value = if self.rng.chance("update.expression", 0.3) {
            self.expr(&scope, 1).0
        } else {
            self.literal(column.column_type)
        };
        let mut sql = format!(
            "UPDATE {} SET {} = {value}",
            quote_identifier(&table.name),
            quote_identifier(&column.name)
        );
        if self.expand(Nonterminal::Update, 0) == "update.where" {
            sql = format!("{sql} WHERE {}", self.predicate(&scope, 1));
        }
        sql
    }

    fn delete(&mut self) -> String {
        let table = self.table();
        let scope = Scope { tables: vec![table] };
        let mut sql = format!("DELETE FROM {}", quote_identifier(&table.name));
        if self.expand(Nonterminal::Delete, 0) == "delete.where" {
            sql = format!("{sql} WHERE {}", self.predicate(&scope, 1));
        }
        sql
    }

    fn ddl(&mut self) -> String {
        let suffix = self.rng.range_inclusive("ddl.suffix", 0, 999);
        let table = self.table();
        let name = quote_identifier(&table.name);
        let scope = Scope { tables: vec![table] };
        match self.expand(Nonterminal::Ddl, 0) {
            "ddl.create-table-as" => {
                let condition = self.predicate(&scope, 1);
                format!(
                    "CREATE TABLE sqldrift_copy_{suffix} AS SELECT * FROM {name} WHERE {condition}"
                )
            }
            "ddl.create-index" => {
                let (column, _) = self.column(&scope);
                let unique = if self.rng.chance("ddl.unique", 0.2) { "UNIQUE " } else { "" };
                format!(
                    "CREATE {unique}INDEX IF NOT EXISTS sqldrift_idx_{suffix} ON {name} ({column})"
                )
            }
            "ddl.create-view" => {
                let (column, _) = self.column(&scope);
                let condition = self.predicate(&scope, 1);
                format!(
                    "CREATE VIEW sqldrift_view_{suffix} AS \
                     SELECT {column} FROM {name} WHERE {condition}"
                )
            }
            "ddl.alter-add-column" => {
                let ty = self.any_type();
                let default = self.rng.range_inclusive("ddl.default", 0, 100);
                format!(
                    "ALTER TABLE {name} ADD COLUMN sqldrift_col_{suffix} {} DEFAULT {default}",
                    ty.sql_name()
                )
            }
            _ => {
                let columns: Vec<String> = table
                    .columns
                    .iter()
                    .map(|c| format!("{} {}", quote_identifier(&c.name), c.column_type.sql_name()))
                    .collect();
                format!("CREATE TABLE sqldrift_table_{suffix} ({})", columns.join(", "))
            }
        }
    }
}

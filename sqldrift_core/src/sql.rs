//! Lexer and clause-level statement model.
//!
//! This is deliberately not a full SQL parser. It knows enough structure to
//! support the rest of the fuzzer: splitting a script into statements, finding
//! top-level clauses, splitting predicates into conjuncts and select lists into
//! items, and a structural validity check used to decide whether a rewritten
//! query is still well formed.

use std::ops::Range;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    #[error("unterminated {what} starting at byte {offset}")]
    Unterminated { what: &'static str, offset: usize },
    #[error("unexpected character {ch:?} at byte {offset}")]
    UnexpectedCharacter { ch: char, offset: usize },
    #[error("malformed blob literal at byte {offset}")]
    MalformedBlob { offset: usize },
    #[error("no statement found")]
    Empty,
    #[error("unbalanced parentheses")]
    UnbalancedParentheses,
    #[error("{0:?} does not begin a statement")]
    UnknownStatement(String),
    #[error("{token:?} at token {index} is missing an operand")]
    MissingOperand { token: String, index: usize },
    #[error("empty parentheses at token {0}")]
    EmptyParentheses(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Keyword,
    Identifier,
    QuotedIdentifier,
    String,
    Blob,
    Integer,
    Float,
    Parameter,
    Operator,
    LParen,
    RParen,
    Comma,
    Semicolon,
    Dot,
    Comment,
    Whitespace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

const KEYWORDS: &[&str] = &[
    "ADD", "ALL", "ALTER", "ANALYZE", "AND", "AS", "ASC", "BEGIN", "BETWEEN", "BY", "CASE",
    "CAST", "CHECK", "COLLATE", "COLUMN", "COMMIT", "CREATE", "CROSS", "DEFAULT", "DELETE",
    "DESC", "DISTINCT", "DROP", "ELSE", "END", "ESCAPE", "EXCEPT", "EXISTS", "EXPLAIN", "FALSE",
    "FROM", "GLOB", "GROUP", "HAVING", "IF", "IN", "INDEX", "INNER", "INSERT", "INTERSECT",
    "INTO", "IS", "JOIN", "KEY", "LEFT", "LIKE", "LIMIT", "NATURAL", "NOT", "NULL", "OFFSET",
    "ON", "OR", "ORDER", "OUTER", "OVER", "PARTITION", "PRAGMA", "PRIMARY", "RECURSIVE",
    "REFERENCES", "REINDEX", "RENAME", "RETURNING", "RIGHT", "ROLLBACK", "SELECT", "SET",
    "TABLE", "THEN", "TO", "TRANSACTION", "TRUE", "UNION", "UNIQUE", "UPDATE", "USING", "VACUUM",
    "VALUES", "VIEW", "WHEN", "WHERE", "WITH",
];

pub fn is_keyword(word: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn keyword(text: &str) -> Self {
        Self::new(TokenKind::Keyword, text)
    }

    pub fn is_keyword(&self, word: &str) -> bool {
        self.kind == TokenKind::Keyword && self.text.eq_ignore_ascii_case(word)
    }

    pub fn is_operator(&self, op: &str) -> bool {
        self.kind == TokenKind::Operator && self.text == op
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::String | TokenKind::Blob | TokenKind::Integer | TokenKind::Float
        ) || self.is_keyword("NULL")
            || self.is_keyword("TRUE")
            || self.is_keyword("FALSE")
    }

    fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }

    /// Can this token begin an expression?
    pub fn starts_operand(&self) -> bool {
        match self.kind {
            TokenKind::Identifier
            | TokenKind::QuotedIdentifier
            | TokenKind::String
            | TokenKind::Blob
            | TokenKind::Integer
            | TokenKind::Float
            | TokenKind::Parameter
            | TokenKind::LParen => true,
            TokenKind::Operator => matches!(self.text.as_str(), "-" | "+" | "~"),
            TokenKind::Keyword => {
                ["NOT", "NULL", "CASE", "EXISTS", "CAST", "TRUE", "FALSE", "SELECT"]
                    .iter()
                    .any(|k| self.is_keyword(k))
            }
            _ => false,
        }
    }

    /// Can this token end an expression?
    pub fn ends_operand(&self) -> bool {
        match self.kind {
            TokenKind::Identifier
            | TokenKind::QuotedIdentifier
            | TokenKind::String
            | TokenKind::Blob
            | TokenKind::Integer
            | TokenKind::Float
            | TokenKind::Parameter
            | TokenKind::RParen => true,
            TokenKind::Operator => self.text == "*",
            TokenKind::Keyword => ["NULL", "TRUE", "FALSE", "END"]
                .iter()
                .any(|k| self.is_keyword(k)),
            _ => false,
        }
    }
}

struct Lexer<'a> {
    sql: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(sql: &'a str) -> Self {
        Self {
            sql,
            chars: sql.char_indices().collect(),
            pos: 0,
        }
    }

    fn at(&self, index: usize) -> Option<char> {
        self.chars.get(index).map(|(_, c)| *c)
    }

    fn offset(&self, index: usize) -> usize {
        self.chars.get(index).map_or(self.sql.len(), |(o, _)| *o)
    }

    fn skip_while(&mut self, pred: impl Fn(char) -> bool) {
        while self.at(self.pos).is_some_and(&pred) {
            self.pos += 1;
        }
    }

    /// Advances past a quoted run opened at `self.pos`, honouring doubled quotes.
    fn scan_quoted(&mut self, close: char, what: &'static str) -> Result<(), SqlError> {
        let start = self.pos;
        self.pos += 1;
        loop {
            match self.at(self.pos) {
                None => {
                    return Err(SqlError::Unterminated {
                        what,
                        offset: self.offset(start),
                    });
                }
                Some(c) if c == close => {
                    if close != ']' && self.at(self.pos + 1) == Some(close) {
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                        return Ok(());
                    }
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    fn scan_number(&mut self) -> Result<TokenKind, SqlError> {
        let start = self.pos;
        if self.at(self.pos) == Some('0')
            && matches!(self.at(self.pos + 1), Some('x' | 'X'))
            && self.at(self.pos + 2).is_some_and(|c| c.is_ascii_hexdigit())
        {
            self.pos += 2;
            self.skip_while(|c| c.is_ascii_hexdigit());
            return self.finish_number(start, TokenKind::Integer);
        }
        let mut kind = TokenKind::Integer;
        self.skip_while(|c| c.is_ascii_digit());
        if self.at(self.pos) == Some('.') {
            kind = TokenKind::Float;
            self.pos += 1;
            self.skip_while(|c| c.is_ascii_digit());
        }
        if matches!(self.at(self.pos), Some('e' | 'E')) {
            let digit_at = match self.at(self.pos + 1) {
                Some('+' | '-') => self.pos + 2,
                _ => self.pos + 1,
            };
            if self.at(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                kind = TokenKind::Float;
                self.pos = digit_at;
                self.skip_while(|c| c.is_ascii_digit());
            }
        }
        self.finish_number(start, kind)
    }

    fn finish_number(&self, start: usize, kind: TokenKind) -> Result<TokenKind, SqlError> {
        match self.at(self.pos) {
            Some(c) if c.is_alphanumeric() || c == '_' => Err(SqlError::UnexpectedCharacter {
                ch: c,
                offset: self.offset(start),
            }),
            _ => Ok(kind),
        }
    }

    fn scan_operator(&mut self, c: char) -> Result<TokenKind, SqlError> {
        let rest = &self.sql[self.offset(self.pos)..];
        let width = ["->>"]
            .iter()
            .chain(["||", "<=", ">=", "<>", "!=", "==", "<<", ">>", "->"].iter())
            .find(|op| rest.starts_with(**op))
            .map(|op| op.len())
            .or_else(|| "+-*/%<>=&|~".contains(c).then_some(1));
        match width {
            Some(n) => {
                self.pos += n;
                Ok(TokenKind::Operator)
            }
            None => Err(SqlError::UnexpectedCharacter {
                ch: c,
                offset: self.offset(self.pos),
            }),
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, SqlError> {
        let Some(c) = self.at(self.pos) else {
            return Ok(None);
        };
        let start = self.pos;
        let next = self.at(self.pos + 1);
        let ident_char = |c: char| c.is_alphanumeric() || c == '_' || c == '$';
        let kind = match c {
            c if c.is_whitespace() => {
                self.skip_while(char::is_whitespace);
                TokenKind::Whitespace
            }
            '-' if next == Some('-') => {
                self.skip_while(|c| c != '\n');
                TokenKind::Comment
            }
            '/' if next == Some('*') => {
                self.pos += 2;
                loop {
                    match self.at(self.pos) {
                        None => {
                            return Err(SqlError::Unterminated {
                                what: "comment",
                                offset: self.offset(start),
                            });
                        }
                        Some('*') if self.at(self.pos + 1) == Some('/') => {
                            self.pos += 2;
                            break;
                        }
                        Some(_) => self.pos += 1,
                    }
                }
                TokenKind::Comment
            }
            '\'' => {
                self.scan_quoted('\'', "string")?;
                TokenKind::String
            }
            'x' | 'X' if next == Some('\'') => {
                self.pos += 1;
                self.scan_quoted('\'', "blob")?;
                let body = &self.sql[self.offset(start + 2)..self.offset(self.pos - 1)];
                if body.len() % 2 != 0 || !body.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(SqlError::MalformedBlob {
                        offset: self.offset(start),
                    });
                }
                TokenKind::Blob
            }
            '"' | '`' => {
                self.scan_quoted(c, "identifier")?;
                TokenKind::QuotedIdentifier
            }
            '[' => {
                self.scan_quoted(']', "identifier")?;
                TokenKind::QuotedIdentifier
            }
            c if c.is_ascii_digit() || (c == '.' && next.is_some_and(|d| d.is_ascii_digit())) => {
                self.scan_number()?
            }
            '?' => {
                self.pos += 1;
                self.skip_while(|c| c.is_ascii_digit());
                TokenKind::Parameter
            }
            ':' | '@' | '$' if next.is_some_and(ident_char) => {
                self.pos += 1;
                self.skip_while(ident_char);
                TokenKind::Parameter
            }
            c if c.is_alphabetic() || c == '_' => {
                self.skip_while(ident_char);
                let word = &self.sql[self.offset(start)..self.offset(self.pos)];
                if is_keyword(word) {
                    TokenKind::Keyword
                } else {
                    TokenKind::Identifier
                }
            }
            '(' | ')' | ',' | ';' | '.' => {
                self.pos += 1;
                match c {
                    '(' => TokenKind::LParen,
                    ')' => TokenKind::RParen,
                    ',' => TokenKind::Comma,
                    ';' => TokenKind::Semicolon,
                    _ => TokenKind::Dot,
                }
            }
            c => self.scan_operator(c)?,
        };
        let text = &self.sql[self.offset(start)..self.offset(self.pos)];
        Ok(Some(Token::new(kind, text)))
    }
}

/// Splits `sql` into tokens, including whitespace and comments.
pub fn tokenize(sql: &str) -> Result<Vec<Token>, SqlError> {
    let mut lexer = Lexer::new(sql);
    let mut tokens = Vec::new();
    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    Ok(tokens)
}

/// Tokens without whitespace and comments.
pub fn significant_tokens(sql: &str) -> Result<Vec<Token>, SqlError> {
    Ok(tokenize(sql)?.into_iter().filter(|t| !t.is_trivia()).collect())
}

/// Size measure for reduction. Text that does not lex falls back to a word count.
pub fn token_count(sql: &str) -> usize {
    match significant_tokens(sql) {
        Ok(tokens) => tokens
            .iter()
            .filter(|t| t.kind != TokenKind::Semicolon)
            .count(),
        Err(_) => sql.split_whitespace().count(),
    }
}

/// Joins tokens back into text with conventional spacing.
pub fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut prev: Option<&Token> = None;
    for token in tokens {
        if let Some(p) = prev {
            let glue_left = matches!(
                token.kind,
                TokenKind::Comma | TokenKind::RParen | TokenKind::Dot | TokenKind::Semicolon
            ) || (token.kind == TokenKind::LParen
                && matches!(p.kind, TokenKind::Identifier | TokenKind::QuotedIdentifier));
            let glue_right = matches!(p.kind, TokenKind::LParen | TokenKind::Dot);
            if !glue_left && !glue_right {
                out.push(' ');
            }
        }
        out.push_str(&token.text);
        prev = Some(token);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Transaction,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClauseKind {
    /// Everything before the first clause keyword (`SELECT ...`, `UPDATE t`, ...).
    Head,
    From,
    Join,
    Where,
    GroupBy,
    Having,
    OrderBy,
    /// `LIMIT`, including a trailing `OFFSET`.
    Limit,
    /// A compound operator together with the arm that follows it.
    Compound,
    Set,
    Values,
    Returning,
}

impl ClauseKind {
    /// Clauses that can be dropped without breaking the statement's shape.
    pub fn is_optional(self) -> bool {
        matches!(
            self,
            ClauseKind::Join
                | ClauseKind::Where
                | ClauseKind::GroupBy
                | ClauseKind::Having
                | ClauseKind::OrderBy
                | ClauseKind::Limit
                | ClauseKind::Compound
                | ClauseKind::Returning
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub kind: ClauseKind,
    pub range: Range<usize>,
}

/// One statement as a flat list of significant tokens (no trailing semicolon).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    kind: StatementKind,
    tokens: Vec<Token>,
}

impl Statement {
    /// Builds and validates a statement from significant tokens.
    pub fn from_tokens(tokens: Vec<Token>) -> Result<Self, SqlError> {
        let kind = statement_kind(&tokens)?;
        check_structure(&tokens)?;
        Ok(Self { kind, tokens })
    }

    /// Parses exactly the first statement of `sql`.
    pub fn parse(sql: &str) -> Result<Self, SqlError> {
        parse_script(sql)?
            .into_iter()
            .next()
            .ok_or(SqlError::Empty)
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn render(&self) -> String {
        render(&self.tokens)
    }

    /// Parenthesis depth before each token, relative to the statement.
    pub fn depths(&self) -> Vec<usize> {
        let mut depth = 0usize;
        self.tokens
            .iter()
            .map(|t| {
                let before = depth;
                match t.kind {
                    TokenKind::LParen => depth += 1,
                    TokenKind::RParen => depth = depth.saturating_sub(1),
                    _ => {}
                }
                before
            })
            .collect()
    }

    /// Top-level clauses in source order; together they cover every token.
    pub fn clauses(&self) -> Vec<Clause> {
        let depths = self.depths();
        let mut starts: Vec<(usize, ClauseKind)> = vec![(0, ClauseKind::Head)];
        let mut in_compound = false;
        let mut i = 1;
        while i < self.tokens.len() {
            if depths[i] != 0 {
                i += 1;
                continue;
            }
            let t = &self.tokens[i];
            let next_is = |word: &str| self.tokens.get(i + 1).is_some_and(|n| n.is_keyword(word));
            let compound =
                t.is_keyword("UNION") || t.is_keyword("INTERSECT") || t.is_keyword("EXCEPT");
            let found = if compound {
                in_compound = true;
                Some(ClauseKind::Compound)
            } else if (t.is_keyword("ORDER") && next_is("BY")) || t.is_keyword("LIMIT") {
                in_compound = false;
                Some(if t.is_keyword("LIMIT") {
                    ClauseKind::Limit
                } else {
                    ClauseKind::OrderBy
                })
            } else if in_compound {
                None
            } else if t.is_keyword("FROM") {
                Some(ClauseKind::From)
            } else if t.is_keyword("JOIN") {
                // Modifiers such as LEFT OUTER belong to the join clause.
                let mut start = i;
                while start > 0
                    && ["LEFT", "RIGHT", "INNER", "OUTER", "CROSS", "NATURAL"]
                        .iter()
                        .any(|m| self.tokens[start - 1].is_keyword(m))
                {
                    start -= 1;
                }
                starts.push((start, ClauseKind::Join));
                i += 1;
                continue;
            } else if t.is_keyword("WHERE") {
                Some(ClauseKind::Where)
            } else if t.is_keyword("GROUP") && next_is("BY") {
                Some(ClauseKind::GroupBy)
            } else if t.is_keyword("HAVING") {
                Some(ClauseKind::Having)
            } else if t.is_keyword("SET") && self.kind == StatementKind::Update {
                Some(ClauseKind::Set)
            } else if t.is_keyword("VALUES") {
                Some(ClauseKind::Values)
            } else if t.is_keyword("RETURNING") {
                Some(ClauseKind::Returning)
            } else {
                None
            };
            if let Some(kind) = found {
                starts.push((i, kind));
            }
            i += 1;
        }
        let mut clauses = Vec::with_capacity(starts.len());
        for (n, (start, kind)) in starts.iter().enumerate() {
            let end = starts
                .get(n + 1)
                .map_or(self.tokens.len(), |(next, _)| *next);
            if end > *start {
                clauses.push(Clause {
                    kind: *kind,
                    range: *start..end,
                });
            }
        }
        clauses
    }

    pub fn clause(&self, kind: ClauseKind) -> Option<Clause> {
        self.clauses().into_iter().find(|c| c.kind == kind)
    }

    /// Token range of the WHERE predicate, without the keyword.
    pub fn where_predicate(&self) -> Option<Range<usize>> {
        self.clause(ClauseKind::Where)
            .map(|c| c.range.start + 1..c.range.end)
            .filter(|r| !r.is_empty())
    }

    /// Splits the predicate at top-level `AND`s, leaving `BETWEEN x AND y` intact.
    pub fn conjuncts(&self, predicate: Range<usize>) -> Vec<Range<usize>> {
        let depths = self.depths();
        let mut parts = Vec::new();
        let mut start = predicate.start;
        let mut pending_between = 0usize;
        for i in predicate.clone() {
            if depths[i] != 0 {
                continue;
            }
            let t = &self.tokens[i];
            if t.is_keyword("BETWEEN") {
                pending_between += 1;
            } else if t.is_keyword("AND") {
                if pending_between > 0 {
                    pending_between -= 1;
                } else {
                    parts.push(start..i);
                    start = i + 1;
                }
            }
        }
        parts.push(start..predicate.end);
        parts
    }

    /// Ranges of the top-level items of the SELECT list.
    pub fn select_items(&self) -> Vec<Range<usize>> {
        if self.kind != StatementKind::Select {
            return Vec::new();
        }
        let Some(head) = self.clause(ClauseKind::Head) else {
            return Vec::new();
        };
        let Some(select_at) = self.tokens[head.range.clone()]
            .iter()
            .position(|t| t.is_keyword("SELECT"))
            .map(|p| p + head.range.start)
        else {
            return Vec::new();
        };
        let mut start = select_at + 1;
        if self
            .tokens
            .get(start)
            .is_some_and(|t| t.is_keyword("DISTINCT") || t.is_keyword("ALL"))
        {
            start += 1;
        }
        let depths = self.depths();
        let mut items = Vec::new();
        for i in start..head.range.end {
            if depths[i] == 0 && self.tokens[i].kind == TokenKind::Comma {
                items.push(start..i);
                start = i + 1;
            }
        }
        if start < head.range.end {
            items.push(start..head.range.end);
        }
        items
    }

    /// Returns the statement with `range` replaced by `replacement`, if the result is well formed.
    pub fn splice(
        &self,
        range: Range<usize>,
        replacement: &[Token],
    ) -> Result<Statement, SqlError> {
        let mut tokens = Vec::with_capacity(self.tokens.len() + replacement.len());
        tokens.extend_from_slice(&self.tokens[..range.start]);
        tokens.extend_from_slice(replacement);
        tokens.extend_from_slice(&self.tokens[range.end..]);
        Statement::from_tokens(tokens)
    }

    pub fn has_top_level(&self, kind: ClauseKind) -> bool {
        self.clauses().iter().any(|c| c.kind == kind)
    }
}

fn statement_kind(tokens: &[Token]) -> Result<StatementKind, SqlError> {
    let first = tokens.first().ok_or(SqlError::Empty)?;
    let head = first.text.to_ascii_uppercase();
    let kind = match head.as_str() {
        "SELECT" | "VALUES" | "WITH" => StatementKind::Select,
        "INSERT" | "REPLACE" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "CREATE" => StatementKind::Create,
        "DROP" => StatementKind::Drop,
        "ALTER" => StatementKind::Alter,
        "BEGIN" | "COMMIT" | "ROLLBACK" | "END" => StatementKind::Transaction,
        "PRAGMA" | "ANALYZE" | "VACUUM" | "REINDEX" | "EXPLAIN" => StatementKind::Other,
        _ => return Err(SqlError::UnknownStatement(first.text.clone())),
    };
    Ok(kind)
}

fn check_structure(tokens: &[Token]) -> Result<(), SqlError> {
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate() {
        let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
        let next = tokens.get(i + 1);
        let missing = || SqlError::MissingOperand {
            token: t.text.clone(),
            index: i,
        };
        match t.kind {
            TokenKind::LParen => {
                depth += 1;
                if next.is_some_and(|n| n.kind == TokenKind::RParen)
                    && !prev.is_some_and(|p| p.kind == TokenKind::Identifier)
                {
                    return Err(SqlError::EmptyParentheses(i));
                }
            }
            TokenKind::RParen => {
                depth = depth.checked_sub(1).ok_or(SqlError::UnbalancedParentheses)?;
            }
            TokenKind::Comma => {
                let prev_ok =
                    prev.is_some_and(|p| !matches!(p.kind, TokenKind::LParen | TokenKind::Comma));
                let next_ok = next.is_some_and(|n| n.starts_operand() || n.is_operator("*"));
                if !prev_ok || !next_ok {
                    return Err(missing());
                }
            }
            TokenKind::Operator if t.text != "*" => {
                let unary = matches!(t.text.as_str(), "-" | "+" | "~");
                if !unary && !prev.is_some_and(Token::ends_operand) {
                    return Err(missing());
                }
                if !next.is_some_and(Token::starts_operand) {
                    return Err(missing());
                }
            }
            TokenKind::Keyword => {
                let binary = t.is_keyword("AND") || t.is_keyword("OR");
                if binary && !prev.is_some_and(Token::ends_operand) {
                    return Err(missing());
                }
                let needs_operand = [
                    "AND", "OR", "WHERE", "HAVING", "ON", "LIMIT", "OFFSET", "BY", "WHEN", "THEN",
                    "ELSE", "BETWEEN", "LIKE", "GLOB",
                ]
                .iter()
                .any(|k| t.is_keyword(k));
                if needs_operand && !next.is_some_and(Token::starts_operand) {
                    return Err(missing());
                }
                if t.is_keyword("NOT") {
                    let ok = next.is_some_and(|n| {
                        n.starts_operand()
                            || ["IN", "LIKE", "GLOB", "BETWEEN", "EXISTS", "NULL"]
                                .iter()
                                .any(|k| n.is_keyword(k))
                    });
                    if !ok {
                        return Err(missing());
                    }
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SqlError::UnbalancedParentheses);
    }
    Ok(())
}

/// Parses every `;`-separated statement of `sql`. Fails if any statement is malformed.
pub fn parse_script(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let tokens = significant_tokens(sql)?;
    let mut statements = Vec::new();
    for chunk in tokens.split(|t| t.kind == TokenKind::Semicolon) {
        if chunk.is_empty() {
            continue;
        }
        statements.push(Statement::from_tokens(chunk.to_vec())?);
    }
    if statements.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(statements)
}

pub fn render_script(statements: &[Statement]) -> String {
    statements
        .iter()
        .map(Statement::render)
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn is_well_formed(sql: &str) -> bool {
    parse_script(sql).is_ok()
}

/// Ordering facts about the statement whose rows end up in the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResultShape {
    /// The final row-producing statement has a top-level ORDER BY.
    pub ordered: bool,
    /// The final row-producing statement has a top-level LIMIT.
    pub limited: bool,
}

/// Ordering facts for `sql`. Text that does not parse falls back to a
/// case-insensitive substring search.
pub fn result_shape(sql: &str) -> ResultShape {
    match parse_script(sql) {
        Ok(statements) => statements
            .iter()
            .rev()
            .find(|s| s.kind() == StatementKind::Select)
            .map(|s| ResultShape {
                ordered: s.has_top_level(ClauseKind::OrderBy),
                limited: s.has_top_level(ClauseKind::Limit),
            })
            .unwrap_or_default(),
        Err(_) => {
            let lower = sql.to_ascii_lowercase();
            ResultShape {
                ordered: lower.contains("order by"),
                limited: lower.contains("limit"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        significant_tokens(sql)
            .expect("lex")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn lexes_literals_and_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("SELECT 'it''s', x'00ff', 1.5e3, 0x1F, ?1, a->>'$' FROM t"),
            vec![
                Keyword, String, Comma, Blob, Comma, Float, Comma, Integer, Comma, Parameter,
                Comma, Identifier, Operator, String, Keyword, Identifier
            ]
        );
    }

    #[test]
    fn lexer_reports_unterminated_string() {
        assert!(matches!(
            tokenize("SELECT 'abc"),
            Err(SqlError::Unterminated { what: "string", .. })
        ));
        assert!(matches!(
            tokenize("SELECT x'0'"),
            Err(SqlError::MalformedBlob { .. })
        ));
    }

    #[test]
    fn comments_are_trivia() {
        let sql = "SELECT a -- trailing\nFROM /* block */ t";
        assert_eq!(token_count(sql), 4);
    }

    #[test]
    fn structural_check_rejects_dangling_pieces() {
        assert!(is_well_formed("SELECT a, b FROM t WHERE a = 1 AND b < 2"));
        assert!(is_well_formed("SELECT COUNT(*) FROM t WHERE a NOT IN (1, 2)"));
        assert!(is_well_formed("SELECT * FROM t WHERE a BETWEEN -1 AND 5 ORDER BY a DESC LIMIT 3"));
        assert!(!is_well_formed("SELECT a FROM t WHERE"));
        assert!(!is_well_formed("SELECT a, FROM t"));
        assert!(!is_well_formed("SELECT a FROM t WHERE a = AND b"));
        assert!(!is_well_formed("SELECT (a FROM t"));
        assert!(!is_well_formed("FROB t"));
        assert!(!is_well_formed("  ;  "));
    }

    #[test]
    fn clauses_cover_the_statement() {
        let stmt = Statement::parse(
            "SELECT a, b FROM t LEFT JOIN u ON t.id = u.id WHERE a > 1 \
             GROUP BY a HAVING COUNT(*) > 1 ORDER BY a LIMIT 5 OFFSET 2",
        )
        .expect("parse");
        let kinds: Vec<ClauseKind> = stmt.clauses().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ClauseKind::Head,
                ClauseKind::From,
                ClauseKind::Join,
                ClauseKind::Where,
                ClauseKind::GroupBy,
                ClauseKind::Having,
                ClauseKind::OrderBy,
                ClauseKind::Limit,
            ]
        );
        let covered: usize = stmt.clauses().iter().map(|c| c.range.len()).sum();
        assert_eq!(covered, stmt.tokens().len());
    }

    #[test]
    fn nested_order_by_is_not_top_level() {
        let shape = result_shape("SELECT * FROM (SELECT a FROM t ORDER BY a) LIMIT 2");
        assert!(!shape.ordered);
        assert!(shape.limited);
        let shape = result_shape("SELECT a FROM t UNION SELECT b FROM u ORDER BY 1");
        assert!(shape.ordered);
    }

    #[test]
    fn conjuncts_keep_between_intact() {
        let stmt =
            Statement::parse("SELECT a FROM t WHERE a BETWEEN 1 AND 3 AND (b = 1 AND c = 2) AND d")
                .expect("parse");
        let predicate = stmt.where_predicate().expect("where");
        let parts: Vec<String> = stmt
            .conjuncts(predicate)
            .into_iter()
            .map(|r| render(&stmt.tokens()[r]))
            .collect();
        assert_eq!(parts, vec!["a BETWEEN 1 AND 3", "(b = 1 AND c = 2)", "d"]);
    }

    #[test]
    fn select_items_split_on_top_level_commas() {
        let stmt = Statement::parse("SELECT DISTINCT a, COALESCE(b, 0), c FROM t").expect("parse");
        let items: Vec<String> = stmt
            .select_items()
            .into_iter()
            .map(|r| render(&stmt.tokens()[r]))
            .collect();
        assert_eq!(items, vec!["a", "COALESCE(b, 0)", "c"]);
    }

    #[test]
    fn splice_rejects_malformed_result() {
        let stmt = Statement::parse("SELECT a FROM t WHERE a = 1").expect("parse");
        let predicate = stmt.where_predicate().expect("where");
        assert!(stmt.splice(predicate.clone(), &[]).is_err());
        let replaced = stmt
            .splice(predicate, &significant_tokens("b IS NULL").expect("lex"))
            .expect("splice");
        assert_eq!(replaced.render(), "SELECT a FROM t WHERE b IS NULL");
    }

    #[test]
    fn script_round_trips_through_render() {
        let statements =
            parse_script("CREATE TABLE t(a INTEGER);INSERT INTO t VALUES (1);").expect("parse");
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].kind(), StatementKind::Create);
        assert_eq!(
            render_script(&statements),
            "CREATE TABLE t(a INTEGER); INSERT INTO t VALUES (1)"
        );
    }
}

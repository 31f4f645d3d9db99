//! Statement classifier.
//!
//! Allow-list first: only a single statement whose first token is `SELECT`
//! is accepted, and it must parse (PostgreSQL dialect) as exactly one query.
//! The parsed tree is then walked for locking clauses, `SELECT INTO`, nested
//! data-modifying statements, side-effecting functions and catalog access.
//! Anything that does not tokenize or parse is rejected.

use super::complexity::ComplexityProfile;
use super::lexer;
use super::shape::{self, is_catalog};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use std::fmt;
use tracing::debug;

/// Outcome of a classification or complexity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Ok,
    NotSelect,
    StackedStatement,
    ForbiddenKeyword,
    InvalidIdentifier,
    TooComplex,
    Unparseable,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NotSelect => "NOT_SELECT",
            Self::StackedStatement => "STACKED_STATEMENT",
            Self::ForbiddenKeyword => "FORBIDDEN_KEYWORD",
            Self::InvalidIdentifier => "INVALID_IDENTIFIER",
            Self::TooComplex => "TOO_COMPLEX",
            Self::Unparseable => "UNPARSEABLE",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for one statement or identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationVerdict {
    pub allowed: bool,
    pub reason: ReasonCode,
    /// Comment-free, single-spaced, bare words upper-cased.
    pub normalized_text: String,
    /// `normalized_text` with literal values replaced by `'?'`.
    pub redacted_text: String,
    /// Text handed to the database: the original statement minus a single
    /// trailing terminator and anything after the last significant token.
    pub executable_text: String,
    /// Measured shape; zero unless the statement parsed.
    pub profile: ComplexityProfile,
    /// What triggered a rejection. Never carries literal values.
    pub detail: Option<String>,
}

impl ValidationVerdict {
    pub fn ok(normalized_text: String, executable_text: String) -> Self {
        Self {
            allowed: true,
            reason: ReasonCode::Ok,
            normalized_text,
            redacted_text: String::new(),
            executable_text,
            profile: ComplexityProfile::default(),
            detail: None,
        }
    }

    pub fn reject(reason: ReasonCode, normalized_text: String) -> Self {
        Self {
            allowed: false,
            reason,
            normalized_text,
            redacted_text: String::new(),
            executable_text: String::new(),
            profile: ComplexityProfile::default(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_redacted(mut self, redacted_text: String) -> Self {
        self.redacted_text = redacted_text;
        self
    }

    pub fn with_profile(mut self, profile: ComplexityProfile) -> Self {
        self.profile = profile;
        self
    }
}

/// Plain identifier accepted by `describe_table`.
/// Compile-time constant pattern, so expect() is safe here.
static IDENTIFIER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$#]*$").expect("Invalid regex: identifier pattern")
});

/// Allow-list statement classifier.
#[derive(Debug, Clone)]
pub struct StatementClassifier {
    max_identifier_length: usize,
}

impl Default for StatementClassifier {
    fn default() -> Self {
        Self {
            max_identifier_length: 128,
        }
    }
}

impl StatementClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_identifier_length(mut self, length: usize) -> Self {
        self.max_identifier_length = length;
        self
    }

    /// Classify a raw statement. Never touches the database.
    pub fn classify(&self, raw_text: &str) -> ValidationVerdict {
        let tokens = match lexer::tokenize(raw_text) {
            Ok(tokens) => tokens,
            Err(e) => {
                debug!(error = %e, "Statement could not be tokenized");
                return ValidationVerdict::reject(ReasonCode::Unparseable, String::new())
                    .with_detail("statement does not tokenize");
            }
        };

        let normalized = lexer::render(&tokens, false);
        let redacted = lexer::render(&tokens, true);
        let reject = |reason: ReasonCode, detail: &str| {
            ValidationVerdict::reject(reason, normalized.clone())
                .with_redacted(redacted.clone())
                .with_detail(detail)
        };

        let Some(first) = tokens.first() else {
            return reject(ReasonCode::NotSelect, "empty statement");
        };

        let starts_with_select = matches!(
            &first.token,
            Token::Word(word) if word.quote_style.is_none() && word.keyword == Keyword::SELECT
        );
        if !starts_with_select {
            let shown = lexer::describe(&first.token);
            return reject(
                ReasonCode::NotSelect,
                format!("statement starts with {shown}").as_str(),
            );
        }

        // Only a final terminator is allowed.
        let terminator = tokens.iter().position(|t| t.token == Token::SemiColon);
        let body_len = match terminator {
            Some(idx) if idx + 1 < tokens.len() => {
                return reject(ReasonCode::StackedStatement, "more than one statement");
            }
            Some(idx) => idx,
            None => tokens.len(),
        };
        let body = &tokens[..body_len];

        let statements = match Parser::parse_sql(&PostgreSqlDialect {}, raw_text) {
            Ok(statements) => statements,
            Err(e) => {
                debug!(error = %e, "Statement did not parse");
                return reject(ReasonCode::Unparseable, "statement does not parse as one query");
            }
        };

        let [statement] = statements.as_slice() else {
            return reject(ReasonCode::StackedStatement, "more than one statement");
        };
        if !matches!(statement, Statement::Query(_)) {
            return reject(ReasonCode::NotSelect, "not a query");
        }

        let shape = shape::inspect(statement);
        if let Some(violation) = &shape.violation {
            return reject(ReasonCode::ForbiddenKeyword, violation.as_str());
        }

        let Some(end) = body.last().and_then(|t| lexer::end_offset(raw_text, t)) else {
            return reject(ReasonCode::Unparseable, "token span out of range");
        };

        let normalized = lexer::render(body, false);
        let profile = ComplexityProfile {
            length: normalized.chars().count(),
            ..shape.profile
        };

        ValidationVerdict::ok(normalized, raw_text[..end].to_string())
            .with_redacted(lexer::render(body, true))
            .with_profile(profile)
    }

    /// Validate a bare table name for `describe_table`.
    pub fn validate_identifier(&self, name: &str) -> ValidationVerdict {
        let normalized = name.trim().to_string();

        if normalized.is_empty() || normalized.len() > self.max_identifier_length {
            return ValidationVerdict::reject(ReasonCode::InvalidIdentifier, normalized)
                .with_detail("identifier length out of range");
        }

        if !IDENTIFIER_REGEX.is_match(&normalized) {
            return ValidationVerdict::reject(ReasonCode::InvalidIdentifier, normalized)
                .with_detail("identifier contains invalid characters");
        }

        if is_catalog(&normalized.to_ascii_uppercase()) {
            return ValidationVerdict::reject(ReasonCode::InvalidIdentifier, normalized)
                .with_detail("system catalog object");
        }

        ValidationVerdict::ok(normalized.clone(), normalized)
    }

    /// Replace string literal contents with `'?'` for audit records.
    ///
    /// Text that does not tokenize is reduced to its leading words, cut at
    /// the first quote or comment opener.
    pub fn redact(text: &str) -> String {
        match lexer::tokenize(text) {
            Ok(tokens) => lexer::render(&tokens, true),
            Err(_) => {
                let cut = text
                    .find(['\'', '"', '$'])
                    .into_iter()
                    .chain(text.find("/*"))
                    .chain(text.find("--"))
                    .min()
                    .unwrap_or(text.len());
                let head: String = text[..cut].split_whitespace().collect::<Vec<_>>().join(" ");
                format!("{head} <unparseable>").trim_start().to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(sql: &str) -> ReasonCode {
        StatementClassifier::new().classify(sql).reason
    }

    #[test]
    fn test_valid_select() {
        assert_eq!(reason("SELECT * FROM users"), ReasonCode::Ok);
        assert_eq!(reason("select id, name from users where id = 1"), ReasonCode::Ok);
        assert_eq!(
            reason("SELECT a.id FROM a JOIN b ON a.id = b.a_id WHERE b.x IN (SELECT x FROM c)"),
            ReasonCode::Ok
        );
        assert_eq!(reason("SELECT * FROM users UNION SELECT * FROM admins"), ReasonCode::Ok);
    }

    #[test]
    fn test_not_select() {
        assert_eq!(reason("DROP TABLE users"), ReasonCode::NotSelect);
        assert_eq!(reason("WITH x AS (SELECT 1) SELECT * FROM x"), ReasonCode::NotSelect);
        assert_eq!(reason("(SELECT 1)"), ReasonCode::NotSelect);
        assert_eq!(reason(""), ReasonCode::NotSelect);
        assert_eq!(reason("  -- only a comment\n"), ReasonCode::NotSelect);
        assert_eq!(reason("EXPLAIN SELECT 1"), ReasonCode::NotSelect);
    }

    #[test]
    fn test_stacked_statements() {
        assert_eq!(reason("SELECT * FROM t; DROP TABLE t"), ReasonCode::StackedStatement);
        assert_eq!(reason("SELECT 1;;"), ReasonCode::StackedStatement);
        assert_eq!(reason("SELECT 1; SELECT 2"), ReasonCode::StackedStatement);
    }

    #[test]
    fn test_trailing_terminator_stripped() {
        let verdict = StatementClassifier::new().classify("SELECT 1 ; -- done\n");
        assert!(verdict.allowed);
        assert_eq!(verdict.executable_text, "SELECT 1");
        assert_eq!(verdict.normalized_text, "SELECT 1");
    }

    #[test]
    fn test_executable_keeps_original_text() {
        let verdict = StatementClassifier::new()
            .classify("select name -- the name\nfrom users where name = 'Bob'  /* tail */");
        assert!(verdict.allowed);
        assert_eq!(
            verdict.executable_text,
            "select name -- the name\nfrom users where name = 'Bob'"
        );
        assert_eq!(verdict.normalized_text, "SELECT NAME FROM USERS WHERE NAME = 'Bob'");
    }

    #[test]
    fn test_unsafe_constructs_anywhere() {
        assert_eq!(reason("SELECT * INTO backup FROM users"), ReasonCode::ForbiddenKeyword);
        assert_eq!(reason("SELECT * FROM accounts FOR UPDATE"), ReasonCode::ForbiddenKeyword);
        assert_eq!(reason("SELECT * FROM accounts FOR SHARE"), ReasonCode::ForbiddenKeyword);
        assert_eq!(
            reason("SELECT * FROM (SELECT * FROM accounts FOR UPDATE) a"),
            ReasonCode::ForbiddenKeyword
        );

        for sql in [
            "SELECT * FROM accounts FOR KEY SHARE",
            "SELECT * FROM (WITH gone AS (DELETE FROM t RETURNING *) SELECT * FROM gone) x",
            "SELECT 1 UNION (INSERT INTO t VALUES (1) RETURNING 1)",
        ] {
            let verdict = StatementClassifier::new().classify(sql);
            assert!(!verdict.allowed, "{sql}");
            assert!(verdict.executable_text.is_empty(), "{sql}");
        }
    }

    #[test]
    fn test_literals_do_not_trigger() {
        assert_eq!(
            reason("SELECT * FROM logs WHERE message = 'DROP TABLE users; DELETE'"),
            ReasonCode::Ok
        );
        assert_eq!(reason("SELECT \"update\", \"into\" FROM t"), ReasonCode::Ok);
        assert_eq!(reason("SELECT $$ pg_sleep(10) $$"), ReasonCode::Ok);
    }

    #[test]
    fn test_ordinary_names_are_reads() {
        for sql in [
            "SELECT replace(name, 'a', 'b') FROM users",
            "SELECT id, comment FROM posts",
            "SELECT * FROM alerts WHERE security = 'high'",
            "SELECT load FROM servers",
            "SELECT sleep FROM cats",
        ] {
            let verdict = StatementClassifier::new().classify(sql);
            assert_eq!(verdict.reason, ReasonCode::Ok, "{sql}");
        }
    }

    #[test]
    fn test_forbidden_functions() {
        assert_eq!(reason("SELECT pg_sleep(10)"), ReasonCode::ForbiddenKeyword);
        assert_eq!(reason("SELECT pg_sleep_for('5 minutes')"), ReasonCode::ForbiddenKeyword);
        assert_eq!(reason("SELECT \"pg_sleep\"(10)"), ReasonCode::ForbiddenKeyword);
        assert_eq!(reason("SELECT pg_catalog.pg_terminate_backend(1)"), ReasonCode::ForbiddenKeyword);
        assert_eq!(reason("SELECT nextval('seq')"), ReasonCode::ForbiddenKeyword);
        assert_eq!(reason("SELECT dbms_random.value FROM t"), ReasonCode::ForbiddenKeyword);
        assert_eq!(reason("SELECT * FROM sys.users"), ReasonCode::ForbiddenKeyword);
        assert_eq!(reason("SELECT pg_advisory_lock(1)"), ReasonCode::ForbiddenKeyword);
        assert_eq!(
            reason("SELECT * FROM t WHERE id IN (SELECT set_config('role', 'x', false))"),
            ReasonCode::ForbiddenKeyword
        );
    }

    #[test]
    fn test_unbalanced_parentheses_rejected() {
        for sql in [
            "SELECT 1) AS x, (SELECT 2",
            "SELECT * FROM t) s CROSS JOIN (SELECT * FROM u",
            "SELECT (1",
            "SELECT 1)",
        ] {
            let verdict = StatementClassifier::new().classify(sql);
            assert_eq!(verdict.reason, ReasonCode::Unparseable, "{sql}");
            assert!(verdict.executable_text.is_empty(), "{sql}");
        }
    }

    #[test]
    fn test_not_select_detail_is_redacted() {
        let verdict = StatementClassifier::new().classify("'hunter2' SELECT 1");
        assert_eq!(verdict.reason, ReasonCode::NotSelect);
        let detail = verdict.detail.unwrap();
        assert!(!detail.contains("hunter2"), "{detail}");

        let verdict = StatementClassifier::new().classify("\"s3cret\" x");
        assert!(!verdict.detail.unwrap().contains("s3cret"));

        let verdict = StatementClassifier::new().classify("delete from t");
        assert_eq!(verdict.detail.as_deref(), Some("statement starts with DELETE"));
    }

    #[test]
    fn test_profile_measured() {
        let verdict = StatementClassifier::new()
            .classify("SELECT * FROM a JOIN b ON true WHERE x IN (SELECT y FROM c)");
        assert!(verdict.allowed);
        assert_eq!(verdict.profile.joins, 1);
        assert_eq!(verdict.profile.subquery_depth, 1);
        assert_eq!(verdict.profile.length, verdict.normalized_text.chars().count());
        assert_eq!(
            verdict.redacted_text,
            "SELECT * FROM A JOIN B ON TRUE WHERE X IN (SELECT Y FROM C)"
        );
    }

    #[test]
    fn test_unparseable() {
        let verdict = StatementClassifier::new().classify("SELECT 'open");
        assert_eq!(verdict.reason, ReasonCode::Unparseable);
        assert!(!verdict.allowed);
        assert!(verdict.executable_text.is_empty());
    }

    #[test]
    fn test_validate_identifier() {
        let classifier = StatementClassifier::new();
        assert!(classifier.validate_identifier("USERS").allowed);
        assert!(classifier.validate_identifier("order_items").allowed);
        assert!(classifier.validate_identifier("tmp$1#a").allowed);

        for bad in ["1=1", "users; DROP", "", "a b", "t'x", "sys", "DUAL", "v$session", "pg_class"] {
            let verdict = classifier.validate_identifier(bad);
            assert_eq!(verdict.reason, ReasonCode::InvalidIdentifier, "{bad}");
        }

        let long = "a".repeat(129);
        assert!(!classifier.validate_identifier(&long).allowed);
        assert!(classifier.max_identifier_length(200).validate_identifier(&long).allowed);
    }

    #[test]
    fn test_redact() {
        assert_eq!(
            StatementClassifier::redact("SELECT * FROM users WHERE email = 'a@b.c'"),
            "SELECT * FROM USERS WHERE EMAIL = '?'"
        );
        assert_eq!(
            StatementClassifier::redact("SELECT * FROM t WHERE secret = 'oops"),
            "SELECT * FROM t WHERE secret = <unparseable>"
        );
    }

    #[test]
    fn test_reason_code_serialization() {
        let json = serde_json::to_string(&ReasonCode::StackedStatement).unwrap();
        assert_eq!(json, "\"STACKED_STATEMENT\"");
        assert_eq!(ReasonCode::TooComplex.to_string(), "TOO_COMPLEX");
    }
}

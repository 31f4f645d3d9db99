//! Token-level view of a statement.
//!
//! Wraps the `sqlparser` tokenizer (PostgreSQL dialect). Callers get only the
//! significant tokens, with comments and whitespace dropped, together with
//! their source spans. Rendering rebuilds a canonical single-spaced text for
//! audit subjects and length ceilings.

use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Location, Token, TokenWithSpan, Tokenizer, TokenizerError};

/// Longest token text echoed into a rejection detail.
const MAX_DESCRIBED_CHARS: usize = 32;

/// Significant tokens of `sql`. Unterminated quotes and comments are errors.
pub fn tokenize(sql: &str) -> Result<Vec<TokenWithSpan>, TokenizerError> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql).tokenize_with_location()?;

    Ok(tokens
        .into_iter()
        .filter(|t| !matches!(t.token, Token::Whitespace(_) | Token::EOF))
        .collect())
}

/// Whether the token carries a literal value that audit output must hide.
pub fn is_literal(token: &Token) -> bool {
    matches!(
        token,
        Token::SingleQuotedString(_)
            | Token::DoubleQuotedString(_)
            | Token::EscapedStringLiteral(_)
            | Token::NationalStringLiteral(_)
            | Token::HexStringLiteral(_)
            | Token::UnicodeStringLiteral(_)
            | Token::DollarQuotedString(_)
            | Token::SingleQuotedByteStringLiteral(_)
            | Token::DoubleQuotedByteStringLiteral(_)
    )
}

/// Canonical text: bare words upper-cased, one space between tokens except
/// around `(`, `)`, `,`, `.` and `;`. With `redact`, literals become `'?'`.
pub fn render(tokens: &[TokenWithSpan], redact: bool) -> String {
    let mut out = String::new();
    let mut prev: Option<&Token> = None;

    for item in tokens {
        let token = &item.token;

        if let Some(prev) = prev {
            let glued = matches!(prev, Token::LParen | Token::Period)
                || matches!(
                    token,
                    Token::RParen | Token::Comma | Token::Period | Token::SemiColon
                );
            if !glued {
                out.push(' ');
            }
        }

        match token {
            Token::Word(word) if word.quote_style.is_none() => {
                out.push_str(&word.value.to_ascii_uppercase());
            }
            t if redact && is_literal(t) => out.push_str("'?'"),
            Token::SingleQuotedString(value) => {
                out.push('\'');
                out.push_str(&value.replace('\'', "''"));
                out.push('\'');
            }
            t => out.push_str(&t.to_string()),
        }

        prev = Some(token);
    }

    out
}

/// Short description of a token that is safe to put in a log or audit
/// message: literals and quoted names are never echoed.
pub fn describe(token: &Token) -> String {
    match token {
        Token::Word(word) if word.quote_style.is_none() => word
            .value
            .to_ascii_uppercase()
            .chars()
            .take(MAX_DESCRIBED_CHARS)
            .collect(),
        Token::Word(_) => "a quoted identifier".into(),
        t if is_literal(t) => "a literal".into(),
        Token::Number(..) => "a number".into(),
        t => t.to_string().chars().take(MAX_DESCRIBED_CHARS).collect(),
    }
}

/// Byte offset in `src` just past the token.
pub fn end_offset(src: &str, token: &TokenWithSpan) -> Option<usize> {
    byte_offset(src, token.span.end)
}

/// Convert a 1-based line/column (columns count chars) into a byte offset.
fn byte_offset(src: &str, location: Location) -> Option<usize> {
    let line = usize::try_from(location.line).ok()?.checked_sub(1)?;
    let column = usize::try_from(location.column).ok()?.checked_sub(1)?;

    let mut line_start = 0;
    for (idx, text) in src.split_inclusive('\n').enumerate() {
        if idx == line {
            return match text.char_indices().nth(column) {
                Some((offset, _)) => Some(line_start + offset),
                None if text.chars().count() == column => Some(line_start + text.len()),
                None => None,
            };
        }
        line_start += text.len();
    }

    // Position just past the last character of input ending in a newline.
    (line_start == src.len() && column == 0).then_some(src.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comments_and_whitespace_dropped() {
        let tokens = tokenize("SELECT /* note */ 1 -- tail\n").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(render(&tokens, false), "SELECT 1");
    }

    #[test]
    fn test_unterminated_input_is_an_error() {
        assert!(tokenize("SELECT 'open").is_err());
        assert!(tokenize("SELECT \"open").is_err());
        assert!(tokenize("SELECT 1 /* open").is_err());
    }

    #[test]
    fn test_render() {
        let tokens = tokenize("select  count(*)\n from   t where name = 'bob'").unwrap();
        assert_eq!(render(&tokens, false), "SELECT COUNT (*) FROM T WHERE NAME = 'bob'");
        assert_eq!(render(&tokens, true), "SELECT COUNT (*) FROM T WHERE NAME = '?'");
    }

    #[test]
    fn test_render_escapes_quotes() {
        let tokens = tokenize("SELECT 'it''s', s.\"Mixed\" FROM s").unwrap();
        assert_eq!(render(&tokens, false), "SELECT 'it''s', S.\"Mixed\" FROM S");
    }

    #[test]
    fn test_describe_hides_literals() {
        let tokens = tokenize("'secret' \"Hidden\" drop").unwrap();
        assert_eq!(describe(&tokens[0].token), "a literal");
        assert_eq!(describe(&tokens[1].token), "a quoted identifier");
        assert_eq!(describe(&tokens[2].token), "DROP");
    }

    #[test]
    fn test_end_offset_counts_chars() {
        let sql = "SELECT\n  'é' -- tail";
        let tokens = tokenize(sql).unwrap();
        let end = end_offset(sql, &tokens[1]).unwrap();
        assert_eq!(&sql[..end], "SELECT\n  'é'");

        let sql = "SELECT 1";
        let tokens = tokenize(sql).unwrap();
        assert_eq!(end_offset(sql, &tokens[1]), Some(sql.len()));
    }
}

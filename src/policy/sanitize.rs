//! Comment and literal stripping so checks only see SQL structure.

use once_cell::sync::Lazy;
use regex::Regex;

static LINE_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)--.*$").expect("line comment pattern"));
static BLOCK_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("block comment pattern"));
static STRING_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(?:''|[^'])*'").expect("string literal pattern"));
static BACKTICK_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`[^`]*`").expect("backtick pattern"));

pub fn strip_comments(sql: &str) -> String {
    let sql = LINE_COMMENT.replace_all(sql, "");
    BLOCK_COMMENT.replace_all(&sql, "").into_owned()
}

/// Empties string literals and backtick-quoted identifiers, keeping the quotes.
pub fn strip_literals(sql: &str) -> String {
    let sql = STRING_LITERAL.replace_all(sql, "''");
    BACKTICK_LITERAL.replace_all(&sql, "``").into_owned()
}

pub fn sanitize(sql: &str) -> String {
    strip_literals(&strip_comments(sql))
}

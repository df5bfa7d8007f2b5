//! Text-level review checks.

use once_cell::sync::Lazy;
use regex::Regex;

use super::sanitize::sanitize;
use super::statement::StatementClassifier;
use super::{Finding, FindingCode, Severity};
use crate::guard::human_bytes;

static SELECT_STAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\bselect\s+(?:(?:distinct|all)\s+)?|,\s*)\*").expect("select star pattern")
});
static ALIAS_STAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\w+\.\*").expect("alias star pattern"));
static CROSS_JOIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bcross\s+join\b").expect("cross join pattern"));
static JOIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bjoin\b").expect("join pattern"));
static ON_OR_USING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:on|using)\b").expect("join condition pattern"));
static STATEMENT_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r";\s*").expect("statement split pattern"));
static SCRIPT_START: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(?:begin|declare|set|if|while|loop|repeat|for|call|execute\s+immediate|raise)\b",
    )
    .expect("script pattern")
});

pub fn check_bytes(bytes_processed: Option<u64>, warn: u64, block: u64) -> Vec<Finding> {
    let Some(bytes) = bytes_processed else {
        return Vec::new();
    };
    if bytes >= block {
        vec![Finding::new(
            Severity::Error,
            FindingCode::BytesBlock,
            format!(
                "Estimated scan {} is at or above the block limit {}",
                human_bytes(bytes),
                human_bytes(block)
            ),
        )
        .with_evidence(format!("{bytes} bytes"))]
    } else if bytes >= warn {
        vec![Finding::new(
            Severity::Warn,
            FindingCode::BytesWarn,
            format!(
                "Estimated scan {} is at or above the warning limit {}",
                human_bytes(bytes),
                human_bytes(warn)
            ),
        )
        .with_evidence(format!("{bytes} bytes"))]
    } else {
        Vec::new()
    }
}

pub fn check_select_star(sql: &str) -> Vec<Finding> {
    let sanitized = sanitize(sql);
    if SELECT_STAR.is_match(&sanitized) || ALIAS_STAR.is_match(&sanitized) {
        vec![Finding::new(
            Severity::Warn,
            FindingCode::SelectStar,
            "SELECT * reads every column",
        )]
    } else {
        Vec::new()
    }
}

pub fn check_cross_join(sql: &str) -> Vec<Finding> {
    if CROSS_JOIN.is_match(&sanitize(sql)) {
        vec![Finding::new(
            Severity::Warn,
            FindingCode::CrossJoin,
            "CROSS JOIN detected",
        )]
    } else {
        Vec::new()
    }
}

/// A JOIN with no ON or USING anywhere in the query. Explicit CROSS JOINs are
/// reported by their own check.
pub fn check_suspect_join(sql: &str) -> Vec<Finding> {
    let sanitized = sanitize(sql);
    let without_cross = CROSS_JOIN.replace_all(&sanitized, " ");
    if JOIN.is_match(&without_cross) && !ON_OR_USING.is_match(&without_cross) {
        vec![Finding::new(
            Severity::Warn,
            FindingCode::SuspectJoin,
            "JOIN without an ON or USING condition",
        )]
    } else {
        Vec::new()
    }
}

pub fn check_multi_statement(sql: &str, block: bool) -> Vec<Finding> {
    let severity = if block {
        Severity::Error
    } else {
        Severity::Warn
    };
    let sanitized = sanitize(sql);
    let statements: Vec<&str> = STATEMENT_SPLIT
        .split(sanitized.trim())
        .filter(|s| !s.trim().is_empty())
        .collect();

    if let Some(script) = statements.iter().find(|s| SCRIPT_START.is_match(s)) {
        let keyword = script.split_whitespace().next().unwrap_or_default();
        return vec![Finding::new(
            severity,
            FindingCode::Script,
            "Scripting statements detected",
        )
        .with_evidence(keyword.to_uppercase())];
    }
    if statements.len() > 1 {
        return vec![Finding::new(
            severity,
            FindingCode::MultiStatement,
            format!("{} statements detected", statements.len()),
        )];
    }
    Vec::new()
}

pub fn check_ddl_dml(sql: &str, classifier: &StatementClassifier) -> Vec<Finding> {
    match classifier.leading_kind(sql) {
        Some(kind) if kind.is_ddl_dml() => vec![Finding::new(
            Severity::Warn,
            FindingCode::DdlDml,
            format!("{} statement modifies data or schema", kind.keyword()),
        )
        .with_evidence(kind.keyword())],
        _ => Vec::new(),
    }
}

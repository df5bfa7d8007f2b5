//! Statement classification.
//!
//! Uses sqlparser-rs with the BigQuery dialect. Text that does not parse
//! (BigQuery has syntax the parser does not know) falls back to the leading
//! keyword.

use sqlparser::ast::Statement;
use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;

use super::sanitize::sanitize;

/// Broad kind of a SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Insert,
    Update,
    Delete,
    Merge,
    Create,
    Drop,
    Alter,
    Truncate,
    Other,
}

impl StatementKind {
    /// True for anything that writes data or changes schema.
    pub fn is_ddl_dml(&self) -> bool {
        !matches!(self, Self::Query | Self::Other)
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Query => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Merge => "MERGE",
            Self::Create => "CREATE",
            Self::Drop => "DROP",
            Self::Alter => "ALTER",
            Self::Truncate => "TRUNCATE",
            Self::Other => "OTHER",
        }
    }

    fn from_keyword(word: &str) -> Self {
        match word.to_ascii_lowercase().as_str() {
            "select" | "with" => Self::Query,
            "insert" => Self::Insert,
            "update" => Self::Update,
            "delete" => Self::Delete,
            "merge" => Self::Merge,
            "create" => Self::Create,
            "drop" => Self::Drop,
            "alter" => Self::Alter,
            "truncate" => Self::Truncate,
            _ => Self::Other,
        }
    }
}

/// Classifies SQL statements.
#[derive(Debug, Default)]
pub struct StatementClassifier {
    dialect: BigQueryDialect,
}

impl StatementClassifier {
    pub fn new() -> Self {
        Self {
            dialect: BigQueryDialect {},
        }
    }

    /// Kind of the first statement in `sql`, or `None` for empty text.
    pub fn leading_kind(&self, sql: &str) -> Option<StatementKind> {
        match Parser::parse_sql(&self.dialect, sql) {
            Ok(statements) => match statements.first() {
                Some(statement) => Some(classify_statement(statement)),
                None => None,
            },
            Err(_) => {
                let sanitized = sanitize(sql);
                sanitized
                    .split_whitespace()
                    .next()
                    .map(|word| word.trim_start_matches('('))
                    .map(StatementKind::from_keyword)
            }
        }
    }
}

fn classify_statement(statement: &Statement) -> StatementKind {
    match statement {
        Statement::Query(_) => StatementKind::Query,
        Statement::Insert { .. } => StatementKind::Insert,
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete { .. } => StatementKind::Delete,
        Statement::Merge { .. } => StatementKind::Merge,
        Statement::CreateTable { .. }
        | Statement::CreateView { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateIndex { .. } => StatementKind::Create,
        Statement::Drop { .. } | Statement::DropFunction { .. } => StatementKind::Drop,
        Statement::AlterTable { .. } | Statement::AlterView { .. } => StatementKind::Alter,
        Statement::Truncate { .. } => StatementKind::Truncate,
        _ => StatementKind::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(sql: &str) -> Option<StatementKind> {
        StatementClassifier::new().leading_kind(sql)
    }

    #[test]
    fn test_select_is_query() {
        assert_eq!(kind("SELECT a FROM `p.d.t`"), Some(StatementKind::Query));
    }

    #[test]
    fn test_cte_is_query() {
        assert_eq!(
            kind("WITH x AS (SELECT 1 AS a) SELECT a FROM x"),
            Some(StatementKind::Query)
        );
    }

    #[test]
    fn test_dml_kinds() {
        assert_eq!(kind("DELETE FROM d.t WHERE true"), Some(StatementKind::Delete));
        assert_eq!(kind("INSERT INTO d.t (a) VALUES (1)"), Some(StatementKind::Insert));
        assert_eq!(kind("UPDATE d.t SET a = 1 WHERE true"), Some(StatementKind::Update));
    }

    #[test]
    fn test_ddl_kinds() {
        assert_eq!(kind("DROP TABLE d.t"), Some(StatementKind::Drop));
        assert_eq!(kind("CREATE TABLE d.t (a INT64)"), Some(StatementKind::Create));
        assert!(StatementKind::Truncate.is_ddl_dml());
        assert!(!StatementKind::Query.is_ddl_dml());
    }

    #[test]
    fn test_unparseable_falls_back_to_keyword() {
        assert_eq!(
            kind("MERGE d.t T USING d.s S ON T.id = S.id WHEN MATCHED THEN DELETE ??"),
            Some(StatementKind::Merge)
        );
        assert_eq!(kind("-- just a comment\nFOO BAR ??"), Some(StatementKind::Other));
    }

    #[test]
    fn test_empty_has_no_kind() {
        assert_eq!(kind("   "), None);
    }
}

//! Review checks run against every successful estimate.
//!
//! Findings are advisory except where they block approval: any ERROR finding,
//! or any WARN finding when `allow_execute_with_warnings` is off.

mod checks;
mod partition;
mod sanitize;
mod statement;

pub use checks::{
    check_bytes, check_cross_join, check_ddl_dml, check_multi_statement, check_select_star,
    check_suspect_join,
};
pub use partition::enforce_partition_filters;
pub use sanitize::sanitize;
pub use statement::{StatementClassifier, StatementKind};

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{Config, LimitsConfig, PolicyConfig};
use crate::warehouse::{Partitioning, TableRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Error,
    Warn,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Error => "ERROR",
            Severity::Warn => "WARN",
            Severity::Info => "INFO",
        };
        write!(f, "{s}")
    }
}

/// Stable identifiers for each check, as shown to the operator and stored in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingCode {
    BytesWarn,
    BytesBlock,
    SelectStar,
    CrossJoin,
    SuspectJoin,
    Script,
    MultiStatement,
    DdlDml,
    PartitionMissing,
    PartitionTablesUnknown,
}

impl FindingCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BytesWarn => "BYTES_WARN",
            Self::BytesBlock => "BYTES_BLOCK",
            Self::SelectStar => "SELECT_STAR",
            Self::CrossJoin => "CROSS_JOIN",
            Self::SuspectJoin => "SUSPECT_JOIN",
            Self::Script => "SCRIPT",
            Self::MultiStatement => "MULTI_STATEMENT",
            Self::DdlDml => "DDL_DML",
            Self::PartitionMissing => "PARTITION_MISSING",
            Self::PartitionTablesUnknown => "PARTITION_TABLES_UNKNOWN",
        }
    }
}

impl fmt::Display for FindingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub code: FindingCode,
    pub message: String,
    pub evidence: Option<String>,
    pub table: Option<TableRef>,
}

impl Finding {
    pub fn new(severity: Severity, code: FindingCode, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
            evidence: None,
            table: None,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }

    pub fn with_table(mut self, table: TableRef) -> Self {
        self.table = Some(table);
        self
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.code, self.message)?;
        if let Some(evidence) = &self.evidence {
            write!(f, " ({evidence})")?;
        }
        Ok(())
    }
}

/// Findings and the per-table partition summary for one estimate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyReport {
    pub findings: Vec<Finding>,
    pub partition_summary: Vec<String>,
}

impl PolicyReport {
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    pub fn has_warnings(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Warn)
    }

    /// Codes that forbid approval under the given warning policy, deduplicated.
    pub fn blocking_codes(&self, allow_warnings: bool) -> Vec<String> {
        let mut codes: Vec<String> = Vec::new();
        for finding in &self.findings {
            let blocks = match finding.severity {
                Severity::Error => true,
                Severity::Warn => !allow_warnings,
                Severity::Info => false,
            };
            let code = finding.code.as_str().to_string();
            if blocks && !codes.contains(&code) {
                codes.push(code);
            }
        }
        codes
    }
}

/// Thresholds and switches the review runs under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyRules {
    pub limits: LimitsConfig,
    pub policy: PolicyConfig,
    pub partition_exempt_tables: Vec<String>,
}

impl PolicyRules {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limits: config.limits.clone(),
            policy: config.policy.clone(),
            partition_exempt_tables: config.exceptions.partition_exempt_tables.clone(),
        }
    }

    pub fn allow_warnings(&self) -> bool {
        self.policy.allow_execute_with_warnings
    }
}

/// Runs every enabled check.
///
/// `partitioning` looks up cached table metadata; unknown tables count as
/// unpartitioned.
pub fn review<F>(
    sql: &str,
    bytes_processed: Option<u64>,
    tables: &[TableRef],
    rules: &PolicyRules,
    partitioning: F,
) -> PolicyReport
where
    F: Fn(&TableRef) -> Option<Partitioning>,
{
    let mut findings = check_bytes(
        bytes_processed,
        rules.limits.warn_bytes,
        rules.limits.block_bytes,
    );
    if rules.policy.warn_select_star {
        findings.extend(check_select_star(sql));
    }
    if rules.policy.warn_cross_join {
        findings.extend(check_cross_join(sql));
    }
    if rules.policy.warn_suspect_join {
        findings.extend(check_suspect_join(sql));
    }
    findings.extend(check_multi_statement(
        sql,
        rules.policy.block_multi_statement,
    ));
    if rules.policy.warn_ddl_dml {
        findings.extend(check_ddl_dml(sql, &StatementClassifier::new()));
    }

    let mut partition_summary = Vec::new();
    if rules.policy.enforce_partition_filter {
        let (partition_findings, summary) = enforce_partition_filters(
            sql,
            tables,
            &rules.partition_exempt_tables,
            partitioning,
        );
        findings.extend(partition_findings);
        partition_summary = summary;
    }

    PolicyReport {
        findings,
        partition_summary,
    }
}

static FULL_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"`?([\w-]+)\.([\w-]+)\.([\w-]+)`?").expect("table reference pattern")
});
static DATASET_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`?([\w-]+)\.([\w-]+)`?").expect("dataset table pattern"));

/// Table references found in the SQL text, in first-seen order.
///
/// Used when the warehouse does not report referenced tables. Two-part names
/// are only considered when no three-part name is present and a default
/// project is known.
pub fn tables_in_sql(sql: &str, default_project: Option<&str>) -> Vec<TableRef> {
    fn push_unique(tables: &mut Vec<TableRef>, table: TableRef) {
        if !tables.contains(&table) {
            tables.push(table);
        }
    }

    let text = sanitize::strip_comments(sql);
    let mut tables = Vec::new();
    for caps in FULL_TABLE.captures_iter(&text) {
        push_unique(&mut tables, TableRef::new(&caps[1], &caps[2], &caps[3]));
    }
    if tables.is_empty() {
        if let Some(project) = default_project {
            for caps in DATASET_TABLE.captures_iter(&text) {
                push_unique(&mut tables, TableRef::new(project, &caps[1], &caps[2]));
            }
        }
    }
    tables
}

//! Partition-filter enforcement.

use regex::Regex;

use super::{Finding, FindingCode, Severity};
use crate::warehouse::{Partitioning, TableRef};

const INGESTION_KEYS: [&str; 2] = ["_PARTITIONDATE", "_PARTITIONTIME"];

fn mentions(sql: &str, key: &str) -> bool {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(key)))
        .map(|re| re.is_match(sql))
        .unwrap_or(false)
}

/// Checks every referenced table against its partitioning.
///
/// `lookup` returns the cached partitioning, or `None` when the table's
/// metadata is unknown (treated as unpartitioned). Returns the findings and one
/// summary line per table.
pub fn enforce_partition_filters<F>(
    sql: &str,
    tables: &[TableRef],
    exempt: &[String],
    lookup: F,
) -> (Vec<Finding>, Vec<String>)
where
    F: Fn(&TableRef) -> Option<Partitioning>,
{
    let mut findings = Vec::new();
    let mut summary = Vec::new();

    if tables.is_empty() {
        findings.push(Finding::new(
            Severity::Warn,
            FindingCode::PartitionTablesUnknown,
            "Could not determine the referenced tables",
        ));
        return (findings, summary);
    }

    for table in tables {
        let name = table.to_string();
        if exempt.iter().any(|e| e.trim().trim_matches('`') == name) {
            summary.push(format!("{name}: exempt"));
            continue;
        }

        let partitioning = lookup(table).unwrap_or_default();
        let required = if partitioning.is_ingestion_time() {
            INGESTION_KEYS.join("/")
        } else if let Some(key) = partitioning.key() {
            key.to_string()
        } else {
            summary.push(format!("{name}: non-partition"));
            continue;
        };

        let satisfied = if partitioning.is_ingestion_time() {
            INGESTION_KEYS.iter().any(|key| mentions(sql, key))
        } else {
            mentions(sql, &required)
        };

        if satisfied {
            summary.push(format!("{name}: ok"));
        } else {
            findings.push(
                Finding::new(
                    Severity::Error,
                    FindingCode::PartitionMissing,
                    format!("{name} needs a partition filter"),
                )
                .with_evidence(required.clone())
                .with_table(table.clone()),
            );
            summary.push(format!("{name}: missing {required}"));
        }
    }

    (findings, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TableRef {
        TableRef::new("p", "d", "t")
    }

    fn run(sql: &str, partitioning: Partitioning, exempt: &[String]) -> (Vec<Finding>, Vec<String>) {
        enforce_partition_filters(sql, &[table()], exempt, |_| Some(partitioning.clone()))
    }

    #[test]
    fn test_ingestion_time_partition_ok() {
        let (findings, summary) = run(
            "SELECT * FROM t WHERE _PARTITIONDATE = '2024-01-01'",
            Partitioning::Time { column: None },
            &[],
        );
        assert!(findings.is_empty());
        assert_eq!(summary, vec!["p.d.t: ok"]);
    }

    #[test]
    fn test_ingestion_time_accepts_partitiontime_case_insensitively() {
        let (findings, _) = run(
            "SELECT a FROM t WHERE _partitiontime > TIMESTAMP('2024-01-01')",
            Partitioning::Time { column: None },
            &[],
        );
        assert!(findings.is_empty());
    }

    #[test]
    fn test_ingestion_time_partition_missing() {
        let (findings, summary) = run(
            "SELECT * FROM t",
            Partitioning::Time { column: None },
            &[],
        );
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Error);
        assert_eq!(findings[0].code, FindingCode::PartitionMissing);
        assert_eq!(summary, vec!["p.d.t: missing _PARTITIONDATE/_PARTITIONTIME"]);
    }

    #[test]
    fn test_column_partition_missing() {
        let (findings, summary) = run(
            "SELECT * FROM t",
            Partitioning::Time {
                column: Some("event_date".to_string()),
            },
            &[],
        );
        assert_eq!(findings[0].code, FindingCode::PartitionMissing);
        assert_eq!(findings[0].evidence.as_deref(), Some("event_date"));
        assert_eq!(summary, vec!["p.d.t: missing event_date"]);
    }

    #[test]
    fn test_column_key_needs_word_boundary() {
        let (findings, _) = run(
            "SELECT * FROM t WHERE event_date_local = '2024-01-01'",
            Partitioning::Time {
                column: Some("event_date".to_string()),
            },
            &[],
        );
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_exempt_tables_skip() {
        let (findings, summary) = run(
            "SELECT * FROM t",
            Partitioning::Time {
                column: Some("event_date".to_string()),
            },
            &["p.d.t".to_string()],
        );
        assert!(findings.is_empty());
        assert_eq!(summary, vec!["p.d.t: exempt"]);
    }

    #[test]
    fn test_unknown_metadata_is_non_partition() {
        let (findings, summary) =
            enforce_partition_filters("SELECT 1 FROM t", &[table()], &[], |_| None);
        assert!(findings.is_empty());
        assert_eq!(summary, vec!["p.d.t: non-partition"]);
    }

    #[test]
    fn test_unknown_tables_warn() {
        let (findings, summary) = enforce_partition_filters("SELECT 1", &[], &[], |_| None);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warn);
        assert_eq!(findings[0].code, FindingCode::PartitionTablesUnknown);
        assert!(summary.is_empty());
    }
}

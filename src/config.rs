//! Configuration management for bq-guard.
//!
//! Loads a TOML file with per-section defaults, clamps invalid values back to
//! their defaults (reporting a warning for each), and resolves the billing
//! project and location from CLI, config, environment, then gcloud.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::{GuardError, Result};

/// Location used when neither config, environment nor gcloud provide one.
pub const DEFAULT_LOCATION: &str = "asia-northeast1";

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub exceptions: ExceptionsConfig,

    #[serde(default)]
    pub bq: BqConfig,

    #[serde(default)]
    pub ui: UiConfig,
}

/// General application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Billing project. Falls back to the environment and gcloud.
    pub default_project: Option<String>,

    /// Job location (e.g. "US", "asia-northeast1").
    pub default_location: Option<String>,

    /// Rows fetched for the preview grid.
    #[serde(default = "default_preview_rows")]
    pub preview_rows: usize,

    /// Rows per result page when exporting.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Directory CSV exports are written to.
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,

    /// History entries kept in the state database.
    #[serde(default = "default_history_max_entries")]
    pub history_max_entries: u32,
}

fn default_preview_rows() -> usize {
    50
}

fn default_page_size() -> usize {
    1000
}

fn default_export_dir() -> PathBuf {
    PathBuf::from("exports")
}

fn default_history_max_entries() -> u32 {
    5000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_project: None,
            default_location: None,
            preview_rows: default_preview_rows(),
            page_size: default_page_size(),
            export_dir: default_export_dir(),
            history_max_entries: default_history_max_entries(),
        }
    }
}

/// Scan-size thresholds, in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// 100 GiB.
    #[serde(default = "default_warn_bytes")]
    pub warn_bytes: u64,

    /// 500 GiB.
    #[serde(default = "default_block_bytes")]
    pub block_bytes: u64,
}

fn default_warn_bytes() -> u64 {
    107_374_182_400
}

fn default_block_bytes() -> u64 {
    536_870_912_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            warn_bytes: default_warn_bytes(),
            block_bytes: default_block_bytes(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// Switches for the review checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_true")]
    pub enforce_partition_filter: bool,

    #[serde(default = "default_true")]
    pub block_multi_statement: bool,

    #[serde(default = "default_true")]
    pub warn_select_star: bool,

    #[serde(default = "default_true")]
    pub warn_cross_join: bool,

    #[serde(default = "default_true")]
    pub warn_suspect_join: bool,

    #[serde(default = "default_true")]
    pub warn_ddl_dml: bool,

    /// When false, any WARN finding blocks approval.
    #[serde(default = "default_true")]
    pub allow_execute_with_warnings: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enforce_partition_filter: true,
            block_multi_statement: true,
            warn_select_star: true,
            warn_cross_join: true,
            warn_suspect_join: true,
            warn_ddl_dml: true,
            allow_execute_with_warnings: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExceptionsConfig {
    /// Fully qualified tables that skip partition-filter enforcement.
    #[serde(default)]
    pub partition_exempt_tables: Vec<String>,
}

/// BigQuery job settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BqConfig {
    #[serde(default)]
    pub use_query_cache: bool,

    /// Labels attached to every job, in addition to `mode`.
    #[serde(default = "default_labels")]
    pub labels: BTreeMap<String, String>,

    /// Override for the REST API root.
    pub api_base_url: Option<String>,
}

fn default_labels() -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), "bq-guard".to_string())])
}

impl Default for BqConfig {
    fn default() -> Self {
        Self {
            use_query_cache: false,
            labels: default_labels(),
            api_base_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiConfig {
    /// Quiet period after the last edit before an automatic estimate.
    #[serde(default = "default_debounce_ms")]
    pub auto_estimate_debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    900
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            auto_estimate_debounce_ms: default_debounce_ms(),
        }
    }
}

/// BigQuery label keys and values: lowercase letters, digits, `_` and `-`, at most 63 chars.
fn is_valid_label(s: &str, allow_empty: bool) -> bool {
    (allow_empty || !s.is_empty())
        && s.len() <= 63
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bq-guard")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file. A missing file yields defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| GuardError::config(format!("Failed to read config file: {e}")))?;

        Self::parse_toml(&content, path)
    }

    /// Loads the file (writing the defaults out if it does not exist yet) and
    /// validates it. Returns the config and any validation warnings.
    pub fn load_or_init(path: &Path) -> Result<(Self, Vec<String>)> {
        let mut warnings = Vec::new();
        if !path.exists() {
            if let Err(e) = Self::default().write_to(path) {
                warnings.push(format!("Could not write default config: {e}"));
            }
        }
        let mut config = Self::load_from_file(path)?;
        warnings.extend(config.validate());
        Ok((config, warnings))
    }

    /// Writes the config as TOML, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GuardError::config(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| GuardError::config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| GuardError::config(format!("Failed to write {}: {e}", path.display())))
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            GuardError::config(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })
    }

    /// Resets invalid values to their defaults and describes each change.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.app.preview_rows == 0 {
            warnings.push("Invalid app.preview_rows; using default.".to_string());
            self.app.preview_rows = default_preview_rows();
        }
        if self.app.page_size == 0 {
            warnings.push("Invalid app.page_size; using default.".to_string());
            self.app.page_size = default_page_size();
        }
        if self.app.history_max_entries == 0 {
            warnings.push("Invalid app.history_max_entries; using default.".to_string());
            self.app.history_max_entries = default_history_max_entries();
        }
        if self.limits.block_bytes < self.limits.warn_bytes {
            warnings.push(
                "limits.block_bytes is below limits.warn_bytes; using default limits.".to_string(),
            );
            self.limits = LimitsConfig::default();
        }

        let invalid: Vec<String> = self
            .bq
            .labels
            .iter()
            .filter(|(k, v)| !is_valid_label(k, false) || !is_valid_label(v, true))
            .map(|(k, _)| k.clone())
            .collect();
        for key in invalid {
            warnings.push(format!("Invalid bq.labels entry '{key}'; dropped."));
            self.bq.labels.remove(&key);
        }

        if let Some(base) = &self.bq.api_base_url {
            if let Err(e) = Url::parse(base) {
                warnings.push(format!("Invalid bq.api_base_url ({e}); using default."));
                self.bq.api_base_url = None;
            }
        }

        for warning in &warnings {
            warn!("{}", warning);
        }
        warnings
    }

    /// Parsed API root override, if configured.
    pub fn api_base_url(&self) -> Option<Url> {
        self.bq
            .api_base_url
            .as_deref()
            .and_then(|base| Url::parse(base).ok())
    }

    /// Project from the CLI, the config file, or the environment, in that order.
    pub fn resolve_project(&self, cli: Option<&str>) -> Option<String> {
        cli.map(String::from)
            .or_else(|| self.app.default_project.clone())
            .or_else(|| env_non_empty("BQ_GUARD_PROJECT"))
            .or_else(|| env_non_empty("GOOGLE_CLOUD_PROJECT"))
    }

    /// Location from the CLI, the config file, or the environment, in that order.
    pub fn resolve_location(&self, cli: Option<&str>) -> Option<String> {
        cli.map(String::from)
            .or_else(|| self.app.default_location.clone())
            .or_else(|| env_non_empty("BQ_GUARD_LOCATION"))
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

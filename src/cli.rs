//! Command-line argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// Output format for headless mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Plain text output of the final screen.
    #[default]
    Text,
    /// JSON output with screen, state, and metadata.
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid output format: {s}. Expected: text or json")),
        }
    }
}

/// Estimate, review and approve BigQuery queries before they run.
#[derive(Parser, Debug)]
#[command(name = "bq-guard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Billing project for dry runs and jobs
    #[arg(short = 'p', long, value_name = "PROJECT")]
    pub project: Option<String>,

    /// Job location (e.g. US, asia-northeast1)
    #[arg(short = 'l', long, value_name = "LOCATION")]
    pub location: Option<String>,

    /// Config file path
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Load the editor with the contents of this file
    #[arg(short = 'f', long, value_name = "PATH")]
    pub query_file: Option<PathBuf>,

    // === Headless mode options ===
    /// Run in headless mode (no terminal UI, for testing/automation)
    #[arg(long)]
    pub headless: bool,

    /// Comma-separated events to execute in headless mode (e.g. "type:SELECT 1,key:ctrl+e")
    #[arg(long, value_name = "EVENTS")]
    pub events: Option<String>,

    /// Path to script file with events (use "-" for stdin)
    #[arg(long, value_name = "PATH")]
    pub script: Option<String>,

    /// Use the in-memory mock warehouse instead of BigQuery
    #[arg(long)]
    pub mock_warehouse: bool,

    /// Screen size for headless mode (WIDTHxHEIGHT, e.g., "100x30")
    #[arg(long, value_name = "SIZE", default_value = "100x30")]
    pub size: String,

    /// Output format for headless mode
    #[arg(long, value_name = "FORMAT", default_value = "text")]
    pub output: String,

    /// Write output to file instead of stdout
    #[arg(long, value_name = "PATH")]
    pub output_file: Option<PathBuf>,

    /// Stop on first assertion failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Do not record the audit history
    #[arg(long)]
    pub no_history: bool,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(crate::config::Config::default_path)
    }

    /// Returns true if headless mode is enabled.
    pub fn is_headless(&self) -> bool {
        self.headless
    }

    /// Reads the initial query text from `--query-file`, if given.
    pub fn read_query_file(&self) -> std::result::Result<Option<String>, String> {
        match &self.query_file {
            Some(path) => std::fs::read_to_string(path)
                .map(Some)
                .map_err(|e| format!("Failed to read query file {}: {e}", path.display())),
            None => Ok(None),
        }
    }

    /// Parses the screen size from the --size argument.
    /// Returns (width, height) or an error.
    pub fn parse_screen_size(&self) -> std::result::Result<(u16, u16), String> {
        let Some((w, h)) = self.size.split_once('x') else {
            return Err(format!(
                "Invalid size format: '{}'. Expected WIDTHxHEIGHT (e.g., 100x30)",
                self.size
            ));
        };
        let width = w
            .parse::<u16>()
            .map_err(|_| format!("Invalid width: '{w}'"))?;
        let height = h
            .parse::<u16>()
            .map_err(|_| format!("Invalid height: '{h}'"))?;
        if width == 0 || height == 0 {
            return Err(format!("Screen size must be non-zero: '{}'", self.size));
        }
        Ok((width, height))
    }

    /// Parses the output format from the --output argument.
    pub fn parse_output_format(&self) -> std::result::Result<OutputFormat, String> {
        self.output.parse()
    }

    /// Validates headless mode arguments.
    /// Returns an error message if validation fails.
    pub fn validate_headless(&self) -> std::result::Result<(), String> {
        if !self.headless {
            if self.events.is_some() || self.script.is_some() {
                return Err("--events and --script require --headless".to_string());
            }
            return Ok(());
        }

        if self.events.is_none() && self.script.is_none() {
            return Err("--headless requires --events or --script".to_string());
        }
        if self.events.is_some() && self.script.is_some() {
            return Err("--events and --script cannot be combined".to_string());
        }

        self.parse_screen_size()?;
        self.parse_output_format()?;

        Ok(())
    }
}

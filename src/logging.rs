//! Logging setup.
//!
//! The interactive terminal owns stdout and stderr, so interactive runs log to
//! a file; headless runs log to stderr.

use std::fs::{self, File};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "bq-guard.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initializes logging for the interactive terminal.
///
/// Writes to `~/.local/state/bq-guard/bq-guard.log` on Linux, or the
/// platform's equivalent. The file is truncated on each run.
pub fn init_file_logging() {
    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            eprintln!("Warning: Could not create log directory: {e}");
            return;
        }
    }

    let log_file = match File::create(&log_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Could not create log file: {e}");
            return;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(log_file)
        .with_ansi(false)
        .init();
}

/// Initializes logging for headless runs.
pub fn init_stderr_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

/// Path of the interactive log file.
pub fn get_log_path() -> PathBuf {
    if let Some(state_dir) = dirs::state_dir() {
        return state_dir.join("bq-guard").join(LOG_FILE);
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("bq-guard").join(LOG_FILE);
    }
    std::env::temp_dir().join(LOG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_path_is_absolute() {
        assert!(get_log_path().is_absolute());
    }

    #[test]
    fn test_log_path_names_the_app() {
        let path = get_log_path();
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some(LOG_FILE));
        assert!(path.to_string_lossy().contains("bq-guard"));
    }
}

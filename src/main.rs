//! bq-guard: estimate, review and approve BigQuery queries before they run.

use std::sync::Arc;
use std::time::Duration;

use bq_guard::cli::Cli;
use bq_guard::config::{Config, DEFAULT_LOCATION};
use bq_guard::error::{GuardError, Result};
use bq_guard::guard::GuardSession;
use bq_guard::logging;
use bq_guard::metadata::MetadataCache;
use bq_guard::persistence::{HistoryLog, StateDb};
use bq_guard::tui::{self, headless, Controller};
use bq_guard::warehouse::{gcloud, BigQueryClient, MockWarehouseClient, WarehouseClient};
use tracing::{error, info, warn};

/// Billing project the demo warehouse answers for.
const MOCK_PROJECT: &str = "mock-project";

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse_args();

    if let Err(message) = cli.validate_headless() {
        eprintln!("Error: {message}");
        std::process::exit(2);
    }

    if cli.is_headless() {
        logging::init_stderr_logging();
    } else {
        logging::init_file_logging();
    }

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}: {}", e.category(), e);
            eprintln!("{}: {}", e.category(), e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let (config, warnings) = Config::load_or_init(&config_path)?;

    let location = match config.resolve_location(cli.location.as_deref()) {
        Some(location) => location,
        None => gcloud::default_location()
            .await
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
    };

    let (client, project): (Arc<dyn WarehouseClient>, Option<String>) = if cli.mock_warehouse {
        let project = config
            .resolve_project(cli.project.as_deref())
            .unwrap_or_else(|| MOCK_PROJECT.to_string());
        info!("Using the in-memory demo warehouse");
        (Arc::new(MockWarehouseClient::demo()), Some(project))
    } else {
        let project = match config.resolve_project(cli.project.as_deref()) {
            Some(project) => project,
            None => gcloud::default_project().await.ok_or_else(|| {
                GuardError::config(
                    "No billing project. Pass --project, set app.default_project, \
                     BQ_GUARD_PROJECT, or run `gcloud config set project`",
                )
            })?,
        };
        let mut client = BigQueryClient::new(project.clone())
            .map_err(|e| GuardError::config(format!("Failed to create BigQuery client: {e}")))?;
        if let Some(base_url) = config.api_base_url() {
            info!("Using BigQuery API at {base_url}");
            client = client.with_base_url(base_url);
        }
        (Arc::new(client), Some(project))
    };
    info!(project = ?project, %location, "Resolved job context");

    let query = cli.read_query_file().map_err(GuardError::config)?;

    let mut session = GuardSession::new(Arc::clone(&client), &config, project.clone(), &location);
    let db = if cli.no_history {
        None
    } else {
        match StateDb::open_default().await {
            Ok(db) => Some(Arc::new(db)),
            Err(e) => {
                warn!("State database unavailable, continuing without history: {e}");
                None
            }
        }
    };
    if let Some(db) = &db {
        let history = HistoryLog::new(Arc::clone(db), project, Some(location.clone()))
            .with_max_entries(config.app.history_max_entries);
        let metadata = MetadataCache::new(Arc::clone(&client))
            .with_store(Arc::clone(db))
            .await;
        session = session.with_history(history).with_metadata(metadata);
    }
    if let Some(text) = query {
        session = session.with_text(text);
    }

    let debounce = Duration::from_millis(config.ui.auto_estimate_debounce_ms);
    let mut controller =
        Controller::new(session, debounce).with_config(config, Some(config_path));
    for warning in warnings {
        controller.app.warn(warning);
    }
    if db.is_none() && !cli.no_history {
        controller.app.warn("History is disabled: state database unavailable");
    }

    let code = if cli.is_headless() {
        headless::run_headless(&cli, controller).await?
    } else {
        tui::run(controller).await?;
        0
    };

    if let Some(db) = db {
        db.close().await;
    }
    Ok(code)
}

//! Integration tests for the guarded workflow.

pub mod export_test;
pub mod headless_test;
pub mod persistence_test;
pub mod workflow_test;

use bq_guard::config::Config;
use bq_guard::guard::GuardSession;
use bq_guard::warehouse::MockWarehouseClient;
use std::sync::Arc;

/// A session over `client` with default config, billing to the mock project.
pub fn session(client: &MockWarehouseClient) -> GuardSession {
    session_with(client, &Config::default())
}

pub fn session_with(client: &MockWarehouseClient, config: &Config) -> GuardSession {
    GuardSession::new(
        Arc::new(client.clone()),
        config,
        Some("mock-project".to_string()),
        "US",
    )
}

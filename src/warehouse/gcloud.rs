//! Helpers that shell out to the `gcloud` CLI for defaults and credentials.

use tokio::process::Command;
use tracing::debug;

use crate::error::WarehouseError;

/// Environment variables checked for a ready-made OAuth access token.
pub const TOKEN_ENV_VARS: [&str; 2] = ["BQ_GUARD_ACCESS_TOKEN", "GOOGLE_OAUTH_ACCESS_TOKEN"];

async fn gcloud(args: &[&str]) -> Result<String, WarehouseError> {
    let output = Command::new("gcloud")
        .args(args)
        .output()
        .await
        .map_err(|e| WarehouseError::auth(format!("could not run gcloud: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WarehouseError::auth(format!(
            "gcloud {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value == "(unset)" {
        None
    } else {
        Some(value.to_string())
    }
}

/// The project configured in the active gcloud configuration, if any.
pub async fn default_project() -> Option<String> {
    match gcloud(&["config", "get-value", "project"]).await {
        Ok(value) => non_empty(value),
        Err(e) => {
            debug!("No gcloud default project: {}", e);
            None
        }
    }
}

/// The region configured in the active gcloud configuration, if any.
pub async fn default_location() -> Option<String> {
    match gcloud(&["config", "get-value", "compute/region"]).await {
        Ok(value) => non_empty(value),
        Err(e) => {
            debug!("No gcloud default region: {}", e);
            None
        }
    }
}

/// Returns an access token from the environment, falling back to gcloud.
pub async fn access_token() -> Result<String, WarehouseError> {
    if let Some(token) = token_from_env() {
        return Ok(token);
    }
    let token = gcloud(&["auth", "print-access-token"]).await?;
    non_empty(token).ok_or_else(|| WarehouseError::auth("gcloud returned an empty access token"))
}

/// Reads the first non-empty token variable.
pub fn token_from_env() -> Option<String> {
    TOKEN_ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find_map(non_empty)
}

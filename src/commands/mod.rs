pub(crate) mod completions;
pub(crate) mod connect;
pub(crate) mod disconnect;
pub(crate) mod kubeconfig;
pub(crate) mod list;
pub(crate) mod logout;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use zli::api::ConnectionApi;
use zli::daemon::RuntimeSettings;
use zli::{DaemonRuntime, Registry, UserConfig};

/// Lifecycle runtime over the default registry, tuned by config.toml.
pub(crate) fn runtime(config: &UserConfig) -> Result<DaemonRuntime> {
    let registry = Registry::open_default();
    tracing::trace!(path = %registry.path().display(), "Using daemon registry");
    let runtime = DaemonRuntime::system(registry, config.daemon.status_timeout())
        .context("Failed to create HTTP client for daemon status checks")?;
    Ok(runtime.with_settings(RuntimeSettings {
        shutdown_grace: config.daemon.shutdown_grace(),
    }))
}

/// API client for the logged in session, if there is one.
pub(crate) fn session_api(config: &UserConfig) -> Result<Option<ConnectionApi>> {
    let Some(token) = config.session_token.as_deref() else {
        return Ok(None);
    };
    let api = ConnectionApi::new(&config.service_url(), token)
        .context("Failed to create HTTP client for the service")?;
    Ok(Some(api))
}

/// Best-effort notification that a connection is gone; failures only log.
pub(crate) async fn close_connections(api: Option<&ConnectionApi>, connection_ids: &[String]) {
    let Some(api) = api else {
        return;
    };
    for connection_id in connection_ids {
        if let Err(e) = api.close_connection(connection_id).await {
            tracing::warn!(
                connection_id = %connection_id,
                error = %e,
                "Failed to close connection"
            );
        }
    }
}

pub(crate) fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

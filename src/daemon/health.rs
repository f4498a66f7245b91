use std::future::Future;
use std::time::Duration;
use tracing::{debug, trace};

use super::DaemonConfig;
use crate::error::Result;

/// Behavioural liveness: a daemon is only "running" when its status
/// endpoint answers.
pub trait HealthCheck: Send + Sync {
    /// Bounded-timeout GET of the daemon's status endpoint; success is any 2xx.
    fn is_healthy(&self, config: &DaemonConfig) -> impl Future<Output = bool> + Send;

    /// Ask a daemon with a control channel to shut down. Returns whether the
    /// request was accepted; kinds without a control channel always decline.
    fn request_shutdown(&self, config: &DaemonConfig) -> impl Future<Output = bool> + Send;
}

/// Status URL polled during health-wait and status resolution.
pub fn status_url(config: &DaemonConfig) -> String {
    let kind = config.kind();
    match (kind.has_control_channel(), config.control_port) {
        (true, Some(control_port)) => format!("http://{}:{}/", config.local_host, control_port),
        _ => format!(
            "{}://{}:{}/",
            kind.status_scheme(),
            config.local_host,
            config.local_port
        ),
    }
}

pub fn shutdown_url(config: &DaemonConfig) -> Option<String> {
    if !config.kind().has_control_channel() {
        return None;
    }
    config
        .control_port
        .map(|port| format!("http://{}:{}/shutdown", config.local_host, port))
}

/// Health checks over HTTP against the daemon's local endpoints.
#[derive(Debug, Clone)]
pub struct HttpHealthCheck {
    client: reqwest::Client,
}

impl HttpHealthCheck {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            // local endpoints only; HTTP(S)_PROXY must not intercept them
            .no_proxy()
            // the kube daemon serves a self-signed certificate
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { client })
    }
}

impl HealthCheck for HttpHealthCheck {
    async fn is_healthy(&self, config: &DaemonConfig) -> bool {
        let url = status_url(config);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let healthy = response.status().is_success();
                trace!(url = %url, status = %response.status(), healthy, "Status probe");
                healthy
            }
            Err(e) => {
                trace!(url = %url, error = %e, "Status probe failed");
                false
            }
        }
    }

    async fn request_shutdown(&self, config: &DaemonConfig) -> bool {
        let Some(url) = shutdown_url(config) else {
            return false;
        };
        match self.client.post(&url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, "Daemon accepted shutdown request");
                true
            }
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "Daemon rejected shutdown request");
                false
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Shutdown request failed");
                false
            }
        }
    }
}

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::kubeconfig::KubeSecuritySettings;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserConfig {
    /// Service base URL (e.g., "https://cloud.bastionzero.com")
    pub service_url: Option<String>,
    pub session_id: Option<String>,
    pub session_token: Option<String>,
    /// Email of the logged in user; names the shared kubeconfig user
    pub email: Option<String>,
    /// Daemon executable, when not on PATH
    pub daemon_path: Option<String>,
    #[serde(default)]
    pub kube: KubeSecuritySettings,
    #[serde(default)]
    pub daemon: DaemonSettings,
}

/// Timing knobs for the daemon lifecycle, all optional in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub startup_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub shutdown_grace_secs: u64,
    pub status_timeout_ms: u64,
    pub default_local_host: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            startup_timeout_secs: 15,
            poll_interval_ms: 250,
            shutdown_grace_secs: 5,
            status_timeout_ms: 2000,
            default_local_host: "localhost".to_string(),
        }
    }
}

impl DaemonSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

impl UserConfig {
    /// $ZLI_CONFIG_DIR/config.toml or ~/.config/zli/config.toml
    pub fn config_path() -> PathBuf {
        crate::clienv::config_dir().join("config.toml")
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        tracing::trace!(path = %path.display(), "Loading user config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(
            service_url = ?config.service_url,
            email = ?config.email,
            "User config loaded"
        );
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Write to `path`, readable by the owner only since it holds session tokens.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        tracing::trace!(path = %path.display(), "Saving user config");

        let content =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        crate::fsutil::write_private(path, content.as_bytes())
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        tracing::trace!("User config saved");
        Ok(())
    }

    pub fn service_url(&self) -> String {
        crate::clienv::service_url(self.service_url.as_deref())
    }

    pub fn daemon_path(&self) -> PathBuf {
        crate::clienv::daemon_path(self.daemon_path.as_deref())
    }

    pub fn email(&self) -> &str {
        self.email.as_deref().unwrap_or_default()
    }

    /// Forget the session; kube credentials go with it.
    pub fn clear_session(&mut self) {
        self.session_id = None;
        self.session_token = None;
        self.kube.token.clear();
    }
}

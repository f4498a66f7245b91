use std::path::PathBuf;

#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    ZliConfigDir,
    ZliDataDir,
    ZliDaemonPath,
    ZliServiceUrl,
    ZliLog,
    KubeConfig,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::ZliConfigDir => "ZLI_CONFIG_DIR",
            EnvVar::ZliDataDir => "ZLI_DATA_DIR",
            EnvVar::ZliDaemonPath => "ZLI_DAEMON_PATH",
            EnvVar::ZliServiceUrl => "ZLI_SERVICE_URL",
            EnvVar::ZliLog => "ZLI_LOG",
            EnvVar::KubeConfig => "KUBECONFIG",
        }
    }
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const FALLBACK_DATA_DIR: &str = "~/.local/share";
const ZLI_SUBDIR: &str = "zli";
const DEFAULT_SERVICE_URL: &str = "https://cloud.bastionzero.com";
const DEFAULT_DAEMON_BINARY: &str = "bzero-daemon";

/// Unset and empty are both "not provided".
fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str()).ok().filter(|v| !v.trim().is_empty())
}

/// zli config directory ($ZLI_CONFIG_DIR or ~/.config/zli)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(EnvVar::ZliConfigDir)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(ZLI_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// zli data directory ($ZLI_DATA_DIR or ~/.local/share/zli)
pub fn data_dir() -> PathBuf {
    let dir = env_opt(EnvVar::ZliDataDir)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
                .join(ZLI_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// Daemon registry file (<config_dir>/daemons.toml)
pub fn registry_path() -> PathBuf {
    config_dir().join("daemons.toml")
}

/// Daemon logs, one `<kind>-<connection id>.log` per daemon
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Installed shell completion scripts
pub fn completions_dir() -> PathBuf {
    data_dir().join("completions")
}

/// Daemon executable ($ZLI_DAEMON_PATH, then `daemon_path` from config, then PATH lookup)
pub fn daemon_path(configured: Option<&str>) -> PathBuf {
    let path = env_opt(EnvVar::ZliDaemonPath)
        .or_else(|| configured.map(str::to_string))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DAEMON_BINARY));
    tracing::trace!(path = %path.display(), "Daemon executable");
    path
}

/// Service URL ($ZLI_SERVICE_URL, then config, then the public default)
pub fn service_url(configured: Option<&str>) -> String {
    let url = env_opt(EnvVar::ZliServiceUrl)
        .or_else(|| configured.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_SERVICE_URL.to_string());
    tracing::trace!(url = %url, "Service URL");
    url
}

/// Log filter directive ($ZLI_LOG, falling back to $RUST_LOG)
pub fn log_filter() -> Option<String> {
    env_opt(EnvVar::ZliLog).or_else(|| std::env::var("RUST_LOG").ok())
}

/// Kubeconfig consulted and updated in place.
///
/// `KUBECONFIG` may hold a path list; like kubectl, the first entry is the
/// file that receives modifications.
pub fn kubeconfig_path() -> PathBuf {
    let path = env_opt(EnvVar::KubeConfig)
        .and_then(|list| first_path_in_list(&list))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join(".kube")
                .join("config")
        });
    tracing::trace!(path = %path.display(), "Kubeconfig path");
    path
}

fn first_path_in_list(list: &str) -> Option<PathBuf> {
    let separator = if cfg!(windows) { ';' } else { ':' };
    list.split(separator)
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn first_kubeconfig_in_list_wins() {
        assert_eq!(
            first_path_in_list("/a/config:/b/config"),
            Some(PathBuf::from("/a/config"))
        );
        assert_eq!(first_path_in_list(" :/b/config"), Some(PathBuf::from("/b/config")));
        assert_eq!(first_path_in_list(""), None);
    }
}

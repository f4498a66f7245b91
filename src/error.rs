use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::daemon::DaemonKind;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("local port {host}:{port} is already in use")]
    PortUnavailable { host: String, port: u16 },

    #[error(
        "{kind} daemon for connection {connection_id} did not become healthy within {timeout:?}"
    )]
    DaemonStartTimeout {
        kind: DaemonKind,
        connection_id: String,
        timeout: Duration,
    },

    #[error("{kind} daemon for connection {connection_id} exited during startup ({status})")]
    DaemonExited {
        kind: DaemonKind,
        connection_id: String,
        status: String,
    },

    #[error("interrupted while waiting for the daemon to start")]
    Interrupted,

    #[error("connection {connection_id} already has a registered {kind} daemon")]
    AlreadyRegistered {
        kind: DaemonKind,
        connection_id: String,
    },

    #[error("{kind} daemon (pid {pid}) for connection {connection_id} is still running after kill")]
    ProcessSurvived {
        kind: DaemonKind,
        connection_id: String,
        pid: u32,
    },

    #[error("daemon registry {path} is corrupt: {detail}")]
    RegistryCorrupt { path: PathBuf, detail: String },

    #[error("failed to write {path}: {source}")]
    ExternalFileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon executable not found: {0}")]
    DaemonBinaryMissing(String),

    #[error("failed to spawn daemon: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to lock daemon registry {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("service request failed ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid kubeconfig: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to serialize daemon registry: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    /// Concrete next step shown to the user below the error message.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::PortUnavailable { .. } => Some(concat!(
                "Choose another port with --port, ",
                "or use `zli list-daemons` to inspect running daemons"
            )),
            Self::DaemonStartTimeout { .. } | Self::DaemonExited { .. } => {
                Some("Check the daemon log in the zli data directory, then retry `zli connect`")
            }
            Self::AlreadyRegistered { .. } => {
                Some("Use `zli list-daemons` to inspect running daemons")
            }
            Self::ProcessSurvived { .. } => {
                Some("Stop the process manually; its registry entry has been removed")
            }
            Self::ExternalFileWriteFailed { .. } => {
                Some("Check permissions, or pass --outputFile to write somewhere else")
            }
            Self::DaemonBinaryMissing(_) => {
                Some("Set ZLI_DAEMON_PATH or `daemon_path` in config.toml to the daemon executable")
            }
            Self::Api { status: 401, .. } => Some("Your session has expired, log in again"),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_unavailable_points_at_list_daemons() {
        let err = DaemonError::PortUnavailable {
            host: "localhost".into(),
            port: 5432,
        };
        assert_eq!(err.to_string(), "local port localhost:5432 is already in use");
        assert!(err.remediation().unwrap().contains("zli list-daemons"));
    }

    #[test]
    fn write_failure_names_the_path() {
        let err = DaemonError::ExternalFileWriteFailed {
            path: PathBuf::from("/nope/config"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.to_string().starts_with("failed to write /nope/config"));
    }
}

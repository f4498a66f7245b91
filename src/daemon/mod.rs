//! Local proxy daemons - lifecycle of detached per-connection processes
//!
//! Every `zli connect` starts one daemon: a detached process that terminates
//! the encrypted tunnel on one side and exposes a local endpoint on the other.
//! The CLI itself is short-lived, so everything later invocations need to know
//! about a daemon lives in the [`Registry`](crate::registry::Registry) and in
//! the OS process table.
//!
//! ```text
//! ┌───────────────┐ spawn + health-wait ┌──────────────┐
//! │   launcher    │────────────────────▶│  daemon proc │
//! └──────┬────────┘                     └──────▲───────┘
//!        │ insert_new                          │ pid / status GET / shutdown
//! ┌──────▼────────┐   read   ┌─────────────────┴──────────┐
//! │   registry    │─────────▶│ status resolver / disconnect│
//! └───────────────┘          └────────────────────────────┘
//! ```

pub mod disconnect;
pub mod health;
pub mod launcher;
pub mod status;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::process::{ProcessMonitor, SystemProcessMonitor};
use crate::registry::Registry;

pub use disconnect::{DisconnectOutcome, DisconnectReport, Disconnector};
pub use health::{HealthCheck, HttpHealthCheck};
pub use launcher::{ConnectionCredentials, DaemonLauncher, LaunchRequest, LauncherSettings};
pub use status::{ResolvedDaemon, StatusResolver};

/// Kind of daemon, one registry section each.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[value(rename_all = "lower")]
pub enum DaemonKind {
    Db,
    Rdp,
    SqlServer,
    Kube,
    Web,
}

impl DaemonKind {
    pub const ALL: [DaemonKind; 5] = [
        DaemonKind::Db,
        DaemonKind::Rdp,
        DaemonKind::SqlServer,
        DaemonKind::Kube,
        DaemonKind::Web,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonKind::Db => "db",
            DaemonKind::Rdp => "rdp",
            DaemonKind::SqlServer => "sqlserver",
            DaemonKind::Kube => "kube",
            DaemonKind::Web => "web",
        }
    }

    /// Raw TCP tunnels get a secondary HTTP control channel; kube and web
    /// daemons already speak HTTP on their local port.
    pub fn has_control_channel(&self) -> bool {
        matches!(
            self,
            DaemonKind::Db | DaemonKind::Rdp | DaemonKind::SqlServer
        )
    }

    /// Short label for listings, e.g. "Kubernetes".
    pub fn label(&self) -> &'static str {
        match self {
            DaemonKind::Db => "Database",
            DaemonKind::Rdp => "RDP",
            DaemonKind::SqlServer => "SQL Server",
            DaemonKind::Kube => "Kubernetes",
            DaemonKind::Web => "Web",
        }
    }

    /// The kube daemon terminates TLS for kubectl on its local port.
    pub fn status_scheme(&self) -> &'static str {
        match self {
            DaemonKind::Kube => "https",
            _ => "http",
        }
    }
}

impl fmt::Display for DaemonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DaemonKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "db" => Ok(DaemonKind::Db),
            "rdp" => Ok(DaemonKind::Rdp),
            "sqlserver" => Ok(DaemonKind::SqlServer),
            "kube" => Ok(DaemonKind::Kube),
            "web" => Ok(DaemonKind::Web),
            other => Err(format!("unknown daemon type: {}", other)),
        }
    }
}

/// Remote side of a TCP-style tunnel (db, rdp, sqlserver, web).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub target_id: String,
    pub target_name: String,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeTarget {
    pub target_id: String,
    pub target_cluster: String,
    pub target_user: String,
    #[serde(default)]
    pub target_groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,
}

/// Kind-specific part of a daemon record; the tag doubles as the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetDetails {
    Db(RemoteTarget),
    Rdp(RemoteTarget),
    SqlServer(RemoteTarget),
    Kube(KubeTarget),
    Web(RemoteTarget),
}

impl TargetDetails {
    pub fn kind(&self) -> DaemonKind {
        match self {
            TargetDetails::Db(_) => DaemonKind::Db,
            TargetDetails::Rdp(_) => DaemonKind::Rdp,
            TargetDetails::SqlServer(_) => DaemonKind::SqlServer,
            TargetDetails::Kube(_) => DaemonKind::Kube,
            TargetDetails::Web(_) => DaemonKind::Web,
        }
    }

    pub fn target_id(&self) -> &str {
        match self {
            TargetDetails::Kube(k) => &k.target_id,
            TargetDetails::Db(r)
            | TargetDetails::Rdp(r)
            | TargetDetails::SqlServer(r)
            | TargetDetails::Web(r) => &r.target_id,
        }
    }

    /// Name shown in listings: the cluster for kube, the target name otherwise.
    pub fn target_name(&self) -> &str {
        match self {
            TargetDetails::Kube(k) => &k.target_cluster,
            TargetDetails::Db(r)
            | TargetDetails::Rdp(r)
            | TargetDetails::SqlServer(r)
            | TargetDetails::Web(r) => &r.target_name,
        }
    }

    pub fn target_user(&self) -> Option<&str> {
        match self {
            TargetDetails::Kube(k) => Some(&k.target_user),
            TargetDetails::Db(r)
            | TargetDetails::Rdp(r)
            | TargetDetails::SqlServer(r)
            | TargetDetails::Web(r) => r.target_user.as_deref(),
        }
    }

    pub fn target_groups(&self) -> &[String] {
        match self {
            TargetDetails::Kube(k) => &k.target_groups,
            _ => &[],
        }
    }
}

/// Persisted record of a daemon that passed its health-wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub name: String,
    pub local_host: String,
    pub local_port: u16,
    pub local_pid: u32,
    /// OS start-time marker of `local_pid`, used to reject recycled PIDs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_started_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,
    pub target: TargetDetails,
}

impl DaemonConfig {
    pub fn kind(&self) -> DaemonKind {
        self.target.kind()
    }

    pub fn local_url(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }
}

/// Facts derived for a daemon that answered its status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveDetails {
    pub local_url: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target_groups: Vec<String>,
}

impl LiveDetails {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            local_url: config.local_url(),
            target: config.target.target_name().to_string(),
            target_user: config.target.target_user().map(str::to_string),
            target_groups: config.target.target_groups().to_vec(),
        }
    }
}

/// Outcome of resolving one connection. Computed fresh, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonStatus {
    NoDaemonRunning,
    DaemonIsRunning {
        config: DaemonConfig,
        details: LiveDetails,
    },
    DaemonQuitUnexpectedly { config: DaemonConfig },
}

impl DaemonStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, DaemonStatus::DaemonIsRunning { .. })
    }

    pub fn config(&self) -> Option<&DaemonConfig> {
        match self {
            DaemonStatus::NoDaemonRunning => None,
            DaemonStatus::DaemonIsRunning { config, .. }
            | DaemonStatus::DaemonQuitUnexpectedly { config } => Some(config),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonStatus::NoDaemonRunning => "not running",
            DaemonStatus::DaemonIsRunning { .. } => "running",
            DaemonStatus::DaemonQuitUnexpectedly { .. } => "quit unexpectedly",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Time a daemon gets to exit after a graceful shutdown request or SIGTERM
    pub shutdown_grace: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Shared handles the lifecycle components operate on.
pub struct DaemonRuntime<M = SystemProcessMonitor, H = HttpHealthCheck> {
    pub registry: Registry,
    pub monitor: Arc<M>,
    pub health: Arc<H>,
    pub settings: RuntimeSettings,
}

impl<M, H> Clone for DaemonRuntime<M, H> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            monitor: Arc::clone(&self.monitor),
            health: Arc::clone(&self.health),
            settings: self.settings.clone(),
        }
    }
}

impl DaemonRuntime {
    /// Runtime backed by the real process table and HTTP status probes.
    pub fn system(registry: Registry, status_timeout: Duration) -> crate::Result<Self> {
        Ok(Self::new(
            registry,
            SystemProcessMonitor,
            HttpHealthCheck::new(status_timeout)?,
        ))
    }
}

impl<M: ProcessMonitor + 'static, H: HealthCheck + 'static> DaemonRuntime<M, H> {
    pub fn new(registry: Registry, monitor: M, health: H) -> Self {
        Self {
            registry,
            monitor: Arc::new(monitor),
            health: Arc::new(health),
            settings: RuntimeSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn resolver(&self) -> StatusResolver<M, H> {
        StatusResolver::new(self.clone())
    }

    pub fn disconnector(&self) -> Disconnector<M, H> {
        Disconnector::new(self.clone())
    }

    pub fn launcher(&self, settings: LauncherSettings) -> DaemonLauncher<M, H> {
        DaemonLauncher::new(self.clone(), settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kube_config() -> DaemonConfig {
        DaemonConfig {
            name: "prod-cluster".into(),
            local_host: "localhost".into(),
            local_port: 6443,
            local_pid: 4242,
            process_started_at: None,
            control_port: None,
            target: TargetDetails::Kube(KubeTarget {
                target_id: "t-1".into(),
                target_cluster: "prod".into(),
                target_user: "admin".into(),
                target_groups: vec!["system:masters".into()],
                default_namespace: Some("default".into()),
            }),
        }
    }

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in DaemonKind::ALL {
            assert_eq!(kind.as_str().parse::<DaemonKind>().unwrap(), kind);
        }
        assert!("ssh".parse::<DaemonKind>().is_err());
    }

    #[test]
    fn registry_cli_and_daemon_share_one_kind_name() {
        use clap::ValueEnum;

        for kind in DaemonKind::ALL {
            let serialized = serde_json::to_value(kind).unwrap();
            assert_eq!(serialized.as_str(), Some(kind.as_str()));
            let value = kind.to_possible_value().unwrap();
            assert_eq!(value.get_name(), kind.as_str());
        }
    }

    #[test]
    fn only_tcp_tunnels_have_control_channels() {
        assert!(DaemonKind::Db.has_control_channel());
        assert!(DaemonKind::SqlServer.has_control_channel());
        assert!(!DaemonKind::Kube.has_control_channel());
        assert!(!DaemonKind::Web.has_control_channel());
    }

    #[test]
    fn live_details_carry_kind_specific_facts() {
        let details = LiveDetails::from_config(&kube_config());
        assert_eq!(details.local_url, "localhost:6443");
        assert_eq!(details.target, "prod");
        assert_eq!(details.target_user.as_deref(), Some("admin"));
        assert_eq!(details.target_groups, vec!["system:masters"]);
    }

    #[test]
    fn config_kind_follows_target_tag() {
        let config = kube_config();
        assert_eq!(config.kind(), DaemonKind::Kube);
        let json = serde_json::to_value(&config.target).unwrap();
        assert_eq!(json["kind"], "kube");
    }

    #[test]
    fn status_accessors() {
        let config = kube_config();
        let quit = DaemonStatus::DaemonQuitUnexpectedly {
            config: config.clone(),
        };
        assert!(!quit.is_running());
        assert_eq!(quit.config(), Some(&config));
        assert_eq!(DaemonStatus::NoDaemonRunning.config(), None);
    }
}

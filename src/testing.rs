//! In-memory process table and status endpoints for lifecycle tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::daemon::{
    DaemonConfig, DaemonRuntime, HealthCheck, KubeTarget, RemoteTarget, RuntimeSettings,
    TargetDetails,
};
use crate::process::ProcessMonitor;
use crate::registry::Registry;

#[derive(Default)]
pub(crate) struct FakeWorld {
    alive: Mutex<HashSet<u32>>,
    bound: Mutex<HashSet<u16>>,
    /// Ports each started pid listens on, released when it dies
    ports: Mutex<HashMap<u32, Vec<u16>>>,
    /// Local ports whose status endpoint answers 200
    healthy: Mutex<HashSet<u16>>,
    accept_shutdown: AtomicBool,
    shutdown_requests: Mutex<Vec<u16>>,
    terminated: Mutex<Vec<u32>>,
    unkillable: Mutex<HashSet<u32>>,
}

impl FakeWorld {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn runtime(
        self: &Arc<Self>,
        registry: Registry,
    ) -> DaemonRuntime<FakeMonitor, FakeHealth> {
        DaemonRuntime::new(
            registry,
            FakeMonitor(Arc::clone(self)),
            FakeHealth(Arc::clone(self)),
        )
        .with_settings(RuntimeSettings {
            shutdown_grace: Duration::from_millis(100),
        })
    }

    /// Make `config` look like a healthy running daemon listening on its
    /// local and control ports.
    pub(crate) fn start(&self, config: &DaemonConfig) {
        let ports: Vec<u16> = std::iter::once(config.local_port)
            .chain(config.control_port)
            .collect();
        self.alive.lock().unwrap().insert(config.local_pid);
        self.bound.lock().unwrap().extend(ports.iter().copied());
        self.healthy.lock().unwrap().insert(config.local_port);
        self.ports.lock().unwrap().insert(config.local_pid, ports);
    }

    /// Process vanished without cleaning up.
    pub(crate) fn crash(&self, config: &DaemonConfig) {
        self.kill(config.local_pid);
    }

    /// Process still exists but stopped answering.
    pub(crate) fn wedge(&self, config: &DaemonConfig) {
        self.healthy.lock().unwrap().remove(&config.local_port);
    }

    pub(crate) fn bind(&self, port: u16) {
        self.bound.lock().unwrap().insert(port);
    }

    /// Signals sent to `pid` are ignored.
    pub(crate) fn make_unkillable(&self, pid: u32) {
        self.unkillable.lock().unwrap().insert(pid);
    }

    pub(crate) fn set_accept_shutdown(&self, accept: bool) {
        self.accept_shutdown.store(accept, Ordering::SeqCst);
    }

    pub(crate) fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    pub(crate) fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().unwrap().clone()
    }

    pub(crate) fn shutdown_requests(&self) -> Vec<u16> {
        self.shutdown_requests.lock().unwrap().clone()
    }

    pub(crate) fn is_bound(&self, port: u16) -> bool {
        self.bound.lock().unwrap().contains(&port)
    }

    /// `pid` exits and its sockets close.
    fn kill(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
        let ports = self.ports.lock().unwrap().remove(&pid).unwrap_or_default();
        let mut bound = self.bound.lock().unwrap();
        let mut healthy = self.healthy.lock().unwrap();
        for port in ports {
            bound.remove(&port);
            healthy.remove(&port);
        }
    }
}

pub(crate) struct FakeMonitor(Arc<FakeWorld>);

impl ProcessMonitor for FakeMonitor {
    fn is_process_alive(&self, pid: u32) -> bool {
        self.0.is_alive(pid)
    }

    fn process_started_at(&self, _pid: u32) -> Option<u64> {
        None
    }

    async fn is_port_bound(&self, _host: &str, port: u16) -> bool {
        self.0.is_bound(port)
    }

    async fn terminate(&self, pid: u32, _grace: Duration) -> bool {
        self.0.terminated.lock().unwrap().push(pid);
        if self.0.unkillable.lock().unwrap().contains(&pid) {
            return false;
        }
        self.0.kill(pid);
        true
    }
}

pub(crate) struct FakeHealth(Arc<FakeWorld>);

impl HealthCheck for FakeHealth {
    async fn is_healthy(&self, config: &DaemonConfig) -> bool {
        self.0.is_alive(config.local_pid)
            && self.0.healthy.lock().unwrap().contains(&config.local_port)
    }

    async fn request_shutdown(&self, config: &DaemonConfig) -> bool {
        if !config.kind().has_control_channel() || config.control_port.is_none() {
            return false;
        }
        self.0.shutdown_requests.lock().unwrap().push(config.local_port);
        if !self.0.accept_shutdown.load(Ordering::SeqCst) {
            return false;
        }
        self.0.kill(config.local_pid);
        true
    }
}

pub(crate) fn temp_registry() -> (tempfile::TempDir, Registry) {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::new(dir.path().join("daemons.toml"));
    (dir, registry)
}

pub(crate) fn kube_daemon(user: &str, cluster: &str, port: u16, pid: u32) -> DaemonConfig {
    DaemonConfig {
        name: cluster.to_string(),
        local_host: "localhost".into(),
        local_port: port,
        local_pid: pid,
        process_started_at: None,
        control_port: None,
        target: TargetDetails::Kube(KubeTarget {
            target_id: format!("kube-{}", cluster),
            target_cluster: cluster.to_string(),
            target_user: user.to_string(),
            target_groups: vec![],
            default_namespace: None,
        }),
    }
}

pub(crate) fn db_daemon(target: &str, port: u16, pid: u32) -> DaemonConfig {
    DaemonConfig {
        name: target.to_string(),
        local_host: "localhost".into(),
        local_port: port,
        local_pid: pid,
        process_started_at: None,
        control_port: Some(port + 1),
        target: TargetDetails::Db(RemoteTarget {
            target_id: format!("db-{}", target),
            target_name: target.to_string(),
            remote_host: "10.0.0.10".into(),
            remote_port: 5432,
            target_user: None,
        }),
    }
}

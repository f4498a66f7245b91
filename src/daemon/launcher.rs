//! Spawning daemons and registering them once they answer.
//!
//! A launch is: pick ports, stop whatever daemon it replaces, spawn the
//! executable detached, poll its status endpoint, then `insert_new`. Any
//! failure after the spawn rolls back (graceful shutdown, kill, reap) before
//! the error reaches the caller, so a failed launch never leaves an orphan
//! or a registry entry behind.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{DaemonConfig, DaemonKind, DaemonRuntime, HealthCheck, TargetDetails};
use crate::clienv;
use crate::error::{DaemonError, Result};
use crate::process::ProcessMonitor;

pub const DEFAULT_LOCAL_HOST: &str = "localhost";
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const FREE_PORT_ATTEMPTS: usize = 10;

/// Secrets and endpoints a daemon needs to open its tunnel.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCredentials {
    pub connection_service_url: String,
    pub connection_auth_token: String,
    pub session_id: String,
    pub session_token: String,
    pub agent_pub_key: String,
    /// Shared token kubectl presents to the kube daemon
    pub localhost_token: Option<String>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub connection_id: String,
    pub display_name: String,
    pub target: TargetDetails,
    pub local_host: Option<String>,
    /// Explicit port; `None` means remembered-or-fresh
    pub local_port: Option<u16>,
    pub control_port: Option<u16>,
    pub credentials: ConnectionCredentials,
}

impl LaunchRequest {
    pub fn kind(&self) -> DaemonKind {
        self.target.kind()
    }
}

#[derive(Debug, Clone)]
pub struct LauncherSettings {
    pub executable: PathBuf,
    /// Extra arguments passed before any daemon-specific environment
    pub args: Vec<String>,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    /// Exported to the daemon as `CONFIG_PATH`
    pub config_path: PathBuf,
    pub log_dir: PathBuf,
}

impl LauncherSettings {
    pub fn new(executable: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            config_path: config_path.into(),
            log_dir: clienv::logs_dir(),
        }
    }

    pub fn log_path(&self, kind: DaemonKind, connection_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}-{}.log", kind, connection_id))
    }
}

/// Ports chosen for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PortPlan {
    local_port: u16,
    control_port: Option<u16>,
}

fn port_unavailable(host: &str, port: u16) -> DaemonError {
    DaemonError::PortUnavailable {
        host: host.to_string(),
        port,
    }
}

/// Resolves on Ctrl-C. Never resolves when the handler cannot be installed.
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Environment handed to the daemon executable.
pub fn daemon_environment(
    request: &LaunchRequest,
    local_host: &str,
    ports: (u16, Option<u16>),
    config_path: &Path,
    log_path: &Path,
) -> Vec<(&'static str, String)> {
    let (local_port, control_port) = ports;
    let creds = &request.credentials;
    let mut env = vec![
        ("LOCAL_HOST", local_host.to_string()),
        ("LOCAL_PORT", local_port.to_string()),
        ("TARGET_ID", request.target.target_id().to_string()),
        ("PLUGIN", request.kind().as_str().to_string()),
        ("CONNECTION_ID", request.connection_id.clone()),
        ("CONNECTION_SERVICE_URL", creds.connection_service_url.clone()),
        ("CONNECTION_SERVICE_AUTH_TOKEN", creds.connection_auth_token.clone()),
        ("SESSION_ID", creds.session_id.clone()),
        ("SESSION_TOKEN", creds.session_token.clone()),
        ("AGENT_PUB_KEY", creds.agent_pub_key.clone()),
        ("CONFIG_PATH", config_path.display().to_string()),
        ("LOG_PATH", log_path.display().to_string()),
    ];

    match &request.target {
        TargetDetails::Kube(kube) => {
            env.push(("TARGET_USER", kube.target_user.clone()));
            env.push(("TARGET_GROUPS", kube.target_groups.join(",")));
            if let Some(token) = &creds.localhost_token {
                env.push(("LOCALHOST_TOKEN", token.clone()));
            }
            if let Some(cert) = &creds.cert_path {
                env.push(("CERT_PATH", cert.display().to_string()));
            }
            if let Some(key) = &creds.key_path {
                env.push(("KEY_PATH", key.display().to_string()));
            }
        }
        TargetDetails::Db(remote)
        | TargetDetails::Rdp(remote)
        | TargetDetails::SqlServer(remote)
        | TargetDetails::Web(remote) => {
            env.push(("REMOTE_HOST", remote.remote_host.clone()));
            env.push(("REMOTE_PORT", remote.remote_port.to_string()));
            if let Some(user) = &remote.target_user {
                env.push(("TARGET_USER", user.clone()));
            }
        }
    }

    if let Some(port) = control_port {
        env.push(("CONTROL_PORT", port.to_string()));
    }
    env
}

/// Child handle that kills and reaps the process unless disarmed.
struct SpawnedDaemon {
    child: Option<Child>,
    pid: u32,
}

impl SpawnedDaemon {
    fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child: Some(child),
            pid,
        }
    }

    fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Ok(None),
        }
    }

    async fn wait_timeout(&mut self, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if matches!(self.try_wait(), Ok(Some(_))) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                debug!(pid = self.pid, error = %e, "Kill failed, daemon already exited");
            }
            let _ = child.wait();
        }
    }

    /// Leave the daemon running after the CLI exits.
    fn disarm(mut self) -> u32 {
        self.child.take();
        self.pid
    }
}

impl Drop for SpawnedDaemon {
    fn drop(&mut self) {
        self.kill();
    }
}

pub struct DaemonLauncher<M, H> {
    rt: DaemonRuntime<M, H>,
    settings: LauncherSettings,
}

impl<M: ProcessMonitor + 'static, H: HealthCheck + 'static> DaemonLauncher<M, H> {
    pub fn new(rt: DaemonRuntime<M, H>, settings: LauncherSettings) -> Self {
        Self { rt, settings }
    }

    pub fn settings(&self) -> &LauncherSettings {
        &self.settings
    }

    /// Start a detached daemon for `request` and register it once healthy.
    /// Ctrl-C during the health-wait rolls the launch back.
    pub async fn launch(&self, request: &LaunchRequest) -> Result<DaemonConfig> {
        self.launch_until(request, ctrl_c()).await
    }

    /// [`launch`](Self::launch) with an explicit interrupt: if `cancel`
    /// resolves before the daemon is healthy, the child is shut down and
    /// `Interrupted` is returned.
    pub async fn launch_until<F>(
        &self,
        request: &LaunchRequest,
        cancel: F,
    ) -> Result<DaemonConfig>
    where
        F: Future<Output = ()>,
    {
        let kind = request.kind();
        let host = request.local_host.as_deref().unwrap_or(DEFAULT_LOCAL_HOST);
        let ports = self.select_ports(request, host, true).await?;

        let mut config = DaemonConfig {
            name: request.display_name.clone(),
            local_host: host.to_string(),
            local_port: ports.local_port,
            local_pid: 0,
            process_started_at: None,
            control_port: ports.control_port,
            target: request.target.clone(),
        };

        let mut child = self.spawn_detached(request, &config)?;
        config.local_pid = child.pid;
        info!(
            %kind,
            connection_id = %request.connection_id,
            pid = child.pid,
            port = config.local_port,
            "Spawned daemon, waiting for it to become healthy"
        );

        let waited = tokio::select! {
            result = self.wait_until_healthy(&mut child, request, &config) => result,
            () = cancel => Err(DaemonError::Interrupted),
        };
        if let Err(e) = waited {
            warn!(
                %kind,
                connection_id = %request.connection_id,
                error = %e,
                "Daemon failed to start, rolling back"
            );
            self.rollback(child, &config).await;
            return Err(e);
        }

        config.process_started_at = self.rt.monitor.process_started_at(child.pid);
        if !self.rt.registry.insert_new(&request.connection_id, config.clone())? {
            warn!(
                %kind,
                connection_id = %request.connection_id,
                "Connection was registered concurrently, rolling back"
            );
            self.rollback(child, &config).await;
            return Err(DaemonError::AlreadyRegistered {
                kind,
                connection_id: request.connection_id.clone(),
            });
        }

        child.disarm();
        info!(
            %kind,
            connection_id = %request.connection_id,
            url = %config.local_url(),
            "Daemon is running"
        );
        Ok(config)
    }

    /// Run the daemon in the foreground with the CLI's stdio. Nothing is
    /// registered and no running daemon is replaced.
    pub async fn launch_attached(&self, request: &LaunchRequest) -> Result<ExitStatus> {
        let host = request.local_host.as_deref().unwrap_or(DEFAULT_LOCAL_HOST);
        let ports = self.select_ports(request, host, false).await?;
        let log_path = self.settings.log_path(request.kind(), &request.connection_id);

        let mut cmd = tokio::process::Command::new(&self.settings.executable);
        cmd.args(&self.settings.args).envs(daemon_environment(
            request,
            host,
            (ports.local_port, ports.control_port),
            &self.settings.config_path,
            &log_path,
        ));
        info!(port = ports.local_port, "Running daemon attached");
        let status = cmd
            .status()
            .await
            .map_err(|e| self.spawn_error(e))?;
        Ok(status)
    }

    /// Port precedence: explicit > remembered for the same target > fresh.
    /// All ports are settled before anything is torn down. With `replace`,
    /// the live daemon already serving this target is disconnected last, and
    /// the ports it held count as free.
    async fn select_ports(
        &self,
        request: &LaunchRequest,
        host: &str,
        replace: bool,
    ) -> Result<PortPlan> {
        let kind = request.kind();
        let previous = self
            .rt
            .registry
            .get(kind)?
            .into_iter()
            .find(|(_, c)| c.target.target_id() == request.target.target_id());

        let reclaimable: BTreeSet<u16> = match &previous {
            Some((_, c))
                if replace
                    && c.local_host == host
                    && self
                        .rt
                        .monitor
                        .is_alive_with_marker(c.local_pid, c.process_started_at) =>
            {
                std::iter::once(c.local_port).chain(c.control_port).collect()
            }
            _ => BTreeSet::new(),
        };

        let mut exclude = self.registered_ports()?;
        let local_port = match (request.local_port, previous.as_ref()) {
            (Some(port), _) => {
                if !self.port_usable(host, port, &reclaimable).await {
                    return Err(port_unavailable(host, port));
                }
                port
            }
            (None, Some((_, c))) => {
                let port = c.local_port;
                if self.port_usable(host, port, &reclaimable).await {
                    debug!(port, "Reusing port of previous daemon for this target");
                    port
                } else {
                    debug!(port, "Remembered port is taken, picking a fresh one");
                    self.free_port(host, &exclude).await?
                }
            }
            (None, None) => self.free_port(host, &exclude).await?,
        };
        exclude.insert(local_port);

        let control_port = if kind.has_control_channel() {
            let port = match request.control_port {
                Some(port) => {
                    if port == local_port || !self.port_usable(host, port, &reclaimable).await {
                        return Err(port_unavailable(host, port));
                    }
                    port
                }
                None => self.free_port(host, &exclude).await?,
            };
            Some(port)
        } else {
            None
        };

        if replace {
            if let Some((connection_id, _)) = &previous {
                info!(%kind, connection_id, "Replacing existing daemon for this target");
                self.rt.disconnector().disconnect(kind, connection_id).await?;
            }
        }

        // anything still on a reclaimed port after the teardown is foreign
        for port in std::iter::once(local_port).chain(control_port) {
            if reclaimable.contains(&port) && self.rt.monitor.is_port_bound(host, port).await {
                return Err(port_unavailable(host, port));
            }
        }

        Ok(PortPlan {
            local_port,
            control_port,
        })
    }

    /// Free now, or held by the daemon about to be replaced.
    async fn port_usable(&self, host: &str, port: u16, reclaimable: &BTreeSet<u16>) -> bool {
        reclaimable.contains(&port) || !self.rt.monitor.is_port_bound(host, port).await
    }

    /// Ports recorded for any daemon, live or not; a stale entry may still
    /// be reclaimed by its owner.
    fn registered_ports(&self) -> Result<BTreeSet<u16>> {
        let mut ports = BTreeSet::new();
        for kind in DaemonKind::ALL {
            for config in self.rt.registry.get(kind)?.values() {
                ports.insert(config.local_port);
                ports.extend(config.control_port);
            }
        }
        Ok(ports)
    }

    /// Let the OS pick an ephemeral port, skipping registered ones.
    async fn free_port(&self, host: &str, exclude: &BTreeSet<u16>) -> Result<u16> {
        for _ in 0..FREE_PORT_ATTEMPTS {
            let port = {
                let listener = TcpListener::bind((host, 0)).await?;
                listener.local_addr()?.port()
            };
            if exclude.contains(&port) || self.rt.monitor.is_port_bound(host, port).await {
                continue;
            }
            debug!(port, "Picked free local port");
            return Ok(port);
        }
        Err(port_unavailable(host, 0))
    }

    fn spawn_detached(
        &self,
        request: &LaunchRequest,
        config: &DaemonConfig,
    ) -> Result<SpawnedDaemon> {
        let log_path = self.settings.log_path(request.kind(), &request.connection_id);
        if let Some(dir) = log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let mut cmd = Command::new(&self.settings.executable);
        cmd.args(&self.settings.args)
            .envs(daemon_environment(
                request,
                &config.local_host,
                (config.local_port, config.control_port),
                &self.settings.config_path,
                &log_path,
            ))
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);

        // New session so the daemon survives the CLI's terminal and process group.
        #[cfg(unix)]
        unsafe {
            use std::os::unix::process::CommandExt;
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
        Ok(SpawnedDaemon::new(child))
    }

    fn spawn_error(&self, e: std::io::Error) -> DaemonError {
        if e.kind() == std::io::ErrorKind::NotFound {
            DaemonError::DaemonBinaryMissing(self.settings.executable.display().to_string())
        } else {
            DaemonError::Spawn(e)
        }
    }

    async fn wait_until_healthy(
        &self,
        child: &mut SpawnedDaemon,
        request: &LaunchRequest,
        config: &DaemonConfig,
    ) -> Result<()> {
        let deadline = Instant::now() + self.settings.startup_timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(DaemonError::DaemonExited {
                    kind: request.kind(),
                    connection_id: request.connection_id.clone(),
                    status: status.to_string(),
                });
            }
            if self.rt.health.is_healthy(config).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DaemonError::DaemonStartTimeout {
                    kind: request.kind(),
                    connection_id: request.connection_id.clone(),
                    timeout: self.settings.startup_timeout,
                });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn rollback(&self, mut child: SpawnedDaemon, config: &DaemonConfig) {
        if config.kind().has_control_channel() && self.rt.health.request_shutdown(config).await {
            if child
                .wait_timeout(self.rt.settings.shutdown_grace, self.settings.poll_interval)
                .await
            {
                debug!(pid = child.pid, "Daemon shut down via control channel");
            }
        }
        child.kill();
    }
}

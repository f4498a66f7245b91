//! Process and socket introspection used to decide whether a recorded daemon
//! still exists and which local ports are free.

use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(300);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(1);

pub trait ProcessMonitor: Send + Sync {
    /// A failed signal or handle lookup counts as "not alive".
    fn is_process_alive(&self, pid: u32) -> bool;

    /// Opaque start-time marker of `pid`, where the platform exposes one.
    fn process_started_at(&self, pid: u32) -> Option<u64>;

    /// Something accepts connections on `host:port`. Not necessarily a daemon.
    fn is_port_bound(&self, host: &str, port: u16) -> impl Future<Output = bool> + Send;

    /// Ask `pid` to exit, escalating to a forced kill after `grace`.
    /// Returns true once the process is gone.
    fn terminate(&self, pid: u32, grace: Duration) -> impl Future<Output = bool> + Send;

    /// Alive and, when both markers are known, still the same process.
    fn is_alive_with_marker(&self, pid: u32, marker: Option<u64>) -> bool {
        if !self.is_process_alive(pid) {
            return false;
        }
        match (marker, self.process_started_at(pid)) {
            (Some(recorded), Some(current)) if recorded != current => {
                debug!(pid, recorded, current, "PID was recycled by another process");
                false
            }
            _ => true,
        }
    }
}

/// Process monitor backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessMonitor;

impl ProcessMonitor for SystemProcessMonitor {
    fn is_process_alive(&self, pid: u32) -> bool {
        let alive = pid_exists(pid) && !is_zombie(pid);
        trace!(pid, alive, "Process liveness check");
        alive
    }

    fn process_started_at(&self, pid: u32) -> Option<u64> {
        start_time_marker(pid)
    }

    async fn is_port_bound(&self, host: &str, port: u16) -> bool {
        let bound = matches!(
            tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        );
        trace!(host, port, bound, "Port probe");
        bound
    }

    async fn terminate(&self, pid: u32, grace: Duration) -> bool {
        if !self.is_process_alive(pid) {
            return true;
        }

        send_terminate(pid);
        if wait_for_exit(self, pid, grace).await {
            debug!(pid, "Process exited after terminate");
            return true;
        }

        warn!(pid, "Process did not exit in {:?}, force killing", grace);
        send_kill(pid);
        wait_for_exit(self, pid, KILL_WAIT).await
    }
}

/// Poll until `pid` is gone or `timeout` elapses.
pub async fn wait_for_exit<M: ProcessMonitor + ?Sized>(
    monitor: &M,
    pid: u32,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !monitor.is_process_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

#[cfg(unix)]
fn pid_exists(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_exists(pid: u32) -> bool {
    use std::process::Command;

    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH", "/FO", "CSV"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{}\"", pid)))
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn proc_stat_fields(pid: u32) -> Option<Vec<String>> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces and parens; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    Some(rest.split_whitespace().map(str::to_string).collect())
}

/// An exited-but-unreaped child still answers `kill(pid, 0)`.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    proc_stat_fields(pid)
        .and_then(|fields| fields.first().cloned())
        .is_some_and(|state| state == "Z" || state == "X")
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Field 22 of /proc/<pid>/stat: start time in clock ticks since boot.
#[cfg(target_os = "linux")]
fn start_time_marker(pid: u32) -> Option<u64> {
    proc_stat_fields(pid)?.get(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn start_time_marker(_pid: u32) -> Option<u64> {
    None
}

#[cfg(unix)]
fn send_terminate(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn send_kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .output();
}

#[cfg(not(unix))]
fn send_kill(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output();
}

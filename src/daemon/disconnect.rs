use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::{DaemonConfig, DaemonKind, DaemonRuntime, DaemonStatus, HealthCheck, ResolvedDaemon};
use crate::error::{DaemonError, Result};
use crate::process::{wait_for_exit, ProcessMonitor};

/// What `disconnect` found and did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// No registry entry; nothing to do.
    NotRunning,
    /// Entry pointed at a dead or wedged daemon; `terminated` is set when a
    /// wedged process had to be killed to free its port.
    Stale { terminated: bool },
    /// A healthy daemon was stopped, via its control channel when `graceful`.
    Stopped { graceful: bool },
}

/// Per-connection results of a batch disconnect, in connection id order.
#[derive(Debug, Default)]
pub struct DisconnectReport {
    pub results: Vec<(String, Result<DisconnectOutcome>)>,
}

impl DisconnectReport {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &DaemonError)> {
        self.results
            .iter()
            .filter_map(|(id, result)| result.as_ref().err().map(|e| (id.as_str(), e)))
    }

    /// Number of daemons that were actually running before the call.
    pub fn stopped(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, result)| matches!(result, Ok(DisconnectOutcome::Stopped { .. })))
            .count()
    }

    fn merge(&mut self, other: DisconnectReport) {
        self.results.extend(other.results);
    }
}

/// Stops daemons and drops their registry entries.
pub struct Disconnector<M, H> {
    rt: DaemonRuntime<M, H>,
}

impl<M, H> Clone for Disconnector<M, H> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
        }
    }
}

impl<M: ProcessMonitor + 'static, H: HealthCheck + 'static> Disconnector<M, H> {
    pub fn new(rt: DaemonRuntime<M, H>) -> Self {
        Self { rt }
    }

    /// Idempotent: a missing entry is success, and the entry is gone
    /// afterwards whichever shutdown path was taken.
    pub async fn disconnect(
        &self,
        kind: DaemonKind,
        connection_id: &str,
    ) -> Result<DisconnectOutcome> {
        let Some(config) = self.rt.registry.find(kind, connection_id)? else {
            debug!(%kind, connection_id, "No daemon registered, nothing to disconnect");
            return Ok(DisconnectOutcome::NotRunning);
        };

        let status = self.rt.resolver().resolve_config(config).await;
        self.teardown(kind, connection_id, &status).await
    }

    /// Disconnect `connection_id` under every kind it is registered as.
    pub async fn disconnect_any(
        &self,
        connection_id: &str,
    ) -> Result<Vec<(DaemonKind, DisconnectOutcome)>> {
        let mut outcomes = Vec::new();
        for kind in self.rt.registry.kinds_of(connection_id)? {
            outcomes.push((kind, self.disconnect(kind, connection_id).await?));
        }
        Ok(outcomes)
    }

    /// Disconnect every daemon of `kind` concurrently. One failure never
    /// aborts the rest of the batch.
    pub async fn disconnect_all(&self, kind: DaemonKind) -> Result<DisconnectReport> {
        let entries = self.rt.registry.get(kind)?;
        let mut tasks = JoinSet::new();
        for connection_id in entries.into_keys() {
            let disconnector = self.clone();
            tasks.spawn(async move {
                let result = disconnector.disconnect(kind, &connection_id).await;
                (connection_id, result)
            });
        }

        let mut report = DisconnectReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => report.results.push(entry),
                Err(e) => warn!(%kind, error = %e, "Disconnect task failed"),
            }
        }
        report.results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(report)
    }

    /// Every kind, as logout does.
    pub async fn disconnect_everything(&self) -> DisconnectReport {
        let mut report = DisconnectReport::default();
        for kind in DaemonKind::ALL {
            match self.disconnect_all(kind).await {
                Ok(batch) => report.merge(batch),
                Err(e) => warn!(%kind, error = %e, "Could not read registry for disconnect"),
            }
        }
        report
    }

    /// Drop entries a resolver pass found to be `DaemonQuitUnexpectedly`,
    /// freeing ports held by wedged processes. Returns how many were pruned.
    pub async fn prune(&self, resolved: &[ResolvedDaemon]) -> usize {
        let mut pruned = 0;
        for entry in resolved {
            if !matches!(entry.status, DaemonStatus::DaemonQuitUnexpectedly { .. }) {
                continue;
            }
            match self.teardown(entry.kind, &entry.connection_id, &entry.status).await {
                Ok(_) => pruned += 1,
                Err(e) => warn!(
                    kind = %entry.kind,
                    connection_id = %entry.connection_id,
                    error = %e,
                    "Failed to prune stale daemon"
                ),
            }
        }
        pruned
    }

    async fn teardown(
        &self,
        kind: DaemonKind,
        connection_id: &str,
        status: &DaemonStatus,
    ) -> Result<DisconnectOutcome> {
        let (outcome, survived) = match status {
            DaemonStatus::NoDaemonRunning => (DisconnectOutcome::NotRunning, None),
            DaemonStatus::DaemonIsRunning { config, .. } => {
                let graceful = self.stop_running(config).await;
                let survived = match graceful {
                    Some(graceful) => {
                        info!(
                            %kind,
                            connection_id,
                            pid = config.local_pid,
                            graceful,
                            "Stopped daemon"
                        );
                        None
                    }
                    None => Some(config.local_pid),
                };
                (
                    DisconnectOutcome::Stopped {
                        graceful: graceful.unwrap_or(false),
                    },
                    survived,
                )
            }
            DaemonStatus::DaemonQuitUnexpectedly { config } => {
                let pid = config.local_pid;
                if self
                    .rt
                    .monitor
                    .is_alive_with_marker(pid, config.process_started_at)
                {
                    warn!(%kind, connection_id, pid, "Daemon is not answering, terminating it");
                    let gone = self
                        .rt
                        .monitor
                        .terminate(pid, self.rt.settings.shutdown_grace)
                        .await;
                    (DisconnectOutcome::Stale { terminated: true }, (!gone).then_some(pid))
                } else {
                    warn!(%kind, connection_id, pid, "Removing stale entry for exited daemon");
                    (DisconnectOutcome::Stale { terminated: false }, None)
                }
            }
        };

        self.rt.registry.remove(kind, connection_id)?;

        match survived {
            Some(pid) => Err(DaemonError::ProcessSurvived {
                kind,
                connection_id: connection_id.to_string(),
                pid,
            }),
            None => Ok(outcome),
        }
    }

    /// Returns `Some(graceful)` once the process is gone, `None` if it
    /// survived even the forced kill.
    async fn stop_running(&self, config: &DaemonConfig) -> Option<bool> {
        let pid = config.local_pid;
        let grace = self.rt.settings.shutdown_grace;

        if self.rt.health.request_shutdown(config).await {
            if wait_for_exit(self.rt.monitor.as_ref(), pid, grace).await {
                return Some(true);
            }
            debug!(pid, "Daemon accepted shutdown but did not exit in {:?}", grace);
        }

        self.rt.monitor.terminate(pid, grace).await.then_some(false)
    }
}

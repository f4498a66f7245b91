use std::collections::BTreeSet;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{DaemonConfig, DaemonKind, DaemonRuntime, DaemonStatus, HealthCheck, LiveDetails};
use crate::error::Result;
use crate::process::ProcessMonitor;

/// One registry entry together with its freshly resolved status.
#[derive(Debug, Clone)]
pub struct ResolvedDaemon {
    pub kind: DaemonKind,
    pub connection_id: String,
    pub status: DaemonStatus,
}

/// Classifies registry entries against the live process table. Read-only:
/// pruning `DaemonQuitUnexpectedly` entries is the caller's decision.
pub struct StatusResolver<M, H> {
    rt: DaemonRuntime<M, H>,
}

impl<M, H> Clone for StatusResolver<M, H> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
        }
    }
}

impl<M: ProcessMonitor + 'static, H: HealthCheck + 'static> StatusResolver<M, H> {
    pub fn new(rt: DaemonRuntime<M, H>) -> Self {
        Self { rt }
    }

    pub async fn resolve(&self, kind: DaemonKind, connection_id: &str) -> Result<DaemonStatus> {
        match self.rt.registry.find(kind, connection_id)? {
            Some(config) => Ok(self.resolve_config(config).await),
            None => Ok(DaemonStatus::NoDaemonRunning),
        }
    }

    /// Status of one recorded daemon: dead PID or failed status probe both
    /// mean it quit unexpectedly.
    pub async fn resolve_config(&self, config: DaemonConfig) -> DaemonStatus {
        let pid = config.local_pid;
        if !self
            .rt
            .monitor
            .is_alive_with_marker(pid, config.process_started_at)
        {
            debug!(kind = %config.kind(), pid, "Daemon process is gone");
            return DaemonStatus::DaemonQuitUnexpectedly { config };
        }

        if !self.rt.health.is_healthy(&config).await {
            debug!(kind = %config.kind(), pid, "Daemon process alive but not answering");
            return DaemonStatus::DaemonQuitUnexpectedly { config };
        }

        let details = LiveDetails::from_config(&config);
        DaemonStatus::DaemonIsRunning { config, details }
    }

    pub async fn resolve_kind(&self, kind: DaemonKind) -> Result<Vec<ResolvedDaemon>> {
        let entries = self.rt.registry.get(kind)?;
        let mut resolved = Vec::with_capacity(entries.len());
        for (connection_id, config) in entries {
            let status = self.resolve_config(config).await;
            resolved.push(ResolvedDaemon {
                kind,
                connection_id,
                status,
            });
        }
        Ok(resolved)
    }

    /// Resolve several kinds concurrently. Output is ordered by kind, then
    /// connection id, regardless of completion order.
    pub async fn resolve_kinds(&self, kinds: &[DaemonKind]) -> Result<Vec<ResolvedDaemon>> {
        let kinds: BTreeSet<DaemonKind> = kinds.iter().copied().collect();
        let mut tasks = JoinSet::new();
        for kind in kinds {
            let resolver = self.clone();
            tasks.spawn(async move { (kind, resolver.resolve_kind(kind).await) });
        }

        let mut per_kind = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((kind, result)) => per_kind.push((kind, result?)),
                Err(e) => warn!(error = %e, "Status resolution task failed"),
            }
        }
        per_kind.sort_by_key(|(kind, _)| *kind);
        Ok(per_kind.into_iter().flat_map(|(_, list)| list).collect())
    }

    /// Local ports of recorded daemons that something is currently listening on.
    pub async fn bound_local_ports(&self) -> Result<BTreeSet<u16>> {
        let mut ports = BTreeSet::new();
        for kind in DaemonKind::ALL {
            for config in self.rt.registry.get(kind)?.values() {
                if self
                    .rt
                    .monitor
                    .is_port_bound(&config.local_host, config.local_port)
                    .await
                {
                    ports.insert(config.local_port);
                }
            }
        }
        Ok(ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{db_daemon, kube_daemon, temp_registry, FakeWorld};

    #[tokio::test]
    async fn unknown_connection_is_not_running() {
        let (_dir, registry) = temp_registry();
        let world = FakeWorld::new();
        let resolver = world.runtime(registry).resolver();

        assert_eq!(
            resolver.resolve(DaemonKind::Db, "nope").await.unwrap(),
            DaemonStatus::NoDaemonRunning
        );
    }

    #[tokio::test]
    async fn registered_and_healthy_is_running() {
        let (_dir, registry) = temp_registry();
        let config = kube_daemon("foo", "c1", 16443, 501);
        registry.put("c-1", config.clone()).unwrap();
        let world = FakeWorld::new();
        world.start(&config);

        let status = world
            .runtime(registry)
            .resolver()
            .resolve(DaemonKind::Kube, "c-1")
            .await
            .unwrap();
        match status {
            DaemonStatus::DaemonIsRunning { details, .. } => {
                assert_eq!(details.local_url, "localhost:16443");
                assert_eq!(details.target, "c1");
                assert_eq!(details.target_user.as_deref(), Some("foo"));
            }
            other => panic!("expected running, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn dead_pid_quit_unexpectedly() {
        let (_dir, registry) = temp_registry();
        let config = db_daemon("orders", 15432, 502);
        registry.put("c-1", config.clone()).unwrap();
        let world = FakeWorld::new();
        world.start(&config);
        world.crash(&config);

        let rt = world.runtime(registry.clone());
        let status = rt.resolver().resolve(DaemonKind::Db, "c-1").await.unwrap();
        assert_eq!(status, DaemonStatus::DaemonQuitUnexpectedly { config });
        // resolution never prunes on its own
        assert!(registry.find(DaemonKind::Db, "c-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn wedged_daemon_quit_unexpectedly() {
        let (_dir, registry) = temp_registry();
        let config = db_daemon("orders", 15432, 503);
        registry.put("c-1", config.clone()).unwrap();
        let world = FakeWorld::new();
        world.start(&config);
        world.wedge(&config);

        let status = world
            .runtime(registry)
            .resolver()
            .resolve(DaemonKind::Db, "c-1")
            .await
            .unwrap();
        assert!(matches!(status, DaemonStatus::DaemonQuitUnexpectedly { .. }));
    }

    #[tokio::test]
    async fn no_daemon_running_iff_no_entry() {
        let (_dir, registry) = temp_registry();
        let running = db_daemon("a", 15000, 601);
        let crashed = db_daemon("b", 15010, 602);
        registry.put("running", running.clone()).unwrap();
        registry.put("crashed", crashed.clone()).unwrap();
        let world = FakeWorld::new();
        world.start(&running);

        let resolver = world.runtime(registry).resolver();
        for id in ["running", "crashed", "missing"] {
            let status = resolver.resolve(DaemonKind::Db, id).await.unwrap();
            assert_eq!(status == DaemonStatus::NoDaemonRunning, id == "missing");
        }
    }

    #[tokio::test]
    async fn resolve_kinds_orders_by_kind_then_connection() {
        let (_dir, registry) = temp_registry();
        registry.put("k-2", kube_daemon("u", "c2", 16002, 702)).unwrap();
        registry.put("k-1", kube_daemon("u", "c1", 16001, 701)).unwrap();
        registry.put("d-1", db_daemon("orders", 15000, 703)).unwrap();
        let world = FakeWorld::new();

        let resolved = world
            .runtime(registry)
            .resolver()
            .resolve_kinds(&[DaemonKind::Kube, DaemonKind::Db])
            .await
            .unwrap();
        let order: Vec<_> = resolved
            .iter()
            .map(|r| (r.kind, r.connection_id.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (DaemonKind::Db, "d-1"),
                (DaemonKind::Kube, "k-1"),
                (DaemonKind::Kube, "k-2")
            ]
        );
    }

    #[tokio::test]
    async fn bound_ports_only_lists_listening_daemons() {
        let (_dir, registry) = temp_registry();
        let up = db_daemon("up", 15000, 801);
        let down = db_daemon("down", 15010, 802);
        registry.put("up", up.clone()).unwrap();
        registry.put("down", down).unwrap();
        let world = FakeWorld::new();
        world.start(&up);

        let ports = world.runtime(registry).resolver().bound_local_ports().await.unwrap();
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![15000]);
    }
}

//! Kubeconfig generation from the registry's kube daemons.
//!
//! Entries zli manages carry the `bzero-` name prefix; anything else in the
//! user's kubeconfig is foreign and left alone.

mod document;
mod entries;

pub use document::{KubeConfigDocument, NamedEntry};
pub use entries::{
    derive_entries, is_managed, managed_name, shared_user_name, KubeConfigEntry,
    KubeSecuritySettings, MANAGED_PREFIX,
};

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::daemon::{DaemonKind, DaemonRuntime, DaemonStatus, DisconnectReport, HealthCheck};
use crate::error::{DaemonError, Result};
use crate::process::ProcessMonitor;
use crate::registry::DaemonMap;

/// Where the generated document goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KubeConfigOutput {
    /// The user's kubeconfig, always merged so foreign entries survive
    InPlace(PathBuf),
    File(PathBuf),
    /// Render only; nothing on disk changes
    Return,
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Merge into the existing document instead of starting fresh
    pub update: bool,
    /// Disconnect every kube daemon, clear the kube registry and rotate the token
    pub force: bool,
    pub output: KubeConfigOutput,
}

#[derive(Debug)]
pub struct GenerateResult {
    pub document: KubeConfigDocument,
    pub yaml: String,
    pub written_to: Option<PathBuf>,
    /// Present only when `force` found daemons to stop
    pub disconnected: Option<DisconnectReport>,
    pub token_rotated: bool,
    /// Stale kube entries dropped while resolving
    pub pruned: usize,
}

pub struct KubeConfigReconciler<M, H> {
    rt: DaemonRuntime<M, H>,
    /// Document merged against when the output is `Return`
    default_path: PathBuf,
}

impl<M: ProcessMonitor + 'static, H: HealthCheck + 'static> KubeConfigReconciler<M, H> {
    pub fn new(rt: DaemonRuntime<M, H>, default_path: impl Into<PathBuf>) -> Self {
        Self {
            rt,
            default_path: default_path.into(),
        }
    }

    /// Build the kubeconfig for the live kube daemons. Rotating the token
    /// mutates `settings`; persisting it is up to the caller.
    pub async fn generate(
        &self,
        settings: &mut KubeSecuritySettings,
        email: &str,
        options: &GenerateOptions,
    ) -> Result<GenerateResult> {
        let mut disconnected = None;
        let mut pruned = 0;

        let entries = if options.force {
            if !self.rt.registry.get(DaemonKind::Kube)?.is_empty() {
                info!("Disconnecting kube daemons before regenerating credentials");
                disconnected = Some(self.rt.disconnector().disconnect_all(DaemonKind::Kube).await?);
            }
            self.rt.registry.clear(DaemonKind::Kube)?;
            settings.rotate_token();
            Vec::new()
        } else {
            let resolved = self.rt.resolver().resolve_kind(DaemonKind::Kube).await?;
            pruned = self.rt.disconnector().prune(&resolved).await;
            let live: DaemonMap = resolved
                .into_iter()
                .filter_map(|r| match r.status {
                    DaemonStatus::DaemonIsRunning { config, .. } => Some((r.connection_id, config)),
                    _ => None,
                })
                .collect();
            derive_entries(&live, settings, email)
        };
        debug!(entries = entries.len(), force = options.force, "Derived kubeconfig entries");

        let (base_path, merge_existing) = match &options.output {
            KubeConfigOutput::InPlace(path) => (path.as_path(), true),
            KubeConfigOutput::File(path) => (path.as_path(), options.update),
            KubeConfigOutput::Return => (self.default_path.as_path(), options.update),
        };
        let mut document = if merge_existing {
            KubeConfigDocument::load(base_path)?
        } else {
            KubeConfigDocument::default()
        };
        document.merge(&entries);
        let yaml = document.to_yaml()?;

        let written_to = match &options.output {
            KubeConfigOutput::InPlace(path) | KubeConfigOutput::File(path) => {
                write_document(path, &yaml)?;
                info!(path = %path.display(), "Wrote kubeconfig");
                Some(path.clone())
            }
            KubeConfigOutput::Return => None,
        };

        Ok(GenerateResult {
            document,
            yaml,
            written_to,
            disconnected,
            token_rotated: options.force,
            pruned,
        })
    }
}

/// Replace `path` with `content` in one rename, creating parent directories.
/// Kubeconfigs hold bearer tokens, so the file is owner-only.
pub fn write_document(path: &Path, content: &str) -> Result<()> {
    crate::fsutil::write_private(path, content.as_bytes()).map_err(|source| {
        DaemonError::ExternalFileWriteFailed {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{kube_daemon, temp_registry, FakeWorld};

    const EMAIL: &str = "alice@example.com";

    fn security() -> KubeSecuritySettings {
        KubeSecuritySettings {
            token: "original".into(),
            ..Default::default()
        }
    }

    fn returned(update: bool, force: bool) -> GenerateOptions {
        GenerateOptions {
            update,
            force,
            output: KubeConfigOutput::Return,
        }
    }

    #[tokio::test]
    async fn two_daemons_yield_two_managed_entries() {
        let (dir, registry) = temp_registry();
        let foo = kube_daemon("foo", "c1", 16001, 1101);
        let bar = kube_daemon("bar", "c2", 16002, 1102);
        registry.put("k-1", foo.clone()).unwrap();
        registry.put("k-2", bar.clone()).unwrap();
        let world = FakeWorld::new();
        world.start(&foo);
        world.start(&bar);

        let reconciler =
            KubeConfigReconciler::new(world.runtime(registry), dir.path().join("kube/config"));
        let mut settings = security();
        let result = reconciler
            .generate(&mut settings, EMAIL, &returned(false, false))
            .await
            .unwrap();

        let doc = &result.document;
        assert_eq!(doc.cluster_names(), vec!["bzero-foo@c1", "bzero-bar@c2"]);
        assert_eq!(doc.context_names(), vec!["bzero-foo@c1", "bzero-bar@c2"]);
        assert_eq!(doc.user_names(), vec!["bzero-alice@example.com"]);
        assert_eq!(doc.current_context.as_deref(), Some("bzero-bar@c2"));
        assert!(result.written_to.is_none());
        assert!(!dir.path().join("kube/config").exists());
        assert_eq!(settings.token, "original");
    }

    #[tokio::test]
    async fn generation_is_idempotent_on_disk() {
        let (dir, registry) = temp_registry();
        let foo = kube_daemon("foo", "c1", 16001, 1103);
        registry.put("k-1", foo.clone()).unwrap();
        let world = FakeWorld::new();
        world.start(&foo);

        let path = dir.path().join("kube/config");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            concat!(
                "apiVersion: v1\nkind: Config\n",
                "clusters:\n- name: mine\n  cluster:\n    server: https://k8s.local\n",
                "contexts: []\nusers: []\n",
            ),
        )
        .unwrap();

        let reconciler = KubeConfigReconciler::new(world.runtime(registry), &path);
        let options = GenerateOptions {
            update: true,
            force: false,
            output: KubeConfigOutput::InPlace(path.clone()),
        };
        let mut settings = security();
        reconciler.generate(&mut settings, EMAIL, &options).await.unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        reconciler.generate(&mut settings, EMAIL, &options).await.unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
        let doc = KubeConfigDocument::parse(&first).unwrap();
        assert_eq!(doc.cluster_names(), vec!["mine", "bzero-foo@c1"]);
    }

    #[tokio::test]
    async fn crashed_daemons_are_pruned_and_left_out() {
        let (dir, registry) = temp_registry();
        let live = kube_daemon("foo", "c1", 16001, 1104);
        registry.put("k-1", live.clone()).unwrap();
        registry.put("k-2", kube_daemon("bar", "c2", 16002, 1105)).unwrap();
        let world = FakeWorld::new();
        world.start(&live);

        let reconciler =
            KubeConfigReconciler::new(world.runtime(registry.clone()), dir.path().join("config"));
        let result = reconciler
            .generate(&mut security(), EMAIL, &returned(false, false))
            .await
            .unwrap();

        assert_eq!(result.pruned, 1);
        assert_eq!(result.document.cluster_names(), vec!["bzero-foo@c1"]);
        let left: Vec<_> = registry.get(DaemonKind::Kube).unwrap().into_keys().collect();
        assert_eq!(left, vec!["k-1"]);
    }

    #[tokio::test]
    async fn force_without_daemons_skips_disconnect() {
        let (dir, registry) = temp_registry();
        let world = FakeWorld::new();
        let reconciler =
            KubeConfigReconciler::new(world.runtime(registry), dir.path().join("config"));

        let mut settings = security();
        let result = reconciler
            .generate(&mut settings, EMAIL, &returned(false, true))
            .await
            .unwrap();

        assert!(result.disconnected.is_none());
        assert!(result.document.clusters.is_empty());
        assert!(result.document.contexts.is_empty());
        assert!(result.document.users.is_empty());
        assert_eq!(result.document.current_context, None);
        assert!(result.token_rotated);
        assert_ne!(settings.token, "original");
        assert!(world.terminated().is_empty());
    }

    #[tokio::test]
    async fn force_disconnects_running_daemons_first() {
        let (dir, registry) = temp_registry();
        let foo = kube_daemon("foo", "c1", 16001, 1106);
        registry.put("k-1", foo.clone()).unwrap();
        let world = FakeWorld::new();
        world.start(&foo);

        let reconciler =
            KubeConfigReconciler::new(world.runtime(registry.clone()), dir.path().join("config"));
        let result = reconciler
            .generate(&mut security(), EMAIL, &returned(false, true))
            .await
            .unwrap();

        let report = result.disconnected.unwrap();
        assert_eq!(report.stopped(), 1);
        assert_eq!(world.terminated(), vec![1106]);
        assert!(registry.get(DaemonKind::Kube).unwrap().is_empty());
        assert!(result.document.clusters.is_empty());
    }

    #[tokio::test]
    async fn in_place_output_keeps_foreign_entries_without_update() {
        let (dir, registry) = temp_registry();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            concat!(
                "apiVersion: v1\nkind: Config\nusers:\n",
                "- name: someone\n  user:\n    token: x\n",
                "- name: bzero-old\n  user:\n    token: y\n",
            ),
        )
        .unwrap();
        let world = FakeWorld::new();
        let reconciler = KubeConfigReconciler::new(world.runtime(registry), &path);

        let options = GenerateOptions {
            update: false,
            force: false,
            output: KubeConfigOutput::InPlace(path.clone()),
        };
        reconciler.generate(&mut security(), EMAIL, &options).await.unwrap();

        let doc = KubeConfigDocument::load(&path).unwrap();
        assert_eq!(doc.user_names(), vec!["someone"]);
    }

    #[test]
    fn write_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/config");
        write_document(&path, "apiVersion: v1\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "apiVersion: v1\n");
        assert!(!dir.path().join("a/b/config.zli-tmp").exists());
    }

    #[test]
    fn write_failure_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();
        let path = blocker.join("config");

        match write_document(&path, "x") {
            Err(DaemonError::ExternalFileWriteFailed { path: failed, .. }) => {
                assert_eq!(failed, path)
            }
            other => panic!("expected write failure, got {:?}", other),
        }
    }
}

//! Persisted daemon registry.
//!
//! One TOML file maps `connection id -> DaemonConfig` per daemon kind. Every
//! mutation is a whole-file read-modify-write under an exclusive advisory
//! lock on a sibling `.lock` file, written to a temp file, synced, then
//! renamed into place, so overlapping CLI invocations never lose a write and a
//! crash right after a launch never loses the record.

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

use crate::daemon::{DaemonConfig, DaemonKind};
use crate::error::{DaemonError, Result};

pub type DaemonMap = BTreeMap<String, DaemonConfig>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    db: DaemonMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    rdp: DaemonMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    sqlserver: DaemonMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    kube: DaemonMap,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    web: DaemonMap,
}

impl RegistryFile {
    fn section(&self, kind: DaemonKind) -> &DaemonMap {
        match kind {
            DaemonKind::Db => &self.db,
            DaemonKind::Rdp => &self.rdp,
            DaemonKind::SqlServer => &self.sqlserver,
            DaemonKind::Kube => &self.kube,
            DaemonKind::Web => &self.web,
        }
    }

    fn section_mut(&mut self, kind: DaemonKind) -> &mut DaemonMap {
        match kind {
            DaemonKind::Db => &mut self.db,
            DaemonKind::Rdp => &mut self.rdp,
            DaemonKind::SqlServer => &mut self.sqlserver,
            DaemonKind::Kube => &mut self.kube,
            DaemonKind::Web => &mut self.web,
        }
    }

    /// Lenient parse: a damaged section or entry is dropped on its own
    /// instead of taking the whole registry down with it.
    fn parse(path: &Path, content: &str) -> Self {
        let table: toml::Table = match toml::from_str(content) {
            Ok(table) => table,
            Err(e) => {
                let err = DaemonError::RegistryCorrupt {
                    path: path.to_path_buf(),
                    detail: e.to_string(),
                };
                warn!(error = %err, "Treating daemon registry as empty");
                return Self::default();
            }
        };

        let mut file = Self::default();
        for kind in DaemonKind::ALL {
            let Some(section) = table.get(kind.as_str()) else {
                continue;
            };
            let Some(entries) = section.as_table() else {
                warn!(kind = %kind, "Registry section is not a table, ignoring it");
                continue;
            };

            for (connection_id, value) in entries {
                match value.clone().try_into::<DaemonConfig>() {
                    Ok(config) if config.kind() == kind => {
                        file.section_mut(kind).insert(connection_id.clone(), config);
                    }
                    Ok(config) => {
                        warn!(
                            connection_id = %connection_id,
                            expected = %kind,
                            found = %config.kind(),
                            "Registry entry filed under the wrong kind, ignoring it"
                        );
                    }
                    Err(e) => {
                        let err = DaemonError::RegistryCorrupt {
                            path: path.to_path_buf(),
                            detail: format!("{}.{}: {}", kind, connection_id, e),
                        };
                        warn!(error = %err, "Ignoring unreadable registry entry");
                    }
                }
            }
        }
        file
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_extension("lock");
        Self { path, lock_path }
    }

    /// Registry in the zli config directory.
    pub fn open_default() -> Self {
        Self::new(crate::clienv::registry_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All daemons of `kind`, ordered by connection id.
    pub fn get(&self, kind: DaemonKind) -> Result<DaemonMap> {
        let file = self.read()?;
        Ok(file.section(kind).clone())
    }

    pub fn find(&self, kind: DaemonKind, connection_id: &str) -> Result<Option<DaemonConfig>> {
        Ok(self.read()?.section(kind).get(connection_id).cloned())
    }

    /// Which kinds hold an entry for `connection_id`.
    pub fn kinds_of(&self, connection_id: &str) -> Result<Vec<DaemonKind>> {
        let file = self.read()?;
        Ok(DaemonKind::ALL
            .into_iter()
            .filter(|kind| file.section(*kind).contains_key(connection_id))
            .collect())
    }

    /// Insert or replace the entry for `connection_id` under the config's own kind.
    pub fn put(&self, connection_id: &str, config: DaemonConfig) -> Result<()> {
        let kind = config.kind();
        self.update(|file| {
            file.section_mut(kind)
                .insert(connection_id.to_string(), config);
        })?;
        debug!(kind = %kind, connection_id, "Registry entry stored");
        Ok(())
    }

    /// Atomic insert-if-absent. Returns false when another invocation
    /// registered the connection first.
    pub fn insert_new(&self, connection_id: &str, config: DaemonConfig) -> Result<bool> {
        let kind = config.kind();
        let inserted = self.update(|file| {
            let section = file.section_mut(kind);
            if section.contains_key(connection_id) {
                return false;
            }
            section.insert(connection_id.to_string(), config);
            true
        })?;
        debug!(kind = %kind, connection_id, inserted, "Registry insert-if-absent");
        Ok(inserted)
    }

    pub fn remove(&self, kind: DaemonKind, connection_id: &str) -> Result<Option<DaemonConfig>> {
        let removed = self.update(|file| file.section_mut(kind).remove(connection_id))?;
        if removed.is_some() {
            debug!(kind = %kind, connection_id, "Registry entry removed");
        }
        Ok(removed)
    }

    /// Drop every entry of `kind`, returning how many there were.
    pub fn clear(&self, kind: DaemonKind) -> Result<usize> {
        let cleared = self.update(|file| std::mem::take(file.section_mut(kind)).len())?;
        debug!(kind = %kind, cleared, "Registry section cleared");
        Ok(cleared)
    }

    fn read(&self) -> Result<RegistryFile> {
        let _lock = self.lock(false)?;
        self.load_unlocked()
    }

    fn update<T>(&self, f: impl FnOnce(&mut RegistryFile) -> T) -> Result<T> {
        let _lock = self.lock(true)?;
        let mut file = self.load_unlocked()?;
        let result = f(&mut file);
        self.store_unlocked(&file)?;
        Ok(result)
    }

    fn load_unlocked(&self) -> Result<RegistryFile> {
        trace!(path = %self.path.display(), "Loading daemon registry");
        match fs::read(&self.path) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(content) => Ok(RegistryFile::parse(&self.path, &content)),
                Err(e) => {
                    let err = DaemonError::RegistryCorrupt {
                        path: self.path.clone(),
                        detail: e.to_string(),
                    };
                    warn!(error = %err, "Treating daemon registry as empty");
                    Ok(RegistryFile::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn store_unlocked(&self, file: &RegistryFile) -> Result<()> {
        let content = toml::to_string_pretty(file)?;
        let tmp_path = self.path.with_extension("toml.tmp");

        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(content.as_bytes())?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)?;
        trace!(path = %self.path.display(), "Daemon registry flushed");
        Ok(())
    }

    fn lock(&self, exclusive: bool) -> Result<RegistryLock> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|source| DaemonError::Lock {
                path: self.lock_path.clone(),
                source,
            })?;

        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|source| DaemonError::Lock {
            path: self.lock_path.clone(),
            source,
        })?;
        Ok(RegistryLock(file))
    }
}

/// Releases the advisory lock when dropped.
struct RegistryLock(File);

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

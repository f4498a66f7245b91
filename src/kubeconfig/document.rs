use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use super::entries::{is_managed, KubeConfigEntry};
use crate::error::Result;

/// A kubeconfig file. Only the named lists and `current-context` are
/// interpreted; everything else round-trips untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubeConfigDocument {
    #[serde(rename = "apiVersion", default = "default_api_version")]
    pub api_version: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub clusters: Vec<NamedEntry>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub contexts: Vec<NamedEntry>,
    #[serde(
        rename = "current-context",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub current_context: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default = "empty_mapping")]
    pub preferences: Value,
    #[serde(default, deserialize_with = "null_as_default")]
    pub users: Vec<NamedEntry>,
    #[serde(flatten)]
    pub extra: Mapping,
}

/// `{ name, <section>: {...} }` list item; the body is kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedEntry {
    pub name: String,
    #[serde(flatten)]
    pub body: Mapping,
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_kind() -> String {
    "Config".to_string()
}

fn empty_mapping() -> Value {
    Value::Mapping(Mapping::new())
}

/// kubectl writes `clusters: null` for empty lists.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Default for KubeConfigDocument {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            clusters: Vec::new(),
            contexts: Vec::new(),
            current_context: None,
            kind: default_kind(),
            preferences: empty_mapping(),
            users: Vec::new(),
            extra: Mapping::new(),
        }
    }
}

impl KubeConfigDocument {
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut document: Self = serde_yaml::from_str(content)?;
        if document.current_context.as_deref() == Some("") {
            document.current_context = None;
        }
        Ok(document)
    }

    /// Existing document at `path`, or an empty one if there is none yet.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No existing kubeconfig");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reconcile the managed entries with `entries`: stale managed entries
    /// are dropped, existing ones overwritten in place, new ones appended.
    /// Foreign entries are never touched.
    pub fn merge(&mut self, entries: &[KubeConfigEntry]) {
        let clusters = entries.iter().map(cluster_entry).collect();
        let contexts = entries.iter().map(context_entry).collect();
        let mut users: Vec<NamedEntry> = Vec::new();
        for entry in entries {
            if !users.iter().any(|u| u.name == entry.user) {
                users.push(user_entry(entry));
            }
        }

        merge_section(&mut self.clusters, clusters);
        let removed_contexts = merge_section(&mut self.contexts, contexts);
        merge_section(&mut self.users, users);

        match entries.last() {
            Some(last) => self.current_context = Some(last.context_name.clone()),
            None => {
                if self
                    .current_context
                    .as_ref()
                    .is_some_and(|current| removed_contexts.contains(current))
                {
                    self.current_context = None;
                }
            }
        }
    }

    pub fn cluster_names(&self) -> Vec<&str> {
        self.clusters.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn context_names(&self) -> Vec<&str> {
        self.contexts.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn user_names(&self) -> Vec<&str> {
        self.users.iter().map(|e| e.name.as_str()).collect()
    }
}

/// Returns the names of managed entries that were removed.
fn merge_section(section: &mut Vec<NamedEntry>, derived: Vec<NamedEntry>) -> Vec<String> {
    let wanted: HashSet<&str> = derived.iter().map(|e| e.name.as_str()).collect();
    let mut removed = Vec::new();
    section.retain(|existing| {
        let keep = !is_managed(&existing.name) || wanted.contains(existing.name.as_str());
        if !keep {
            removed.push(existing.name.clone());
        }
        keep
    });

    for entry in derived {
        match section.iter_mut().find(|e| e.name == entry.name) {
            Some(slot) => *slot = entry,
            None => section.push(entry),
        }
    }
    removed
}

fn named(name: &str, section: &str, body: Mapping) -> NamedEntry {
    let mut wrapper = Mapping::new();
    wrapper.insert(Value::from(section), Value::Mapping(body));
    NamedEntry {
        name: name.to_string(),
        body: wrapper,
    }
}

fn cluster_entry(entry: &KubeConfigEntry) -> NamedEntry {
    let mut cluster = Mapping::new();
    cluster.insert(Value::from("server"), Value::from(entry.server.as_str()));
    if entry.skip_tls_verify {
        cluster.insert(Value::from("insecure-skip-tls-verify"), Value::from(true));
    }
    if let Some(ca) = &entry.certificate_authority {
        cluster.insert(
            Value::from("certificate-authority"),
            Value::from(ca.display().to_string()),
        );
    }
    named(&entry.cluster_name, "cluster", cluster)
}

fn context_entry(entry: &KubeConfigEntry) -> NamedEntry {
    let mut context = Mapping::new();
    context.insert(Value::from("cluster"), Value::from(entry.cluster_name.as_str()));
    context.insert(Value::from("user"), Value::from(entry.user.as_str()));
    if let Some(namespace) = &entry.namespace {
        context.insert(Value::from("namespace"), Value::from(namespace.as_str()));
    }
    named(&entry.context_name, "context", context)
}

fn user_entry(entry: &KubeConfigEntry) -> NamedEntry {
    let mut user = Mapping::new();
    user.insert(Value::from("token"), Value::from(entry.token.as_str()));
    named(&entry.user, "user", user)
}

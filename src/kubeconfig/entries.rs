use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::daemon::TargetDetails;
use crate::registry::DaemonMap;

/// Name prefix marking clusters, contexts and users zli owns.
pub const MANAGED_PREFIX: &str = "bzero-";

/// Security material shared by every kube daemon and written into the
/// generated kubeconfig. Persisted in the `[kube]` section of config.toml.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeSecuritySettings {
    /// Token kubectl presents to the local kube daemons
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    /// Skip verification instead of pinning `cert_path` as the cluster CA
    #[serde(default = "default_skip_tls_verify")]
    pub skip_tls_verify: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_target_groups: Vec<String>,
}

fn default_skip_tls_verify() -> bool {
    true
}

impl Default for KubeSecuritySettings {
    fn default() -> Self {
        Self {
            token: String::new(),
            cert_path: None,
            key_path: None,
            skip_tls_verify: default_skip_tls_verify(),
            default_target_groups: Vec::new(),
        }
    }
}

impl KubeSecuritySettings {
    /// Replace the shared token. Every running kube daemon holds the old one,
    /// so callers must disconnect them first.
    pub fn rotate_token(&mut self) {
        let bytes: [u8; 32] = rand::random();
        self.token = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    }

    /// Generate a token if none exists yet. Returns true when one was created.
    pub fn ensure_token(&mut self) -> bool {
        if self.token.is_empty() {
            self.rotate_token();
            return true;
        }
        false
    }
}

/// One cluster + context pair, plus the shared user it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeConfigEntry {
    pub cluster_name: String,
    pub server: String,
    pub skip_tls_verify: bool,
    pub certificate_authority: Option<PathBuf>,
    pub context_name: String,
    pub user: String,
    pub token: String,
    pub namespace: Option<String>,
}

pub fn managed_name(user: &str, cluster: &str) -> String {
    format!("{}{}@{}", MANAGED_PREFIX, user, cluster)
}

pub fn shared_user_name(email: &str) -> String {
    let email = email.trim();
    if email.is_empty() {
        format!("{}zli", MANAGED_PREFIX)
    } else {
        format!("{}{}", MANAGED_PREFIX, email)
    }
}

pub fn is_managed(name: &str) -> bool {
    name.starts_with(MANAGED_PREFIX)
}

/// Entries for every kube daemon in `daemons`, in connection id order. Two
/// daemons for the same user and cluster collapse into one entry; the later
/// connection wins.
pub fn derive_entries(
    daemons: &DaemonMap,
    settings: &KubeSecuritySettings,
    email: &str,
) -> Vec<KubeConfigEntry> {
    let user = shared_user_name(email);
    let mut entries: Vec<KubeConfigEntry> = Vec::new();

    for config in daemons.values() {
        let TargetDetails::Kube(kube) = &config.target else {
            continue;
        };
        let name = managed_name(&kube.target_user, &kube.target_cluster);
        let entry = KubeConfigEntry {
            cluster_name: name.clone(),
            server: format!("https://{}:{}", config.local_host, config.local_port),
            skip_tls_verify: settings.skip_tls_verify,
            certificate_authority: if settings.skip_tls_verify {
                None
            } else {
                settings.cert_path.clone()
            },
            context_name: name,
            user: user.clone(),
            token: settings.token.clone(),
            namespace: kube.default_namespace.clone(),
        };

        match entries.iter_mut().find(|e| e.context_name == entry.context_name) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{db_daemon, kube_daemon};

    fn settings() -> KubeSecuritySettings {
        KubeSecuritySettings {
            token: "abc".into(),
            skip_tls_verify: true,
            ..Default::default()
        }
    }

    #[test]
    fn entries_follow_connection_order() {
        let mut daemons = DaemonMap::new();
        daemons.insert("k-2".into(), kube_daemon("bar", "c2", 16002, 2));
        daemons.insert("k-1".into(), kube_daemon("foo", "c1", 16001, 1));
        daemons.insert("d-1".into(), db_daemon("orders", 15000, 3));

        let entries = derive_entries(&daemons, &settings(), "alice@example.com");
        let names: Vec<_> = entries.iter().map(|e| e.context_name.as_str()).collect();
        assert_eq!(names, vec!["bzero-foo@c1", "bzero-bar@c2"]);
        assert_eq!(entries[0].server, "https://localhost:16001");
        assert!(entries.iter().all(|e| e.user == "bzero-alice@example.com"));
    }

    #[test]
    fn derivation_is_deterministic() {
        let mut daemons = DaemonMap::new();
        daemons.insert("k-1".into(), kube_daemon("foo", "c1", 16001, 1));
        daemons.insert("k-2".into(), kube_daemon("bar", "c2", 16002, 2));

        let first = derive_entries(&daemons, &settings(), "a@b.c");
        let second = derive_entries(&daemons, &settings(), "a@b.c");
        assert_eq!(first, second);
    }

    #[test]
    fn same_user_and_cluster_collapse() {
        let mut daemons = DaemonMap::new();
        daemons.insert("k-1".into(), kube_daemon("foo", "c1", 16001, 1));
        daemons.insert("k-2".into(), kube_daemon("foo", "c1", 16002, 2));

        let entries = derive_entries(&daemons, &settings(), "a@b.c");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].server, "https://localhost:16002");
    }

    #[test]
    fn pinned_ca_disables_skip_verify() {
        let mut daemons = DaemonMap::new();
        daemons.insert("k-1".into(), kube_daemon("foo", "c1", 16001, 1));
        let settings = KubeSecuritySettings {
            skip_tls_verify: false,
            cert_path: Some("/keys/ca.pem".into()),
            ..settings()
        };

        let entry = &derive_entries(&daemons, &settings, "a@b.c")[0];
        assert!(!entry.skip_tls_verify);
        assert_eq!(entry.certificate_authority, Some(PathBuf::from("/keys/ca.pem")));
    }

    #[test]
    fn rotated_token_is_fresh_hex() {
        let mut settings = KubeSecuritySettings::default();
        assert!(settings.ensure_token());
        let first = settings.token.clone();
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!settings.ensure_token());

        settings.rotate_token();
        assert_ne!(settings.token, first);
    }
}

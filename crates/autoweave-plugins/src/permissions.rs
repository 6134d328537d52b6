//! Fast permission queries derived from a validated manifest.
//!
//! Paths are canonicalised once at construction; every later check is a
//! component-boundary prefix match. The module deny list dominates the allow
//! list. The set is frozen for the life of the plugin instance.

use crate::manifest::{FileMode, PluginManifest};
use serde::Serialize;
use std::collections::HashSet;

/// Immutable permission query surface for one plugin
#[derive(Debug, Clone, Serialize)]
pub struct PermissionSet {
    read_roots: Vec<String>,
    write_roots: Vec<String>,
    allowed_hosts: Vec<String>,
    network_rate_limit: Option<u32>,
    queues: HashSet<String>,
    module_allow: Option<HashSet<String>>,
    module_deny: HashSet<String>,
    heap_budget_bytes: Option<u64>,
    storage_budget_bytes: Option<u64>,
}

impl PermissionSet {
    pub fn from_manifest(manifest: &PluginManifest) -> Self {
        let mut read_roots = Vec::new();
        let mut write_roots = Vec::new();
        for entry in &manifest.permissions.filesystem {
            read_roots.push(entry.path.clone());
            if entry.mode == FileMode::ReadWrite {
                write_roots.push(entry.path.clone());
            }
        }

        let (allowed_hosts, network_rate_limit) = match &manifest.permissions.network {
            Some(network) => (network.allowed_hosts.clone(), Some(network.rate_limit)),
            None => (Vec::new(), None),
        };

        let (module_allow, module_deny) = match &manifest.permissions.modules {
            Some(modules) => {
                let allow = if modules.allow.is_empty() {
                    None
                } else {
                    Some(modules.allow.iter().cloned().collect())
                };
                (allow, modules.deny.iter().cloned().collect())
            }
            None => (None, HashSet::new()),
        };

        let (heap_budget_bytes, storage_budget_bytes) = match &manifest.permissions.memory {
            Some(memory) => (
                Some(memory.max_heap_mb * 1024 * 1024),
                memory.max_storage_mb.map(|mb| mb * 1024 * 1024),
            ),
            None => (None, None),
        };

        Self {
            read_roots,
            write_roots,
            allowed_hosts,
            network_rate_limit,
            queues: manifest.permissions.queues.iter().cloned().collect(),
            module_allow,
            module_deny,
            heap_budget_bytes,
            storage_budget_bytes,
        }
    }

    /// Whether `path` is readable (readwrite roots imply read)
    pub fn may_read_path(&self, path: &str) -> bool {
        let Some(path) = crate::manifest::normalize_root(path) else {
            return false;
        };
        self.read_roots.iter().any(|root| under_root(&path, root))
    }

    /// Whether `path` is writable
    pub fn may_write_path(&self, path: &str) -> bool {
        let Some(path) = crate::manifest::normalize_root(path) else {
            return false;
        };
        self.write_roots.iter().any(|root| under_root(&path, root))
    }

    /// Whether the plugin may open a connection to `host`. `*.domain`
    /// entries match any subdomain.
    pub fn may_connect(&self, host: &str) -> bool {
        self.allowed_hosts.iter().any(|allowed| {
            match allowed.strip_prefix("*.") {
                Some(suffix) => {
                    host.strip_suffix(suffix)
                        .is_some_and(|rest| rest.ends_with('.'))
                        || host == suffix
                }
                None => allowed == host,
            }
        })
    }

    /// Declared outbound request rate limit, when networking is granted
    pub fn network_rate_limit(&self) -> Option<u32> {
        self.network_rate_limit
    }

    pub fn may_publish(&self, queue: &str) -> bool {
        self.queues.contains(queue)
    }

    pub fn may_subscribe(&self, queue: &str) -> bool {
        self.queues.contains(queue)
    }

    /// Deny wins over allow; an absent allow list permits everything not
    /// denied.
    pub fn module_allowed(&self, name: &str) -> bool {
        if self.module_deny.contains(name) {
            return false;
        }
        match &self.module_allow {
            Some(allow) => allow.contains(name),
            None => true,
        }
    }

    pub fn heap_budget_bytes(&self) -> Option<u64> {
        self.heap_budget_bytes
    }

    pub fn storage_budget_bytes(&self) -> Option<u64> {
        self.storage_budget_bytes
    }

    /// True when the manifest declared nothing at all
    pub fn is_empty(&self) -> bool {
        self.read_roots.is_empty()
            && self.allowed_hosts.is_empty()
            && self.queues.is_empty()
            && self.module_allow.is_none()
            && self.module_deny.is_empty()
    }
}

/// Component-boundary prefix check: `/data/x` is under `/data`, `/database`
/// is not.
fn under_root(path: &str, root: &str) -> bool {
    if path == root {
        return true;
    }
    let root = root.trim_end_matches('/');
    path.strip_prefix(root)
        .is_some_and(|rest| rest.starts_with('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::RawManifest;
    use serde_json::json;

    fn permissions(perms: serde_json::Value) -> PermissionSet {
        let raw = RawManifest::from_json(
            &json!({
                "name": "p",
                "version": "1.0.0",
                "entry": "main",
                "permissions": perms
            })
            .to_string(),
        )
        .unwrap();
        PermissionSet::from_manifest(&raw.validate().unwrap())
    }

    #[test]
    fn test_read_only_root() {
        let set = permissions(json!({
            "filesystem": [{"path": "/data", "mode": "read"}]
        }));

        assert!(set.may_read_path("/data/devices.json"));
        assert!(set.may_read_path("/data"));
        assert!(!set.may_write_path("/data/devices.json"));
        assert!(!set.may_read_path("/database"));
        assert!(!set.may_read_path("/etc/passwd"));
    }

    #[test]
    fn test_traversal_cannot_escape() {
        let set = permissions(json!({
            "filesystem": [{"path": "/data", "mode": "readwrite"}]
        }));

        assert!(!set.may_read_path("/data/../etc/passwd"));
        assert!(set.may_read_path("/data/sub/../devices.json"));
        assert!(set.may_write_path("/data/x"));
    }

    #[test]
    fn test_host_matching() {
        let set = permissions(json!({
            "network": {"allowedHosts": ["api.example.com", "*.internal.net"], "rateLimit": 10}
        }));

        assert!(set.may_connect("api.example.com"));
        assert!(!set.may_connect("evil.example.com"));
        assert!(set.may_connect("svc.internal.net"));
        assert!(set.may_connect("a.b.internal.net"));
        assert!(set.may_connect("internal.net"));
        assert!(!set.may_connect("notinternal.net"));
        assert_eq!(set.network_rate_limit(), Some(10));
    }

    #[test]
    fn test_queue_permissions() {
        let set = permissions(json!({"queues": ["plugin-jobs", "llm-batch"]}));
        assert!(set.may_publish("plugin-jobs"));
        assert!(set.may_subscribe("llm-batch"));
        assert!(!set.may_publish("system-maintenance"));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let set = permissions(json!({
            "modules": {"allow": ["usb"], "deny": ["net"]}
        }));
        assert!(set.module_allowed("usb"));
        assert!(!set.module_allowed("net"));
        assert!(!set.module_allowed("fs")); // not on the allow list

        let deny_only = permissions(json!({"modules": {"deny": ["net"]}}));
        assert!(deny_only.module_allowed("usb"));
        assert!(!deny_only.module_allowed("net"));
    }

    #[test]
    fn test_budgets() {
        let set = permissions(json!({
            "memory": {"max_heap_mb": 64, "max_storage_mb": 128}
        }));
        assert_eq!(set.heap_budget_bytes(), Some(64 * 1024 * 1024));
        assert_eq!(set.storage_budget_bytes(), Some(128 * 1024 * 1024));
    }

    #[test]
    fn test_zero_permissions_deny_everything() {
        let set = permissions(json!({}));
        assert!(set.is_empty());
        assert!(!set.may_read_path("/data"));
        assert!(!set.may_write_path("/tmp/x"));
        assert!(!set.may_connect("example.com"));
        assert!(!set.may_publish("plugin-jobs"));
    }
}

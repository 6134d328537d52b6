//! Plugin manifest parsing and validation.
//!
//! Manifests live at `<pluginRoot>/<name>/autoweave.plugin.json`. Parsing is
//! deliberately loose (`RawManifest`); `validate` checks everything at once
//! and produces either a canonical [`PluginManifest`] or a
//! [`ValidationErrors`] listing every violation. No I/O happens here, and
//! canonicalisation is idempotent: validating an already-canonical manifest
//! yields the same manifest.

use autoweave_core::ValidationErrors;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Manifest file name inside each plugin directory
pub const MANIFEST_FILENAME: &str = "autoweave.plugin.json";

/// Optional detached signature next to the manifest
pub const SIGNATURE_FILENAME: &str = "plugin.sig";

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9-]+$").expect("valid regex"));

/// The closed set of recognised permission keys
const PERMISSION_KEYS: &[&str] = &["filesystem", "network", "queues", "memory", "modules"];

/// Manifest exactly as found on disk, before validation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawManifest {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub entry: Option<String>,

    /// Kept as a raw map so unknown keys can be reported
    #[serde(default)]
    pub permissions: Option<serde_json::Map<String, serde_json::Value>>,

    #[serde(default)]
    pub hooks: HooksSection,

    #[serde(default)]
    pub signature: Option<String>,
}

impl RawManifest {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Validate and canonicalise. Reports every violation, in check order:
    /// required fields, name pattern, semver, entry path, permission keys,
    /// filesystem entries, module list disjointness.
    pub fn validate(&self) -> Result<PluginManifest, ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let name = match &self.name {
            Some(name) => {
                if !NAME_RE.is_match(name) {
                    errors.add_with_code("name", "must match ^[a-z0-9-]+$", "name-pattern");
                }
                name.clone()
            }
            None => {
                errors.add_with_code("name", "is required", "required");
                String::new()
            }
        };

        let version = match &self.version {
            Some(version) => match semver::Version::parse(version) {
                Ok(version) => Some(version),
                Err(e) => {
                    errors.add_with_code("version", format!("not a valid semver: {e}"), "semver");
                    None
                }
            },
            None => {
                errors.add_with_code("version", "is required", "required");
                None
            }
        };

        let entry = match &self.entry {
            Some(entry) => match normalize_relative(entry) {
                Some(entry) => entry,
                None => {
                    errors.add_with_code(
                        "entry",
                        "must be a relative path that stays inside the plugin directory",
                        "entry-path",
                    );
                    String::new()
                }
            },
            None => {
                errors.add_with_code("entry", "is required", "required");
                String::new()
            }
        };

        let permissions = match &self.permissions {
            Some(raw) => parse_permissions(raw, &mut errors),
            None => {
                errors.add_with_code("permissions", "is required", "required");
                PermissionsSection::default()
            }
        };

        let manifest = PluginManifest {
            name,
            version: version.unwrap_or_else(|| semver::Version::new(0, 0, 0)),
            entry,
            permissions,
            hooks: self.hooks.clone(),
            signature: self.signature.clone(),
        };

        if errors.is_empty() {
            Ok(manifest)
        } else {
            Err(errors)
        }
    }
}

fn parse_permissions(
    raw: &serde_json::Map<String, serde_json::Value>,
    errors: &mut ValidationErrors,
) -> PermissionsSection {
    let mut section = PermissionsSection::default();

    for key in raw.keys() {
        if !PERMISSION_KEYS.contains(&key.as_str()) {
            errors.add_with_code(
                format!("permissions.{key}"),
                "is not a recognised permission",
                "unknown-permission",
            );
        }
    }

    if let Some(value) = raw.get("filesystem") {
        match serde_json::from_value::<Vec<RawFilesystemEntry>>(value.clone()) {
            Ok(entries) => {
                for (index, entry) in entries.iter().enumerate() {
                    let field = format!("permissions.filesystem[{index}]");
                    let Some(path) = &entry.path else {
                        errors.add_with_code(format!("{field}.path"), "is required", "required");
                        continue;
                    };
                    let Some(mode) = &entry.mode else {
                        errors.add_with_code(format!("{field}.mode"), "is required", "required");
                        continue;
                    };
                    let mode = match mode.as_str() {
                        "read" => FileMode::Read,
                        "readwrite" => FileMode::ReadWrite,
                        other => {
                            errors.add_with_code(
                                format!("{field}.mode"),
                                format!("`{other}` is not one of read, readwrite"),
                                "mode",
                            );
                            continue;
                        }
                    };
                    match normalize_root(path) {
                        Some(path) => section.filesystem.push(FilesystemPermission { path, mode }),
                        None => errors.add_with_code(
                            format!("{field}.path"),
                            "escapes its root after canonicalisation",
                            "fs-path",
                        ),
                    }
                }
            }
            Err(e) => errors.add_with_code(
                "permissions.filesystem",
                format!("must be a list of {{path, mode}} entries: {e}"),
                "shape",
            ),
        }
    }

    if let Some(value) = raw.get("network") {
        match serde_json::from_value::<NetworkPermission>(value.clone()) {
            Ok(network) => section.network = Some(network),
            Err(e) => errors.add_with_code(
                "permissions.network",
                format!("must be {{allowedHosts, rateLimit}}: {e}"),
                "shape",
            ),
        }
    }

    if let Some(value) = raw.get("queues") {
        match serde_json::from_value::<Vec<String>>(value.clone()) {
            Ok(queues) => section.queues = queues,
            Err(e) => errors.add_with_code(
                "permissions.queues",
                format!("must be a list of queue names: {e}"),
                "shape",
            ),
        }
    }

    if let Some(value) = raw.get("memory") {
        match serde_json::from_value::<MemoryPermission>(value.clone()) {
            Ok(memory) => {
                if memory.max_heap_mb == 0 {
                    errors.add_with_code(
                        "permissions.memory.max_heap_mb",
                        "must be a positive integer",
                        "positive",
                    );
                }
                section.memory = Some(memory);
            }
            Err(e) => errors.add_with_code(
                "permissions.memory",
                format!("must be {{max_heap_mb, max_storage_mb}}: {e}"),
                "shape",
            ),
        }
    }

    if let Some(value) = raw.get("modules") {
        match serde_json::from_value::<ModulesPermission>(value.clone()) {
            Ok(modules) => {
                let allow: HashSet<&String> = modules.allow.iter().collect();
                let overlap: Vec<&str> = modules
                    .deny
                    .iter()
                    .filter(|name| allow.contains(name))
                    .map(|s| s.as_str())
                    .collect();
                if !overlap.is_empty() {
                    errors.add_with_code(
                        "permissions.modules",
                        format!("allow and deny lists overlap: {}", overlap.join(", ")),
                        "disjoint",
                    );
                }
                section.modules = Some(modules);
            }
            Err(e) => errors.add_with_code(
                "permissions.modules",
                format!("must be {{allow, deny}}: {e}"),
                "shape",
            ),
        }
    }

    section
}

#[derive(Debug, Clone, Deserialize)]
struct RawFilesystemEntry {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    mode: Option<String>,
}

/// Canonical, validated manifest. Immutable for the life of a plugin
/// instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PluginManifest {
    pub name: String,
    pub version: semver::Version,
    pub entry: String,
    pub permissions: PermissionsSection,
    pub hooks: HooksSection,
    pub signature: Option<String>,
}

impl PluginManifest {
    /// Back to the raw shape; `raw.validate()` on the result reproduces
    /// this manifest exactly.
    pub fn to_raw(&self) -> RawManifest {
        let mut permissions = serde_json::Map::new();
        if !self.permissions.filesystem.is_empty() {
            permissions.insert(
                "filesystem".to_string(),
                serde_json::to_value(&self.permissions.filesystem).expect("serializable"),
            );
        }
        if let Some(network) = &self.permissions.network {
            permissions.insert(
                "network".to_string(),
                serde_json::to_value(network).expect("serializable"),
            );
        }
        if !self.permissions.queues.is_empty() {
            permissions.insert(
                "queues".to_string(),
                serde_json::to_value(&self.permissions.queues).expect("serializable"),
            );
        }
        if let Some(memory) = &self.permissions.memory {
            permissions.insert(
                "memory".to_string(),
                serde_json::to_value(memory).expect("serializable"),
            );
        }
        if let Some(modules) = &self.permissions.modules {
            permissions.insert(
                "modules".to_string(),
                serde_json::to_value(modules).expect("serializable"),
            );
        }

        RawManifest {
            name: Some(self.name.clone()),
            version: Some(self.version.to_string()),
            entry: Some(self.entry.clone()),
            permissions: Some(permissions),
            hooks: self.hooks.clone(),
            signature: self.signature.clone(),
        }
    }
}

/// Validated permission declarations
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PermissionsSection {
    pub filesystem: Vec<FilesystemPermission>,
    pub network: Option<NetworkPermission>,
    pub queues: Vec<String>,
    pub memory: Option<MemoryPermission>,
    pub modules: Option<ModulesPermission>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilesystemPermission {
    pub path: String,
    pub mode: FileMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileMode {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkPermission {
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
}

fn default_rate_limit() -> u32 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryPermission {
    pub max_heap_mb: u64,
    #[serde(default)]
    pub max_storage_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModulesPermission {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Event hook selectors; entries may end in `*` for prefix matches
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HooksSection {
    #[serde(default, rename = "onEvent")]
    pub on_event: Vec<String>,
}

impl HooksSection {
    /// Whether any selector matches an event type like `usb.device.attached`
    pub fn matches(&self, event_type: &str) -> bool {
        self.on_event.iter().any(|selector| {
            match selector.strip_suffix('*') {
                Some(prefix) => event_type.starts_with(prefix),
                None => selector == event_type,
            }
        })
    }
}

/// Lexically normalise a relative path: fold `.` and `..`, reject absolute
/// paths and anything that pops above its root. No filesystem access.
pub fn normalize_relative(path: &str) -> Option<String> {
    if path.is_empty() || path.starts_with('/') || path.starts_with('\\') {
        return None;
    }
    fold_components(path, false)
}

/// Normalise a permission root: absolute paths are allowed, relative ones
/// must not escape.
pub fn normalize_root(path: &str) -> Option<String> {
    if path.is_empty() {
        return None;
    }
    if let Some(rest) = path.strip_prefix('/') {
        let folded = fold_components(rest, true)?;
        return Some(format!("/{folded}"));
    }
    fold_components(path, false)
}

fn fold_components(path: &str, allow_empty: bool) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                parts.pop()?;
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() && !allow_empty {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest_json() -> String {
        json!({
            "name": "usb-scanner",
            "version": "1.2.0",
            "entry": "bin/scanner",
            "permissions": {
                "filesystem": [{"path": "/data", "mode": "read"}],
                "network": {"allowedHosts": ["api.example.com"], "rateLimit": 30},
                "queues": ["plugin-jobs"],
                "memory": {"max_heap_mb": 64, "max_storage_mb": 128},
                "modules": {"allow": ["usb"], "deny": ["net"]}
            },
            "hooks": {"onEvent": ["usb.device.attached", "usb.device.*"]}
        })
        .to_string()
    }

    #[test]
    fn test_valid_manifest() {
        let raw = RawManifest::from_json(&manifest_json()).unwrap();
        let manifest = raw.validate().unwrap();

        assert_eq!(manifest.name, "usb-scanner");
        assert_eq!(manifest.version.to_string(), "1.2.0");
        assert_eq!(manifest.entry, "bin/scanner");
        assert_eq!(manifest.permissions.filesystem.len(), 1);
        assert_eq!(manifest.permissions.queues, vec!["plugin-jobs"]);
        assert!(manifest.hooks.matches("usb.device.attached"));
        assert!(manifest.hooks.matches("usb.device.detached"));
        assert!(!manifest.hooks.matches("job.completed"));
    }

    #[test]
    fn test_missing_fields_all_reported() {
        let raw = RawManifest::from_json("{}").unwrap();
        let errors = raw.validate().unwrap_err();

        let fields: Vec<&str> = errors.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"name"));
        assert!(fields.contains(&"version"));
        assert!(fields.contains(&"entry"));
        assert!(fields.contains(&"permissions"));
    }

    #[test]
    fn test_name_pattern() {
        for bad in ["UsbScanner", "usb_scanner", "usb scanner", "usb/scanner"] {
            let raw = RawManifest {
                name: Some(bad.to_string()),
                version: Some("1.0.0".to_string()),
                entry: Some("main".to_string()),
                permissions: Some(serde_json::Map::new()),
                ..Default::default()
            };
            let errors = raw.validate().unwrap_err();
            assert!(
                errors.errors.iter().any(|e| e.field == "name"),
                "{bad} should fail the name check"
            );
        }
    }

    #[test]
    fn test_bad_semver() {
        let raw = RawManifest {
            name: Some("usb-scanner".to_string()),
            version: Some("1.2".to_string()),
            entry: Some("main".to_string()),
            permissions: Some(serde_json::Map::new()),
            ..Default::default()
        };
        let errors = raw.validate().unwrap_err();
        assert!(errors.errors.iter().any(|e| e.field == "version"));
    }

    #[test]
    fn test_escaping_entry_rejected() {
        for bad in ["../../etc/passwd", "/abs/path", "a/../../b", ""] {
            let raw = RawManifest {
                name: Some("usb-scanner".to_string()),
                version: Some("1.0.0".to_string()),
                entry: Some(bad.to_string()),
                permissions: Some(serde_json::Map::new()),
                ..Default::default()
            };
            let errors = raw.validate().unwrap_err();
            assert!(
                errors.errors.iter().any(|e| e.field == "entry"),
                "{bad} should fail the entry check"
            );
        }
    }

    #[test]
    fn test_entry_normalisation_folds_dots() {
        let raw = RawManifest {
            name: Some("usb-scanner".to_string()),
            version: Some("1.0.0".to_string()),
            entry: Some("./bin/../bin/scanner".to_string()),
            permissions: Some(serde_json::Map::new()),
            ..Default::default()
        };
        let manifest = raw.validate().unwrap();
        assert_eq!(manifest.entry, "bin/scanner");
    }

    #[test]
    fn test_unknown_permission_key() {
        let raw = RawManifest::from_json(
            &json!({
                "name": "p",
                "version": "1.0.0",
                "entry": "main",
                "permissions": {"clipboard": true}
            })
            .to_string(),
        )
        .unwrap();
        let errors = raw.validate().unwrap_err();
        assert!(errors
            .errors
            .iter()
            .any(|e| e.field == "permissions.clipboard"));
    }

    #[test]
    fn test_filesystem_entry_checks() {
        let raw = RawManifest::from_json(
            &json!({
                "name": "p",
                "version": "1.0.0",
                "entry": "main",
                "permissions": {
                    "filesystem": [
                        {"path": "/data"},
                        {"mode": "read"},
                        {"path": "/data", "mode": "append"},
                        {"path": "/data/../..", "mode": "read"}
                    ]
                }
            })
            .to_string(),
        )
        .unwrap();
        let errors = raw.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_modules_disjoint() {
        let raw = RawManifest::from_json(
            &json!({
                "name": "p",
                "version": "1.0.0",
                "entry": "main",
                "permissions": {"modules": {"allow": ["usb", "hid"], "deny": ["hid"]}}
            })
            .to_string(),
        )
        .unwrap();
        let errors = raw.validate().unwrap_err();
        assert!(errors
            .errors
            .iter()
            .any(|e| e.field == "permissions.modules"));
    }

    #[test]
    fn test_canonicalisation_idempotent() {
        let raw = RawManifest::from_json(&manifest_json()).unwrap();
        let canonical = raw.validate().unwrap();
        let revalidated = canonical.to_raw().validate().unwrap();
        assert_eq!(canonical, revalidated);
    }

    #[test]
    fn test_normalize_root() {
        assert_eq!(normalize_root("/data//logs/./x"), Some("/data/logs/x".to_string()));
        assert_eq!(normalize_root("/data/.."), Some("/".to_string()));
        assert_eq!(normalize_root("/data/../.."), None);
        assert_eq!(normalize_root("relative/dir"), Some("relative/dir".to_string()));
        assert_eq!(normalize_root("relative/../.."), None);
    }
}

//! Plugin discovery and hot-reload watching.
//!
//! Scans the plugin root for `<name>/autoweave.plugin.json`, validates each
//! manifest, and checksums the entry artifact for change detection. An
//! optional `notify` watcher surfaces filesystem changes as discovery
//! events; the host decides what to do with a changed plugin.

use crate::manifest::{PluginManifest, RawManifest, MANIFEST_FILENAME, SIGNATURE_FILENAME};
use autoweave_core::{Error, Result};
use notify::{RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Discovery configuration
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Root directory containing one subdirectory per plugin
    pub root: PathBuf,

    /// Manifest file name inside each plugin directory
    pub manifest_filename: String,

    /// Scan depth below the root
    pub max_depth: usize,
}

impl DiscoveryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest_filename: MANIFEST_FILENAME.to_string(),
            max_depth: 2,
        }
    }
}

/// A plugin found on disk with a valid manifest
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    pub manifest: PluginManifest,
    /// Plugin directory
    pub path: PathBuf,
    pub manifest_path: PathBuf,
    /// Absolute path to the entry artifact
    pub entry_path: PathBuf,
    /// Signature blob contents when `plugin.sig` is present
    pub signature_blob: Option<String>,
    /// blake3 of the entry artifact
    pub checksum: String,
    pub discovered_at: chrono::DateTime<chrono::Utc>,
}

/// Filesystem changes surfaced to the host
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Discovered(DiscoveredPlugin),
    /// Files under a known plugin directory changed
    Changed(String, PathBuf),
    Removed(String, PathBuf),
    Error(String, String),
}

/// Plugin discovery service
pub struct PluginDiscovery {
    config: DiscoveryConfig,
    plugins: Arc<RwLock<HashMap<String, DiscoveredPlugin>>>,
    watcher: Option<notify::RecommendedWatcher>,
}

impl PluginDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            plugins: Arc::new(RwLock::new(HashMap::new())),
            watcher: None,
        }
    }

    /// Scan the root, replacing the known-plugin set. Invalid manifests are
    /// logged and skipped; a broken plugin never aborts the scan.
    pub fn scan(&self) -> Result<Vec<DiscoveredPlugin>> {
        if !self.config.root.exists() {
            return Err(Error::configuration(format!(
                "plugin root {} does not exist",
                self.config.root.display()
            )));
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(&self.config.root)
            .min_depth(2)
            .max_depth(self.config.max_depth)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file()
                && entry.file_name().to_string_lossy() == self.config.manifest_filename
            {
                match Self::load_from_manifest(entry.path()) {
                    Ok(plugin) => {
                        debug!(
                            plugin_id = %plugin.manifest.name,
                            path = %plugin.path.display(),
                            "Discovered plugin"
                        );
                        found.push(plugin);
                    }
                    Err(e) => {
                        warn!(
                            manifest = %entry.path().display(),
                            error = %e,
                            "Skipping plugin with invalid manifest"
                        );
                    }
                }
            }
        }

        let mut plugins = self.plugins.write();
        plugins.clear();
        for plugin in &found {
            plugins.insert(plugin.manifest.name.clone(), plugin.clone());
        }
        Ok(found)
    }

    /// Load and validate a single plugin directory
    pub fn load_plugin_dir(dir: &Path) -> Result<DiscoveredPlugin> {
        Self::load_from_manifest(&dir.join(MANIFEST_FILENAME))
    }

    fn load_from_manifest(manifest_path: &Path) -> Result<DiscoveredPlugin> {
        let dir = manifest_path
            .parent()
            .ok_or_else(|| Error::configuration("manifest has no parent directory"))?
            .to_path_buf();

        let json = std::fs::read_to_string(manifest_path).map_err(|e| {
            Error::storage_with_source(
                format!("failed to read {}", manifest_path.display()),
                e,
            )
        })?;

        let raw = RawManifest::from_json(&json)
            .map_err(|e| Error::serialization(format!("manifest is not valid JSON: {e}")))?;

        let manifest = raw.validate().map_err(|errors| Error::ManifestInvalid {
            plugin_id: dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            errors,
        })?;

        let dir_name = dir.file_name().map(|n| n.to_string_lossy().into_owned());
        if dir_name.as_deref() != Some(manifest.name.as_str()) {
            return Err(Error::plugin(
                &manifest.name,
                "plugin directory name must match the manifest name",
            ));
        }

        let entry_path = dir.join(&manifest.entry);
        let artifact = std::fs::read(&entry_path).map_err(|e| {
            Error::storage_with_source(
                format!("failed to read entry artifact {}", entry_path.display()),
                e,
            )
        })?;
        let checksum = blake3::hash(&artifact).to_hex().to_string();

        let signature_path = dir.join(SIGNATURE_FILENAME);
        let signature_blob = match std::fs::read_to_string(&signature_path) {
            Ok(blob) => Some(blob),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(Error::storage_with_source(
                    format!("failed to read {}", signature_path.display()),
                    e,
                ))
            }
        };

        Ok(DiscoveredPlugin {
            manifest,
            path: dir,
            manifest_path: manifest_path.to_path_buf(),
            entry_path,
            signature_blob,
            checksum,
            discovered_at: chrono::Utc::now(),
        })
    }

    /// Start watching the root; changes arrive on the returned receiver.
    pub fn watch(&mut self) -> Result<mpsc::Receiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::channel(64);
        let root = self.config.root.clone();
        let plugins = self.plugins.clone();

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<notify::Event, notify::Error>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        let _ = tx.try_send(DiscoveryEvent::Error(
                            "watcher".to_string(),
                            e.to_string(),
                        ));
                        return;
                    }
                };

                for path in event.paths {
                    let Some(plugin_id) = plugin_id_for_path(&root, &path) else {
                        continue;
                    };
                    let known = plugins.read().contains_key(&plugin_id);
                    let discovery_event = match event.kind {
                        notify::EventKind::Remove(_) if known => {
                            DiscoveryEvent::Removed(plugin_id, path)
                        }
                        notify::EventKind::Create(_) | notify::EventKind::Modify(_) => {
                            DiscoveryEvent::Changed(plugin_id, path)
                        }
                        _ => continue,
                    };
                    if tx.try_send(discovery_event).is_err() {
                        // Receiver lagging or gone; the next scan reconciles.
                        break;
                    }
                }
            },
        )
        .map_err(|e| Error::internal(format!("failed to create watcher: {e}")))?;

        watcher
            .watch(&self.config.root, RecursiveMode::Recursive)
            .map_err(|e| Error::internal(format!("failed to watch plugin root: {e}")))?;

        self.watcher = Some(watcher);
        Ok(rx)
    }

    /// Stop the watcher if one is running
    pub fn unwatch(&mut self) {
        self.watcher = None;
    }

    pub fn get(&self, plugin_id: &str) -> Option<DiscoveredPlugin> {
        self.plugins.read().get(plugin_id).cloned()
    }

    pub fn list(&self) -> Vec<DiscoveredPlugin> {
        self.plugins.read().values().cloned().collect()
    }
}

/// First path component under the root, i.e. the plugin directory name
fn plugin_id_for_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    relative
        .components()
        .next()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_plugin(root: &Path, name: &str, entry_body: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = json!({
            "name": name,
            "version": "1.0.0",
            "entry": "main",
            "permissions": {"queues": ["plugin-jobs"]}
        });
        std::fs::write(dir.join(MANIFEST_FILENAME), manifest.to_string()).unwrap();
        std::fs::write(dir.join("main"), entry_body).unwrap();
    }

    #[test]
    fn test_scan_finds_valid_plugins() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(root.path(), "usb-scanner", "bin-a");
        write_plugin(root.path(), "led-blinker", "bin-b");

        let discovery = PluginDiscovery::new(DiscoveryConfig::new(root.path()));
        let mut found = discovery.scan().unwrap();
        found.sort_by(|a, b| a.manifest.name.cmp(&b.manifest.name));

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].manifest.name, "led-blinker");
        assert_eq!(found[1].manifest.name, "usb-scanner");
        assert_ne!(found[0].checksum, found[1].checksum);
        assert!(discovery.get("usb-scanner").is_some());
    }

    #[test]
    fn test_invalid_manifest_skipped() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(root.path(), "good-plugin", "bin");

        let bad = root.path().join("BadName");
        std::fs::create_dir_all(&bad).unwrap();
        std::fs::write(bad.join(MANIFEST_FILENAME), "{\"name\": \"BadName\"}").unwrap();

        let discovery = PluginDiscovery::new(DiscoveryConfig::new(root.path()));
        let found = discovery.scan().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].manifest.name, "good-plugin");
    }

    #[test]
    fn test_directory_name_must_match() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("wrong-dir");
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = json!({
            "name": "usb-scanner",
            "version": "1.0.0",
            "entry": "main",
            "permissions": {}
        });
        std::fs::write(dir.join(MANIFEST_FILENAME), manifest.to_string()).unwrap();
        std::fs::write(dir.join("main"), "bin").unwrap();

        let err = PluginDiscovery::load_plugin_dir(&dir).unwrap_err();
        assert_eq!(err.kind(), "plugin-error");
    }

    #[test]
    fn test_missing_entry_artifact() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("no-entry");
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = json!({
            "name": "no-entry",
            "version": "1.0.0",
            "entry": "missing",
            "permissions": {}
        });
        std::fs::write(dir.join(MANIFEST_FILENAME), manifest.to_string()).unwrap();

        let err = PluginDiscovery::load_plugin_dir(&dir).unwrap_err();
        assert_eq!(err.kind(), "storage-error");
    }

    #[test]
    fn test_signature_blob_read() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(root.path(), "signed-plugin", "bin");
        std::fs::write(
            root.path().join("signed-plugin").join(SIGNATURE_FILENAME),
            "c2lnbmF0dXJl",
        )
        .unwrap();

        let plugin =
            PluginDiscovery::load_plugin_dir(&root.path().join("signed-plugin")).unwrap();
        assert_eq!(plugin.signature_blob.as_deref(), Some("c2lnbmF0dXJl"));
    }

    #[test]
    fn test_missing_root_errors() {
        let discovery =
            PluginDiscovery::new(DiscoveryConfig::new("/definitely/not/a/real/path"));
        assert!(discovery.scan().is_err());
    }
}

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use crate::domain::{CloudProvider, Health, Plugin, PluginCapabilities, Result};

/// File each plugin directory must contain.
pub const MANIFEST_FILE: &str = "plugin.json";

#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
    version: String,

    #[serde(default)]
    description: String,

    grpc_address: String,

    #[serde(default)]
    capabilities: ManifestCapabilities,

    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestCapabilities {
    #[serde(default)]
    supports_projected: bool,

    #[serde(default)]
    supports_actual: bool,

    #[serde(default)]
    providers: Vec<CloudProvider>,

    #[serde(default)]
    resource_types: Vec<String>,
}

/// Parse one plugin directory's manifest into a validated [`Plugin`].
pub fn load_plugin(dir: &Path) -> Result<Plugin> {
    let path = dir.join(MANIFEST_FILE);
    let contents = std::fs::read_to_string(&path)?;
    let manifest: Manifest = serde_json::from_str(&contents)?;
    let plugin = Plugin {
        name: manifest.name,
        version: manifest.version,
        description: manifest.description,
        grpc_address: manifest.grpc_address,
        capabilities: PluginCapabilities {
            supports_projected: manifest.capabilities.supports_projected,
            supports_actual: manifest.capabilities.supports_actual,
            providers: manifest.capabilities.providers,
            resource_types: manifest.capabilities.resource_types,
        },
        metadata: manifest.metadata,
        health: Health::default(),
    };
    plugin.validate()?;
    Ok(plugin)
}

/// Scan the plugin directory. Subdirectories without a readable, valid
/// manifest are skipped with a warning; a missing directory is treated the
/// same as an empty one.
pub fn scan_directory(dir: &Path) -> Vec<Plugin> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "plugin directory unreadable");
            return Vec::new();
        }
    };

    let mut plugins = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if !path.join(MANIFEST_FILE).is_file() {
            continue;
        }
        match load_plugin(&path) {
            Ok(plugin) => plugins.push(plugin),
            Err(e) => {
                warn!(dir = %path.display(), error = %e, "skipping malformed plugin manifest");
            }
        }
    }
    plugins.sort_by(|a, b| a.name.cmp(&b.name));
    plugins
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_manifest(dir: &Path, name: &str, body: &str) {
        let plugin_dir = dir.join(name);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        let mut file = std::fs::File::create(plugin_dir.join(MANIFEST_FILE)).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn test_scan_skips_malformed_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "good",
            r#"{
              "name": "aws-billing",
              "version": "0.3.0",
              "grpc_address": "127.0.0.1:50051",
              "capabilities": {"supports_actual": true, "providers": ["aws"]}
            }"#,
        );
        write_manifest(dir.path(), "broken", "{ not json");
        write_manifest(
            dir.path(),
            "no-caps",
            r#"{"name":"x","version":"1.0.0","grpc_address":"127.0.0.1:1"}"#,
        );

        let plugins = scan_directory(dir.path());
        assert_eq!(plugins.len(), 1);
        assert_eq!(plugins[0].name, "aws-billing");
    }

    #[test]
    fn test_empty_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(scan_directory(dir.path()).is_empty());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        assert!(scan_directory(Path::new("/nonexistent/plugins")).is_empty());
    }
}

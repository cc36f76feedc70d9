//! Plugin discovery and manifest loading.
//!
//! Each plugin lives in its own directory under the plugins root with a
//! `plugin.yaml` manifest. The entrypoint is an executable relative to
//! that directory, launched with no arguments.

use ductile_protocol::{Command, PROTOCOL_VERSION};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "plugin.yaml";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("plugin `{name}` declares protocol {got}, this orchestrator speaks {expected}")]
    ProtocolMismatch { name: String, got: u32, expected: u32 },

    #[error("duplicate plugin name `{0}`")]
    DuplicateName(String),

    #[error("plugin `{name}` entrypoint escapes its directory: {entrypoint}")]
    EntrypointEscapes { name: String, entrypoint: String },

    #[error("plugin `{0}` declares no commands")]
    NoCommands(String),
}

/// Parsed `plugin.yaml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub protocol: u32,
    pub entrypoint: String,
    pub commands: Vec<Command>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// A discovered plugin: manifest plus its directory.
#[derive(Debug, Clone)]
pub struct PluginHandle {
    pub manifest: PluginManifest,
    pub dir: PathBuf,
}

impl PluginHandle {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Absolute path of the executable to spawn.
    pub fn entrypoint_path(&self) -> PathBuf {
        self.dir.join(&self.manifest.entrypoint)
    }

    pub fn supports(&self, command: Command) -> bool {
        self.manifest.commands.contains(&command)
    }

    /// Invocation timeout: the manifest's, or the orchestrator default.
    pub fn timeout(&self, default: Duration) -> Duration {
        self.manifest
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// All discovered plugins, by name.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, PluginHandle>,
}

impl PluginRegistry {
    /// Scan `plugins_dir` for `<dir>/plugin.yaml` manifests.
    ///
    /// A missing plugins root yields an empty registry - an orchestrator
    /// with no plugins is idle, not broken.
    pub fn load(plugins_dir: &Path) -> Result<Self, RegistryError> {
        let mut registry = Self::default();

        let entries = match std::fs::read_dir(plugins_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No plugins directory at {}", plugins_dir.display());
                return Ok(registry);
            }
            Err(source) => {
                return Err(RegistryError::Io {
                    path: plugins_dir.to_path_buf(),
                    source,
                })
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let manifest_path = dir.join(MANIFEST_FILE);
            if !manifest_path.is_file() {
                continue;
            }
            let handle = load_manifest(&manifest_path, &dir)?;
            info!(
                "Discovered plugin {} v{} ({})",
                handle.manifest.name,
                handle.manifest.version,
                handle.entrypoint_path().display()
            );
            if registry.plugins.contains_key(handle.name()) {
                return Err(RegistryError::DuplicateName(handle.manifest.name));
            }
            registry.plugins.insert(handle.manifest.name.clone(), handle);
        }

        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&PluginHandle> {
        self.plugins.get(name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Register a handle directly (test fixtures).
    pub fn insert(&mut self, handle: PluginHandle) {
        self.plugins.insert(handle.manifest.name.clone(), handle);
    }
}

fn load_manifest(manifest_path: &Path, dir: &Path) -> Result<PluginHandle, RegistryError> {
    let raw = std::fs::read_to_string(manifest_path).map_err(|source| RegistryError::Io {
        path: manifest_path.to_path_buf(),
        source,
    })?;
    let manifest: PluginManifest =
        serde_yaml::from_str(&raw).map_err(|source| RegistryError::Parse {
            path: manifest_path.to_path_buf(),
            source,
        })?;

    if manifest.protocol != PROTOCOL_VERSION {
        return Err(RegistryError::ProtocolMismatch {
            name: manifest.name,
            got: manifest.protocol,
            expected: PROTOCOL_VERSION,
        });
    }
    if manifest.commands.is_empty() {
        return Err(RegistryError::NoCommands(manifest.name));
    }
    let entrypoint = Path::new(&manifest.entrypoint);
    if entrypoint.is_absolute()
        || entrypoint
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(RegistryError::EntrypointEscapes {
            entrypoint: manifest.entrypoint.clone(),
            name: manifest.name,
        });
    }

    Ok(PluginHandle {
        manifest,
        dir: dir.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_plugin(root: &Path, dir_name: &str, manifest: &str) {
        let dir = root.join(dir_name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
    }

    #[test]
    fn loads_valid_manifests() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "trigger",
            "name: trigger\nversion: 0.1.0\nprotocol: 1\nentrypoint: run.sh\ncommands: [poll, handle]\ntimeout_secs: 5\n",
        );

        let registry = PluginRegistry::load(root.path()).unwrap();
        assert_eq!(registry.len(), 1);
        let handle = registry.get("trigger").unwrap();
        assert!(handle.supports(Command::Poll));
        assert!(!handle.supports(Command::Init));
        assert_eq!(handle.timeout(Duration::from_secs(60)), Duration::from_secs(5));
        assert!(handle.entrypoint_path().ends_with("trigger/run.sh"));
    }

    #[test]
    fn missing_root_is_empty_not_an_error() {
        let root = tempfile::tempdir().unwrap();
        let registry = PluginRegistry::load(&root.path().join("nope")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn rejects_wrong_protocol() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "old",
            "name: old\nversion: 0.1.0\nprotocol: 2\nentrypoint: run.sh\ncommands: [poll]\n",
        );
        assert!(matches!(
            PluginRegistry::load(root.path()),
            Err(RegistryError::ProtocolMismatch { got: 2, .. })
        ));
    }

    #[test]
    fn rejects_escaping_entrypoint() {
        let root = tempfile::tempdir().unwrap();
        write_plugin(
            root.path(),
            "sneaky",
            "name: sneaky\nversion: 0.1.0\nprotocol: 1\nentrypoint: ../../bin/sh\ncommands: [poll]\n",
        );
        assert!(matches!(
            PluginRegistry::load(root.path()),
            Err(RegistryError::EntrypointEscapes { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let root = tempfile::tempdir().unwrap();
        let manifest =
            "name: same\nversion: 0.1.0\nprotocol: 1\nentrypoint: run.sh\ncommands: [poll]\n";
        write_plugin(root.path(), "a", manifest);
        write_plugin(root.path(), "b", manifest);
        assert!(matches!(
            PluginRegistry::load(root.path()),
            Err(RegistryError::DuplicateName(_))
        ));
    }
}

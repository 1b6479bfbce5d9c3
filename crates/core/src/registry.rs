use log::*;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet, btree_map::Entry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::config::ExtensionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Configuration name must not be empty")]
  EmptyName,
  #[error("Configuration '{0}' already registered")]
  DuplicateName(String),
  #[error("Configuration '{name}' contains an empty extension path")]
  EmptyPath { name: String },
  #[error("Configuration '{name}' lists extension '{}' more than once", path.display())]
  DuplicatePath { name: String, path: PathBuf },
  #[error("IO: {0}")]
  Io(#[from] std::io::Error),
  #[error("Json: {0}")]
  Json(#[from] serde_json::Error),
}

/// Named extension configurations.
///
/// Owned by the caller and handed to [`crate::ConnectionFactory`]. Registrations are expected to
/// happen up front, before connections are opened, but the registry is internally synchronized
/// so late registrations are safe as well. Registered configurations are immutable.
#[derive(Debug, Default)]
pub struct Registry {
  configs: RwLock<BTreeMap<String, Arc<ExtensionConfig>>>,
}

impl Registry {
  pub fn new() -> Self {
    return Self::default();
  }

  /// Parses a JSON object mapping configuration names to configurations, e.g.:
  ///
  /// ```json
  /// {
  ///   "with_ext": ["./ext_version"],
  ///   "vector": { "search_dir": "/opt/sqlite", "extensions": ["vector", "js"] }
  /// }
  /// ```
  pub fn from_json(json: &str) -> Result<Self, ConfigError> {
    let configs: BTreeMap<String, ExtensionConfig> = serde_json::from_str(json)?;

    let registry = Self::new();
    for (name, config) in configs {
      registry.register(name, config)?;
    }
    return Ok(registry);
  }

  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    return Self::from_json(&contents);
  }

  /// Registers `config` under `name`.
  ///
  /// Relative extension paths are resolved against the configuration's `search_dir`, if set.
  /// Re-registering an existing name is rejected and leaves the existing configuration untouched.
  pub fn register(
    &self,
    name: impl Into<String>,
    config: ExtensionConfig,
  ) -> Result<(), ConfigError> {
    let name: String = name.into();
    if name.is_empty() {
      return Err(ConfigError::EmptyName);
    }

    return match self.configs.write().entry(name) {
      Entry::Occupied(entry) => Err(ConfigError::DuplicateName(entry.key().clone())),
      Entry::Vacant(entry) => {
        let config = resolve(entry.key(), config)?;
        debug!(
          "Registered extension config '{}': {:?}",
          entry.key(),
          config.paths().collect::<Vec<_>>()
        );
        entry.insert(Arc::new(config));
        Ok(())
      }
    };
  }

  pub fn register_paths<P: Into<PathBuf>>(
    &self,
    name: impl Into<String>,
    paths: impl IntoIterator<Item = P>,
  ) -> Result<(), ConfigError> {
    return self.register(
      name,
      ExtensionConfig::new(paths.into_iter().map(Into::<PathBuf>::into)),
    );
  }

  pub fn get(&self, name: &str) -> Option<Arc<ExtensionConfig>> {
    return self.configs.read().get(name).cloned();
  }

  pub fn contains(&self, name: &str) -> bool {
    return self.configs.read().contains_key(name);
  }

  pub fn names(&self) -> Vec<String> {
    return self.configs.read().keys().cloned().collect();
  }

  pub fn len(&self) -> usize {
    return self.configs.read().len();
  }

  pub fn is_empty(&self) -> bool {
    return self.configs.read().is_empty();
  }

  /// Copy of all registered configurations, e.g. for serialization.
  pub fn snapshot(&self) -> BTreeMap<String, ExtensionConfig> {
    return self
      .configs
      .read()
      .iter()
      .map(|(name, config)| (name.clone(), (**config).clone()))
      .collect();
  }
}

fn resolve(name: &str, mut config: ExtensionConfig) -> Result<ExtensionConfig, ConfigError> {
  let mut seen = HashSet::<PathBuf>::with_capacity(config.extensions.len());

  for extension in &mut config.extensions {
    if extension.path.as_os_str().is_empty() {
      return Err(ConfigError::EmptyPath {
        name: name.to_string(),
      });
    }

    if let Some(ref dir) = config.search_dir
      && extension.path.is_relative()
    {
      extension.path = dir.join(&extension.path);
    }

    if !seen.insert(extension.path.clone()) {
      return Err(ConfigError::DuplicatePath {
        name: name.to_string(),
        path: extension.path.clone(),
      });
    }
  }

  return Ok(config);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Extension;

  #[test]
  fn test_register_and_get() {
    let registry = Registry::new();
    assert!(registry.is_empty());

    registry
      .register_paths("with_ext", ["./ext_version"])
      .unwrap();
    registry
      .register("plain", ExtensionConfig::default())
      .unwrap();

    assert_eq!(registry.len(), 2);
    assert!(registry.contains("with_ext"));
    assert_eq!(registry.names(), vec!["plain".to_string(), "with_ext".to_string()]);

    let config = registry.get("with_ext").unwrap();
    assert_eq!(
      config.paths().collect::<Vec<_>>(),
      vec![Path::new("./ext_version")]
    );
    assert!(registry.get("plain").unwrap().is_empty());
    assert!(registry.get("missing").is_none());
  }

  #[test]
  fn test_duplicate_name_keeps_first() {
    let registry = Registry::new();
    registry.register_paths("dup", ["./first"]).unwrap();

    let err = registry.register_paths("dup", ["./second"]).unwrap_err();
    assert!(matches!(err, ConfigError::DuplicateName(ref name) if name == "dup"));

    let config = registry.get("dup").unwrap();
    assert_eq!(*config, ExtensionConfig::new(["./first"]));
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn test_duplicate_name_wins_over_invalid_paths() {
    let registry = Registry::new();
    registry.register_paths("dup", ["./first"]).unwrap();

    assert!(matches!(
      registry.register_paths("dup", [""]),
      Err(ConfigError::DuplicateName(ref name)) if name == "dup"
    ));
    assert!(matches!(
      registry.register_paths("dup", ["./a", "./a"]),
      Err(ConfigError::DuplicateName(ref name)) if name == "dup"
    ));

    assert_eq!(*registry.get("dup").unwrap(), ExtensionConfig::new(["./first"]));
  }

  #[test]
  fn test_invalid_configs() {
    let registry = Registry::new();

    assert!(matches!(
      registry.register("", ExtensionConfig::default()),
      Err(ConfigError::EmptyName)
    ));
    assert!(matches!(
      registry.register_paths("empty", [""]),
      Err(ConfigError::EmptyPath { .. })
    ));
    assert!(matches!(
      registry.register_paths("twice", ["./a", "./b", "./a"]),
      Err(ConfigError::DuplicatePath { ref path, .. }) if path == Path::new("./a")
    ));

    // Failed registrations leave no trace.
    assert!(registry.is_empty());
  }

  #[test]
  fn test_search_dir_resolution() {
    let registry = Registry::new();
    registry
      .register(
        "vector",
        ExtensionConfig::new([
          Extension::new("vector"),
          Extension::new("/abs/js").with_entry_point("sqlite3_js_init"),
        ])
        .with_search_dir("/opt/sqlite"),
      )
      .unwrap();

    let config = registry.get("vector").unwrap();
    assert_eq!(
      config.paths().collect::<Vec<_>>(),
      vec![Path::new("/opt/sqlite/vector"), Path::new("/abs/js")]
    );
    assert_eq!(
      config.extensions[1].entry_point.as_deref(),
      Some("sqlite3_js_init")
    );

    // Resolution happens before the duplicate check.
    assert!(matches!(
      registry.register(
        "dup",
        ExtensionConfig::new(["vector", "/opt/sqlite/vector"]).with_search_dir("/opt/sqlite"),
      ),
      Err(ConfigError::DuplicatePath { .. })
    ));
  }

  #[test]
  fn test_from_json() {
    let registry = Registry::from_json(
      r#"{
        "with_ext": ["./ext_version"],
        "vector": { "search_dir": "/opt/sqlite", "extensions": ["vector", "js"] }
      }"#,
    )
    .unwrap();

    assert_eq!(registry.names(), vec!["vector".to_string(), "with_ext".to_string()]);
    assert_eq!(
      registry.get("vector").unwrap().paths().collect::<Vec<_>>(),
      vec![Path::new("/opt/sqlite/vector"), Path::new("/opt/sqlite/js")]
    );

    assert!(matches!(
      Registry::from_json("[1, 2]"),
      Err(ConfigError::Json(_))
    ));
    assert!(matches!(
      Registry::from_json(r#"{"x": ["a", "a"]}"#),
      Err(ConfigError::DuplicatePath { .. })
    ));
  }

  #[test]
  fn test_from_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("extensions.json");
    std::fs::write(&path, r#"{"with_ext": ["./ext_version"]}"#).unwrap();

    let registry = Registry::from_file(&path).unwrap();
    assert!(registry.contains("with_ext"));

    assert!(matches!(
      Registry::from_file(dir.path().join("missing.json")),
      Err(ConfigError::Io(_))
    ));
  }
}

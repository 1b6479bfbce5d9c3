use rusqlite::OpenFlags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// A native SQLite extension module.
///
/// The path may omit the platform suffix, e.g. `./ext_version` rather than
/// `./ext_version.so`, in which case SQLite appends `.so`, `.dylib` or `.dll`. Without an explicit
/// entry point SQLite looks for `sqlite3_<basename>_init` and falls back to
/// `sqlite3_extension_init`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ExtensionRepr")]
pub struct Extension {
  pub path: PathBuf,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub entry_point: Option<String>,
}

impl Extension {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    return Self {
      path: path.into(),
      entry_point: None,
    };
  }

  pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
    self.entry_point = Some(entry_point.into());
    return self;
  }
}

macro_rules! extension_from_path(
    ($t:ty) => (
        impl From<$t> for Extension {
            #[inline]
            fn from(path: $t) -> Self { Extension::new(path) }
        }
    )
);

extension_from_path!(&str);
extension_from_path!(String);
extension_from_path!(&Path);
extension_from_path!(PathBuf);

// Accepts both `"./ext"` and `{ "path": "./ext", "entry_point": "..." }`.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExtensionRepr {
  Path(PathBuf),
  Full {
    path: PathBuf,
    #[serde(default)]
    entry_point: Option<String>,
  },
}

impl From<ExtensionRepr> for Extension {
  fn from(repr: ExtensionRepr) -> Self {
    return match repr {
      ExtensionRepr::Path(path) => Extension::new(path),
      ExtensionRepr::Full { path, entry_point } => Extension { path, entry_point },
    };
  }
}

/// Ordered list of extensions loaded into every connection opened under one configuration name.
///
/// Load order is preserved exactly, later extensions may depend on symbols registered by earlier
/// ones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ConfigRepr")]
pub struct ExtensionConfig {
  pub extensions: Vec<Extension>,
  /// Directory relative extension paths are resolved against at registration.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub search_dir: Option<PathBuf>,
}

impl ExtensionConfig {
  pub fn new<E: Into<Extension>>(extensions: impl IntoIterator<Item = E>) -> Self {
    return Self {
      extensions: extensions.into_iter().map(Into::into).collect(),
      search_dir: None,
    };
  }

  pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
    self.search_dir = Some(dir.into());
    return self;
  }

  pub fn push(&mut self, extension: impl Into<Extension>) {
    self.extensions.push(extension.into());
  }

  pub fn paths(&self) -> impl Iterator<Item = &Path> {
    return self.extensions.iter().map(|e| e.path.as_path());
  }

  pub fn is_empty(&self) -> bool {
    return self.extensions.is_empty();
  }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigRepr {
  List(Vec<Extension>),
  Full {
    #[serde(default)]
    extensions: Vec<Extension>,
    #[serde(default)]
    search_dir: Option<PathBuf>,
  },
}

impl From<ConfigRepr> for ExtensionConfig {
  fn from(repr: ConfigRepr) -> Self {
    return match repr {
      ConfigRepr::List(extensions) => ExtensionConfig {
        extensions,
        search_dir: None,
      },
      ConfigRepr::Full {
        extensions,
        search_dir,
      } => ExtensionConfig {
        extensions,
        search_dir,
      },
    };
  }
}

/// Where a connection's database lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataSource {
  Memory,
  Path(PathBuf),
  /// SQLite URI filename, e.g. `file:data.db?mode=ro`.
  Uri(String),
}

impl DataSource {
  pub const MEMORY: &'static str = ":memory:";

  /// `":memory:"` is an in-memory database and `file:` prefixes denote URIs. Anything else,
  /// including the empty string, is a path. SQLite opens an empty path as a private temporary
  /// database on disk, removed on close.
  pub fn parse(source: &str) -> Self {
    if source == Self::MEMORY {
      return DataSource::Memory;
    }
    if source.starts_with("file:") {
      return DataSource::Uri(source.to_string());
    }
    return DataSource::Path(PathBuf::from(source));
  }
}

impl From<&str> for DataSource {
  fn from(source: &str) -> Self {
    return DataSource::parse(source);
  }
}

impl fmt::Display for DataSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    return match self {
      DataSource::Memory => f.write_str(Self::MEMORY),
      DataSource::Path(path) => write!(f, "{}", path.display()),
      DataSource::Uri(uri) => f.write_str(uri),
    };
  }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpenMode {
  ReadOnly,
  ReadWrite,
  #[default]
  ReadWriteCreate,
}

impl OpenMode {
  pub fn flags(self) -> OpenFlags {
    let flags = match self {
      OpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
      OpenMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
      OpenMode::ReadWriteCreate => {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
      }
    };
    // Every connection is confined to a single thread by the connection handle.
    return flags | OpenFlags::SQLITE_OPEN_NO_MUTEX;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_data_source_parse() {
    assert_eq!(DataSource::parse(":memory:"), DataSource::Memory);
    assert_eq!(DataSource::parse(""), DataSource::Path(PathBuf::new()));
    assert_eq!(
      DataSource::parse(" main.db"),
      DataSource::Path(PathBuf::from(" main.db"))
    );
    assert_eq!(
      DataSource::parse("file:main.db?mode=ro"),
      DataSource::Uri("file:main.db?mode=ro".to_string())
    );
    assert_eq!(
      DataSource::parse("data/main.db"),
      DataSource::Path(PathBuf::from("data/main.db"))
    );
    assert_eq!(DataSource::Memory.to_string(), ":memory:");
  }

  #[test]
  fn test_config_deserialize_shorthands() {
    let config: ExtensionConfig = serde_json::from_str(r#"["./a", "./b"]"#).unwrap();
    assert_eq!(config, ExtensionConfig::new(["./a", "./b"]));

    let config: ExtensionConfig = serde_json::from_str(
      r#"{
        "search_dir": "/opt/ext",
        "extensions": ["a", { "path": "b", "entry_point": "sqlite3_b_init" }]
      }"#,
    )
    .unwrap();
    assert_eq!(config.search_dir, Some(PathBuf::from("/opt/ext")));
    assert_eq!(
      config.extensions,
      vec![
        Extension::new("a"),
        Extension::new("b").with_entry_point("sqlite3_b_init"),
      ]
    );

    let json = serde_json::to_value(&config).unwrap();
    assert_eq!(json["extensions"][0], serde_json::json!({ "path": "a" }));
  }
}

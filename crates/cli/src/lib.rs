#![forbid(clippy::unwrap_used)]
#![allow(clippy::needless_return)]

mod args;

pub use args::{DefaultCommandLineArgs, SubCommands};

use std::fmt::Write;
use std::time::Duration;

use extload::{
  ConfigError, Extension, ExtensionConfig, ExtensionConnection, OpenMode, Options, Registry, Rows,
  Value,
};

/// Builds the registry from `--config` and registers the `--extension` flags under `--name`.
///
/// Without any `--extension` flags an empty configuration is registered under `--name`, unless
/// the config file already provides one, so that plain databases can be queried too.
pub fn build_registry(args: &DefaultCommandLineArgs) -> Result<Registry, ConfigError> {
  let registry = match args.config {
    Some(ref path) => Registry::from_file(path)?,
    None => Registry::new(),
  };

  if !args.extensions.is_empty() || !registry.contains(&args.name) {
    let mut config = ExtensionConfig::default();
    for path in &args.extensions {
      let extension = Extension::new(path);
      config.push(match args.entry_point {
        Some(ref entry_point) => extension.with_entry_point(entry_point),
        None => extension,
      });
    }
    if let Some(ref dir) = args.search_dir {
      config = config.with_search_dir(dir);
    }

    registry.register(&args.name, config)?;
  }

  return Ok(registry);
}

pub fn options(args: &DefaultCommandLineArgs) -> Options {
  return Options {
    busy_timeout: Duration::from_millis(args.busy_timeout_ms),
    mode: if args.read_only {
      OpenMode::ReadOnly
    } else {
      OpenMode::ReadWriteCreate
    },
    ..Default::default()
  };
}

pub fn format_value(value: &Value) -> String {
  return match value {
    Value::Null => "NULL".to_string(),
    Value::Integer(i) => i.to_string(),
    Value::Real(r) => r.to_string(),
    Value::Text(s) => s.clone(),
    Value::Blob(b) => {
      let mut hex = String::with_capacity(2 * b.len() + 3);
      hex.push_str("x'");
      for byte in b {
        let _ = write!(hex, "{byte:02x}");
      }
      hex.push('\'');
      hex
    }
  };
}

/// Renders a header line with the column names followed by one tab separated line per row.
pub fn format_rows(rows: &Rows) -> String {
  let mut out = rows.columns().join("\t");
  out.push('\n');

  for row in rows {
    let line = row
      .values()
      .iter()
      .map(format_value)
      .collect::<Vec<_>>()
      .join("\t");
    out.push_str(&line);
    out.push('\n');
  }

  return out;
}

/// Runs `sql` on the writer connection, i.e. statements with side effects are allowed.
pub async fn query(conn: &ExtensionConnection, sql: String) -> Result<String, extload::Error> {
  let rows = conn.write_query_rows(sql, ()).await?;
  return Ok(format_rows(&rows));
}

#[cfg(test)]
mod tests {
  use clap::Parser;
  use std::path::{Path, PathBuf};
  use std::sync::Arc;

  use super::*;

  fn parse(args: &[&str]) -> DefaultCommandLineArgs {
    let argv = std::iter::once("extload").chain(args.iter().copied());
    return DefaultCommandLineArgs::try_parse_from(argv).unwrap();
  }

  #[test]
  fn test_build_registry_from_flags() {
    let args = parse(&[
      "--extension",
      "a",
      "--extension",
      "/abs/b",
      "--entry-point",
      "sqlite3_x_init",
      "--search-dir",
      "/opt/ext",
      "--name",
      "custom",
    ]);

    let registry = build_registry(&args).unwrap();
    assert_eq!(registry.names(), vec!["custom".to_string()]);

    let config = registry.get("custom").unwrap();
    assert_eq!(
      config.paths().collect::<Vec<_>>(),
      vec![Path::new("/opt/ext/a"), Path::new("/abs/b")]
    );
    assert!(
      config
        .extensions
        .iter()
        .all(|e| e.entry_point.as_deref() == Some("sqlite3_x_init"))
    );
  }

  #[test]
  fn test_build_registry_from_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("extensions.json");
    std::fs::write(&path, r#"{"with_extensions": ["./from_file"], "other": []}"#).unwrap();

    let config_arg = path.to_str().unwrap();

    // The file's config is used as is.
    let registry = build_registry(&parse(&["--config", config_arg])).unwrap();
    assert_eq!(
      registry.get("with_extensions").unwrap().paths().collect::<Vec<_>>(),
      vec![Path::new("./from_file")]
    );

    // Colliding ad-hoc extensions are reported rather than silently dropped.
    assert!(matches!(
      build_registry(&parse(&["--config", config_arg, "-e", "./flag"])),
      Err(ConfigError::DuplicateName(_))
    ));

    let registry =
      build_registry(&parse(&["--config", config_arg, "--name", "adhoc", "-e", "./flag"]))
        .unwrap();
    assert_eq!(registry.len(), 3);
    assert_eq!(
      registry.get("adhoc").unwrap().extensions,
      vec![Extension::new(PathBuf::from("./flag"))]
    );
  }

  #[test]
  fn test_options() {
    let opts = options(&parse(&["--read-only", "--busy-timeout-ms", "250"]));
    assert_eq!(opts.mode, OpenMode::ReadOnly);
    assert_eq!(opts.busy_timeout, Duration::from_millis(250));

    assert_eq!(options(&parse(&[])).mode, OpenMode::ReadWriteCreate);
  }

  #[test]
  fn test_format_value() {
    assert_eq!(format_value(&Value::Null), "NULL");
    assert_eq!(format_value(&Value::Integer(-3)), "-3");
    assert_eq!(format_value(&Value::Real(1.5)), "1.5");
    assert_eq!(format_value(&Value::Text("abc".to_string())), "abc");
    assert_eq!(format_value(&Value::Blob(vec![0x00, 0xab, 0x10])), "x'00ab10'");
  }

  #[tokio::test]
  async fn test_query_without_extensions() {
    let args = parse(&[]);
    let registry = build_registry(&args).unwrap();
    let factory = extload::ConnectionFactory::new(Arc::new(registry), options(&args));

    let conn = factory.open(&args.name, &args.data_source).unwrap();
    let out = query(&conn, "SELECT 1 AS a, 'x' AS b, NULL AS c".to_string())
      .await
      .unwrap();
    assert_eq!(out, "a\tb\tc\n1\tx\tNULL\n");

    conn.close().await.unwrap();
    assert!(matches!(
      query(&conn, "SELECT 1".to_string()).await,
      Err(extload::Error::InvalidState)
    ));
  }
}

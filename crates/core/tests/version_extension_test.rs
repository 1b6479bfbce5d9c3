use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, OnceLock};

use extload::{ConnectionFactory, OpenError, Options, Registry};

/// Set to skip the tests needing the natively built `ext_version` extension.
const SKIP_ENV: &str = "EXTLOAD_SKIP_NATIVE_EXTENSION";

/// Returns the `ext_version` extension, building `crates/extension-so` on first use.
///
/// `EXTLOAD_VERSION_EXTENSION` may point at a prebuilt library instead. Returns `None` only if
/// `EXTLOAD_SKIP_NATIVE_EXTENSION` is set, a failed build fails the calling test.
fn version_extension() -> Option<PathBuf> {
  static EXTENSION: OnceLock<Option<PathBuf>> = OnceLock::new();

  let _ = env_logger::try_init_from_env(env_logger::Env::new().default_filter_or("info,extload=debug"));

  return EXTENSION
    .get_or_init(|| {
      if std::env::var_os(SKIP_ENV).is_some() {
        return None;
      }
      if let Some(path) = std::env::var_os("EXTLOAD_VERSION_EXTENSION") {
        return Some(PathBuf::from(path));
      }
      return Some(build_version_extension());
    })
    .clone();
}

fn build_version_extension() -> PathBuf {
  let crate_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../extension-so");
  let target_dir = crate_dir.join("target");

  let build = |offline: bool| {
    let mut cmd = Command::new(option_env!("CARGO").unwrap_or("cargo"));
    cmd
      .arg("build")
      .arg("--manifest-path")
      .arg(crate_dir.join("Cargo.toml"))
      .arg("--target-dir")
      .arg(&target_dir)
      .env_remove("CARGO_TARGET_DIR");
    if offline {
      cmd.arg("--offline");
    }
    return cmd.status().is_ok_and(|status| status.success());
  };

  assert!(
    build(true) || build(false),
    "building {} failed, set {SKIP_ENV}=1 to skip the native extension tests",
    crate_dir.display()
  );

  let file_name = if cfg!(windows) {
    "ext_version.dll"
  } else if cfg!(target_os = "macos") {
    "libext_version.dylib"
  } else {
    "libext_version.so"
  };
  let path = target_dir.join("debug").join(file_name);
  assert!(
    path.exists(),
    "{} missing after build, set {SKIP_ENV}=1 to skip the native extension tests",
    path.display()
  );
  return path;
}

#[tokio::test]
async fn test_load_version_extension() {
  let Some(path) = version_extension() else {
    eprintln!("{SKIP_ENV} set, skipping");
    return;
  };

  let registry = Registry::new();
  registry.register_paths("with_ext", [&path]).unwrap();
  let factory = ConnectionFactory::new(Arc::new(registry), Options::default());

  let conn = factory.open("with_ext", ":memory:").unwrap();

  let version: Option<String> = conn
    .read_query_value("SELECT ext_version()", ())
    .await
    .unwrap();
  assert_eq!(version.as_deref(), Some("1.0.0"));

  conn.close().await.unwrap();
  assert!(matches!(
    conn.read_query_value::<String>("SELECT ext_version()", ()).await,
    Err(extload::Error::InvalidState)
  ));
}

#[test]
fn test_load_version_extension_blocking() {
  let Some(path) = version_extension() else {
    eprintln!("{SKIP_ENV} set, skipping");
    return;
  };

  let registry = Registry::new();
  registry
    .register_paths("with_ext", [path.clone()])
    .unwrap();
  registry
    .register_paths("broken", [path.clone(), PathBuf::from("/nonexistent/libnope")])
    .unwrap();
  let factory = ConnectionFactory::new(Arc::new(registry), Options::default());

  let conn = factory.connect("with_ext", ":memory:").unwrap();
  let version: String = conn
    .query_row("SELECT ext_version()", (), |row| row.get(0))
    .unwrap();
  assert_eq!(version, "1.0.0");

  match factory.connect("broken", ":memory:") {
    Err(OpenError::ExtensionLoadFailed { path, .. }) => {
      assert_eq!(path, PathBuf::from("/nonexistent/libnope"));
    }
    other => panic!("unexpected result: {other:?}"),
  };
}

#[test]
fn test_on_disk_database_with_registry_file() {
  let dir = tempfile::TempDir::new().unwrap();
  let config_path = dir.path().join("extensions.json");
  std::fs::write(&config_path, r#"{ "plain": [] }"#).unwrap();

  let registry = Registry::from_file(&config_path).unwrap();
  let factory = ConnectionFactory::new(Arc::new(registry), Options::default());

  let db_path = dir.path().join("main.db");
  let data_source = db_path.to_str().unwrap();
  {
    let conn = factory.connect("plain", data_source).unwrap();
    conn
      .execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('persisted');")
      .unwrap();
  }

  let conn = factory.connect("plain", data_source).unwrap();
  let v: String = conn
    .query_row("SELECT v FROM t", (), |row| row.get(0))
    .unwrap();
  assert_eq!(v, "persisted");
}

use log::*;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{DataSource, Extension, ExtensionConfig, OpenMode};
use crate::driver::{Driver, SqliteDriver};
use crate::registry::Registry;

pub use extload_sqlite::Connection;

#[derive(Debug, Error)]
pub enum OpenError {
  #[error("Unknown extension config: '{0}'")]
  UnknownConfig(String),
  #[error("Engine open failed: {0}")]
  EngineOpenFailed(#[source] rusqlite::Error),
  #[error("Loading extension '{}' failed: {cause}", path.display())]
  ExtensionLoadFailed {
    path: PathBuf,
    #[source]
    cause: rusqlite::Error,
  },
  #[error("Connection: {0}")]
  Connection(#[source] extload_sqlite::Error),
}

impl From<extload_sqlite::Error> for OpenError {
  fn from(err: extload_sqlite::Error) -> Self {
    return match err {
      // Raw engine errors while setting up the handle, e.g. applying the busy timeout.
      extload_sqlite::Error::Rusqlite(err) => OpenError::EngineOpenFailed(err),
      err => OpenError::Connection(err),
    };
  }
}

#[derive(Clone, Debug)]
pub struct Options {
  pub busy_timeout: Duration,
  /// Reader threads for file databases, see [`extload_sqlite::Options::n_read_threads`]. Each
  /// reader has its own engine connection with its own copy of the extensions.
  pub n_read_threads: usize,
  pub mode: OpenMode,
}

impl Default for Options {
  fn default() -> Self {
    let defaults = extload_sqlite::Options::default();
    return Self {
      busy_timeout: defaults.busy_timeout,
      n_read_threads: defaults.n_read_threads,
      mode: OpenMode::default(),
    };
  }
}

/// An open connection together with the configuration its extensions were loaded from.
#[derive(Clone, Debug)]
pub struct ExtensionConnection {
  connection: Connection,
  name: String,
  config: Arc<ExtensionConfig>,
}

impl ExtensionConnection {
  pub fn config_name(&self) -> &str {
    return &self.name;
  }

  /// The extensions loaded into this connection, in load order.
  pub fn extensions(&self) -> &[Extension] {
    return &self.config.extensions;
  }

  pub fn into_inner(self) -> Connection {
    return self.connection;
  }
}

impl Deref for ExtensionConnection {
  type Target = Connection;

  fn deref(&self) -> &Connection {
    return &self.connection;
  }
}

/// Opens SQLite connections with the extensions of a registered configuration already loaded.
///
/// Loading is part of establishing the connection: a handle is only ever returned with every
/// configured extension loaded, in order. If any extension fails to load the engine connection
/// is closed and the failing path is reported.
pub struct ConnectionFactory<D: Driver = SqliteDriver> {
  registry: Arc<Registry>,
  options: Options,
  driver: Arc<D>,
}

impl ConnectionFactory<SqliteDriver> {
  pub fn new(registry: Arc<Registry>, options: Options) -> Self {
    return Self::with_driver(registry, options, SqliteDriver);
  }
}

impl<D: Driver> ConnectionFactory<D> {
  pub fn with_driver(registry: Arc<Registry>, options: Options, driver: D) -> Self {
    return Self {
      registry,
      options,
      driver: Arc::new(driver),
    };
  }

  pub fn registry(&self) -> &Arc<Registry> {
    return &self.registry;
  }

  pub fn options(&self) -> &Options {
    return &self.options;
  }

  /// Opens `data_source`, e.g. `":memory:"` or a file path, and loads the extensions registered
  /// under `name`.
  pub fn open(&self, name: &str, data_source: &str) -> Result<ExtensionConnection, OpenError> {
    let config = self.lookup(name)?;
    let source = DataSource::parse(data_source);

    let connection = Connection::new(
      || open_with_extensions(self.driver.as_ref(), &source, self.options.mode, &config),
      Some(extload_sqlite::Options {
        busy_timeout: self.options.busy_timeout,
        n_read_threads: self.options.n_read_threads,
      }),
    )?;

    info!(
      "Opened '{source}' with extension config '{name}' ({} extensions)",
      config.extensions.len()
    );

    return Ok(ExtensionConnection {
      connection,
      name: name.to_string(),
      config,
    });
  }

  /// Blocking counterpart of [`ConnectionFactory::open`] returning a plain SQLite connection
  /// owned by the caller.
  pub fn connect(&self, name: &str, data_source: &str) -> Result<rusqlite::Connection, OpenError> {
    let config = self.lookup(name)?;
    let source = DataSource::parse(data_source);

    let conn = open_with_extensions(self.driver.as_ref(), &source, self.options.mode, &config)?;
    conn
      .busy_timeout(self.options.busy_timeout)
      .map_err(OpenError::EngineOpenFailed)?;
    return Ok(conn);
  }

  fn lookup(&self, name: &str) -> Result<Arc<ExtensionConfig>, OpenError> {
    return self
      .registry
      .get(name)
      .ok_or_else(|| OpenError::UnknownConfig(name.to_string()));
  }
}

fn open_with_extensions<D: Driver + ?Sized>(
  driver: &D,
  source: &DataSource,
  mode: OpenMode,
  config: &ExtensionConfig,
) -> Result<rusqlite::Connection, OpenError> {
  let conn = driver
    .open(source, mode)
    .map_err(OpenError::EngineOpenFailed)?;

  for extension in &config.extensions {
    if let Err(cause) = driver.load_extension(&conn, extension) {
      warn!(
        "Failed to load extension '{}': {cause}",
        extension.path.display()
      );

      if let Err(err) = driver.close(conn) {
        warn!("Failed to close partially initialized connection: {err}");
      }

      return Err(OpenError::ExtensionLoadFailed {
        path: extension.path.clone(),
        cause,
      });
    }

    debug!("Loaded extension '{}'", extension.path.display());
  }

  return Ok(conn);
}

#[cfg(test)]
mod tests {
  use parking_lot::Mutex;
  use rusqlite::ffi;
  use rusqlite::functions::FunctionFlags;
  use std::collections::HashMap;
  use std::path::Path;
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  struct FakeModule {
    function: &'static str,
    version: &'static str,
    requires: Option<&'static str>,
  }

  /// Stands in for native extensions: "loading" a module registers a scalar function returning
  /// the module's version. Modules may require a function registered by another module.
  #[derive(Default)]
  struct FakeDriver {
    modules: HashMap<PathBuf, FakeModule>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    loaded: Mutex<Vec<PathBuf>>,
  }

  impl FakeDriver {
    fn with_module(
      mut self,
      path: &str,
      function: &'static str,
      version: &'static str,
      requires: Option<&'static str>,
    ) -> Self {
      self.modules.insert(
        PathBuf::from(path),
        FakeModule {
          function,
          version,
          requires,
        },
      );
      return self;
    }
  }

  fn load_error(msg: String) -> rusqlite::Error {
    return rusqlite::Error::SqliteFailure(ffi::Error::new(ffi::SQLITE_ERROR), Some(msg));
  }

  impl Driver for FakeDriver {
    fn open(
      &self,
      source: &DataSource,
      mode: OpenMode,
    ) -> rusqlite::Result<rusqlite::Connection> {
      self.opens.fetch_add(1, Ordering::SeqCst);
      return SqliteDriver.open(source, mode);
    }

    fn load_extension(
      &self,
      conn: &rusqlite::Connection,
      extension: &Extension,
    ) -> rusqlite::Result<()> {
      let Some(module) = self.modules.get(&extension.path) else {
        return Err(load_error(format!(
          "{}: cannot open shared object file: No such file or directory",
          extension.path.display()
        )));
      };

      if let Some(required) = module.requires
        && conn.prepare(&format!("SELECT {required}()")).is_err()
      {
        return Err(load_error(format!("undefined symbol: {required}")));
      }

      let version = module.version;
      conn.create_scalar_function(
        module.function,
        0,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |_ctx| Ok(version.to_string()),
      )?;

      self.loaded.lock().push(extension.path.clone());
      return Ok(());
    }

    fn close(&self, conn: rusqlite::Connection) -> rusqlite::Result<()> {
      self.closes.fetch_add(1, Ordering::SeqCst);
      return conn.close().map_err(|(_, err)| err);
    }
  }

  fn fake_driver() -> FakeDriver {
    return FakeDriver::default()
      .with_module("/ext/a", "a_version", "0.1.0", None)
      .with_module("/ext/b", "b_version", "0.2.0", Some("a_version"))
      .with_module("/ext/ext_version", "ext_version", "1.0.0", None);
  }

  fn factory(
    configs: Vec<(&str, Vec<&str>)>,
    driver: FakeDriver,
    options: Options,
  ) -> ConnectionFactory<FakeDriver> {
    let _ = env_logger::try_init_from_env(env_logger::Env::new().default_filter_or("debug"));

    let registry = Registry::new();
    for (name, paths) in configs {
      registry.register_paths(name, paths).unwrap();
    }
    return ConnectionFactory::with_driver(Arc::new(registry), options, driver);
  }

  #[tokio::test]
  async fn test_end_to_end() {
    let factory = factory(
      vec![("with_ext", vec!["/ext/ext_version"])],
      fake_driver(),
      Options::default(),
    );

    let conn = factory.open("with_ext", ":memory:").unwrap();
    assert_eq!(conn.config_name(), "with_ext");
    assert_eq!(conn.extensions(), &[Extension::new("/ext/ext_version")]);

    let version: Option<String> = conn
      .read_query_value("SELECT ext_version()", ())
      .await
      .unwrap();
    assert_eq!(version.as_deref(), Some("1.0.0"));

    conn.close().await.unwrap();
  }

  #[test]
  fn test_unknown_config_does_not_touch_engine() {
    let factory = factory(vec![], fake_driver(), Options::default());

    let err = factory.open("nonexistent", ":memory:").unwrap_err();
    assert!(matches!(err, OpenError::UnknownConfig(ref name) if name == "nonexistent"));

    assert!(matches!(
      factory.connect("nonexistent", ":memory:"),
      Err(OpenError::UnknownConfig(_))
    ));
    assert_eq!(factory.driver.opens.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_extension_load_is_atomic() {
    let factory = factory(
      vec![("broken", vec!["/ext/a", "/ext/missing"])],
      fake_driver(),
      Options::default(),
    );

    let err = factory.open("broken", ":memory:").unwrap_err();
    let OpenError::ExtensionLoadFailed { ref path, ref cause } = err else {
      panic!("unexpected error: {err:?}");
    };
    assert_eq!(path, Path::new("/ext/missing"));
    assert!(cause.to_string().contains("No such file"), "{cause}");

    // "a" loaded fine, the engine connection was opened once and closed again.
    assert_eq!(*factory.driver.loaded.lock(), vec![PathBuf::from("/ext/a")]);
    assert_eq!(factory.driver.opens.load(Ordering::SeqCst), 1);
    assert_eq!(factory.driver.closes.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_load_order_is_preserved() {
    let factory = factory(
      vec![
        ("ordered", vec!["/ext/a", "/ext/b"]),
        ("reversed", vec!["/ext/b", "/ext/a"]),
      ],
      fake_driver(),
      Options::default(),
    );

    let conn = factory.connect("ordered", ":memory:").unwrap();
    let b: String = conn
      .query_row("SELECT b_version()", (), |row| row.get(0))
      .unwrap();
    assert_eq!(b, "0.2.0");

    let err = factory.connect("reversed", ":memory:").unwrap_err();
    assert!(
      matches!(err, OpenError::ExtensionLoadFailed { ref path, .. } if path == Path::new("/ext/b")),
      "{err:?}"
    );
  }

  #[test]
  fn test_engine_open_failure() {
    let factory = factory(
      vec![("with_ext", vec!["/ext/ext_version"])],
      fake_driver(),
      Options::default(),
    );

    let err = factory
      .open("with_ext", "/nonexistent/directory/main.db")
      .unwrap_err();
    assert!(matches!(err, OpenError::EngineOpenFailed(_)), "{err:?}");
    assert!(factory.driver.loaded.lock().is_empty());
  }

  #[tokio::test]
  async fn test_closed_connection_is_invalid() {
    let factory = factory(
      vec![("with_ext", vec!["/ext/ext_version"])],
      fake_driver(),
      Options::default(),
    );

    let conn = factory.open("with_ext", ":memory:").unwrap();
    conn.close().await.unwrap();

    assert!(matches!(
      conn.read_query_rows("SELECT ext_version()", ()).await,
      Err(extload_sqlite::Error::InvalidState)
    ));
    assert!(conn.close().await.is_ok());
  }

  #[tokio::test]
  async fn test_every_reader_loads_extensions() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("main.db");

    let factory = factory(
      vec![("ordered", vec!["/ext/a", "/ext/b"])],
      fake_driver(),
      Options {
        n_read_threads: 3,
        ..Default::default()
      },
    );

    let conn = factory
      .open("ordered", path.to_str().unwrap())
      .unwrap();

    assert_eq!(factory.driver.opens.load(Ordering::SeqCst), 3);
    assert_eq!(factory.driver.loaded.lock().len(), 6);

    for _ in 0..6 {
      let v: Option<String> = conn
        .read_query_value("SELECT a_version() || '/' || b_version()", ())
        .await
        .unwrap();
      assert_eq!(v.as_deref(), Some("0.1.0/0.2.0"));
    }

    conn.close().await.unwrap();
  }

  #[tokio::test]
  async fn test_empty_config() {
    let factory = factory(vec![("plain", vec![])], fake_driver(), Options::default());

    let conn = factory.open("plain", "").unwrap();
    assert!(conn.extensions().is_empty());

    let v: Option<i64> = conn.read_query_value("SELECT 1 + 1", ()).await.unwrap();
    assert_eq!(v, Some(2));
  }

  #[tokio::test]
  async fn test_concurrent_opens_are_independent() {
    let factory = factory(
      vec![("with_ext", vec!["/ext/ext_version"])],
      fake_driver(),
      Options::default(),
    );

    let conns: Vec<ExtensionConnection> = std::thread::scope(|scope| {
      let handles: Vec<_> = (0..4)
        .map(|_| scope.spawn(|| factory.open("with_ext", ":memory:")))
        .collect();
      return handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();
    });
    assert_eq!(factory.driver.opens.load(Ordering::SeqCst), 4);
    assert_eq!(factory.driver.loaded.lock().len(), 4);

    conns[0]
      .execute("CREATE TABLE t (v INTEGER)", ())
      .await
      .unwrap();
    for conn in &conns[1..] {
      let n: Option<i64> = conn
        .read_query_value("SELECT COUNT(*) FROM sqlite_master WHERE name = 't'", ())
        .await
        .unwrap();
      assert_eq!(n, Some(0));
    }

    conns[0].close().await.unwrap();
    for conn in &conns[1..] {
      assert!(!conn.is_closed());
      let version: Option<String> = conn
        .read_query_value("SELECT ext_version()", ())
        .await
        .unwrap();
      assert_eq!(version.as_deref(), Some("1.0.0"));
    }
  }

  #[tokio::test]
  async fn test_dropping_last_handle_releases_database() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("main.db");

    let factory = factory(
      vec![("with_ext", vec!["/ext/ext_version"])],
      fake_driver(),
      Options::default(),
    );
    let conn = factory.open("with_ext", path.to_str().unwrap()).unwrap();
    conn
      .execute_batch(
        "PRAGMA locking_mode = EXCLUSIVE;
         CREATE TABLE t (v INTEGER);
         INSERT INTO t VALUES (1);",
      )
      .await
      .unwrap();

    let other = rusqlite::Connection::open(&path).unwrap();
    other.busy_timeout(Duration::ZERO).unwrap();
    let insert = || other.execute("INSERT INTO t VALUES (2)", ());
    assert!(insert().is_err(), "exclusive lock not held");

    // No close(): the workers exit once their queues hang up and release the engine connection.
    drop(conn);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
      match insert() {
        Ok(n) => {
          assert_eq!(n, 1);
          break;
        }
        Err(err) if std::time::Instant::now() > deadline => {
          panic!("database still locked after drop: {err}");
        }
        Err(_) => std::thread::sleep(Duration::from_millis(10)),
      }
    }
  }

  #[test]
  fn test_real_driver_reports_missing_extension() {
    let registry = Registry::new();
    registry
      .register_paths("missing", ["/nonexistent/libnope"])
      .unwrap();
    let factory = ConnectionFactory::new(Arc::new(registry), Options::default());

    let err = factory.open("missing", ":memory:").unwrap_err();
    assert!(
      matches!(err, OpenError::ExtensionLoadFailed { ref path, .. } if path == Path::new("/nonexistent/libnope")),
      "{err:?}"
    );
    assert!(err.to_string().contains("/nonexistent/libnope"));
  }
}

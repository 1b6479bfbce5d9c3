use rusqlite::{LoadExtensionGuard, OpenFlags};

use crate::config::{DataSource, Extension, OpenMode};

/// The embedded engine as seen by [`crate::ConnectionFactory`].
///
/// Implementations must be cheap to share across threads: a factory calls into its driver from
/// whichever thread invokes `open`.
pub trait Driver: Send + Sync + 'static {
  fn open(&self, source: &DataSource, mode: OpenMode) -> rusqlite::Result<rusqlite::Connection>;

  fn load_extension(
    &self,
    conn: &rusqlite::Connection,
    extension: &Extension,
  ) -> rusqlite::Result<()>;

  /// Releases a connection that never made it to the caller.
  fn close(&self, conn: rusqlite::Connection) -> rusqlite::Result<()> {
    return conn.close().map_err(|(_, err)| err);
  }
}

/// Driver backed by the SQLite library linked into this binary.
#[derive(Clone, Copy, Debug, Default)]
pub struct SqliteDriver;

impl Driver for SqliteDriver {
  fn open(&self, source: &DataSource, mode: OpenMode) -> rusqlite::Result<rusqlite::Connection> {
    return match source {
      // A fresh in-memory database is always empty, read-only makes no sense.
      DataSource::Memory => rusqlite::Connection::open_in_memory_with_flags(
        OpenMode::ReadWriteCreate.flags(),
      ),
      DataSource::Path(path) => rusqlite::Connection::open_with_flags(path, mode.flags()),
      DataSource::Uri(uri) => {
        rusqlite::Connection::open_with_flags(uri, mode.flags() | OpenFlags::SQLITE_OPEN_URI)
      }
    };
  }

  #[allow(unsafe_code)]
  fn load_extension(
    &self,
    conn: &rusqlite::Connection,
    extension: &Extension,
  ) -> rusqlite::Result<()> {
    // SAFETY: Loading an extension runs arbitrary native code. The set of extensions is chosen by
    // whoever registered the configuration, never derived from SQL input. Loading is only enabled
    // while the guard is alive, i.e. `load_extension()` cannot be reached from SQL afterwards.
    return unsafe {
      let _guard = LoadExtensionGuard::new(conn)?;
      conn.load_extension(&extension.path, extension.entry_point.as_deref())
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_open_modes() {
    let driver = SqliteDriver;

    let conn = driver.open(&DataSource::Memory, OpenMode::ReadOnly).unwrap();
    conn.execute("CREATE TABLE t (v INTEGER)", ()).unwrap();

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("main.db");
    let source = DataSource::Path(path.clone());

    // Nothing to open yet without the create flag.
    assert!(driver.open(&source, OpenMode::ReadWrite).is_err());

    let conn = driver.open(&source, OpenMode::ReadWriteCreate).unwrap();
    conn.execute("CREATE TABLE t (v INTEGER)", ()).unwrap();
    driver.close(conn).unwrap();

    let conn = driver.open(&source, OpenMode::ReadOnly).unwrap();
    assert!(conn.execute("INSERT INTO t VALUES (1)", ()).is_err());

    let uri = DataSource::Uri(format!("file:{}?mode=ro", path.display()));
    let conn = driver.open(&uri, OpenMode::ReadWrite).unwrap();
    let n: i64 = conn
      .query_row("SELECT COUNT(*) FROM t", (), |row| row.get(0))
      .unwrap();
    assert_eq!(n, 0);
  }

  #[test]
  fn test_load_missing_extension() {
    let driver = SqliteDriver;
    let conn = driver.open(&DataSource::Memory, OpenMode::default()).unwrap();

    let err = driver
      .load_extension(&conn, &Extension::new("/nonexistent/libnope"))
      .unwrap_err();
    assert!(matches!(err, rusqlite::Error::SqliteFailure(..)));

    // Extension loading is disabled again once the guard is dropped.
    let err = conn
      .query_row("SELECT load_extension('/nonexistent/libnope')", (), |_| Ok(()))
      .unwrap_err();
    assert!(err.to_string().contains("not authorized"), "{err}");
  }
}

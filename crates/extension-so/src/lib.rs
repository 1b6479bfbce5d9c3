#![forbid(clippy::unwrap_used)]
#![allow(clippy::needless_return)]

use rusqlite::functions::FunctionFlags;
use rusqlite::{Connection, ffi};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn register(conn: &Connection) -> rusqlite::Result<()> {
  conn.create_scalar_function(
    "ext_version",
    0,
    FunctionFlags::SQLITE_UTF8
      | FunctionFlags::SQLITE_DETERMINISTIC
      | FunctionFlags::SQLITE_INNOCUOUS,
    |_ctx| Ok(VERSION),
  )?;
  return Ok(());
}

/// Entry point for SQLite to load the extension.
///
/// Named after the library file the way SQLite derives entry points, i.e. alphabetic characters
/// of `libext_version.so` minus the `lib` prefix, see <https://sqlite.org/c3ref/load_extension.html>.
///
/// # Safety
/// This function is called by SQLite and must be safe to call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sqlite3_extversion_init(
  db: *mut ffi::sqlite3,
  pz_err_msg: *mut *mut std::os::raw::c_char,
  p_api: *mut ffi::sqlite3_api_routines,
) -> std::os::raw::c_int {
  return unsafe {
    Connection::extension_init2(db, pz_err_msg, p_api, |conn| {
      register(&conn)?;

      // Unload together with the connection rather than staying resident, i.e. no
      // SQLITE_OK_LOAD_PERMANENTLY.
      return Ok(false);
    })
  };
}

/// Legacy default entry point, tried by SQLite before deriving one from the file name.
///
/// # Safety
/// This function is called by SQLite and must be safe to call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn sqlite3_extension_init(
  db: *mut ffi::sqlite3,
  pz_err_msg: *mut *mut std::os::raw::c_char,
  p_api: *mut ffi::sqlite3_api_routines,
) -> std::os::raw::c_int {
  return unsafe { sqlite3_extversion_init(db, pz_err_msg, p_api) };
}

#![forbid(clippy::unwrap_used)]
#![allow(clippy::needless_return)]
#![warn(
  clippy::await_holding_lock,
  clippy::empty_enum,
  clippy::enum_glob_use,
  clippy::inefficient_to_string,
  clippy::mem_forget,
  clippy::mutex_integer,
  clippy::needless_continue
)]

pub mod config;
pub mod driver;
pub mod factory;
pub mod registry;

pub use config::{DataSource, Extension, ExtensionConfig, OpenMode};
pub use driver::{Driver, SqliteDriver};
pub use factory::{ConnectionFactory, ExtensionConnection, OpenError, Options};
pub use registry::{ConfigError, Registry};

pub use extload_sqlite::{Connection, Error, Row, Rows, Value};

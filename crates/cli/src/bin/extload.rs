#![allow(clippy::needless_return)]

use clap::Parser;
use log::*;
use std::sync::Arc;

use extload::ConnectionFactory;
use extload_cli::{DefaultCommandLineArgs, SubCommands, build_registry, options, query};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn init_logger(verbose: bool) {
  const DEFAULT: &str = "info";

  env_logger::Builder::from_env(if verbose {
    env_logger::Env::new().default_filter_or(format!("{DEFAULT},extload=debug,extload_sqlite=debug"))
  } else {
    env_logger::Env::new().default_filter_or(DEFAULT)
  })
  .format_timestamp_micros()
  .init();
}

async fn async_main() -> Result<(), BoxError> {
  let args = DefaultCommandLineArgs::parse();
  init_logger(args.verbose);

  let registry = Arc::new(build_registry(&args)?);

  match args.cmd {
    Some(SubCommands::Configs) => {
      println!("{}", serde_json::to_string_pretty(&registry.snapshot())?);
    }
    Some(SubCommands::Query { ref sql }) => {
      let factory = ConnectionFactory::new(registry, options(&args));
      let conn = factory.open(&args.name, &args.data_source)?;

      let result = query(&conn, sql.clone()).await;
      conn.close().await?;

      print!("{}", result?);
    }
    None => {
      let factory = ConnectionFactory::new(registry, options(&args));
      let conn = factory.open(&args.name, &args.data_source)?;

      let version: Option<String> = conn
        .read_query_value("SELECT sqlite_version()", ())
        .await?;
      println!(
        "SQLite {} with {} extension(s) from '{}'",
        version.unwrap_or_default(),
        conn.extensions().len(),
        conn.config_name(),
      );

      conn.close().await?;
    }
  }

  return Ok(());
}

fn main() -> Result<(), BoxError> {
  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()?;

  if let Err(err) = runtime.block_on(async_main()) {
    error!("{err}");
    return Err(err);
  }
  return Ok(());
}

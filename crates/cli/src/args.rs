use clap::{Parser, Subcommand};

use extload::DataSource;

/// Command line arguments for the extload CLI.
///
/// Extension configurations come from a JSON registry file (`--config`), from `--extension`
/// flags, or both. Ad-hoc extensions are registered under `--name`.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about, long_about = None)]
pub struct DefaultCommandLineArgs {
  /// JSON file mapping configuration names to lists of extensions.
  #[arg(long, env = "EXTLOAD_CONFIG")]
  pub config: Option<std::path::PathBuf>,

  /// Extension to load, may be repeated. Loaded in the given order.
  #[arg(
    short,
    long = "extension",
    env = "EXTLOAD_EXTENSIONS",
    value_delimiter = ','
  )]
  pub extensions: Vec<std::path::PathBuf>,

  /// Entry point symbol used for every `--extension` (Default: derived by SQLite).
  #[arg(long)]
  pub entry_point: Option<String>,

  /// Directory relative `--extension` paths are resolved against.
  #[arg(long)]
  pub search_dir: Option<std::path::PathBuf>,

  /// Name of the extension configuration to open the database with.
  #[arg(long, default_value = "with_extensions")]
  pub name: String,

  /// Database to open: a file path, a `file:` URI or `:memory:`.
  #[arg(long, default_value = DataSource::MEMORY)]
  pub data_source: String,

  /// Open file databases read-only.
  #[arg(long, default_value_t = false)]
  pub read_only: bool,

  /// SQLite busy timeout in milliseconds.
  #[arg(long, default_value_t = 5000)]
  pub busy_timeout_ms: u64,

  /// Log at debug level unless RUST_LOG says otherwise.
  #[arg(short, long, default_value_t = false)]
  pub verbose: bool,

  #[command(subcommand)]
  pub cmd: Option<SubCommands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommands {
  /// Runs a statement against the opened database and prints the resulting rows.
  Query {
    #[arg(default_value = "SELECT sqlite_version()")]
    sql: String,
  },
  /// Prints all registered extension configurations as JSON.
  Configs,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_args() {
    let args = DefaultCommandLineArgs::try_parse_from([
      "extload",
      "-e",
      "./a,./b",
      "--extension",
      "./c",
      "--data-source",
      "main.db",
      "query",
      "SELECT 1",
    ])
    .unwrap();

    assert_eq!(
      args.extensions,
      vec![
        std::path::PathBuf::from("./a"),
        std::path::PathBuf::from("./b"),
        std::path::PathBuf::from("./c"),
      ]
    );
    assert_eq!(args.name, "with_extensions");
    assert_eq!(args.data_source, "main.db");
    assert_eq!(args.busy_timeout_ms, 5000);
    assert!(!args.read_only);
    assert!(matches!(args.cmd, Some(SubCommands::Query { ref sql }) if sql == "SELECT 1"));

    let args = DefaultCommandLineArgs::try_parse_from(["extload", "query"]).unwrap();
    assert_eq!(args.data_source, ":memory:");
    assert!(
      matches!(args.cmd, Some(SubCommands::Query { ref sql }) if sql == "SELECT sqlite_version()")
    );
  }
}

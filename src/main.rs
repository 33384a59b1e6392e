mod cache;
mod commands;
mod config;
mod dates;
mod db;
mod dedup;
mod format;
mod providers;
mod receivables;
mod repository;

#[cfg(test)]
mod test_utils;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "fincache")]
#[command(about = "Month-partitioned cache for Zoho and Stripe transactions")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fincache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: commands::Command,
}

/// Log to a daily file in the data directory, and to stderr with --verbose.
/// RUST_LOG overrides the default filter.
fn init_tracing(verbose: bool) -> Result<WorkerGuard> {
  let log_dir = config::Config::data_dir()?.join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| color_eyre::eyre::eyre!("Failed to create log directory: {}", e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, "fincache.log"));

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    EnvFilter::new(if verbose {
      "fincache=debug"
    } else {
      "fincache=info"
    })
  });

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(file_writer).with_ansi(false))
    .with(verbose.then(|| fmt::layer().with_writer(std::io::stderr).compact()))
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Keep the guard alive so buffered log lines are flushed on exit
  let _guard = init_tracing(args.verbose)?;

  let config = config::Config::load(args.config.as_deref())?;

  commands::run(args.command, config).await
}

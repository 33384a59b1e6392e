//! CLI subcommands and their handlers.

use chrono::{Local, NaiveDate, Utc};
use clap::{Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;

use crate::cache::{
  CacheDecision, CacheStats, CacheStorage, PredictiveWarmer, QueryPlan, SqliteStorage,
};
use crate::config::Config;
use crate::dates::{parse_flexible_date, DateRange, YearMonth};
use crate::db::Database;
use crate::format::{format_age, format_amount, format_display_date, format_month_label, truncate};
use crate::providers::{Source, Transaction};
use crate::receivables::ReceivablesStore;
use crate::repository::{Dashboard, DashboardData, SourceSummary, Totals};

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Fetch transactions through the cache
  Fetch {
    #[arg(value_enum, default_value_t = SourceArg::All)]
    source: SourceArg,
    #[command(flatten)]
    range: RangeArgs,
    /// Refetch everything in the range
    #[arg(short, long)]
    force: bool,
    #[arg(long)]
    json: bool,
  },
  /// Show how a request would be served without fetching
  Plan {
    #[arg(value_parser = parse_source)]
    source: Source,
    #[command(flatten)]
    range: RangeArgs,
    #[arg(short, long)]
    force: bool,
    #[arg(long)]
    json: bool,
  },
  /// List cached months
  Months {
    #[arg(value_parser = parse_source)]
    source: Option<Source>,
  },
  /// Cache hit rate and sizes
  Stats {
    /// Lookback window for the metrics log
    #[arg(short, long, default_value_t = 7)]
    days: i64,
    #[arg(long)]
    json: bool,
  },
  /// Delete cached rows for a range so the next read refetches it
  Clear {
    #[arg(value_parser = parse_source)]
    source: Source,
    #[command(flatten)]
    range: RangeArgs,
  },
  /// Recompute monthly counts from the stored rows
  Repair,
  /// Prefetch the months most likely to be requested
  Warm {
    /// Keep running and warm on the configured interval
    #[arg(long)]
    daemon: bool,
  },
  /// Manage receivable flags
  Receivables {
    #[command(subcommand)]
    action: ReceivablesCommand,
  },
}

#[derive(Subcommand, Debug)]
pub enum ReceivablesCommand {
  /// List flagged transactions
  List {
    #[arg(value_parser = parse_source)]
    source: Option<Source>,
  },
  /// Flag a transaction as receivable
  Select {
    #[arg(value_parser = parse_source)]
    source: Source,
    transaction_id: String,
    #[arg(short, long)]
    note: Option<String>,
  },
  /// Remove a receivable flag
  Deselect {
    #[arg(value_parser = parse_source)]
    source: Source,
    transaction_id: String,
  },
  /// Total flagged income in a range
  Summary {
    #[command(flatten)]
    range: RangeArgs,
    #[arg(long)]
    json: bool,
  },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceArg {
  Zoho,
  Stripe,
  All,
}

impl SourceArg {
  fn source(self) -> Option<Source> {
    match self {
      SourceArg::Zoho => Some(Source::Zoho),
      SourceArg::Stripe => Some(Source::Stripe),
      SourceArg::All => None,
    }
  }
}

/// Date range flags. Both default to the current month.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct RangeArgs {
  /// First day (YYYY-MM-DD)
  #[arg(long, value_parser = parse_date)]
  pub start: Option<NaiveDate>,
  /// Last day (YYYY-MM-DD)
  #[arg(long, value_parser = parse_date)]
  pub end: Option<NaiveDate>,
}

impl RangeArgs {
  pub fn resolve(&self, today: NaiveDate) -> Result<DateRange> {
    let current = YearMonth::containing(today);
    let start = self.start.unwrap_or_else(|| current.first_day());
    let end = match self.end {
      Some(end) => end,
      None if self.start.is_some() => today.max(start),
      None => current.last_day(),
    };
    DateRange::new(start, end)
  }
}

fn parse_source(s: &str) -> Result<Source, String> {
  s.parse().map_err(|e: color_eyre::Report| e.to_string())
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
  parse_flexible_date(s).ok_or_else(|| format!("invalid date '{}'", s))
}

fn today() -> NaiveDate {
  Local::now().date_naive()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode JSON: {}", e))?;
  println!("{}", text);
  Ok(())
}

pub async fn run(command: Command, config: Config) -> Result<()> {
  match command {
    Command::Fetch {
      source,
      range,
      force,
      json,
    } => cmd_fetch(&config, source, range.resolve(today())?, force, json).await,
    Command::Plan {
      source,
      range,
      force,
      json,
    } => cmd_plan(&config, source, range.resolve(today())?, force, json),
    Command::Months { source } => cmd_months(&config, source),
    Command::Stats { days, json } => cmd_stats(&config, days, json),
    Command::Clear { source, range } => cmd_clear(&config, source, range.resolve(today())?),
    Command::Repair => cmd_repair(&config),
    Command::Warm { daemon } => cmd_warm(&config, daemon).await,
    Command::Receivables { action } => cmd_receivables(&config, action).await,
  }
}

async fn cmd_fetch(
  config: &Config,
  source: SourceArg,
  range: DateRange,
  force: bool,
  json: bool,
) -> Result<()> {
  let dashboard = Dashboard::open(config)?;

  let data = match source.source() {
    None => dashboard.fetch_all(range, force).await,
    Some(source) => {
      let result = dashboard.fetch(source, range, force).await;
      DashboardData {
        range,
        sources: vec![SourceSummary {
          source,
          served_from: result.source,
          count: result.data.len(),
          cached_at: result.cached_at,
        }],
        totals: Totals::of(&result.data),
        transactions: result.data,
      }
    }
  };

  if json {
    return print_json(&data);
  }

  print_transactions(&data.transactions);
  println!();
  let now = Utc::now();
  for summary in &data.sources {
    let age = summary
      .cached_at
      .map(|at| format!(", cached {}", format_age(at, now)))
      .unwrap_or_default();
    println!(
      "{}: {} transactions from {}{}",
      summary.source,
      summary.count,
      summary.served_from.label(),
      age
    );
  }
  println!(
    "Income {}  Expenses {}  Fees {}  Net {}",
    format_amount(data.totals.income),
    format_amount(data.totals.expenses),
    format_amount(data.totals.fees),
    format_amount(data.totals.net)
  );
  Ok(())
}

fn print_transactions(transactions: &[Transaction]) {
  println!(
    "{:<13} {:>13} {:<7} {:<8} DESCRIPTION",
    "DATE", "AMOUNT", "SOURCE", "TYPE"
  );
  for tx in transactions {
    println!(
      "{:<13} {:>13} {:<7} {:<8} {}",
      format_display_date(tx.date),
      format_amount(tx.signed_amount()),
      tx.source.as_str(),
      tx.kind.as_str(),
      truncate(&tx.description, 48)
    );
  }
}

fn cmd_plan(
  config: &Config,
  source: Source,
  range: DateRange,
  force: bool,
  json: bool,
) -> Result<()> {
  let dashboard = Dashboard::open(config)?;
  let plan = dashboard.plan(source, range, force)?;

  if json {
    return print_json(&plan);
  }
  print_plan(&plan);
  Ok(())
}

fn print_plan(plan: &QueryPlan) {
  println!("{} {}", plan.source, plan.range);
  for month in &plan.months {
    let action = match month.decision {
      CacheDecision::UseCache => "cache".to_string(),
      CacheDecision::FullRefresh => "fetch".to_string(),
      CacheDecision::PartialRefresh { from } => format!("fetch from {}", from),
    };
    println!(
      "  {:<10} {:<22} {:<20} {}",
      format_month_label(month.month),
      month.range.to_string(),
      action,
      month.reason
    );
  }
  println!(
    "{} API call(s), {:.0}% from cache",
    plan.estimated_api_calls,
    plan.cache_coverage * 100.0
  );
}

fn cmd_months(config: &Config, source: Option<Source>) -> Result<()> {
  let db = Database::open(&config.database_path()?)?;
  let storage = SqliteStorage::new(db);
  let months = storage.list_months(source)?;

  if months.is_empty() {
    println!("No cached months");
    return Ok(());
  }

  let now = Utc::now();
  println!(
    "{:<7} {:<10} {:<11} {:>6}  UPDATED",
    "SOURCE", "MONTH", "STATUS", "ROWS"
  );
  for entry in months {
    println!(
      "{:<7} {:<10} {:<11} {:>6}  {}",
      entry.source.as_str(),
      entry.month.to_string(),
      entry.status.as_str(),
      entry.transaction_count,
      format_age(entry.updated_at, now)
    );
  }
  Ok(())
}

fn cmd_stats(config: &Config, days: i64, json: bool) -> Result<()> {
  let db = Database::open(&config.database_path()?)?;
  let storage = SqliteStorage::new(db);
  let stats = CacheStats::collect(&storage, days)?;

  if json {
    return print_json(&stats);
  }

  let now = Utc::now();
  for source in &stats.per_source {
    let updated = source
      .newest_update
      .map(|at| format_age(at, now))
      .unwrap_or_else(|| "never".to_string());
    println!(
      "{}: {} months ({} complete), {} transactions, last update {}",
      source.source, source.months, source.complete_months, source.transactions, updated
    );
  }
  println!("{} cached transactions", stats.total_transactions());
  println!(
    "Last {} days: {} hits, {} misses, {} partial, {} refreshes",
    days, stats.hits, stats.misses, stats.partials, stats.refreshes
  );
  println!(
    "Hit rate {:.1}%, average {:.0} ms",
    stats.hit_rate * 100.0,
    stats.avg_duration_ms
  );
  Ok(())
}

fn cmd_clear(config: &Config, source: Source, range: DateRange) -> Result<()> {
  let dashboard = Dashboard::open(config)?;
  let deleted = dashboard.clear(source, range)?;
  println!("Deleted {} cached {} transactions in {}", deleted, source, range);
  Ok(())
}

fn cmd_repair(config: &Config) -> Result<()> {
  let db = Database::open(&config.database_path()?)?;
  let storage = SqliteStorage::new(db);
  let actions = storage.repair_monthly_counts()?;

  if actions.is_empty() {
    println!("All monthly counts match");
  }
  for action in actions {
    println!("{}", action);
  }
  Ok(())
}

async fn cmd_warm(config: &Config, daemon: bool) -> Result<()> {
  let dashboard = Dashboard::open(config)?;
  let warmer = PredictiveWarmer::new(dashboard, config.warmer.clone());

  let report = warmer.warm_once().await?;
  println!("{}", report);

  if daemon {
    let handle = warmer.start();
    tokio::signal::ctrl_c()
      .await
      .map_err(|e| eyre!("Failed to listen for ctrl-c: {}", e))?;
    handle.abort();
  }
  Ok(())
}

async fn cmd_receivables(config: &Config, action: ReceivablesCommand) -> Result<()> {
  let db = Database::open(&config.database_path()?)?;
  let store = ReceivablesStore::new(db);

  match action {
    ReceivablesCommand::List { source } => {
      let selections = store.list(source)?;
      if selections.is_empty() {
        println!("No receivables selected");
      }
      for s in selections {
        println!(
          "{:<7} {:<28} {}",
          s.source.as_str(),
          s.transaction_id,
          s.note.as_deref().unwrap_or("")
        );
      }
    }
    ReceivablesCommand::Select {
      source,
      transaction_id,
      note,
    } => {
      store.select(source, &transaction_id, note.as_deref())?;
      println!("Selected {} {}", source, transaction_id);
    }
    ReceivablesCommand::Deselect {
      source,
      transaction_id,
    } => {
      if store.deselect(source, &transaction_id)? {
        println!("Deselected {} {}", source, transaction_id);
      } else {
        println!("{} {} was not selected", source, transaction_id);
      }
    }
    ReceivablesCommand::Summary { range, json } => {
      let dashboard = Dashboard::open(config)?;
      let data = dashboard.fetch_all(range.resolve(today())?, false).await;
      let summary = store.summary(&data.transactions)?;

      if json {
        return print_json(&summary);
      }
      for source in &summary.per_source {
        println!(
          "{}: {} selected, {}",
          source.source,
          source.count,
          format_amount(source.total)
        );
      }
      println!("Total {}", format_amount(summary.total));
    }
  }
  Ok(())
}

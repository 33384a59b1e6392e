//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, NaiveDate, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::dates::{DateRange, YearMonth};
use crate::db::Database;
use crate::providers::{Source, Transaction, TransactionType};

/// Lifecycle of a monthly entry or segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
  /// A fetch for this month has started
  Processing,
  /// Every transaction of the month is stored
  Complete,
  /// Some transactions are stored, but the month needs a refresh
  Partial,
}

impl CacheStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheStatus::Processing => "processing",
      CacheStatus::Complete => "complete",
      CacheStatus::Partial => "partial",
    }
  }
}

impl FromStr for CacheStatus {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "processing" => Ok(CacheStatus::Processing),
      "complete" => Ok(CacheStatus::Complete),
      "partial" => Ok(CacheStatus::Partial),
      other => Err(eyre!("Unknown cache status '{}'", other)),
    }
  }
}

/// One row of `monthly_cache`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyCacheEntry {
  pub source: Source,
  pub month: YearMonth,
  pub transaction_count: i64,
  pub status: CacheStatus,
  pub updated_at: DateTime<Utc>,
}

/// One row of `cache_segments`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSegment {
  pub source: Source,
  pub range: DateRange,
  pub transaction_count: i64,
  pub status: CacheStatus,
  pub last_refreshed_at: DateTime<Utc>,
}

/// Kind of event recorded in `cache_metrics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheEvent {
  /// Served entirely from cache
  Hit,
  /// Nothing was cached
  Miss,
  /// Mixed cache and network, or some ranges failed
  Partial,
  /// Forced refetch
  Refresh,
}

impl CacheEvent {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheEvent::Hit => "hit",
      CacheEvent::Miss => "miss",
      CacheEvent::Partial => "partial",
      CacheEvent::Refresh => "refresh",
    }
  }
}

impl FromStr for CacheEvent {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "hit" => Ok(CacheEvent::Hit),
      "miss" => Ok(CacheEvent::Miss),
      "partial" => Ok(CacheEvent::Partial),
      "refresh" => Ok(CacheEvent::Refresh),
      other => Err(eyre!("Unknown cache event '{}'", other)),
    }
  }
}

/// One row of `cache_metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMetric {
  pub source: Source,
  pub event: CacheEvent,
  pub range: DateRange,
  pub transaction_count: i64,
  pub duration_ms: i64,
  pub recorded_at: DateTime<Utc>,
}

/// A monthly entry whose count was corrected by [`CacheStorage::repair_monthly_counts`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairAction {
  pub source: Source,
  pub month: YearMonth,
  /// Recorded count, or None when the entry was missing
  pub recorded: Option<i64>,
  pub actual: i64,
}

impl fmt::Display for RepairAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.recorded {
      Some(recorded) => write!(
        f,
        "{} {}: count {} -> {}",
        self.source, self.month, recorded, self.actual
      ),
      None => write!(
        f,
        "{} {}: created entry for {} orphaned rows",
        self.source, self.month, self.actual
      ),
    }
  }
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Replace a month's rows and mark it complete. Returns the stored count.
  fn store_month(&self, source: Source, month: YearMonth, transactions: &[Transaction])
    -> Result<i64>;

  /// Insert or update rows by `(source, identity)`. Returns rows written.
  fn upsert_transactions(&self, transactions: &[Transaction]) -> Result<usize>;

  /// Create or update a monthly entry's status without touching its count.
  fn mark_month(&self, source: Source, month: YearMonth, status: CacheStatus) -> Result<()>;

  /// Recount a month's rows and write the entry with `status`.
  fn refresh_month_count(&self, source: Source, month: YearMonth, status: CacheStatus)
    -> Result<i64>;

  fn get_month(&self, source: Source, month: YearMonth) -> Result<Option<MonthlyCacheEntry>>;

  fn list_months(&self, source: Option<Source>) -> Result<Vec<MonthlyCacheEntry>>;

  /// Cached rows in range, newest first.
  fn get_transactions(&self, source: Source, range: DateRange) -> Result<Vec<Transaction>>;

  fn count_transactions(&self, source: Source) -> Result<i64>;

  /// Remove rows in range, entries for fully covered months and overlapping
  /// segments. Partially covered months become `partial`. Returns rows deleted.
  fn delete_range(&self, source: Source, range: DateRange) -> Result<usize>;

  fn store_segment(
    &self,
    source: Source,
    range: DateRange,
    transaction_count: i64,
    status: CacheStatus,
  ) -> Result<()>;

  /// Most recently refreshed complete segment covering `range`.
  fn find_covering_segment(&self, source: Source, range: DateRange)
    -> Result<Option<CacheSegment>>;

  fn record_metric(&self, metric: &CacheMetric) -> Result<()>;

  fn metrics_since(&self, since: DateTime<Utc>) -> Result<Vec<CacheMetric>>;

  /// Bring every monthly count back in line with the stored rows.
  fn repair_monthly_counts(&self) -> Result<Vec<RepairAction>>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Backdate a monthly entry, for exercising freshness rules.
  #[cfg(test)]
  pub(crate) fn set_month_updated_at(
    &self,
    source: Source,
    month: YearMonth,
    at: DateTime<Utc>,
  ) -> Result<()> {
    self.db.conn()?.execute(
      "UPDATE monthly_cache SET updated_at = ? WHERE source = ? AND year = ? AND month = ?",
      params![format_ts(at), source.as_str(), month.year, month.month],
    )?;
    Ok(())
  }

  /// Overwrite a monthly count directly, for exercising repair.
  #[cfg(test)]
  pub(crate) fn set_month_count(&self, source: Source, month: YearMonth, count: i64) -> Result<()> {
    self.db.conn()?.execute(
      "UPDATE monthly_cache SET transaction_count = ? WHERE source = ? AND year = ? AND month = ?",
      params![count, source.as_str(), month.year, month.month],
    )?;
    Ok(())
  }
}

/// Timestamps are stored the way SQLite's datetime() writes them.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn format_ts(at: DateTime<Utc>) -> String {
  at.format(TS_FORMAT).to_string()
}

/// Parse a datetime string from SQLite format.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  chrono::NaiveDateTime::parse_from_str(s, TS_FORMAT)
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

fn parse_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| eyre!("Failed to parse date '{}': {}", s, e))
}

fn write_transaction(conn: &Connection, tx: &Transaction) -> Result<()> {
  let month = YearMonth::containing(tx.date);
  let metadata = tx
    .metadata
    .as_ref()
    .map(serde_json::to_string)
    .transpose()
    .map_err(|e| eyre!("Failed to serialize metadata for {}: {}", tx.id, e))?;

  conn
    .execute(
      "INSERT INTO cached_transactions
         (id, source, identity, external_id, date, year, month, amount, description,
          category, type, fees, gross, metadata, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
       ON CONFLICT(source, identity) DO UPDATE SET
         id = excluded.id,
         external_id = excluded.external_id,
         date = excluded.date,
         year = excluded.year,
         month = excluded.month,
         amount = excluded.amount,
         description = excluded.description,
         category = excluded.category,
         type = excluded.type,
         fees = excluded.fees,
         gross = excluded.gross,
         metadata = excluded.metadata,
         cached_at = excluded.cached_at",
      params![
        tx.id,
        tx.source.as_str(),
        tx.identity(),
        tx.external_id,
        tx.date.to_string(),
        month.year,
        month.month,
        tx.amount,
        tx.description,
        tx.category,
        tx.kind.as_str(),
        tx.fees,
        tx.gross,
        metadata,
        format_ts(Utc::now()),
      ],
    )
    .map_err(|e| eyre!("Failed to store transaction {}: {}", tx.id, e))?;

  Ok(())
}

fn count_month(conn: &Connection, source: Source, month: YearMonth) -> Result<i64> {
  conn
    .query_row(
      "SELECT COUNT(*) FROM cached_transactions WHERE source = ? AND year = ? AND month = ?",
      params![source.as_str(), month.year, month.month],
      |row| row.get(0),
    )
    .map_err(|e| eyre!("Failed to count {} rows for {}: {}", source, month, e))
}

fn write_month_entry(
  conn: &Connection,
  source: Source,
  month: YearMonth,
  count: i64,
  status: CacheStatus,
) -> Result<()> {
  conn
    .execute(
      "INSERT INTO monthly_cache (source, year, month, transaction_count, status, updated_at)
       VALUES (?, ?, ?, ?, ?, ?)
       ON CONFLICT(source, year, month) DO UPDATE SET
         transaction_count = excluded.transaction_count,
         status = excluded.status,
         updated_at = excluded.updated_at",
      params![
        source.as_str(),
        month.year,
        month.month,
        count,
        status.as_str(),
        format_ts(Utc::now())
      ],
    )
    .map_err(|e| eyre!("Failed to update monthly entry {} {}: {}", source, month, e))?;
  Ok(())
}

/// Raw `cached_transactions` columns, converted outside the rusqlite closure
/// so conversion errors carry context.
struct TransactionRow {
  id: String,
  source: String,
  external_id: Option<String>,
  date: String,
  amount: f64,
  description: String,
  category: String,
  kind: String,
  fees: Option<f64>,
  gross: Option<f64>,
  metadata: Option<String>,
}

impl TransactionRow {
  const COLUMNS: &'static str =
    "id, source, external_id, date, amount, description, category, type, fees, gross, metadata";

  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      source: row.get(1)?,
      external_id: row.get(2)?,
      date: row.get(3)?,
      amount: row.get(4)?,
      description: row.get(5)?,
      category: row.get(6)?,
      kind: row.get(7)?,
      fees: row.get(8)?,
      gross: row.get(9)?,
      metadata: row.get(10)?,
    })
  }

  fn into_transaction(self) -> Result<Transaction> {
    let metadata = self
      .metadata
      .as_deref()
      .map(serde_json::from_str)
      .transpose()
      .map_err(|e| eyre!("Failed to parse metadata for {}: {}", self.id, e))?;

    Ok(Transaction {
      source: self.source.parse()?,
      date: parse_date(&self.date)?,
      kind: self.kind.parse::<TransactionType>()?,
      id: self.id,
      external_id: self.external_id,
      amount: self.amount,
      description: self.description,
      category: self.category,
      fees: self.fees,
      gross: self.gross,
      metadata,
    })
  }
}

fn month_entry_from_row(row: &Row<'_>) -> rusqlite::Result<(String, i32, u32, i64, String, String)> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn into_month_entry(raw: (String, i32, u32, i64, String, String)) -> Result<MonthlyCacheEntry> {
  let (source, year, month, transaction_count, status, updated_at) = raw;
  Ok(MonthlyCacheEntry {
    source: source.parse()?,
    month: YearMonth::new(year, month)?,
    transaction_count,
    status: status.parse()?,
    updated_at: parse_datetime(&updated_at)?,
  })
}

impl CacheStorage for SqliteStorage {
  fn store_month(
    &self,
    source: Source,
    month: YearMonth,
    transactions: &[Transaction],
  ) -> Result<i64> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cached_transactions WHERE source = ? AND year = ? AND month = ?",
      params![source.as_str(), month.year, month.month],
    )
    .map_err(|e| eyre!("Failed to clear {} {}: {}", source, month, e))?;

    for transaction in transactions
      .iter()
      .filter(|t| t.source == source && YearMonth::containing(t.date) == month)
    {
      write_transaction(&tx, transaction)?;
    }

    let count = count_month(&tx, source, month)?;
    write_month_entry(&tx, source, month, count, CacheStatus::Complete)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(count)
  }

  fn upsert_transactions(&self, transactions: &[Transaction]) -> Result<usize> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for transaction in transactions {
      write_transaction(&tx, transaction)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(transactions.len())
  }

  fn mark_month(&self, source: Source, month: YearMonth, status: CacheStatus) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO monthly_cache (source, year, month, transaction_count, status, updated_at)
         VALUES (?, ?, ?, 0, ?, ?)
         ON CONFLICT(source, year, month) DO UPDATE SET status = excluded.status",
        params![
          source.as_str(),
          month.year,
          month.month,
          status.as_str(),
          format_ts(Utc::now())
        ],
      )
      .map_err(|e| eyre!("Failed to mark {} {} {}: {}", source, month, status.as_str(), e))?;
    Ok(())
  }

  fn refresh_month_count(
    &self,
    source: Source,
    month: YearMonth,
    status: CacheStatus,
  ) -> Result<i64> {
    let conn = self.db.conn()?;
    let count = count_month(&conn, source, month)?;
    write_month_entry(&conn, source, month, count, status)?;
    Ok(count)
  }

  fn get_month(&self, source: Source, month: YearMonth) -> Result<Option<MonthlyCacheEntry>> {
    let conn = self.db.conn()?;
    let raw = conn
      .query_row(
        "SELECT source, year, month, transaction_count, status, updated_at FROM monthly_cache
         WHERE source = ? AND year = ? AND month = ?",
        params![source.as_str(), month.year, month.month],
        month_entry_from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to load monthly entry {} {}: {}", source, month, e))?;

    raw.map(into_month_entry).transpose()
  }

  fn list_months(&self, source: Option<Source>) -> Result<Vec<MonthlyCacheEntry>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT source, year, month, transaction_count, status, updated_at FROM monthly_cache
         WHERE ?1 IS NULL OR source = ?1
         ORDER BY source, year DESC, month DESC",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![source.map(|s| s.as_str())], month_entry_from_row)
      .map_err(|e| eyre!("Failed to list monthly entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read monthly entry: {}", e))?;

    rows.into_iter().map(into_month_entry).collect()
  }

  fn get_transactions(&self, source: Source, range: DateRange) -> Result<Vec<Transaction>> {
    let conn = self.db.conn()?;
    let sql = format!(
      "SELECT {} FROM cached_transactions
       WHERE source = ? AND date >= ? AND date <= ?
       ORDER BY date DESC, id",
      TransactionRow::COLUMNS
    );
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(
        params![source.as_str(), range.start.to_string(), range.end.to_string()],
        TransactionRow::from_row,
      )
      .map_err(|e| eyre!("Failed to query transactions: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read transaction: {}", e))?;

    rows.into_iter().map(TransactionRow::into_transaction).collect()
  }

  fn count_transactions(&self, source: Source) -> Result<i64> {
    let conn = self.db.conn()?;
    conn
      .query_row(
        "SELECT COUNT(*) FROM cached_transactions WHERE source = ?",
        params![source.as_str()],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count {} transactions: {}", source, e))
  }

  fn delete_range(&self, source: Source, range: DateRange) -> Result<usize> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let start = range.start.to_string();
    let end = range.end.to_string();

    let deleted = tx
      .execute(
        "DELETE FROM cached_transactions WHERE source = ? AND date >= ? AND date <= ?",
        params![source.as_str(), start, end],
      )
      .map_err(|e| eyre!("Failed to delete transactions: {}", e))?;

    for month in range.months() {
      if range.covers_month(month) {
        tx.execute(
          "DELETE FROM monthly_cache WHERE source = ? AND year = ? AND month = ?",
          params![source.as_str(), month.year, month.month],
        )
        .map_err(|e| eyre!("Failed to delete monthly entry {}: {}", month, e))?;
      } else {
        let count = count_month(&tx, source, month)?;
        tx.execute(
          "UPDATE monthly_cache SET transaction_count = ?, status = ?
           WHERE source = ? AND year = ? AND month = ?",
          params![
            count,
            CacheStatus::Partial.as_str(),
            source.as_str(),
            month.year,
            month.month
          ],
        )
        .map_err(|e| eyre!("Failed to update monthly entry {}: {}", month, e))?;
      }
    }

    tx.execute(
      "DELETE FROM cache_segments WHERE source = ? AND start_date <= ? AND end_date >= ?",
      params![source.as_str(), end, start],
    )
    .map_err(|e| eyre!("Failed to delete segments: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted)
  }

  fn store_segment(
    &self,
    source: Source,
    range: DateRange,
    transaction_count: i64,
    status: CacheStatus,
  ) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO cache_segments
           (source, start_date, end_date, transaction_count, status, last_refreshed_at)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(source, start_date, end_date) DO UPDATE SET
           transaction_count = excluded.transaction_count,
           status = excluded.status,
           last_refreshed_at = excluded.last_refreshed_at",
        params![
          source.as_str(),
          range.start.to_string(),
          range.end.to_string(),
          transaction_count,
          status.as_str(),
          format_ts(Utc::now())
        ],
      )
      .map_err(|e| eyre!("Failed to store segment {}: {}", range, e))?;
    Ok(())
  }

  fn find_covering_segment(
    &self,
    source: Source,
    range: DateRange,
  ) -> Result<Option<CacheSegment>> {
    let conn = self.db.conn()?;
    let raw: Option<(String, String, i64, String, String)> = conn
      .query_row(
        "SELECT start_date, end_date, transaction_count, status, last_refreshed_at
         FROM cache_segments
         WHERE source = ? AND start_date <= ? AND end_date >= ? AND status = ?
         ORDER BY last_refreshed_at DESC
         LIMIT 1",
        params![
          source.as_str(),
          range.start.to_string(),
          range.end.to_string(),
          CacheStatus::Complete.as_str()
        ],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query segments: {}", e))?;

    raw
      .map(|(start, end, transaction_count, status, refreshed)| -> Result<CacheSegment> {
        Ok(CacheSegment {
          source,
          range: DateRange::new(parse_date(&start)?, parse_date(&end)?)?,
          transaction_count,
          status: status.parse()?,
          last_refreshed_at: parse_datetime(&refreshed)?,
        })
      })
      .transpose()
  }

  fn record_metric(&self, metric: &CacheMetric) -> Result<()> {
    let conn = self.db.conn()?;
    conn
      .execute(
        "INSERT INTO cache_metrics
           (source, event, start_date, end_date, transaction_count, duration_ms, recorded_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
          metric.source.as_str(),
          metric.event.as_str(),
          metric.range.start.to_string(),
          metric.range.end.to_string(),
          metric.transaction_count,
          metric.duration_ms,
          format_ts(metric.recorded_at)
        ],
      )
      .map_err(|e| eyre!("Failed to record metric: {}", e))?;
    Ok(())
  }

  fn metrics_since(&self, since: DateTime<Utc>) -> Result<Vec<CacheMetric>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT source, event, start_date, end_date, transaction_count, duration_ms, recorded_at
         FROM cache_metrics
         WHERE recorded_at >= ?
         ORDER BY recorded_at, id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    type RawMetric = (String, String, String, String, i64, i64, String);
    let rows: Vec<RawMetric> = stmt
      .query_map(params![format_ts(since)], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query metrics: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read metric: {}", e))?;

    rows
      .into_iter()
      .map(|(source, event, start, end, count, duration, recorded)| -> Result<CacheMetric> {
        Ok(CacheMetric {
          source: source.parse()?,
          event: event.parse()?,
          range: DateRange::new(parse_date(&start)?, parse_date(&end)?)?,
          transaction_count: count,
          duration_ms: duration,
          recorded_at: parse_datetime(&recorded)?,
        })
      })
      .collect()
  }

  fn repair_monthly_counts(&self) -> Result<Vec<RepairAction>> {
    let mut conn = self.db.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let mut actions = Vec::new();

    // Entries whose recorded count drifted from their rows
    {
      let mut stmt = tx
        .prepare(
          "SELECT m.source, m.year, m.month, m.transaction_count,
                  (SELECT COUNT(*) FROM cached_transactions t
                   WHERE t.source = m.source AND t.year = m.year AND t.month = m.month)
           FROM monthly_cache m",
        )
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let drifted: Vec<(String, i32, u32, i64, i64)> = stmt
        .query_map([], |row| {
          Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })
        .map_err(|e| eyre!("Failed to scan monthly entries: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read monthly entry: {}", e))?
        .into_iter()
        .filter(|(_, _, _, recorded, actual)| recorded != actual)
        .collect();

      for (source, year, month, recorded, actual) in drifted {
        actions.push(RepairAction {
          source: source.parse()?,
          month: YearMonth::new(year, month)?,
          recorded: Some(recorded),
          actual,
        });
      }
    }

    // Rows whose month has no entry at all
    {
      let mut stmt = tx
        .prepare(
          "SELECT t.source, t.year, t.month, COUNT(*) FROM cached_transactions t
           WHERE NOT EXISTS (
             SELECT 1 FROM monthly_cache m
             WHERE m.source = t.source AND m.year = t.year AND m.month = t.month)
           GROUP BY t.source, t.year, t.month",
        )
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let orphaned: Vec<(String, i32, u32, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
        .map_err(|e| eyre!("Failed to scan orphaned rows: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read orphaned rows: {}", e))?;

      for (source, year, month, actual) in orphaned {
        actions.push(RepairAction {
          source: source.parse()?,
          month: YearMonth::new(year, month)?,
          recorded: None,
          actual,
        });
      }
    }

    for action in &actions {
      match action.recorded {
        Some(_) => {
          tx.execute(
            "UPDATE monthly_cache SET transaction_count = ?
             WHERE source = ? AND year = ? AND month = ?",
            params![
              action.actual,
              action.source.as_str(),
              action.month.year,
              action.month.month
            ],
          )
          .map_err(|e| eyre!("Failed to repair {}: {}", action, e))?;
        }
        // Orphaned rows may not be the whole month
        None => write_month_entry(
          &tx,
          action.source,
          action.month,
          action.actual,
          CacheStatus::Partial,
        )?,
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(actions)
  }
}

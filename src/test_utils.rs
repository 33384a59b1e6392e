//! Shared fixtures for unit tests.

use chrono::NaiveDate;
use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{SqliteStorage, StalenessManager};
use crate::dates::DateRange;
use crate::db::Database;
use crate::providers::types::local_id;
use crate::providers::{Source, Transaction, TransactionSource, TransactionType};

pub fn tx(source: Source, external_id: &str, date: &str, amount: f64) -> Transaction {
  Transaction {
    id: local_id(source, external_id),
    external_id: Some(external_id.to_string()),
    date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
    amount,
    description: format!("transaction {}", external_id),
    category: "Sales".to_string(),
    source,
    kind: TransactionType::Income,
    fees: None,
    gross: None,
    metadata: None,
  }
}

pub fn storage() -> (Arc<SqliteStorage>, Arc<StalenessManager<SqliteStorage>>) {
  let storage = Arc::new(SqliteStorage::new(Database::open_in_memory().unwrap()));
  let staleness = Arc::new(StalenessManager::new(
    storage.clone(),
    chrono::Duration::minutes(5),
  ));
  (storage, staleness)
}

/// In-memory provider that serves a fixed set of rows and counts calls.
#[derive(Clone)]
pub struct FakeSource {
  pub source: Source,
  rows: Arc<Mutex<Vec<Transaction>>>,
  calls: Arc<AtomicU32>,
  requested: Arc<Mutex<Vec<DateRange>>>,
  fail: Arc<AtomicBool>,
}

impl FakeSource {
  pub fn new(source: Source, rows: Vec<Transaction>) -> Self {
    Self {
      source,
      rows: Arc::new(Mutex::new(rows)),
      calls: Arc::new(AtomicU32::new(0)),
      requested: Arc::new(Mutex::new(Vec::new())),
      fail: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn calls(&self) -> u32 {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn requested(&self) -> Vec<DateRange> {
    self.requested.lock().unwrap().clone()
  }

  pub fn set_failing(&self, fail: bool) {
    self.fail.store(fail, Ordering::SeqCst);
  }

  pub fn set_rows(&self, rows: Vec<Transaction>) {
    *self.rows.lock().unwrap() = rows;
  }
}

impl TransactionSource for FakeSource {
  fn source(&self) -> Source {
    self.source
  }

  async fn fetch_transactions(&self, range: DateRange) -> Result<Vec<Transaction>> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.requested.lock().unwrap().push(range);
    if self.fail.load(Ordering::SeqCst) {
      return Err(eyre!("provider offline"));
    }
    let rows = self.rows.lock().unwrap().clone();
    Ok(rows.into_iter().filter(|t| range.contains(t.date)).collect())
  }
}

//! Time-boxed staleness markers.
//!
//! Marking a range stale deletes its rows from storage and, for the length of
//! the stale window, forces every plan touching the range to refetch even if
//! something re-populated the monthly entry in the meantime.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use super::storage::CacheStorage;
use crate::dates::DateRange;
use crate::providers::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleMarker {
  pub range: DateRange,
  pub marked_at: DateTime<Utc>,
}

pub struct StalenessManager<S: CacheStorage> {
  storage: Arc<S>,
  markers: Mutex<HashMap<Source, Vec<StaleMarker>>>,
  window: Duration,
}

impl<S: CacheStorage> StalenessManager<S> {
  pub fn new(storage: Arc<S>, window: Duration) -> Self {
    Self {
      storage,
      markers: Mutex::new(HashMap::new()),
      window,
    }
  }

  fn markers(&self) -> MutexGuard<'_, HashMap<Source, Vec<StaleMarker>>> {
    // Markers are plain data; a panic elsewhere cannot leave them half-written.
    self.markers.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Mark a range stale and delete its cached rows. Returns rows deleted.
  pub fn mark_stale(&self, source: Source, range: DateRange) -> Result<usize> {
    self.mark_stale_at(source, range, Utc::now())
  }

  fn mark_stale_at(&self, source: Source, range: DateRange, now: DateTime<Utc>) -> Result<usize> {
    self.markers().entry(source).or_default().push(StaleMarker {
      range,
      marked_at: now,
    });

    let deleted = self.storage.delete_range(source, range)?;
    info!(%source, %range, deleted, "marked range stale");
    Ok(deleted)
  }

  /// True if an unexpired marker overlaps `range`.
  pub fn is_stale(&self, source: Source, range: DateRange) -> bool {
    self.is_stale_at(source, range, Utc::now())
  }

  fn is_stale_at(&self, source: Source, range: DateRange, now: DateTime<Utc>) -> bool {
    self
      .markers()
      .get(&source)
      .map(|markers| {
        markers
          .iter()
          .any(|m| now - m.marked_at < self.window && m.range.overlaps(&range))
      })
      .unwrap_or(false)
  }

  /// Drop markers overlapping `range`, typically after it was refetched.
  pub fn clear(&self, source: Source, range: DateRange) {
    if let Some(markers) = self.markers().get_mut(&source) {
      markers.retain(|m| !m.range.overlaps(&range));
    }
  }

  /// Remove expired markers. Returns how many were removed.
  pub fn prune(&self) -> usize {
    self.prune_at(Utc::now())
  }

  fn prune_at(&self, now: DateTime<Utc>) -> usize {
    let mut removed = 0;
    for markers in self.markers().values_mut() {
      let before = markers.len();
      markers.retain(|m| now - m.marked_at < self.window);
      removed += before - markers.len();
    }
    removed
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{CacheStorage, SqliteStorage};
  use crate::dates::YearMonth;
  use crate::db::Database;
  use crate::providers::{Transaction, TransactionType};

  fn manager() -> (Arc<SqliteStorage>, StalenessManager<SqliteStorage>) {
    let storage = Arc::new(SqliteStorage::new(Database::open_in_memory().unwrap()));
    let manager = StalenessManager::new(storage.clone(), Duration::minutes(5));
    (storage, manager)
  }

  fn range(start: &str, end: &str) -> DateRange {
    DateRange::parse(start, end).unwrap()
  }

  #[test]
  fn test_mark_stale_deletes_rows() {
    let (storage, manager) = manager();
    let month = YearMonth::new(2024, 3).unwrap();
    let tx = Transaction {
      id: "zoho-1".to_string(),
      external_id: Some("1".to_string()),
      date: month.first_day(),
      amount: 10.0,
      description: "deposit".to_string(),
      category: "Sales".to_string(),
      source: Source::Zoho,
      kind: TransactionType::Income,
      fees: None,
      gross: None,
      metadata: None,
    };
    storage.store_month(Source::Zoho, month, &[tx]).unwrap();

    let deleted = manager.mark_stale(Source::Zoho, month.range()).unwrap();
    assert_eq!(deleted, 1);
    assert!(storage.get_month(Source::Zoho, month).unwrap().is_none());
    assert!(manager.is_stale(Source::Zoho, month.range()));
  }

  #[test]
  fn test_overlap_and_source() {
    let (_, manager) = manager();
    manager
      .mark_stale(Source::Stripe, range("2024-03-10", "2024-03-20"))
      .unwrap();

    assert!(manager.is_stale(Source::Stripe, range("2024-03-01", "2024-03-10")));
    assert!(!manager.is_stale(Source::Stripe, range("2024-03-21", "2024-03-31")));
    assert!(!manager.is_stale(Source::Zoho, range("2024-03-01", "2024-03-31")));
  }

  #[test]
  fn test_markers_expire() {
    let (_, manager) = manager();
    let r = range("2024-03-01", "2024-03-31");
    let then = Utc::now() - Duration::minutes(10);
    manager.mark_stale_at(Source::Zoho, r, then).unwrap();

    assert!(!manager.is_stale(Source::Zoho, r));
    assert!(manager.is_stale_at(Source::Zoho, r, then + Duration::minutes(4)));
    assert_eq!(manager.prune(), 1);
    assert_eq!(manager.prune(), 0);
  }

  #[test]
  fn test_clear_after_refresh() {
    let (_, manager) = manager();
    let r = range("2024-03-01", "2024-03-31");
    manager.mark_stale(Source::Zoho, r).unwrap();
    manager.clear(Source::Zoho, range("2024-03-15", "2024-03-15"));
    assert!(!manager.is_stale(Source::Zoho, r));
  }
}

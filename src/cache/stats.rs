//! Aggregate statistics over the monthly entries and the metrics log.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use serde::Serialize;

use super::storage::{CacheEvent, CacheStatus, CacheStorage};
use crate::providers::Source;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStats {
  pub source: Source,
  pub months: usize,
  pub complete_months: usize,
  pub transactions: i64,
  pub oldest_update: Option<DateTime<Utc>>,
  pub newest_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
  pub since: DateTime<Utc>,
  pub per_source: Vec<SourceStats>,
  pub hits: usize,
  pub misses: usize,
  pub partials: usize,
  pub refreshes: usize,
  /// Hits over all non-forced requests, 0 when there were none
  pub hit_rate: f64,
  pub avg_duration_ms: f64,
}

impl CacheStats {
  /// Collect statistics for the last `days` days.
  pub fn collect<S: CacheStorage>(storage: &S, days: i64) -> Result<Self> {
    Self::collect_since(storage, Utc::now() - Duration::days(days))
  }

  pub fn collect_since<S: CacheStorage>(storage: &S, since: DateTime<Utc>) -> Result<Self> {
    let mut per_source = Vec::with_capacity(Source::ALL.len());
    for source in Source::ALL {
      let months = storage.list_months(Some(source))?;
      per_source.push(SourceStats {
        source,
        months: months.len(),
        complete_months: months
          .iter()
          .filter(|m| m.status == CacheStatus::Complete)
          .count(),
        transactions: storage.count_transactions(source)?,
        oldest_update: months.iter().map(|m| m.updated_at).min(),
        newest_update: months.iter().map(|m| m.updated_at).max(),
      });
    }

    let metrics = storage.metrics_since(since)?;
    let count = |event: CacheEvent| metrics.iter().filter(|m| m.event == event).count();
    let (hits, misses, partials, refreshes) = (
      count(CacheEvent::Hit),
      count(CacheEvent::Miss),
      count(CacheEvent::Partial),
      count(CacheEvent::Refresh),
    );

    let lookups = hits + misses + partials;
    let hit_rate = if lookups == 0 {
      0.0
    } else {
      hits as f64 / lookups as f64
    };
    let avg_duration_ms = if metrics.is_empty() {
      0.0
    } else {
      metrics.iter().map(|m| m.duration_ms as f64).sum::<f64>() / metrics.len() as f64
    };

    Ok(Self {
      since,
      per_source,
      hits,
      misses,
      partials,
      refreshes,
      hit_rate,
      avg_duration_ms,
    })
  }

  pub fn total_transactions(&self) -> i64 {
    self.per_source.iter().map(|s| s.transactions).sum()
  }
}

//! Executes a [`QueryPlan`]: fetch what must be fetched, store it back per
//! month, read the rest from cache and merge.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use super::intelligence::{CacheDecision, MonthPlan, QueryPlan};
use super::staleness::StalenessManager;
use super::storage::{CacheEvent, CacheMetric, CacheStatus, CacheStorage};
use crate::dates::DateRange;
use crate::providers::{Source, Transaction, TransactionSource};

#[derive(Debug, Clone)]
pub struct HybridResult {
  /// Merged rows, newest first
  pub transactions: Vec<Transaction>,
  /// Fetch ranges that failed and were served from whatever was cached
  pub failed_ranges: Vec<DateRange>,
  pub event: CacheEvent,
  pub oldest_cached_at: Option<DateTime<Utc>>,
}

pub struct HybridDataService<S: CacheStorage> {
  storage: Arc<S>,
  staleness: Arc<StalenessManager<S>>,
}

impl<S: CacheStorage> HybridDataService<S> {
  pub fn new(storage: Arc<S>, staleness: Arc<StalenessManager<S>>) -> Self {
    Self { storage, staleness }
  }

  pub async fn execute<C: TransactionSource>(
    &self,
    plan: &QueryPlan,
    client: &C,
  ) -> Result<HybridResult> {
    let started = Instant::now();
    let source = plan.source;

    // Let concurrent planners see that these months are being filled
    for month in plan
      .months
      .iter()
      .filter(|m| m.aligned && m.decision == CacheDecision::FullRefresh)
    {
      self
        .storage
        .mark_month(source, month.month, CacheStatus::Processing)?;
    }

    let fetches: Vec<_> = plan
      .fetch_ranges
      .iter()
      .map(|range| client.fetch_transactions(*range))
      .collect();
    let outcomes = futures::future::join_all(fetches).await;

    let mut fetched = Vec::new();
    let mut failed_ranges = Vec::new();
    for (range, outcome) in plan.fetch_ranges.iter().zip(outcomes) {
      match outcome {
        Ok(rows) => fetched.extend(rows),
        Err(e) => {
          warn!(%source, %range, error = %e, "fetch failed, falling back to cache");
          failed_ranges.push(*range);
        }
      }
    }

    for month in &plan.months {
      let Some(fetch) = month.fetch else {
        continue;
      };
      if failed_ranges.iter().any(|r| r.covers(&fetch)) {
        self.mark_failed(source, month)?;
        continue;
      }

      let rows: Vec<Transaction> = fetched
        .iter()
        .filter(|t| fetch.contains(t.date))
        .cloned()
        .collect();
      self.persist(plan, month, fetch, &rows)?;
      self.staleness.clear(source, fetch);
    }

    let mut cached = Vec::new();
    for range in plan.cached_ranges.iter().chain(&failed_ranges) {
      cached.extend(self.storage.get_transactions(source, *range)?);
    }

    let cached_count = cached.len();
    let fetched_count = fetched.len();
    let transactions = merge(cached, fetched);

    let event = if plan.force {
      CacheEvent::Refresh
    } else if plan.fetch_ranges.is_empty() {
      CacheEvent::Hit
    } else if plan.cached_ranges.is_empty() && failed_ranges.is_empty() {
      CacheEvent::Miss
    } else {
      CacheEvent::Partial
    };

    let duration_ms = started.elapsed().as_millis() as i64;
    let metric = CacheMetric {
      source,
      event,
      range: plan.range,
      transaction_count: transactions.len() as i64,
      duration_ms,
      recorded_at: Utc::now(),
    };
    if let Err(e) = self.storage.record_metric(&metric) {
      warn!(error = %e, "failed to record cache metric");
    }

    info!(
      %source,
      range = %plan.range,
      event = event.as_str(),
      cached = cached_count,
      fetched = fetched_count,
      duration_ms,
      "served transactions"
    );

    Ok(HybridResult {
      transactions,
      failed_ranges,
      event,
      oldest_cached_at: plan.oldest_cached_at(),
    })
  }

  /// Write fetched rows for one month piece back to the cache.
  fn persist(
    &self,
    plan: &QueryPlan,
    month: &MonthPlan,
    fetch: DateRange,
    rows: &[Transaction],
  ) -> Result<()> {
    let source = plan.source;

    match month.decision {
      CacheDecision::FullRefresh if month.aligned => {
        self.storage.store_month(source, month.month, rows)?;
      }
      CacheDecision::FullRefresh => {
        self.storage.upsert_transactions(rows)?;
        self
          .storage
          .store_segment(source, fetch, rows.len() as i64, CacheStatus::Complete)?;
        // The rest of the month was not refetched
        self
          .storage
          .refresh_month_count(source, month.month, CacheStatus::Partial)?;
      }
      CacheDecision::PartialRefresh { .. } => {
        self.storage.upsert_transactions(rows)?;
        let reaches_month_end = fetch.end == month.month.last_day();
        let complete = reaches_month_end
          && (fetch.start == month.month.first_day()
            || month.entry_status == Some(CacheStatus::Complete));
        let status = if complete {
          CacheStatus::Complete
        } else {
          CacheStatus::Partial
        };
        self.storage.refresh_month_count(source, month.month, status)?;
      }
      CacheDecision::UseCache => {}
    }

    Ok(())
  }

  fn mark_failed(&self, source: Source, month: &MonthPlan) -> Result<()> {
    // A piece that never had an entry stays absent so the next plan retries it
    let has_entry = month.entry_status.is_some()
      || (month.aligned && month.decision == CacheDecision::FullRefresh);
    if has_entry {
      self
        .storage
        .mark_month(source, month.month, CacheStatus::Partial)?;
    }
    Ok(())
  }
}

/// Merge cached and fetched rows: fetched rows win, keyed by id and date.
pub fn merge(cached: Vec<Transaction>, fetched: Vec<Transaction>) -> Vec<Transaction> {
  let mut by_key: HashMap<_, Transaction> = HashMap::with_capacity(cached.len() + fetched.len());
  for tx in cached.into_iter().chain(fetched) {
    by_key.insert(tx.merge_key(), tx);
  }

  let mut merged: Vec<Transaction> = by_key.into_values().collect();
  merged.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));
  merged
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::intelligence::{FreshnessPolicy, QueryOptimizer};
  use crate::cache::storage::SqliteStorage;
  use crate::config::CacheConfig;
  use crate::dates::YearMonth;
  use crate::test_utils::{self, tx, FakeSource};

  struct Harness {
    storage: Arc<SqliteStorage>,
    optimizer: QueryOptimizer<SqliteStorage>,
    service: HybridDataService<SqliteStorage>,
  }

  fn harness() -> Harness {
    let (storage, staleness) = test_utils::storage();
    let policy = FreshnessPolicy::from_config(&CacheConfig::default());
    Harness {
      optimizer: QueryOptimizer::new(storage.clone(), staleness.clone(), policy),
      service: HybridDataService::new(storage.clone(), staleness),
      storage,
    }
  }

  fn range(start: &str, end: &str) -> DateRange {
    DateRange::parse(start, end).unwrap()
  }

  #[tokio::test]
  async fn test_cold_miss_then_hit() {
    let h = harness();
    let client = FakeSource::new(
      Source::Stripe,
      vec![
        tx(Source::Stripe, "a", "2020-03-02", 10.0),
        tx(Source::Stripe, "b", "2020-03-20", 20.0),
        tx(Source::Stripe, "c", "2020-04-01", 30.0),
      ],
    );
    let march = range("2020-03-01", "2020-03-31");

    let plan = h.optimizer.plan(Source::Stripe, march, false).unwrap();
    let first = h.service.execute(&plan, &client).await.unwrap();
    assert_eq!(first.event, CacheEvent::Miss);
    assert_eq!(first.transactions.len(), 2);
    assert_eq!(first.transactions[0].date.to_string(), "2020-03-20");

    let entry = h
      .storage
      .get_month(Source::Stripe, YearMonth::new(2020, 3).unwrap())
      .unwrap()
      .unwrap();
    assert_eq!(entry.status, CacheStatus::Complete);
    assert_eq!(entry.transaction_count, 2);

    let plan = h.optimizer.plan(Source::Stripe, march, false).unwrap();
    let second = h.service.execute(&plan, &client).await.unwrap();
    assert_eq!(second.event, CacheEvent::Hit);
    assert_eq!(second.transactions.len(), 2);
    assert_eq!(client.calls(), 1);
  }

  #[tokio::test]
  async fn test_mixed_plan_fetches_only_missing_month() {
    let h = harness();
    let february = YearMonth::new(2020, 2).unwrap();
    h.storage
      .store_month(
        Source::Stripe,
        february,
        &[tx(Source::Stripe, "a", "2020-02-10", 5.0)],
      )
      .unwrap();
    let client = FakeSource::new(
      Source::Stripe,
      vec![tx(Source::Stripe, "b", "2020-03-10", 7.0)],
    );

    let plan = h
      .optimizer
      .plan(Source::Stripe, range("2020-02-01", "2020-03-31"), false)
      .unwrap();
    let result = h.service.execute(&plan, &client).await.unwrap();

    assert_eq!(result.event, CacheEvent::Partial);
    assert_eq!(result.transactions.len(), 2);
    assert_eq!(client.requested(), vec![range("2020-03-01", "2020-03-31")]);
    assert!(result.oldest_cached_at.is_some());
  }

  #[tokio::test]
  async fn test_forced_refresh_prefers_fetched_rows() {
    let h = harness();
    let month = YearMonth::new(2020, 2).unwrap();
    h.storage
      .store_month(
        Source::Stripe,
        month,
        &[tx(Source::Stripe, "a", "2020-02-10", 10.0)],
      )
      .unwrap();
    let client = FakeSource::new(
      Source::Stripe,
      vec![tx(Source::Stripe, "a", "2020-02-10", 12.5)],
    );

    let plan = h.optimizer.plan(Source::Stripe, month.range(), true).unwrap();
    let result = h.service.execute(&plan, &client).await.unwrap();

    assert_eq!(result.event, CacheEvent::Refresh);
    assert_eq!(result.transactions.len(), 1);
    assert_eq!(result.transactions[0].amount, 12.5);
    let stored = h.storage.get_transactions(Source::Stripe, month.range()).unwrap();
    assert_eq!(stored[0].amount, 12.5);
  }

  #[tokio::test]
  async fn test_failed_fetch_serves_cache_and_marks_partial() {
    let h = harness();
    let month = YearMonth::new(2020, 5).unwrap();
    h.storage
      .store_month(
        Source::Stripe,
        month,
        &[tx(Source::Stripe, "a", "2020-05-04", 10.0)],
      )
      .unwrap();
    h.storage
      .set_month_updated_at(Source::Stripe, month, Utc::now() - chrono::Duration::days(30))
      .unwrap();

    let client = FakeSource::new(Source::Stripe, Vec::new());
    client.set_failing(true);

    let plan = h.optimizer.plan(Source::Stripe, month.range(), false).unwrap();
    assert_eq!(plan.months[0].decision, CacheDecision::FullRefresh);
    let result = h.service.execute(&plan, &client).await.unwrap();

    assert_eq!(result.failed_ranges, vec![month.range()]);
    assert_eq!(result.event, CacheEvent::Partial);
    assert_eq!(result.transactions.len(), 1);
    let entry = h.storage.get_month(Source::Stripe, month).unwrap().unwrap();
    assert_eq!(entry.status, CacheStatus::Partial);
  }

  #[tokio::test]
  async fn test_failed_cold_fetch_leaves_no_entry_behind() {
    let h = harness();
    let client = FakeSource::new(Source::Stripe, Vec::new());
    client.set_failing(true);

    let piece = range("2020-06-05", "2020-06-12");
    let plan = h.optimizer.plan(Source::Stripe, piece, false).unwrap();
    let result = h.service.execute(&plan, &client).await.unwrap();

    assert!(result.transactions.is_empty());
    assert!(h
      .storage
      .get_month(Source::Stripe, YearMonth::new(2020, 6).unwrap())
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_unaligned_piece_records_segment() {
    let h = harness();
    let client = FakeSource::new(
      Source::Stripe,
      vec![
        tx(Source::Stripe, "a", "2020-03-06", 1.0),
        tx(Source::Stripe, "b", "2020-03-25", 2.0),
      ],
    );
    let piece = range("2020-03-05", "2020-03-20");

    let plan = h.optimizer.plan(Source::Stripe, piece, false).unwrap();
    let result = h.service.execute(&plan, &client).await.unwrap();
    assert_eq!(result.transactions.len(), 1);

    let segment = h
      .storage
      .find_covering_segment(Source::Stripe, piece)
      .unwrap()
      .unwrap();
    assert_eq!(segment.transaction_count, 1);
    let entry = h
      .storage
      .get_month(Source::Stripe, YearMonth::new(2020, 3).unwrap())
      .unwrap()
      .unwrap();
    assert_eq!(entry.status, CacheStatus::Partial);

    // the segment now answers the same piece
    let plan = h.optimizer.plan(Source::Stripe, piece, false).unwrap();
    assert!(plan.is_full_hit());
  }

  #[tokio::test]
  async fn test_aging_current_month_refetches_tail() {
    let h = harness();
    let now = Utc::now();
    let today = now.date_naive();
    let month = YearMonth::containing(today);
    h.storage
      .store_month(
        Source::Zoho,
        month,
        &[tx(Source::Zoho, "old", &month.first_day().to_string(), 10.0)],
      )
      .unwrap();
    // past the 60 minute TTL but inside twice that
    let updated_at = now - chrono::Duration::minutes(90);
    h.storage
      .set_month_updated_at(Source::Zoho, month, updated_at)
      .unwrap();

    let client = FakeSource::new(
      Source::Zoho,
      vec![
        tx(Source::Zoho, "old", &month.first_day().to_string(), 10.0),
        tx(Source::Zoho, "new", &today.to_string(), 25.0),
      ],
    );

    let plan = h.optimizer.plan(Source::Zoho, month.range(), false).unwrap();
    let from = (updated_at.date_naive() - chrono::Duration::days(1)).max(month.first_day());
    assert_eq!(plan.months[0].decision, CacheDecision::PartialRefresh { from });

    let result = h.service.execute(&plan, &client).await.unwrap();
    assert_eq!(
      client.requested(),
      vec![DateRange::new(from, month.last_day()).unwrap()]
    );
    assert_eq!(result.transactions.len(), 2);

    let entry = h.storage.get_month(Source::Zoho, month).unwrap().unwrap();
    assert_eq!(entry.status, CacheStatus::Complete);
    assert_eq!(entry.transaction_count, 2);
    assert!(entry.updated_at > updated_at);
  }

  #[tokio::test]
  async fn test_partial_month_refetch_completes_entry() {
    let h = harness();
    let month = YearMonth::new(2020, 8).unwrap();
    h.storage
      .store_month(
        Source::Zoho,
        month,
        &[tx(Source::Zoho, "a", "2020-08-03", 4.0)],
      )
      .unwrap();
    h.storage
      .mark_month(Source::Zoho, month, CacheStatus::Partial)
      .unwrap();

    let client = FakeSource::new(
      Source::Zoho,
      vec![
        tx(Source::Zoho, "a", "2020-08-03", 4.0),
        tx(Source::Zoho, "b", "2020-08-19", 6.0),
      ],
    );
    let plan = h.optimizer.plan(Source::Zoho, month.range(), false).unwrap();
    h.service.execute(&plan, &client).await.unwrap();

    assert_eq!(client.requested(), vec![month.range()]);
    let entry = h.storage.get_month(Source::Zoho, month).unwrap().unwrap();
    assert_eq!(entry.status, CacheStatus::Complete);
    assert_eq!(entry.transaction_count, 2);
  }

  /// Records the month's entry status at the moment it is fetched.
  #[derive(Clone)]
  struct StatusObserver {
    storage: Arc<SqliteStorage>,
    seen: Arc<std::sync::Mutex<Vec<Option<CacheStatus>>>>,
  }

  impl TransactionSource for StatusObserver {
    fn source(&self) -> Source {
      Source::Stripe
    }

    async fn fetch_transactions(&self, range: DateRange) -> Result<Vec<Transaction>> {
      let month = YearMonth::containing(range.start);
      let status = self
        .storage
        .get_month(Source::Stripe, month)?
        .map(|entry| entry.status);
      self.seen.lock().unwrap().push(status);
      Ok(Vec::new())
    }
  }

  #[tokio::test]
  async fn test_months_marked_processing_during_fetch() {
    let h = harness();
    let client = StatusObserver {
      storage: h.storage.clone(),
      seen: Arc::new(std::sync::Mutex::new(Vec::new())),
    };
    let plan = h
      .optimizer
      .plan(Source::Stripe, range("2020-09-01", "2020-10-31"), false)
      .unwrap();
    h.service.execute(&plan, &client).await.unwrap();

    let seen = client.seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|s| *s == Some(CacheStatus::Processing)));

    let entry = h
      .storage
      .get_month(Source::Stripe, YearMonth::new(2020, 9).unwrap())
      .unwrap()
      .unwrap();
    assert_eq!(entry.status, CacheStatus::Complete);
  }

  #[test]
  fn test_merge_dedups_and_sorts() {
    let cached = vec![
      tx(Source::Zoho, "1", "2024-01-05", 10.0),
      tx(Source::Zoho, "2", "2024-01-09", 3.0),
    ];
    let fetched = vec![
      tx(Source::Zoho, "1", "2024-01-05", 11.0),
      tx(Source::Zoho, "3", "2024-01-07", 4.0),
    ];

    let merged = merge(cached, fetched);
    let ids: Vec<&str> = merged.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["zoho-2", "zoho-3", "zoho-1"]);
    assert_eq!(merged[2].amount, 11.0);
  }
}

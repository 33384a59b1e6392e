//! Background prefetch of the months a user is likely to open next.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use super::storage::CacheStorage;
use crate::config::WarmerConfig;
use crate::dates::YearMonth;
use crate::providers::{Source, TransactionSource};
use crate::repository::Dashboard;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
  pub warmed: usize,
  pub skipped: usize,
  pub failed: usize,
}

impl fmt::Display for WarmReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} warmed, {} already cached, {} failed",
      self.warmed, self.skipped, self.failed
    )
  }
}

pub struct PredictiveWarmer<Z: TransactionSource, T: TransactionSource, S: CacheStorage> {
  dashboard: Dashboard<Z, T, S>,
  config: WarmerConfig,
}

impl<Z: TransactionSource, T: TransactionSource, S: CacheStorage> PredictiveWarmer<Z, T, S> {
  pub fn new(dashboard: Dashboard<Z, T, S>, config: WarmerConfig) -> Self {
    Self { dashboard, config }
  }

  /// Months to keep warm, most recent first.
  pub fn predict(&self) -> Result<Vec<YearMonth>> {
    self.predict_at(Utc::now())
  }

  fn predict_at(&self, now: DateTime<Utc>) -> Result<Vec<YearMonth>> {
    let current = YearMonth::containing(now.date_naive());
    let mut months = vec![current, current.prev()];

    let since = now - Duration::days(self.config.lookback_days);
    let mut requested: HashMap<YearMonth, usize> = HashMap::new();
    for metric in self.dashboard.storage.metrics_since(since)? {
      for month in metric.range.months() {
        *requested.entry(month).or_default() += 1;
      }
    }

    let mut popular: Vec<(YearMonth, usize)> = requested
      .into_iter()
      .filter(|(month, _)| !months.contains(month))
      .collect();
    popular.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    months.extend(
      popular
        .into_iter()
        .take(self.config.max_predictions)
        .map(|(month, _)| month),
    );

    months.sort_by(|a, b| b.cmp(a));
    Ok(months)
  }

  /// Fetch every predicted month that is not already cached.
  pub async fn warm_once(&self) -> Result<WarmReport> {
    let months = self.predict()?;
    let mut report = WarmReport::default();

    for source in Source::ALL {
      for month in &months {
        match self.dashboard.warm(source, month.range()).await {
          Ok(true) => report.warmed += 1,
          Ok(false) => report.skipped += 1,
          Err(e) => {
            warn!(%source, %month, error = %e, "failed to warm month");
            report.failed += 1;
          }
        }
      }
    }

    Ok(report)
  }

  /// Spawn a task that warms the cache every `interval_minutes`.
  pub fn start(self) -> JoinHandle<()> {
    let period = std::time::Duration::from_secs(self.config.interval_minutes.max(1) * 60);
    info!(
      "Starting cache warmer: every {} minutes",
      self.config.interval_minutes
    );

    tokio::spawn(async move {
      let mut ticker = interval(period);

      // First tick completes immediately
      ticker.tick().await;

      loop {
        ticker.tick().await;

        match self.warm_once().await {
          Ok(report) => info!("Cache warm completed: {}", report),
          Err(e) => error!("Cache warm failed: {}", e),
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{CacheEvent, CacheMetric, SqliteStorage};
  use crate::config::Config;
  use crate::dates::DateRange;
  use crate::test_utils::{self, FakeSource};
  use chrono::TimeZone;

  fn warmer(
    zoho: FakeSource,
    stripe: FakeSource,
    max_predictions: usize,
  ) -> PredictiveWarmer<FakeSource, FakeSource, SqliteStorage> {
    let (storage, _) = test_utils::storage();
    let dashboard = Dashboard::new(zoho, stripe, storage, &Config::default());
    PredictiveWarmer::new(
      dashboard,
      WarmerConfig {
        max_predictions,
        ..WarmerConfig::default()
      },
    )
  }

  fn requested(storage: &SqliteStorage, start: &str, end: &str, times: usize) {
    for _ in 0..times {
      storage
        .record_metric(&CacheMetric {
          source: Source::Zoho,
          event: CacheEvent::Hit,
          range: DateRange::parse(start, end).unwrap(),
          transaction_count: 0,
          duration_ms: 1,
          recorded_at: Utc::now(),
        })
        .unwrap();
    }
  }

  fn ym(year: i32, month: u32) -> YearMonth {
    YearMonth::new(year, month).unwrap()
  }

  #[test]
  fn test_predict_without_history() {
    let w = warmer(
      FakeSource::new(Source::Zoho, Vec::new()),
      FakeSource::new(Source::Stripe, Vec::new()),
      3,
    );
    let now = Utc.with_ymd_and_hms(2024, 1, 15, 12, 0, 0).unwrap();
    assert_eq!(w.predict_at(now).unwrap(), vec![ym(2024, 1), ym(2023, 12)]);
  }

  #[test]
  fn test_predict_adds_popular_months() {
    let w = warmer(
      FakeSource::new(Source::Zoho, Vec::new()),
      FakeSource::new(Source::Stripe, Vec::new()),
      2,
    );
    let storage = w.dashboard.storage.clone();
    requested(&storage, "2020-01-01", "2020-01-31", 3);
    requested(&storage, "2020-03-01", "2020-04-30", 2);
    requested(&storage, "2019-06-01", "2019-06-30", 1);

    let predicted = w.predict().unwrap();
    let current = YearMonth::containing(Utc::now().date_naive());
    // April and March tie, the more recent wins
    assert_eq!(
      predicted,
      vec![current, current.prev(), ym(2020, 4), ym(2020, 1)]
    );
  }

  #[tokio::test]
  async fn test_warm_once_then_skip() {
    let zoho = FakeSource::new(Source::Zoho, Vec::new());
    let stripe = FakeSource::new(Source::Stripe, Vec::new());
    let w = warmer(zoho.clone(), stripe.clone(), 3);

    let first = w.warm_once().await.unwrap();
    assert_eq!(first.warmed, 4);
    assert_eq!(first.failed, 0);
    assert_eq!(zoho.calls(), 2);

    let second = w.warm_once().await.unwrap();
    assert_eq!(second.skipped, 4);
    assert_eq!(zoho.calls(), 2);
  }

  #[tokio::test]
  async fn test_warm_once_counts_failures() {
    let zoho = FakeSource::new(Source::Zoho, Vec::new());
    zoho.set_failing(true);
    let w = warmer(zoho, FakeSource::new(Source::Stripe, Vec::new()), 3);

    let report = w.warm_once().await.unwrap();
    assert_eq!(report.failed, 2);
    assert_eq!(report.warmed, 2);
  }
}

//! Freshness rules and query planning.
//!
//! A request range is split into calendar-month pieces. Each piece gets a
//! [`CacheDecision`] from its monthly entry (or, for pieces that do not cover
//! a whole month, from a covering segment), and the pieces are folded into a
//! [`QueryPlan`] listing which sub-ranges come from cache and which must be
//! fetched. Adjacent fetch ranges are merged so a multi-month miss costs one
//! provider call.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use super::staleness::StalenessManager;
use super::storage::{CacheStatus, CacheStorage, MonthlyCacheEntry};
use crate::config::CacheConfig;
use crate::dates::{coalesce, DateRange, YearMonth};
use crate::providers::Source;

/// What to do with one month piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CacheDecision {
  UseCache,
  /// Refetch from `from` to the end of the piece and upsert
  PartialRefresh { from: NaiveDate },
  FullRefresh,
}

/// Age of a monthly entry against the TTL that applies to its month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
  pub age: Duration,
  pub ttl: Duration,
}

impl Freshness {
  pub fn is_fresh(&self) -> bool {
    self.age <= self.ttl
  }
}

#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
  pub current_month_ttl: Duration,
  pub previous_month_ttl: Duration,
  pub historical_ttl: Duration,
  pub processing_timeout: Duration,
  pub segment_ttl: Duration,
}

impl FreshnessPolicy {
  pub fn from_config(config: &CacheConfig) -> Self {
    Self {
      current_month_ttl: Duration::minutes(config.current_month_ttl_minutes),
      previous_month_ttl: Duration::minutes(config.previous_month_ttl_minutes),
      historical_ttl: Duration::minutes(config.historical_ttl_minutes),
      processing_timeout: Duration::minutes(config.processing_timeout_minutes),
      segment_ttl: Duration::minutes(config.segment_ttl_minutes),
    }
  }

  /// Recent months change more often, so they expire sooner.
  pub fn ttl_for(&self, month: YearMonth, now: DateTime<Utc>) -> Duration {
    let current = YearMonth::containing(now.date_naive());
    match current.months_since(month) {
      n if n <= 0 => self.current_month_ttl,
      1 => self.previous_month_ttl,
      _ => self.historical_ttl,
    }
  }

  pub fn freshness(&self, entry: &MonthlyCacheEntry, now: DateTime<Utc>) -> Freshness {
    Freshness {
      age: now - entry.updated_at,
      ttl: self.ttl_for(entry.month, now),
    }
  }

  /// Decide what to do with a whole month.
  pub fn decide(
    &self,
    month: YearMonth,
    entry: Option<&MonthlyCacheEntry>,
    stale: bool,
    now: DateTime<Utc>,
  ) -> (CacheDecision, &'static str) {
    if stale {
      return (CacheDecision::FullRefresh, "marked stale");
    }

    let Some(entry) = entry else {
      return (CacheDecision::FullRefresh, "not cached");
    };

    match entry.status {
      CacheStatus::Processing => {
        if now - entry.updated_at > self.processing_timeout {
          (CacheDecision::FullRefresh, "processing timed out")
        } else {
          (CacheDecision::UseCache, "fetch in progress")
        }
      }
      CacheStatus::Partial => (
        CacheDecision::PartialRefresh {
          from: month.first_day(),
        },
        "partially cached",
      ),
      CacheStatus::Complete => {
        let freshness = self.freshness(entry, now);
        if freshness.is_fresh() {
          return (CacheDecision::UseCache, "fresh");
        }
        if freshness.age > freshness.ttl * 2 {
          return (CacheDecision::FullRefresh, "expired");
        }

        // New rows can only appear on dates at or after the last store, give
        // or take a day of provider lag.
        let from = (entry.updated_at.date_naive() - Duration::days(1)).max(month.first_day());
        if from > month.last_day() {
          (CacheDecision::UseCache, "aging, no newer dates")
        } else {
          (CacheDecision::PartialRefresh { from }, "aging")
        }
      }
    }
  }
}

/// Decision for one month piece of a request.
#[derive(Debug, Clone, Serialize)]
pub struct MonthPlan {
  pub month: YearMonth,
  /// The part of the request inside this month
  pub range: DateRange,
  /// True when `range` is the whole month
  pub aligned: bool,
  pub decision: CacheDecision,
  pub reason: &'static str,
  /// Portion served from cache
  pub cached: Option<DateRange>,
  /// Portion to fetch
  pub fetch: Option<DateRange>,
  pub entry_status: Option<CacheStatus>,
  pub entry_updated_at: Option<DateTime<Utc>>,
}

impl MonthPlan {
  fn new(
    month: YearMonth,
    range: DateRange,
    aligned: bool,
    entry: Option<&MonthlyCacheEntry>,
    (decision, reason): (CacheDecision, &'static str),
  ) -> Self {
    let (cached, fetch) = match decision {
      CacheDecision::UseCache => (Some(range), None),
      CacheDecision::FullRefresh => (None, Some(range)),
      CacheDecision::PartialRefresh { from } => {
        if from > range.end {
          (Some(range), None)
        } else if from <= range.start {
          (None, Some(range))
        } else {
          let cached = DateRange {
            start: range.start,
            end: from.pred_opt().unwrap_or(range.start),
          };
          let fetch = DateRange {
            start: from,
            end: range.end,
          };
          (Some(cached), Some(fetch))
        }
      }
    };

    Self {
      month,
      range,
      aligned,
      decision,
      reason,
      cached,
      fetch,
      entry_status: entry.map(|e| e.status),
      entry_updated_at: entry.map(|e| e.updated_at),
    }
  }
}

/// How a request range is served.
#[derive(Debug, Clone, Serialize)]
pub struct QueryPlan {
  pub source: Source,
  pub range: DateRange,
  pub force: bool,
  pub months: Vec<MonthPlan>,
  pub cached_ranges: Vec<DateRange>,
  pub fetch_ranges: Vec<DateRange>,
  pub estimated_api_calls: usize,
  /// Fraction of requested days served from cache
  pub cache_coverage: f64,
}

impl QueryPlan {
  fn from_months(source: Source, range: DateRange, force: bool, months: Vec<MonthPlan>) -> Self {
    let cached_ranges = coalesce(months.iter().filter_map(|m| m.cached).collect());
    let fetch_ranges = coalesce(months.iter().filter_map(|m| m.fetch).collect());
    let cached_days: i64 = cached_ranges.iter().map(DateRange::days).sum();

    Self {
      source,
      range,
      force,
      estimated_api_calls: fetch_ranges.len(),
      cache_coverage: cached_days as f64 / range.days() as f64,
      months,
      cached_ranges,
      fetch_ranges,
    }
  }

  pub fn is_full_hit(&self) -> bool {
    self.fetch_ranges.is_empty()
  }

  /// Oldest cache entry that served part of this plan.
  pub fn oldest_cached_at(&self) -> Option<DateTime<Utc>> {
    self
      .months
      .iter()
      .filter(|m| m.cached.is_some())
      .filter_map(|m| m.entry_updated_at)
      .min()
  }
}

/// Builds query plans from the monthly entries, segments and staleness markers.
pub struct QueryOptimizer<S: CacheStorage> {
  storage: Arc<S>,
  staleness: Arc<StalenessManager<S>>,
  policy: FreshnessPolicy,
}

impl<S: CacheStorage> QueryOptimizer<S> {
  pub fn new(storage: Arc<S>, staleness: Arc<StalenessManager<S>>, policy: FreshnessPolicy) -> Self {
    Self {
      storage,
      staleness,
      policy,
    }
  }

  pub fn plan(&self, source: Source, range: DateRange, force: bool) -> Result<QueryPlan> {
    self.plan_at(source, range, force, Utc::now())
  }

  pub fn plan_at(
    &self,
    source: Source,
    range: DateRange,
    force: bool,
    now: DateTime<Utc>,
  ) -> Result<QueryPlan> {
    let mut months = Vec::new();

    for (month, piece) in range.split_by_month() {
      let aligned = piece == month.range();
      let entry = self.storage.get_month(source, month)?;

      let decision = if force {
        (CacheDecision::FullRefresh, "forced")
      } else {
        let stale = self.staleness.is_stale(source, piece);
        let whole_month = self.policy.decide(month, entry.as_ref(), stale, now);
        if aligned || stale || whole_month.0 == CacheDecision::UseCache {
          whole_month
        } else {
          self.decide_piece(source, piece, whole_month, now)?
        }
      };

      let plan = MonthPlan::new(month, piece, aligned, entry.as_ref(), decision);
      debug!(%source, %month, reason = plan.reason, "planned month");
      months.push(plan);
    }

    Ok(QueryPlan::from_months(source, range, force, months))
  }

  /// A piece shorter than its month can still be served by a fresh segment.
  fn decide_piece(
    &self,
    source: Source,
    piece: DateRange,
    whole_month: (CacheDecision, &'static str),
    now: DateTime<Utc>,
  ) -> Result<(CacheDecision, &'static str)> {
    if let Some(segment) = self.storage.find_covering_segment(source, piece)? {
      if now - segment.last_refreshed_at <= self.policy.segment_ttl {
        return Ok((CacheDecision::UseCache, "fresh segment"));
      }
    }
    Ok(whole_month)
  }
}

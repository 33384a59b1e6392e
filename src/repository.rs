//! Per-source repositories and the two-source dashboard on top of them.
//!
//! A repository plans a request against the cache, executes the plan through
//! the hybrid service and deduplicates identical concurrent requests. It never
//! fails a read: when the provider is down it serves stored rows, then mock
//! data if enabled, then an empty list.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::storage::CacheEvent;
use crate::cache::{
  CacheResult, CacheSource, CacheStorage, FreshnessPolicy, HybridDataService, HybridResult,
  QueryOptimizer, QueryPlan, SqliteStorage, StalenessManager,
};
use crate::config::{CacheConfig, Config};
use crate::dates::DateRange;
use crate::db::Database;
use crate::dedup::{ApiRequestManager, RequestKey};
use crate::providers::mock::mock_transactions;
use crate::providers::{
  FunctionsClient, Source, StripeClient, Transaction, TransactionSource, TransactionType,
  ZohoClient,
};

struct Inner<C: TransactionSource, S: CacheStorage> {
  client: C,
  storage: Arc<S>,
  staleness: Arc<StalenessManager<S>>,
  optimizer: QueryOptimizer<S>,
  hybrid: HybridDataService<S>,
  requests: ApiRequestManager<CacheResult<Vec<Transaction>>>,
  mock_fallback: bool,
}

/// Cached access to one provider's transactions.
pub struct TransactionRepository<C: TransactionSource, S: CacheStorage> {
  inner: Arc<Inner<C, S>>,
}

impl<C: TransactionSource, S: CacheStorage> Clone for TransactionRepository<C, S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<C: TransactionSource, S: CacheStorage> TransactionRepository<C, S> {
  pub fn new(
    client: C,
    storage: Arc<S>,
    staleness: Arc<StalenessManager<S>>,
    config: &CacheConfig,
    mock_fallback: bool,
  ) -> Self {
    let policy = FreshnessPolicy::from_config(config);
    Self {
      inner: Arc::new(Inner {
        optimizer: QueryOptimizer::new(storage.clone(), staleness.clone(), policy),
        hybrid: HybridDataService::new(storage.clone(), staleness.clone()),
        requests: ApiRequestManager::new(
          std::time::Duration::from_secs(config.dedup_ttl_secs),
          std::time::Duration::from_secs(config.dedup_cooldown_secs),
        ),
        client,
        storage,
        staleness,
        mock_fallback,
      }),
    }
  }

  pub fn source(&self) -> Source {
    self.inner.client.source()
  }

  #[cfg(test)]
  pub fn storage(&self) -> &Arc<S> {
    &self.inner.storage
  }

  /// How a request would be served right now.
  pub fn plan(&self, range: DateRange, force: bool) -> Result<QueryPlan> {
    self.inner.optimizer.plan(self.source(), range, force)
  }

  fn request_key(&self, range: DateRange, force: bool) -> String {
    let kind = if force { "refresh" } else { "transactions" };
    RequestKey::new(self.source(), range, kind).cache_hash()
  }

  /// Transactions dated within `range`, newest first.
  pub async fn get_transactions(
    &self,
    range: DateRange,
    force: bool,
  ) -> CacheResult<Vec<Transaction>> {
    let key = self.request_key(range, force);
    let inner = Arc::clone(&self.inner);
    debug!(
      source = %self.source(),
      %range,
      force,
      pending = self.inner.requests.in_flight(),
      "loading transactions"
    );

    let result = self
      .inner
      .requests
      .execute(&key, move || async move { inner.load(range, force).await })
      .await;

    match result {
      Ok(result) => result,
      Err(e) => {
        warn!(source = %self.source(), %range, error = %e, "serving fallback transactions");
        self.fallback(range)
      }
    }
  }

  /// Drop cached rows for `range` and keep it stale until it is refetched.
  /// Returns the number of rows deleted.
  pub fn clear(&self, range: DateRange) -> Result<usize> {
    self.inner.staleness.prune();
    let deleted = self.inner.staleness.mark_stale(self.source(), range)?;
    // Neither a cached read nor an earlier refresh may answer for this range
    self.inner.requests.invalidate(&self.request_key(range, false));
    self.inner.requests.invalidate(&self.request_key(range, true));
    Ok(deleted)
  }

  /// Drop cached rows for `range` and refetch them.
  pub async fn refresh(&self, range: DateRange) -> Result<CacheResult<Vec<Transaction>>> {
    let deleted = self.clear(range)?;
    info!(source = %self.source(), %range, deleted, "refreshing range");
    Ok(self.get_transactions(range, true).await)
  }

  /// Fetch whatever `range` is missing without going through deduplication.
  /// Returns false when the cache already covered it.
  pub async fn warm(&self, range: DateRange) -> Result<bool> {
    let plan = self.plan(range, false)?;
    if plan.is_full_hit() {
      return Ok(false);
    }
    let result = self.inner.hybrid.execute(&plan, &self.inner.client).await?;
    if !result.failed_ranges.is_empty() {
      return Err(eyre!(
        "{} failed for {} range(s)",
        self.source(),
        result.failed_ranges.len()
      ));
    }
    // Earlier results and cooldowns predate the rows just stored
    self.inner.requests.clear();
    Ok(true)
  }

  fn fallback(&self, range: DateRange) -> CacheResult<Vec<Transaction>> {
    let source = self.source();
    match self.inner.storage.get_transactions(source, range) {
      Ok(rows) if !rows.is_empty() => return CacheResult::offline(rows),
      Ok(_) => {}
      Err(e) => warn!(%source, error = %e, "failed to read cached rows"),
    }

    if self.inner.mock_fallback {
      warn!(%source, %range, "serving mock transactions");
      return CacheResult::new(mock_transactions(source, range), CacheSource::Mock, None);
    }

    CacheResult::new(Vec::new(), CacheSource::Empty, None)
  }
}

impl<C: TransactionSource, S: CacheStorage> Inner<C, S> {
  async fn load(&self, range: DateRange, force: bool) -> Result<CacheResult<Vec<Transaction>>> {
    let plan = self.optimizer.plan(self.client.source(), range, force)?;
    let result = self.hybrid.execute(&plan, &self.client).await?;
    to_cache_result(result)
  }
}

fn to_cache_result(result: HybridResult) -> Result<CacheResult<Vec<Transaction>>> {
  if !result.failed_ranges.is_empty() {
    if result.transactions.is_empty() {
      // Nothing to show; let the caller pick a fallback
      return Err(eyre!("provider unavailable for {:?}", result.failed_ranges));
    }
    return Ok(CacheResult::new(
      result.transactions,
      CacheSource::Offline,
      result.oldest_cached_at,
    ));
  }

  let source = match result.event {
    CacheEvent::Hit => CacheSource::CacheFresh,
    CacheEvent::Miss | CacheEvent::Refresh => CacheSource::Network,
    CacheEvent::Partial => CacheSource::Hybrid,
  };
  Ok(CacheResult::new(result.transactions, source, result.oldest_cached_at))
}

/// Income, expense and fee totals for a set of transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Totals {
  pub income: f64,
  pub expenses: f64,
  pub fees: f64,
  pub net: f64,
}

impl Totals {
  pub fn of(transactions: &[Transaction]) -> Self {
    let mut totals = Totals::default();
    for tx in transactions {
      match tx.kind {
        TransactionType::Income => totals.income += tx.amount,
        TransactionType::Expense => totals.expenses += tx.amount,
      }
      totals.fees += tx.fees.unwrap_or(0.0);
      totals.net += tx.signed_amount();
    }
    totals
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
  pub source: Source,
  pub served_from: CacheSource,
  pub count: usize,
  pub cached_at: Option<DateTime<Utc>>,
}

impl SourceSummary {
  fn of(source: Source, result: &CacheResult<Vec<Transaction>>) -> Self {
    Self {
      source,
      served_from: result.source,
      count: result.data.len(),
      cached_at: result.cached_at,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
  pub range: DateRange,
  /// Both sources merged, newest first
  pub transactions: Vec<Transaction>,
  pub sources: Vec<SourceSummary>,
  pub totals: Totals,
}

/// Both provider repositories over one store.
pub struct Dashboard<Z: TransactionSource, T: TransactionSource, S: CacheStorage> {
  pub zoho: TransactionRepository<Z, S>,
  pub stripe: TransactionRepository<T, S>,
  pub storage: Arc<S>,
}

impl<Z: TransactionSource, T: TransactionSource, S: CacheStorage> Clone for Dashboard<Z, T, S> {
  fn clone(&self) -> Self {
    Self {
      zoho: self.zoho.clone(),
      stripe: self.stripe.clone(),
      storage: Arc::clone(&self.storage),
    }
  }
}

impl Dashboard<ZohoClient, StripeClient, SqliteStorage> {
  /// Open the database and build both provider clients from configuration.
  pub fn open(config: &Config) -> Result<Self> {
    let db = Database::open(&config.database_path()?)?;
    let functions = FunctionsClient::new(&config.providers)?;
    let zoho = ZohoClient::new(functions.clone(), config.providers.zoho_function.clone());
    let stripe = StripeClient::new(functions, config.providers.stripe_function.clone());
    Ok(Self::new(
      zoho,
      stripe,
      Arc::new(SqliteStorage::new(db)),
      config,
    ))
  }
}

impl<Z: TransactionSource, T: TransactionSource, S: CacheStorage> Dashboard<Z, T, S> {
  pub fn new(zoho: Z, stripe: T, storage: Arc<S>, config: &Config) -> Self {
    let staleness = Arc::new(StalenessManager::new(
      storage.clone(),
      Duration::minutes(config.cache.stale_window_minutes),
    ));
    let mock_fallback = config.providers.mock_fallback;
    Self {
      zoho: TransactionRepository::new(
        zoho,
        storage.clone(),
        staleness.clone(),
        &config.cache,
        mock_fallback,
      ),
      stripe: TransactionRepository::new(
        stripe,
        storage.clone(),
        staleness,
        &config.cache,
        mock_fallback,
      ),
      storage,
    }
  }

  /// Fetch both sources concurrently and merge them.
  pub async fn fetch_all(&self, range: DateRange, force: bool) -> DashboardData {
    let (zoho, stripe) = tokio::join!(
      self.fetch(Source::Zoho, range, force),
      self.fetch(Source::Stripe, range, force)
    );

    let sources = vec![
      SourceSummary::of(Source::Zoho, &zoho),
      SourceSummary::of(Source::Stripe, &stripe),
    ];

    let mut transactions = zoho.data;
    transactions.extend(stripe.data);
    transactions.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.id.cmp(&b.id)));

    DashboardData {
      range,
      totals: Totals::of(&transactions),
      transactions,
      sources,
    }
  }

  /// Read `source` through its cache. Forcing refreshes the range first.
  pub async fn fetch(
    &self,
    source: Source,
    range: DateRange,
    force: bool,
  ) -> CacheResult<Vec<Transaction>> {
    if force {
      match self.refresh(source, range).await {
        Ok(result) => return result,
        Err(e) => warn!(%source, %range, error = %e, "could not mark range stale"),
      }
    }
    match source {
      Source::Zoho => self.zoho.get_transactions(range, force).await,
      Source::Stripe => self.stripe.get_transactions(range, force).await,
    }
  }

  pub fn plan(&self, source: Source, range: DateRange, force: bool) -> Result<QueryPlan> {
    match source {
      Source::Zoho => self.zoho.plan(range, force),
      Source::Stripe => self.stripe.plan(range, force),
    }
  }

  pub async fn refresh(
    &self,
    source: Source,
    range: DateRange,
  ) -> Result<CacheResult<Vec<Transaction>>> {
    match source {
      Source::Zoho => self.zoho.refresh(range).await,
      Source::Stripe => self.stripe.refresh(range).await,
    }
  }

  pub fn clear(&self, source: Source, range: DateRange) -> Result<usize> {
    match source {
      Source::Zoho => self.zoho.clear(range),
      Source::Stripe => self.stripe.clear(range),
    }
  }

  pub async fn warm(&self, source: Source, range: DateRange) -> Result<bool> {
    match source {
      Source::Zoho => self.zoho.warm(range).await,
      Source::Stripe => self.stripe.warm(range).await,
    }
  }
}

//! In-flight request deduplication.
//!
//! `ApiRequestManager<T>` keeps a map from request key to a shared future.
//! Callers asking for the same key while an entry is younger than the TTL
//! await the same underlying request, so a burst of identical reads costs one
//! provider call. A failed request puts its key into a cooldown during which
//! callers get the remembered error back instead of firing again.
//!
//! Requests run on spawned tasks: dropping every caller does not cancel them.
//!
//! # Example
//!
//! ```ignore
//! let requests = ApiRequestManager::new(Duration::from_secs(30), Duration::from_secs(10));
//! let key = RequestKey::new(Source::Zoho, range, "transactions").cache_hash();
//! let rows = requests
//!   .execute(&key, move || async move { client.fetch_transactions(range).await })
//!   .await?;
//! ```

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::dates::DateRange;
use crate::providers::Source;

/// Errors are carried as strings because the shared output must be Clone.
type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, String>>>;

struct InFlight<T> {
  fetch: SharedFetch<T>,
  started_at: Instant,
}

struct Failure {
  at: Instant,
  message: String,
}

struct State<T> {
  in_flight: HashMap<String, InFlight<T>>,
  failures: HashMap<String, Failure>,
}

/// Stable key for a provider request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
  pub source: Source,
  pub range: DateRange,
  pub kind: &'static str,
}

impl RequestKey {
  pub fn new(source: Source, range: DateRange, kind: &'static str) -> Self {
    Self {
      source,
      range,
      kind,
    }
  }

  /// SHA256 hash for stable, fixed-length keys
  pub fn cache_hash(&self) -> String {
    let input = format!(
      "{}:{}:{}:{}",
      self.kind, self.source, self.range.start, self.range.end
    );
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

pub struct ApiRequestManager<T> {
  state: Mutex<State<T>>,
  ttl: Duration,
  cooldown: Duration,
}

impl<T: Clone + Send + Sync + 'static> ApiRequestManager<T> {
  pub fn new(ttl: Duration, cooldown: Duration) -> Self {
    Self {
      state: Mutex::new(State {
        in_flight: HashMap::new(),
        failures: HashMap::new(),
      }),
      ttl,
      cooldown,
    }
  }

  fn state(&self) -> MutexGuard<'_, State<T>> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Run `fetcher` for `key`, or join the request already running for it.
  pub async fn execute<F, Fut>(&self, key: &str, fetcher: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let fetch = {
      let mut state = self.state();
      let now = Instant::now();

      let (ttl, cooldown) = (self.ttl, self.cooldown);
      state
        .in_flight
        .retain(|_, entry| now.duration_since(entry.started_at) < ttl);
      state
        .failures
        .retain(|_, failure| now.duration_since(failure.at) < cooldown);

      if let Some(failure) = state.failures.get(key) {
        return Err(eyre!(
          "Request cooling down after failure: {}",
          failure.message
        ));
      }

      match state.in_flight.get(key) {
        Some(entry) => {
          debug!(key, "joining in-flight request");
          entry.fetch.clone()
        }
        None => {
          let task = tokio::spawn(fetcher());
          let fetch = async move {
            match task.await {
              Ok(result) => result.map_err(|e| format!("{:#}", e)),
              Err(join_error) => Err(format!("request task failed: {}", join_error)),
            }
          }
          .boxed()
          .shared();

          state.in_flight.insert(
            key.to_string(),
            InFlight {
              fetch: fetch.clone(),
              started_at: now,
            },
          );
          fetch
        }
      }
    };

    let result = fetch.clone().await;

    if let Err(message) = &result {
      let mut state = self.state();
      // Only the caller whose entry is still registered records the failure
      let still_registered = state
        .in_flight
        .get(key)
        .map(|entry| entry.fetch.ptr_eq(&fetch))
        .unwrap_or(false);
      if still_registered {
        state.in_flight.remove(key);
        state.failures.insert(
          key.to_string(),
          Failure {
            at: Instant::now(),
            message: message.clone(),
          },
        );
      }
    }

    result.map_err(|message| eyre!(message))
  }

  /// Forget a key so the next call fires a new request.
  pub fn invalidate(&self, key: &str) {
    let mut state = self.state();
    state.in_flight.remove(key);
    state.failures.remove(key);
  }

  /// Forget every request and cooldown.
  pub fn clear(&self) {
    let mut state = self.state();
    state.in_flight.clear();
    state.failures.clear();
  }

  /// Requests still inside their TTL.
  pub fn in_flight(&self) -> usize {
    let mut state = self.state();
    let now = Instant::now();
    let ttl = self.ttl;
    state
      .in_flight
      .retain(|_, entry| now.duration_since(entry.started_at) < ttl);
    state.in_flight.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn counting_fetcher(
    counter: Arc<AtomicU32>,
    delay: Duration,
  ) -> impl FnOnce() -> BoxFuture<'static, Result<u32>> {
    move || {
      async move {
        tokio::time::sleep(delay).await;
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_concurrent_calls_share_request() {
    let manager = Arc::new(ApiRequestManager::new(
      Duration::from_secs(30),
      Duration::from_secs(10),
    ));
    let counter = Arc::new(AtomicU32::new(0));

    let calls = (0..5).map(|_| {
      let manager = manager.clone();
      let counter = counter.clone();
      async move {
        manager
          .execute("k", counting_fetcher(counter, Duration::from_millis(50)))
          .await
      }
    });
    let results = futures::future::join_all(calls).await;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    for result in results {
      assert_eq!(result.unwrap(), 1);
    }
  }

  #[tokio::test]
  async fn test_result_reused_within_ttl() {
    let manager = ApiRequestManager::new(Duration::from_secs(30), Duration::from_secs(10));
    let counter = Arc::new(AtomicU32::new(0));

    manager
      .execute("k", counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    manager
      .execute("k", counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    manager.invalidate("k");
    manager
      .execute("k", counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_ttl_expiry_refetches() {
    let manager = ApiRequestManager::new(Duration::from_millis(20), Duration::from_secs(10));
    let counter = Arc::new(AtomicU32::new(0));

    manager
      .execute("k", counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    let second = manager
      .execute("k", counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(second, 2);
  }

  #[tokio::test]
  async fn test_distinct_keys_run_separately() {
    let manager = ApiRequestManager::new(Duration::from_secs(30), Duration::from_secs(10));
    let counter = Arc::new(AtomicU32::new(0));

    manager
      .execute("a", counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    manager
      .execute("b", counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_cooldown_after_failure() {
    let manager: ApiRequestManager<u32> =
      ApiRequestManager::new(Duration::from_secs(30), Duration::from_millis(50));
    let attempts = Arc::new(AtomicU32::new(0));

    let failing = |attempts: Arc<AtomicU32>| {
      move || async move {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err::<u32, _>(eyre!("provider unavailable"))
      }
    };

    let first = manager.execute("k", failing(attempts.clone())).await;
    assert!(first.unwrap_err().to_string().contains("provider unavailable"));

    let second = manager.execute("k", failing(attempts.clone())).await;
    assert!(second.unwrap_err().to_string().contains("cooling down"));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    let third = manager.execute("k", failing(attempts.clone())).await;
    assert!(third.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_in_flight_counts_live_entries() {
    let manager = ApiRequestManager::new(Duration::from_millis(30), Duration::from_secs(10));
    let counter = Arc::new(AtomicU32::new(0));
    assert_eq!(manager.in_flight(), 0);

    for key in ["a", "b"] {
      manager
        .execute(key, counting_fetcher(counter.clone(), Duration::ZERO))
        .await
        .unwrap();
    }
    assert_eq!(manager.in_flight(), 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.in_flight(), 0);
  }

  #[tokio::test]
  async fn test_clear_drops_requests_and_cooldowns() {
    let manager: ApiRequestManager<u32> =
      ApiRequestManager::new(Duration::from_secs(30), Duration::from_secs(30));
    let counter = Arc::new(AtomicU32::new(0));
    let attempts = Arc::new(AtomicU32::new(0));

    manager
      .execute("ok", counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    let failing = {
      let attempts = attempts.clone();
      move || async move {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err::<u32, _>(eyre!("provider unavailable"))
      }
    };
    assert!(manager.execute("bad", failing).await.is_err());
    assert_eq!(manager.in_flight(), 1);

    manager.clear();
    assert_eq!(manager.in_flight(), 0);

    // cooldown is gone, so the failing key runs again
    let retry = {
      let attempts = attempts.clone();
      move || async move {
        attempts.fetch_add(1, Ordering::SeqCst);
        Ok::<u32, color_eyre::Report>(7)
      }
    };
    assert_eq!(manager.execute("bad", retry).await.unwrap(), 7);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    manager
      .execute("ok", counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_request_key_hash_is_stable() {
    let range = DateRange::parse("2024-01-01", "2024-01-31").unwrap();
    let a = RequestKey::new(Source::Zoho, range, "transactions");
    let b = RequestKey::new(Source::Zoho, range, "transactions");
    let c = RequestKey::new(Source::Stripe, range, "transactions");
    assert_eq!(a.cache_hash(), b.cache_hash());
    assert_ne!(a.cache_hash(), c.cache_hash());
    assert_eq!(a.cache_hash().len(), 64);
  }
}

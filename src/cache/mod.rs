//! Month-partitioned transaction cache.
//!
//! - `storage`: SQLite tables for rows, monthly entries, segments and metrics
//! - `staleness`: time-boxed markers that force a range to be refetched
//! - `intelligence`: freshness rules and query planning per month
//! - `hybrid`: executes a plan, mixing cached and fetched rows
//! - `warmer`: background prefetch of months likely to be requested
//! - `stats`: aggregates over the metrics log

pub mod hybrid;
pub mod intelligence;
pub mod staleness;
pub mod stats;
pub mod storage;
mod traits;
pub mod warmer;

pub use hybrid::{HybridDataService, HybridResult};
pub use intelligence::{CacheDecision, FreshnessPolicy, QueryOptimizer, QueryPlan};
pub use staleness::StalenessManager;
pub use stats::CacheStats;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
pub use warmer::PredictiveWarmer;

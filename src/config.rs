use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub providers: ProvidersConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub warmer: WarmerConfig,
  /// Database file (defaults to $XDG_DATA_HOME/fincache/cache.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
  /// Base URL of the serverless functions, e.g. https://<project>.supabase.co/functions/v1
  pub functions_url: String,
  pub zoho_function: String,
  pub stripe_function: String,
  pub timeout_secs: u64,
  /// Serve mock data when a provider and the cache both come up empty
  pub mock_fallback: bool,
}

impl Default for ProvidersConfig {
  fn default() -> Self {
    Self {
      functions_url: "http://localhost:54321/functions/v1".to_string(),
      zoho_function: "zoho-transactions".to_string(),
      stripe_function: "stripe-transactions".to_string(),
      timeout_secs: 30,
      mock_fallback: false,
    }
  }
}

/// Freshness and deduplication tuning. All durations are in minutes unless
/// the field name says otherwise.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub current_month_ttl_minutes: i64,
  pub previous_month_ttl_minutes: i64,
  pub historical_ttl_minutes: i64,
  /// A month stuck in `processing` longer than this is refetched
  pub processing_timeout_minutes: i64,
  /// Segments older than this are not trusted
  pub segment_ttl_minutes: i64,
  /// How long a staleness marker forces misses
  pub stale_window_minutes: i64,
  pub dedup_ttl_secs: u64,
  pub dedup_cooldown_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      current_month_ttl_minutes: 60,
      previous_month_ttl_minutes: 6 * 60,
      historical_ttl_minutes: 7 * 24 * 60,
      processing_timeout_minutes: 10,
      segment_ttl_minutes: 60,
      stale_window_minutes: 5,
      dedup_ttl_secs: 30,
      dedup_cooldown_secs: 10,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WarmerConfig {
  pub interval_minutes: u64,
  /// Most frequently requested months to warm besides current and previous
  pub max_predictions: usize,
  pub lookback_days: i64,
}

impl Default for WarmerConfig {
  fn default() -> Self {
    Self {
      interval_minutes: 30,
      max_predictions: 3,
      lookback_days: 30,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fincache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fincache/config.yaml
  ///
  /// With no file found, defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("fincache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fincache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Data directory for the database and logs.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("fincache"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }

  /// Key sent as the bearer token to the serverless functions.
  ///
  /// Checks FINCACHE_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Option<String> {
    std::env::var("FINCACHE_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .ok()
  }
}

use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::types::{Source, Transaction};
use crate::config::{Config, ProvidersConfig};
use crate::dates::DateRange;

/// A remote provider of transactions.
pub trait TransactionSource: Clone + Send + Sync + 'static {
  fn source(&self) -> Source;

  /// Fetch every transaction dated within `range`.
  fn fetch_transactions(
    &self,
    range: DateRange,
  ) -> impl Future<Output = Result<Vec<Transaction>>> + Send;
}

/// HTTP client for the hosted serverless functions that proxy provider APIs.
#[derive(Clone)]
pub struct FunctionsClient {
  http: reqwest::Client,
  base: Url,
  api_key: Option<String>,
}

impl FunctionsClient {
  pub fn new(config: &ProvidersConfig) -> Result<Self> {
    let mut base = Url::parse(&config.functions_url)
      .map_err(|e| eyre!("Invalid functions_url '{}': {}", config.functions_url, e))?;
    // Url::join replaces the last segment unless the base ends with '/'
    if !base.path().ends_with('/') {
      base.set_path(&format!("{}/", base.path()));
    }

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      api_key: Config::get_api_key(),
    })
  }

  /// URL a function is invoked at.
  pub fn function_url(&self, function: &str) -> Result<Url> {
    self
      .base
      .join(function)
      .map_err(|e| eyre!("Invalid function name '{}': {}", function, e))
  }

  /// Invoke a function for a date range and return its JSON body.
  pub async fn invoke(&self, function: &str, range: DateRange) -> Result<Value> {
    let url = self.function_url(function)?;
    let body = json!({
      "startDate": range.start.to_string(),
      "endDate": range.end.to_string(),
    });

    debug!(%url, %range, "invoking function");

    let mut request = self.http.post(url.clone()).json(&body);
    if let Some(key) = &self.api_key {
      request = request.bearer_auth(key);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", function, e))?;

    let status = response.status();
    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      return Err(eyre!("{} returned {}: {}", function, status, text));
    }

    response
      .json::<Value>()
      .await
      .map_err(|e| eyre!("Failed to parse {} response: {}", function, e))
  }
}

/// Keep normalized rows that fall inside the requested range.
pub(crate) fn normalize_rows<T>(
  rows: Vec<T>,
  range: DateRange,
  source: Source,
  normalize: impl Fn(T) -> Option<Transaction>,
) -> Vec<Transaction> {
  let total = rows.len();
  let transactions: Vec<Transaction> = rows.into_iter().filter_map(normalize).collect();

  let skipped = total - transactions.len();
  if skipped > 0 {
    tracing::warn!(%source, skipped, "skipped rows without id or date");
  }

  transactions
    .into_iter()
    .filter(|tx| range.contains(tx.date))
    .collect()
}

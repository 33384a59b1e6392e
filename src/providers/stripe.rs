use color_eyre::Result;
use tracing::info;

use super::api_types::{parse_envelope, ApiStripeTransaction};
use super::client::{normalize_rows, FunctionsClient, TransactionSource};
use super::types::{Source, Transaction};
use crate::dates::DateRange;

/// Stripe balance transactions, fetched through a serverless function.
#[derive(Clone)]
pub struct StripeClient {
  functions: FunctionsClient,
  function: String,
}

impl StripeClient {
  pub fn new(functions: FunctionsClient, function: impl Into<String>) -> Self {
    Self {
      functions,
      function: function.into(),
    }
  }
}

impl TransactionSource for StripeClient {
  fn source(&self) -> Source {
    Source::Stripe
  }

  async fn fetch_transactions(&self, range: DateRange) -> Result<Vec<Transaction>> {
    let body = self.functions.invoke(&self.function, range).await?;
    let rows: Vec<ApiStripeTransaction> = parse_envelope(body)?;

    let transactions = normalize_rows(rows, range, Source::Stripe, |row| row.into_transaction());
    info!(%range, count = transactions.len(), "fetched Stripe transactions");

    Ok(transactions)
  }
}

use color_eyre::Result;
use tracing::info;

use super::api_types::{parse_envelope, ApiZohoTransaction};
use super::client::{normalize_rows, FunctionsClient, TransactionSource};
use super::types::{Source, Transaction};
use crate::dates::DateRange;

/// Zoho Books bank transactions, fetched through a serverless function.
#[derive(Clone)]
pub struct ZohoClient {
  functions: FunctionsClient,
  function: String,
}

impl ZohoClient {
  pub fn new(functions: FunctionsClient, function: impl Into<String>) -> Self {
    Self {
      functions,
      function: function.into(),
    }
  }
}

impl TransactionSource for ZohoClient {
  fn source(&self) -> Source {
    Source::Zoho
  }

  async fn fetch_transactions(&self, range: DateRange) -> Result<Vec<Transaction>> {
    let body = self.functions.invoke(&self.function, range).await?;
    let rows: Vec<ApiZohoTransaction> = parse_envelope(body)?;

    let transactions = normalize_rows(rows, range, Source::Zoho, |row| row.into_transaction());
    info!(%range, count = transactions.len(), "fetched Zoho transactions");

    Ok(transactions)
  }
}

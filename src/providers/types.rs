use chrono::NaiveDate;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transaction provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Source {
  Zoho,
  Stripe,
}

impl Source {
  pub const ALL: [Source; 2] = [Source::Zoho, Source::Stripe];

  /// Value stored in the `source` column
  pub fn as_str(&self) -> &'static str {
    match self {
      Source::Zoho => "Zoho",
      Source::Stripe => "Stripe",
    }
  }
}

impl fmt::Display for Source {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Source {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_lowercase().as_str() {
      "zoho" => Ok(Source::Zoho),
      "stripe" => Ok(Source::Stripe),
      other => Err(eyre!("Unknown source '{}' (expected zoho or stripe)", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
  Income,
  Expense,
}

impl TransactionType {
  pub fn as_str(&self) -> &'static str {
    match self {
      TransactionType::Income => "income",
      TransactionType::Expense => "expense",
    }
  }
}

impl FromStr for TransactionType {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s {
      "income" => Ok(TransactionType::Income),
      "expense" => Ok(TransactionType::Expense),
      other => Err(eyre!("Unknown transaction type '{}'", other)),
    }
  }
}

/// A normalized transaction from either provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
  pub id: String,
  pub external_id: Option<String>,
  pub date: NaiveDate,
  pub amount: f64,
  pub description: String,
  pub category: String,
  pub source: Source,
  #[serde(rename = "type")]
  pub kind: TransactionType,
  pub fees: Option<f64>,
  pub gross: Option<f64>,
  pub metadata: Option<serde_json::Value>,
}

impl Transaction {
  /// Identity within a source: the provider id, or the local id when absent.
  pub fn identity(&self) -> &str {
    self.external_id.as_deref().unwrap_or(&self.id)
  }

  /// Key used when merging cached and fetched rows.
  pub fn merge_key(&self) -> (String, NaiveDate) {
    (self.id.clone(), self.date)
  }

  /// Amount with sign applied: income positive, expense negative.
  pub fn signed_amount(&self) -> f64 {
    match self.kind {
      TransactionType::Income => self.amount,
      TransactionType::Expense => -self.amount,
    }
  }
}

/// Local id for a provider row
pub fn local_id(source: Source, external_id: &str) -> String {
  format!("{}-{}", source.as_str().to_lowercase(), external_id)
}

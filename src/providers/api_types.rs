//! Serde-deserializable types matching the serverless function responses.
//!
//! The functions proxy the provider APIs and are not consistent about their
//! envelope or field types, so everything here is deserialized loosely and
//! normalized into [`Transaction`] afterwards.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::types::{local_id, Source, Transaction, TransactionType};
use crate::dates::{parse_flexible_date, unix_to_date};

// ============================================================================
// Response envelope
// ============================================================================

/// The shapes a function response comes back in.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiEnvelope<T> {
  List(Vec<T>),
  Transactions { transactions: Vec<T> },
  Data { data: Vec<T> },
  Error { error: Value },
}

/// Extract the row list from any supported envelope.
pub fn parse_envelope<T: DeserializeOwned>(body: Value) -> Result<Vec<T>> {
  let envelope: ApiEnvelope<T> =
    serde_json::from_value(body).map_err(|e| eyre!("Unrecognized response shape: {}", e))?;

  match envelope {
    ApiEnvelope::List(rows)
    | ApiEnvelope::Transactions { transactions: rows }
    | ApiEnvelope::Data { data: rows } => Ok(rows),
    ApiEnvelope::Error { error } => Err(eyre!("Function returned an error: {}", error)),
  }
}

// ============================================================================
// Loose field helpers
// ============================================================================

/// Ids arrive as strings or numbers.
fn value_to_string(value: &Value) -> Option<String> {
  match value {
    Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Amounts arrive as numbers or numeric strings.
fn value_to_f64(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().replace(',', "").parse().ok(),
    _ => None,
  }
}

fn first_string(values: &[&Option<Value>]) -> Option<String> {
  values
    .iter()
    .filter_map(|v| v.as_ref())
    .find_map(value_to_string)
}

fn metadata_from(extra: HashMap<String, Value>) -> Option<Value> {
  let map: Map<String, Value> = extra.into_iter().filter(|(_, v)| !v.is_null()).collect();
  (!map.is_empty()).then_some(Value::Object(map))
}

// ============================================================================
// Zoho Books
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ApiZohoTransaction {
  pub transaction_id: Option<Value>,
  pub id: Option<Value>,
  pub date: Option<Value>,
  pub amount: Option<Value>,
  pub description: Option<Value>,
  pub reference_number: Option<Value>,
  pub payee: Option<Value>,
  pub account_name: Option<Value>,
  pub category: Option<Value>,
  pub transaction_type: Option<String>,
  #[serde(flatten)]
  pub extra: HashMap<String, Value>,
}

const ZOHO_INCOME_TYPES: &[&str] = &["deposit", "income", "credit", "sales_receipt"];

impl ApiZohoTransaction {
  /// Normalize into a transaction. Returns None when the row has no id or no
  /// parseable date.
  pub fn into_transaction(self) -> Option<Transaction> {
    let external_id = first_string(&[&self.transaction_id, &self.id])?;
    let date = self
      .date
      .as_ref()
      .and_then(value_to_string)
      .and_then(|s| parse_flexible_date(&s))?;

    let raw_amount = self.amount.as_ref().and_then(value_to_f64).unwrap_or(0.0);
    let declared_income = self
      .transaction_type
      .as_deref()
      .map(|t| ZOHO_INCOME_TYPES.contains(&t.to_lowercase().as_str()))
      .unwrap_or(false);
    let kind = if declared_income && raw_amount >= 0.0 {
      TransactionType::Income
    } else {
      TransactionType::Expense
    };

    let description = first_string(&[&self.description, &self.reference_number, &self.payee])
      .unwrap_or_else(|| "Zoho transaction".to_string());
    let category = first_string(&[&self.account_name, &self.category])
      .unwrap_or_else(|| "Uncategorized".to_string());

    let mut extra = self.extra;
    if let Some(t) = self.transaction_type {
      extra.insert("transaction_type".to_string(), Value::String(t));
    }

    Some(Transaction {
      id: local_id(Source::Zoho, &external_id),
      external_id: Some(external_id),
      date,
      amount: raw_amount.abs(),
      description,
      category,
      source: Source::Zoho,
      kind,
      fees: None,
      gross: None,
      metadata: metadata_from(extra),
    })
  }
}

// ============================================================================
// Stripe balance transactions
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ApiStripeTransaction {
  pub id: Option<Value>,
  /// Unix seconds
  pub created: Option<Value>,
  pub date: Option<Value>,
  /// Minor units (cents)
  pub amount: Option<Value>,
  pub fee: Option<Value>,
  pub net: Option<Value>,
  pub description: Option<Value>,
  pub reporting_category: Option<Value>,
  #[serde(rename = "type")]
  pub kind: Option<String>,
  #[serde(flatten)]
  pub extra: HashMap<String, Value>,
}

const STRIPE_EXPENSE_TYPES: &[&str] = &["refund", "payout", "stripe_fee", "payment_failure_refund"];

impl ApiStripeTransaction {
  fn parse_date(&self) -> Option<chrono::NaiveDate> {
    if let Some(created) = &self.created {
      let date = match created {
        Value::Number(n) => n.as_i64().and_then(unix_to_date),
        other => value_to_string(other).and_then(|s| parse_flexible_date(&s)),
      };
      if date.is_some() {
        return date;
      }
    }
    self
      .date
      .as_ref()
      .and_then(value_to_string)
      .and_then(|s| parse_flexible_date(&s))
  }

  /// Normalize into a transaction. Minor units are converted to major units.
  pub fn into_transaction(self) -> Option<Transaction> {
    let external_id = self.id.as_ref().and_then(value_to_string)?;
    let date = self.parse_date()?;

    let cents = |v: &Option<Value>| v.as_ref().and_then(value_to_f64).map(|c| c / 100.0);
    let gross = cents(&self.amount).unwrap_or(0.0);
    let fee = cents(&self.fee);
    let net = cents(&self.net).unwrap_or(gross - fee.unwrap_or(0.0));

    let type_name = self.kind.clone().unwrap_or_else(|| "charge".to_string());
    let kind = if STRIPE_EXPENSE_TYPES.contains(&type_name.as_str()) || net < 0.0 {
      TransactionType::Expense
    } else {
      TransactionType::Income
    };

    let description = self
      .description
      .as_ref()
      .and_then(value_to_string)
      .unwrap_or_else(|| format!("Stripe {}", type_name));
    let category = self
      .reporting_category
      .as_ref()
      .and_then(value_to_string)
      .unwrap_or_else(|| type_name.clone());

    let mut extra = self.extra;
    extra.insert("type".to_string(), Value::String(type_name));

    Some(Transaction {
      id: local_id(Source::Stripe, &external_id),
      external_id: Some(external_id),
      date,
      amount: net.abs(),
      description,
      category,
      source: Source::Stripe,
      kind,
      fees: fee,
      gross: Some(gross.abs()),
      metadata: metadata_from(extra),
    })
  }
}

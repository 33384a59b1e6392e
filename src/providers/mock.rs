//! Deterministic stand-in data served when a provider is unreachable.

use sha2::{Digest, Sha256};

use super::types::{local_id, Source, Transaction, TransactionType};
use crate::dates::DateRange;

const INCOME_DESCRIPTIONS: &[&str] = &[
  "Invoice payment",
  "Subscription renewal",
  "Consulting retainer",
  "Product sale",
];

const EXPENSE_DESCRIPTIONS: &[&str] = &[
  "Software licenses",
  "Office supplies",
  "Contractor payment",
  "Hosting",
];

/// Mock transactions for a range. The same inputs always produce the same rows.
pub fn mock_transactions(source: Source, range: DateRange) -> Vec<Transaction> {
  let mut transactions = Vec::new();

  for date in range.start.iter_days().take_while(|d| *d <= range.end) {
    let digest = Sha256::digest(format!("{}:{}", source, date).as_bytes());
    // roughly one row every third day
    if digest[0] % 3 != 0 {
      continue;
    }

    let dollars = u16::from_be_bytes([digest[1], digest[2]]) % 5000 + 50;
    let amount = dollars as f64 + (digest[3] % 100) as f64 / 100.0;
    let kind = if digest[4] % 4 == 0 {
      TransactionType::Expense
    } else {
      TransactionType::Income
    };
    let descriptions = match kind {
      TransactionType::Income => INCOME_DESCRIPTIONS,
      TransactionType::Expense => EXPENSE_DESCRIPTIONS,
    };
    let description = descriptions[digest[5] as usize % descriptions.len()];

    let external_id = format!("mock-{}", hex::encode(&digest[..6]));
    let (fees, gross) = match source {
      Source::Stripe => {
        let fee = (amount * 0.029 * 100.0).round() / 100.0 + 0.30;
        (Some(fee), Some(amount + fee))
      }
      Source::Zoho => (None, None),
    };

    transactions.push(Transaction {
      id: local_id(source, &external_id),
      external_id: Some(external_id),
      date,
      amount,
      description: description.to_string(),
      category: if kind == TransactionType::Income {
        "Sales".to_string()
      } else {
        "Operating Expenses".to_string()
      },
      source,
      kind,
      fees,
      gross,
      metadata: Some(serde_json::json!({ "mock": true })),
    });
  }

  transactions
}

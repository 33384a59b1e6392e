//! Locally stored receivable flags on provider transactions.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;

use crate::cache::storage::{format_ts, parse_datetime};
use crate::db::Database;
use crate::providers::{Source, Transaction, TransactionType};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivableSelection {
  pub source: Source,
  pub transaction_id: String,
  pub note: Option<String>,
  pub selected_at: DateTime<Utc>,
}

/// A transaction with its receivable flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivableRow {
  pub transaction: Transaction,
  pub selected: bool,
  pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReceivables {
  pub source: Source,
  pub count: usize,
  pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivablesSummary {
  pub per_source: Vec<SourceReceivables>,
  pub total: f64,
}

#[derive(Clone)]
pub struct ReceivablesStore {
  db: Database,
}

impl ReceivablesStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Flag a transaction. Selecting it again replaces the note.
  pub fn select(&self, source: Source, transaction_id: &str, note: Option<&str>) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT INTO receivable_selections (source, transaction_id, note, selected_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(source, transaction_id) DO UPDATE SET note = excluded.note",
        params![source.as_str(), transaction_id, note, format_ts(Utc::now())],
      )
      .map_err(|e| eyre!("Failed to select {} {}: {}", source, transaction_id, e))?;
    Ok(())
  }

  /// Remove a flag. Returns false when it was not set.
  pub fn deselect(&self, source: Source, transaction_id: &str) -> Result<bool> {
    let removed = self
      .db
      .conn()?
      .execute(
        "DELETE FROM receivable_selections WHERE source = ? AND transaction_id = ?",
        params![source.as_str(), transaction_id],
      )
      .map_err(|e| eyre!("Failed to deselect {} {}: {}", source, transaction_id, e))?;
    Ok(removed > 0)
  }

  pub fn list(&self, source: Option<Source>) -> Result<Vec<ReceivableSelection>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT source, transaction_id, note, selected_at FROM receivable_selections
         WHERE ?1 IS NULL OR source = ?1
         ORDER BY selected_at DESC, transaction_id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    type RawSelection = (String, String, Option<String>, String);
    let rows: Vec<RawSelection> = stmt
      .query_map(params![source.map(|s| s.as_str())], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to query selections: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read selection: {}", e))?;

    rows
      .into_iter()
      .map(
        |(source, transaction_id, note, selected_at)| -> Result<ReceivableSelection> {
          Ok(ReceivableSelection {
            source: source.parse()?,
            transaction_id,
            note,
            selected_at: parse_datetime(&selected_at)?,
          })
        },
      )
      .collect()
  }

  /// Flag selected rows among `transactions` and total their income.
  pub fn summary(&self, transactions: &[Transaction]) -> Result<ReceivablesSummary> {
    let rows = merge(transactions, &self.list(None)?);
    Ok(summarize(&rows))
  }
}

/// Pair every transaction with its selection, if any.
pub fn merge(transactions: &[Transaction], selections: &[ReceivableSelection]) -> Vec<ReceivableRow> {
  let by_key: HashMap<(Source, &str), &ReceivableSelection> = selections
    .iter()
    .map(|s| ((s.source, s.transaction_id.as_str()), s))
    .collect();

  transactions
    .iter()
    .map(|tx| {
      let selection = by_key.get(&(tx.source, tx.id.as_str()));
      ReceivableRow {
        transaction: tx.clone(),
        selected: selection.is_some(),
        note: selection.and_then(|s| s.note.clone()),
      }
    })
    .collect()
}

/// Total selected income per source. Expenses never count as receivable.
pub fn summarize(rows: &[ReceivableRow]) -> ReceivablesSummary {
  let per_source: Vec<SourceReceivables> = Source::ALL
    .iter()
    .map(|&source| {
      let selected: Vec<&Transaction> = rows
        .iter()
        .filter(|r| r.selected && r.transaction.source == source)
        .filter(|r| r.transaction.kind == TransactionType::Income)
        .map(|r| &r.transaction)
        .collect();
      SourceReceivables {
        source,
        count: selected.len(),
        total: selected.iter().map(|t| t.amount).sum(),
      }
    })
    .collect();

  ReceivablesSummary {
    total: per_source.iter().map(|s| s.total).sum(),
    per_source,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test_utils::tx;

  fn store() -> ReceivablesStore {
    ReceivablesStore::new(Database::open_in_memory().unwrap())
  }

  #[test]
  fn test_select_and_deselect() {
    let store = store();
    store.select(Source::Zoho, "zoho-1", Some("net 30")).unwrap();
    store.select(Source::Stripe, "stripe-ch_1", None).unwrap();

    assert_eq!(store.list(None).unwrap().len(), 2);
    let zoho = store.list(Some(Source::Zoho)).unwrap();
    assert_eq!(zoho.len(), 1);
    assert_eq!(zoho[0].note.as_deref(), Some("net 30"));

    assert!(store.deselect(Source::Zoho, "zoho-1").unwrap());
    assert!(!store.deselect(Source::Zoho, "zoho-1").unwrap());
    assert!(store.list(Some(Source::Zoho)).unwrap().is_empty());
  }

  #[test]
  fn test_reselect_replaces_note() {
    let store = store();
    store.select(Source::Zoho, "zoho-1", Some("first")).unwrap();
    store.select(Source::Zoho, "zoho-1", Some("second")).unwrap();

    let selections = store.list(None).unwrap();
    assert_eq!(selections.len(), 1);
    assert_eq!(selections[0].note.as_deref(), Some("second"));
  }

  #[test]
  fn test_merge_matches_source_and_id() {
    let store = store();
    store.select(Source::Zoho, "zoho-1", Some("chase")).unwrap();
    // same id under the other source does not match
    store.select(Source::Stripe, "zoho-2", None).unwrap();

    let transactions = vec![
      tx(Source::Zoho, "1", "2024-01-05", 100.0),
      tx(Source::Zoho, "2", "2024-01-06", 40.0),
    ];
    let rows = merge(&transactions, &store.list(None).unwrap());
    assert!(rows[0].selected);
    assert_eq!(rows[0].note.as_deref(), Some("chase"));
    assert!(!rows[1].selected);
  }

  #[test]
  fn test_summary_totals_selected_income() {
    let store = store();
    let mut refund = tx(Source::Stripe, "re_1", "2024-01-09", 15.0);
    refund.kind = TransactionType::Expense;
    let transactions = vec![
      tx(Source::Zoho, "1", "2024-01-05", 100.0),
      tx(Source::Zoho, "2", "2024-01-06", 40.0),
      tx(Source::Stripe, "ch_1", "2024-01-07", 25.5),
      refund,
    ];
    store.select(Source::Zoho, "zoho-1", None).unwrap();
    store.select(Source::Stripe, "stripe-ch_1", None).unwrap();
    store.select(Source::Stripe, "stripe-re_1", None).unwrap();

    let summary = store.summary(&transactions).unwrap();
    assert_eq!(summary.per_source[0].count, 1);
    assert_eq!(summary.per_source[0].total, 100.0);
    assert_eq!(summary.per_source[1].count, 1);
    assert_eq!(summary.per_source[1].total, 25.5);
    assert_eq!(summary.total, 125.5);
  }
}

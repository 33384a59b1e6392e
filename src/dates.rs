//! Calendar helpers for month-partitioned caching.
//!
//! Every cache decision is made per calendar month, so most of the crate talks
//! in terms of [`YearMonth`] and inclusive [`DateRange`]s.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct YearMonth {
  pub year: i32,
  pub month: u32,
}

impl YearMonth {
  pub fn new(year: i32, month: u32) -> Result<Self> {
    if !(1..=12).contains(&month) {
      return Err(eyre!("Invalid month {} (expected 1-12)", month));
    }
    Ok(Self { year, month })
  }

  /// The month a date falls in.
  pub fn containing(date: NaiveDate) -> Self {
    Self {
      year: date.year(),
      month: date.month(),
    }
  }

  pub fn first_day(&self) -> NaiveDate {
    // month is always 1..=12 and day 1 exists in every month
    NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
  }

  pub fn last_day(&self) -> NaiveDate {
    self.next().first_day() - Duration::days(1)
  }

  pub fn next(&self) -> Self {
    if self.month == 12 {
      Self {
        year: self.year + 1,
        month: 1,
      }
    } else {
      Self {
        year: self.year,
        month: self.month + 1,
      }
    }
  }

  pub fn prev(&self) -> Self {
    if self.month == 1 {
      Self {
        year: self.year - 1,
        month: 12,
      }
    } else {
      Self {
        year: self.year,
        month: self.month - 1,
      }
    }
  }

  /// Whole-month range.
  pub fn range(&self) -> DateRange {
    DateRange {
      start: self.first_day(),
      end: self.last_day(),
    }
  }

  /// Number of months from `other` to `self` (positive when `self` is later).
  pub fn months_since(&self, other: YearMonth) -> i32 {
    (self.year - other.year) * 12 + (self.month as i32 - other.month as i32)
  }
}

impl fmt::Display for YearMonth {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:04}-{:02}", self.year, self.month)
  }
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
  pub start: NaiveDate,
  pub end: NaiveDate,
}

impl DateRange {
  pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
    if end < start {
      return Err(eyre!("Invalid date range: {} is after {}", start, end));
    }
    Ok(Self { start, end })
  }

  /// Parse a range from two `YYYY-MM-DD` strings.
  #[cfg(test)]
  pub fn parse(start: &str, end: &str) -> Result<Self> {
    let start = NaiveDate::parse_from_str(start, "%Y-%m-%d")
      .map_err(|e| eyre!("Invalid start date '{}': {}", start, e))?;
    let end = NaiveDate::parse_from_str(end, "%Y-%m-%d")
      .map_err(|e| eyre!("Invalid end date '{}': {}", end, e))?;
    Self::new(start, end)
  }

  pub fn contains(&self, date: NaiveDate) -> bool {
    date >= self.start && date <= self.end
  }

  /// Number of days, inclusive of both ends.
  pub fn days(&self) -> i64 {
    (self.end - self.start).num_days() + 1
  }

  pub fn overlaps(&self, other: &DateRange) -> bool {
    self.start <= other.end && other.start <= self.end
  }

  pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
    let start = self.start.max(other.start);
    let end = self.end.min(other.end);
    (start <= end).then_some(DateRange { start, end })
  }

  /// True if this range covers `other` entirely.
  pub fn covers(&self, other: &DateRange) -> bool {
    self.start <= other.start && self.end >= other.end
  }

  pub fn covers_month(&self, ym: YearMonth) -> bool {
    self.covers(&ym.range())
  }

  /// Months touched by this range, in order.
  pub fn months(&self) -> Vec<YearMonth> {
    let last = YearMonth::containing(self.end);
    let mut months = Vec::new();
    let mut ym = YearMonth::containing(self.start);
    while ym <= last {
      months.push(ym);
      ym = ym.next();
    }
    months
  }

  /// Split into per-month pieces, each clipped to this range.
  pub fn split_by_month(&self) -> Vec<(YearMonth, DateRange)> {
    self
      .months()
      .into_iter()
      .filter_map(|ym| ym.range().intersect(self).map(|piece| (ym, piece)))
      .collect()
  }

  /// True if `other` starts the day after this range ends.
  pub fn is_adjacent_to(&self, other: &DateRange) -> bool {
    self.end.succ_opt() == Some(other.start)
  }
}

impl fmt::Display for DateRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}..{}", self.start, self.end)
  }
}

/// Merge adjacent or overlapping ranges. Input need not be sorted.
pub fn coalesce(mut ranges: Vec<DateRange>) -> Vec<DateRange> {
  ranges.sort_by_key(|r| r.start);
  let mut merged: Vec<DateRange> = Vec::with_capacity(ranges.len());
  for range in ranges {
    match merged.last_mut() {
      Some(last) if last.overlaps(&range) || last.is_adjacent_to(&range) => {
        last.end = last.end.max(range.end);
      }
      _ => merged.push(range),
    }
  }
  merged
}

/// Parse the date formats providers send back.
///
/// Accepts `YYYY-MM-DD`, RFC 3339 timestamps (normalized to UTC before the
/// date is taken), `YYYY-MM-DD HH:MM:SS`, and integer Unix seconds.
pub fn parse_flexible_date(s: &str) -> Option<NaiveDate> {
  let s = s.trim();
  if s.is_empty() {
    return None;
  }

  if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
    return Some(date);
  }

  if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
    return Some(dt.with_timezone(&Utc).date_naive());
  }

  if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
    return Some(dt.date());
  }

  if let Ok(secs) = s.parse::<i64>() {
    return unix_to_date(secs);
  }

  None
}

/// Convert Unix seconds to a UTC calendar date.
pub fn unix_to_date(secs: i64) -> Option<NaiveDate> {
  DateTime::from_timestamp(secs, 0).map(|dt| dt.date_naive())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
  }

  #[test]
  fn test_month_bounds() {
    let feb = YearMonth::new(2024, 2).unwrap();
    assert_eq!(feb.first_day(), d("2024-02-01"));
    assert_eq!(feb.last_day(), d("2024-02-29"));

    let feb = YearMonth::new(2023, 2).unwrap();
    assert_eq!(feb.last_day(), d("2023-02-28"));
  }

  #[test]
  fn test_month_wraps_year() {
    let dec = YearMonth::new(2023, 12).unwrap();
    assert_eq!(dec.next(), YearMonth::new(2024, 1).unwrap());
    assert_eq!(dec.next().prev(), dec);
    assert_eq!(dec.last_day(), d("2023-12-31"));
  }

  #[test]
  fn test_invalid_month_rejected() {
    assert!(YearMonth::new(2024, 13).is_err());
    assert!(YearMonth::new(2024, 0).is_err());
  }

  #[test]
  fn test_months_since() {
    let a = YearMonth::new(2024, 2).unwrap();
    let b = YearMonth::new(2023, 11).unwrap();
    assert_eq!(a.months_since(b), 3);
    assert_eq!(b.months_since(a), -3);
  }

  #[test]
  fn test_range_rejects_reversed() {
    assert!(DateRange::new(d("2024-02-02"), d("2024-02-01")).is_err());
    assert!(DateRange::parse("2024-01-01", "2024-01-01").is_ok());
  }

  #[test]
  fn test_split_by_month_clips() {
    let range = DateRange::parse("2023-12-15", "2024-02-10").unwrap();
    let pieces = range.split_by_month();
    assert_eq!(pieces.len(), 3);
    assert_eq!(pieces[0].1, DateRange::parse("2023-12-15", "2023-12-31").unwrap());
    assert_eq!(pieces[1].1, YearMonth::new(2024, 1).unwrap().range());
    assert_eq!(pieces[2].1, DateRange::parse("2024-02-01", "2024-02-10").unwrap());

    assert!(!range.covers_month(pieces[0].0));
    assert!(range.covers_month(pieces[1].0));
  }

  #[test]
  fn test_intersect_and_days() {
    let a = DateRange::parse("2024-01-01", "2024-01-31").unwrap();
    let b = DateRange::parse("2024-01-20", "2024-02-10").unwrap();
    let i = a.intersect(&b).unwrap();
    assert_eq!(i, DateRange::parse("2024-01-20", "2024-01-31").unwrap());
    assert_eq!(i.days(), 12);

    let c = DateRange::parse("2024-03-01", "2024-03-02").unwrap();
    assert!(a.intersect(&c).is_none());
  }

  #[test]
  fn test_coalesce_adjacent() {
    let ranges = vec![
      DateRange::parse("2024-02-01", "2024-02-29").unwrap(),
      DateRange::parse("2024-01-01", "2024-01-31").unwrap(),
      DateRange::parse("2024-04-01", "2024-04-30").unwrap(),
    ];
    let merged = coalesce(ranges);
    assert_eq!(
      merged,
      vec![
        DateRange::parse("2024-01-01", "2024-02-29").unwrap(),
        DateRange::parse("2024-04-01", "2024-04-30").unwrap(),
      ]
    );
  }

  #[test]
  fn test_parse_flexible_date() {
    assert_eq!(parse_flexible_date("2024-03-05"), Some(d("2024-03-05")));
    assert_eq!(parse_flexible_date("2024-03-05 10:00:00"), Some(d("2024-03-05")));
    // 23:30 at -05:00 is already the next day in UTC
    assert_eq!(
      parse_flexible_date("2024-03-05T23:30:00-05:00"),
      Some(d("2024-03-06"))
    );
    assert_eq!(parse_flexible_date("1704067200"), Some(d("2024-01-01")));
    assert_eq!(parse_flexible_date("not a date"), None);
    assert_eq!(parse_flexible_date(""), None);
  }
}

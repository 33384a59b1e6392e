use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::dates::YearMonth;

const MONTH_NAMES: [&str; 12] = [
  "January",
  "February",
  "March",
  "April",
  "May",
  "June",
  "July",
  "August",
  "September",
  "October",
  "November",
  "December",
];

/// Truncate a string to a maximum number of characters, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

/// "Jan 5, 2024"
pub fn format_display_date(date: NaiveDate) -> String {
  date.format("%b %-d, %Y").to_string()
}

/// "January 2024"
pub fn format_month_label(ym: YearMonth) -> String {
  let name = MONTH_NAMES
    .get(ym.month as usize - 1)
    .copied()
    .unwrap_or("?");
  format!("{} {}", name, ym.year)
}

/// Dollar amount with thousands separators, e.g. "$1,234.56" or "-$12.00".
pub fn format_amount(amount: f64) -> String {
  let cents = (amount.abs() * 100.0).round() as u64;
  let whole = (cents / 100).to_string();
  let frac = cents % 100;

  let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
  for (i, ch) in whole.chars().enumerate() {
    if i > 0 && (whole.len() - i) % 3 == 0 {
      grouped.push(',');
    }
    grouped.push(ch);
  }

  let sign = if amount < 0.0 && cents > 0 { "-" } else { "" };
  format!("{}${}.{:02}", sign, grouped, frac)
}

/// Relative age of a timestamp, e.g. "5m ago".
pub fn format_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
  let age = now - then;
  if age < Duration::minutes(1) {
    "just now".to_string()
  } else if age < Duration::hours(1) {
    format!("{}m ago", age.num_minutes())
  } else if age < Duration::days(1) {
    format!("{}h ago", age.num_hours())
  } else {
    format!("{}d ago", age.num_days())
  }
}

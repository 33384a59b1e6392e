/// Schema for the cache and receivables tables.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Normalized provider transactions, partitioned by source and month
CREATE TABLE IF NOT EXISTS cached_transactions (
    id TEXT NOT NULL,
    source TEXT NOT NULL,
    identity TEXT NOT NULL,
    external_id TEXT,
    date TEXT NOT NULL,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    amount REAL NOT NULL,
    description TEXT NOT NULL,
    category TEXT NOT NULL,
    type TEXT NOT NULL,
    fees REAL,
    gross REAL,
    metadata TEXT,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (source, identity)
);

CREATE INDEX IF NOT EXISTS idx_cached_transactions_month
    ON cached_transactions(source, year, month);

CREATE INDEX IF NOT EXISTS idx_cached_transactions_date
    ON cached_transactions(source, date);

-- One row per (source, year, month) that has been fetched
CREATE TABLE IF NOT EXISTS monthly_cache (
    source TEXT NOT NULL,
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,
    transaction_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (source, year, month)
);

-- Fetched ranges that do not align with a calendar month
CREATE TABLE IF NOT EXISTS cache_segments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    transaction_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    last_refreshed_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (source, start_date, end_date)
);

-- Append-only log of cache events
CREATE TABLE IF NOT EXISTS cache_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    event TEXT NOT NULL,
    start_date TEXT NOT NULL,
    end_date TEXT NOT NULL,
    transaction_count INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_cache_metrics_recorded
    ON cache_metrics(recorded_at);

-- Transactions the user flagged as receivables
CREATE TABLE IF NOT EXISTS receivable_selections (
    source TEXT NOT NULL,
    transaction_id TEXT NOT NULL,
    note TEXT,
    selected_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (source, transaction_id)
);
"#;

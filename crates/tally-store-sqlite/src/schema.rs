//! SQL schema for the Tally SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS accounts (
    account_id    INTEGER PRIMARY KEY,
    currency_code TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_seen_at  TEXT NOT NULL
);

-- One header per capture, so an empty set is still an observable capture.
CREATE TABLE IF NOT EXISTS snapshot_captures (
    entity_set  TEXT    NOT NULL,   -- SnapshotKind discriminant
    account_id  INTEGER NOT NULL REFERENCES accounts(account_id),
    captured_at TEXT    NOT NULL,   -- RFC 3339 UTC, microseconds
    row_count   INTEGER NOT NULL,
    written_at  TEXT    NOT NULL,
    PRIMARY KEY (entity_set, account_id, captured_at)
);

CREATE TABLE IF NOT EXISTS snapshot_rows (
    entity_set      TEXT    NOT NULL,
    account_id      INTEGER NOT NULL,
    captured_at     TEXT    NOT NULL,
    row_key         TEXT    NOT NULL,
    references_json TEXT    NOT NULL DEFAULT '[]',
    fields_json     TEXT    NOT NULL,
    PRIMARY KEY (entity_set, account_id, captured_at, row_key),
    FOREIGN KEY (entity_set, account_id, captured_at)
        REFERENCES snapshot_captures(entity_set, account_id, captured_at)
);

-- History rows are append-only.
-- No UPDATE or DELETE is ever issued against this table.
CREATE TABLE IF NOT EXISTS history_records (
    kind         TEXT    NOT NULL,  -- HistoryKind discriminant
    natural_key  TEXT    NOT NULL,  -- JSON array of key components
    account_id   INTEGER NOT NULL REFERENCES accounts(account_id),
    occurred_at  TEXT    NOT NULL,
    payload_json TEXT    NOT NULL,
    recorded_at  TEXT    NOT NULL,
    PRIMARY KEY (kind, natural_key)
);

CREATE TABLE IF NOT EXISTS dimensions (
    kind            TEXT NOT NULL,
    key             TEXT NOT NULL,
    attributes_json TEXT,
    first_seen_at   TEXT NOT NULL,
    last_seen_at    TEXT NOT NULL,
    PRIMARY KEY (kind, key)
);

CREATE TABLE IF NOT EXISTS raw_pages (
    page_id        INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint       TEXT    NOT NULL,
    account_id     INTEGER NOT NULL REFERENCES accounts(account_id),
    cycle_id       TEXT    NOT NULL,
    fetched_at     TEXT    NOT NULL,
    payload_hash   TEXT    NOT NULL,  -- hex SHA-256 of payload_json
    payload_json   TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS history_account_idx  ON history_records(account_id, kind);
CREATE INDEX IF NOT EXISTS history_occurred_idx ON history_records(occurred_at);
CREATE INDEX IF NOT EXISTS raw_pages_cycle_idx  ON raw_pages(cycle_id);

PRAGMA user_version = 1;
";

//! SQL schema for the threadline SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One row per (user, source, external_id). Re-imports hit the UNIQUE key.
CREATE TABLE IF NOT EXISTS communications (
    id                TEXT PRIMARY KEY,
    user_id           TEXT NOT NULL,
    source            TEXT NOT NULL,   -- 'messages' | 'backup' | 'mail'
    external_id       TEXT NOT NULL,
    channel           TEXT NOT NULL,
    direction         TEXT NOT NULL,   -- 'inbound' | 'outbound'
    participants      TEXT NOT NULL,   -- JSON array of this record's parties
    participants_flat TEXT NOT NULL DEFAULT '',  -- every party of the thread
    thread_id         TEXT NOT NULL,
    subject           TEXT,
    body_text         TEXT NOT NULL,
    sent_at           TEXT NOT NULL,   -- RFC 3339 UTC, fixed width
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    UNIQUE (user_id, source, external_id)
);

-- One physical file per distinct content hash.
CREATE TABLE IF NOT EXISTS attachment_blobs (
    content_hash TEXT PRIMARY KEY,
    storage_path TEXT NOT NULL,
    size         INTEGER NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attachments (
    id               TEXT PRIMARY KEY,
    communication_id TEXT NOT NULL REFERENCES communications(id),
    external_id      TEXT NOT NULL,
    filename         TEXT,
    mime_type        TEXT,
    content_hash     TEXT NOT NULL REFERENCES attachment_blobs(content_hash),
    UNIQUE (communication_id, external_id)
);

-- Exactly one of communication_id / thread_id is set.
CREATE TABLE IF NOT EXISTS links (
    link_id          TEXT PRIMARY KEY,
    communication_id TEXT REFERENCES communications(id),
    thread_id        TEXT,
    transaction_id   TEXT NOT NULL,
    link_source      TEXT NOT NULL CHECK (link_source IN ('auto', 'manual')),
    linked_at        TEXT NOT NULL,
    CHECK ((communication_id IS NULL) != (thread_id IS NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS links_communication_txn_idx
    ON links(communication_id, transaction_id) WHERE communication_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS links_thread_txn_idx
    ON links(thread_id, transaction_id) WHERE thread_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS links_txn_idx ON links(transaction_id);

CREATE INDEX IF NOT EXISTS communications_thread_idx ON communications(user_id, thread_id);
CREATE INDEX IF NOT EXISTS communications_sent_idx   ON communications(user_id, sent_at);
CREATE INDEX IF NOT EXISTS attachments_comm_idx      ON attachments(communication_id);

PRAGMA user_version = 1;
";

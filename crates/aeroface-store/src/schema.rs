pub(crate) const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS identities (
    id            TEXT PRIMARY KEY,
    email         TEXT UNIQUE,
    display_name  TEXT,
    embedding     BLOB,
    embedding_dim INTEGER,
    encrypted     INTEGER NOT NULL DEFAULT 0,
    model_version TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    identity_id   TEXT NOT NULL REFERENCES identities(id),
    venue         TEXT NOT NULL,
    visit         INTEGER NOT NULL,
    checkin_time  TEXT NOT NULL,
    checkout_time TEXT,
    PRIMARY KEY (identity_id, venue, visit)
);

CREATE UNIQUE INDEX IF NOT EXISTS attendance_one_open
    ON attendance (identity_id, venue) WHERE checkout_time IS NULL;
";

pub(crate) const SELECT_IDENTITY: &str =
    "SELECT id, email, display_name, embedding, encrypted, model_version FROM identities";

pub(crate) const SELECT_SESSION: &str =
    "SELECT identity_id, venue, visit, checkin_time, checkout_time FROM attendance";

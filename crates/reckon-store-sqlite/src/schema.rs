//! SQL schema for the Reckon SQLite store.
//!
//! Executed once at connection startup via `PRAGMA user_version`. Future
//! migrations will be gated on that version number.

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- One row per published ruleset. Only the lifecycle columns are ever
-- updated, and every update bumps `revision`.
CREATE TABLE IF NOT EXISTS snapshots (
    ruleset_id     TEXT PRIMARY KEY,
    published_at   TEXT NOT NULL,
    status         TEXT NOT NULL,   -- 'draft' | 'validated' | 'activated' | 'superseded'
    revision       INTEGER NOT NULL,
    recorded_at    TEXT NOT NULL,
    activated_at   TEXT,
    valid_to       TEXT,
    superseded_at  TEXT,
    candidate_json TEXT             -- draft contents; NULL once validated
);

-- Record tables are strictly append-only and keyed by (id, version).
-- No UPDATE or DELETE is ever issued against them.
CREATE TABLE IF NOT EXISTS rules (
    record_id    TEXT NOT NULL,
    version      INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    body_json    TEXT NOT NULL,
    recorded_at  TEXT NOT NULL,
    PRIMARY KEY (record_id, version)
);

CREATE TABLE IF NOT EXISTS refs (
    record_id    TEXT NOT NULL,
    version      INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    body_json    TEXT NOT NULL,
    recorded_at  TEXT NOT NULL,
    PRIMARY KEY (record_id, version)
);

CREATE TABLE IF NOT EXISTS assumptions (
    record_id    TEXT NOT NULL,
    version      INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    body_json    TEXT NOT NULL,
    recorded_at  TEXT NOT NULL,
    PRIMARY KEY (record_id, version)
);

-- Which record versions make up a validated snapshot.
CREATE TABLE IF NOT EXISTS snapshot_members (
    ruleset_id TEXT NOT NULL REFERENCES snapshots(ruleset_id),
    kind       TEXT NOT NULL,   -- 'rule' | 'reference' | 'assumption'
    record_id  TEXT NOT NULL,
    version    INTEGER NOT NULL,
    PRIMARY KEY (ruleset_id, kind, record_id, version)
);

CREATE TABLE IF NOT EXISTS tie_breaks (
    ruleset_id  TEXT NOT NULL REFERENCES snapshots(ruleset_id),
    calculation TEXT NOT NULL,
    preferred   TEXT NOT NULL,
    PRIMARY KEY (ruleset_id, calculation, preferred)
);

-- Single-row counter bumped with every header change.
CREATE TABLE IF NOT EXISTS registry (
    id       INTEGER PRIMARY KEY CHECK (id = 1),
    revision INTEGER NOT NULL
);
INSERT OR IGNORE INTO registry (id, revision) VALUES (1, 0);

-- One row per canonical computation.
CREATE TABLE IF NOT EXISTS runs (
    run_id              TEXT PRIMARY KEY,
    scenario_id         TEXT NOT NULL,
    ruleset_id          TEXT NOT NULL REFERENCES snapshots(ruleset_id),
    as_of               TEXT NOT NULL,   -- YYYY-MM-DD
    inputs_hash         TEXT NOT NULL,
    idempotency_key     TEXT UNIQUE,
    calculated_at       TEXT NOT NULL,   -- ISO 8601 UTC; server-assigned
    failures_json       TEXT NOT NULL DEFAULT '[]',
    reconciliation_json TEXT NOT NULL,
    UNIQUE (scenario_id, ruleset_id, as_of, inputs_hash)
);

-- Facts are immutable; their ids are content-derived.
CREATE TABLE IF NOT EXISTS facts (
    fact_id       TEXT PRIMARY KEY,
    run_id        TEXT NOT NULL REFERENCES runs(run_id),
    seq           INTEGER NOT NULL,   -- position within the run
    scenario_id   TEXT NOT NULL,
    ruleset_id    TEXT NOT NULL REFERENCES snapshots(ruleset_id),
    as_of         TEXT NOT NULL,
    period_index  INTEGER NOT NULL,
    calculation   TEXT NOT NULL,
    entity_id     TEXT,               -- NULL for household facts
    value_json    TEXT NOT NULL,
    inputs_hash   TEXT NOT NULL,
    rounding_json TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS provenance_links (
    fact_id     TEXT NOT NULL REFERENCES facts(fact_id),
    seq         INTEGER NOT NULL,
    role        TEXT NOT NULL,
    target_kind TEXT NOT NULL,   -- 'rule' | 'reference' | 'assumption' | 'parameter' | 'input' | 'fact'
    target_json TEXT NOT NULL,
    window_json TEXT,
    PRIMARY KEY (fact_id, seq)
);

CREATE TABLE IF NOT EXISTS trace_entries (
    run_id        TEXT NOT NULL REFERENCES runs(run_id),
    seq           INTEGER NOT NULL,
    calculation   TEXT,
    entity_id     TEXT,
    field         TEXT,
    severity      TEXT NOT NULL,   -- 'info' | 'warning' | 'decision_point'
    period_index  INTEGER NOT NULL,
    explanation   TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (run_id, seq)
);

CREATE INDEX IF NOT EXISTS runs_scenario_idx   ON runs(scenario_id, as_of);
CREATE INDEX IF NOT EXISTS facts_run_idx       ON facts(run_id, seq);
CREATE INDEX IF NOT EXISTS facts_scenario_idx  ON facts(scenario_id, as_of);
CREATE INDEX IF NOT EXISTS links_target_idx    ON provenance_links(target_kind);
CREATE INDEX IF NOT EXISTS trace_calc_idx      ON trace_entries(calculation);

PRAGMA user_version = 1;
";

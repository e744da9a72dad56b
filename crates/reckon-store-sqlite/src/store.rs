//! [`SqliteStore`], the SQLite implementation of [`RuleStore`].

use std::path::Path;

use chrono::{NaiveDate, Utc};
use rusqlite::{OptionalExtension as _, params};
use uuid::Uuid;

use reckon_core::{
  FactId, RulesetId, ScenarioId,
  fact::Fact,
  resolve::SnapshotIndex,
  rule::{RecordKey, RecordKind},
  snapshot::{
    CandidateRuleset, HeaderPlan, IssueCode, RulesetSnapshot, SnapshotHeader,
    ValidationIssue, ValidationReport, plan_activation, plan_rollback,
    plan_validation, validate_snapshot,
  },
  store::{NewRun, RuleStore, RunKey, RunRecord, ScenarioTrace},
};

use crate::{
  Error, Result,
  encode::{
    FACT_COLUMNS, HEADER_COLUMNS, HeaderUpdate, RUN_COLUMNS, RawFact,
    RawHeader, RawRun, RawSnapshot, RawTraceEntry, RecordRow, RunRow,
    TRACE_COLUMNS, encode_date, encode_dt, encode_record_kind, encode_records,
    record_table,
  },
  schema::SCHEMA,
};

// ─── Row loaders (run on the connection thread) ──────────────────────────────

type Links = Vec<(String, String, Option<String>)>;

/// Records already stored under the same `(id, version)` with different
/// content.
fn conflicting_records(
  conn: &rusqlite::Connection,
  rows: &[RecordRow],
) -> rusqlite::Result<Vec<(RecordKind, String, u32)>> {
  let mut conflicts = Vec::new();
  for row in rows {
    let sql = format!(
      "SELECT content_hash FROM {} WHERE record_id = ?1 AND version = ?2",
      record_table(row.kind)
    );
    let stored: Option<String> = conn
      .query_row(&sql, params![row.record_id, row.version], |r| r.get(0))
      .optional()?;
    if stored.is_some_and(|hash| hash != row.content_hash) {
      conflicts.push((row.kind, row.record_id.clone(), row.version));
    }
  }
  Ok(conflicts)
}

fn load_headers(conn: &rusqlite::Connection) -> rusqlite::Result<Vec<RawHeader>> {
  let sql = format!(
    "SELECT {HEADER_COLUMNS} FROM snapshots ORDER BY published_at, ruleset_id"
  );
  let mut stmt = conn.prepare(&sql)?;
  stmt
    .query_map([], RawHeader::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()
}

fn load_members(
  conn: &rusqlite::Connection,
  ruleset_id: &str,
  kind: RecordKind,
) -> rusqlite::Result<Vec<String>> {
  let sql = format!(
    "SELECT r.body_json FROM snapshot_members m
     JOIN {} r ON r.record_id = m.record_id AND r.version = m.version
     WHERE m.ruleset_id = ?1 AND m.kind = ?2
     ORDER BY r.record_id, r.version",
    record_table(kind)
  );
  let mut stmt = conn.prepare(&sql)?;
  stmt
    .query_map(params![ruleset_id, encode_record_kind(kind)], |r| r.get(0))?
    .collect::<rusqlite::Result<Vec<_>>>()
}

fn load_snapshot(
  conn: &rusqlite::Connection,
  ruleset_id: &str,
) -> rusqlite::Result<Option<RawSnapshot>> {
  let sql = format!(
    "SELECT {HEADER_COLUMNS}, candidate_json FROM snapshots WHERE ruleset_id = ?1"
  );
  let row = conn
    .query_row(&sql, params![ruleset_id], |r| {
      Ok((RawHeader::from_row(r)?, r.get::<_, Option<String>>(8)?))
    })
    .optional()?;
  let Some((header, candidate_json)) = row else {
    return Ok(None);
  };

  let mut stmt = conn.prepare(
    "SELECT calculation, preferred FROM tie_breaks
     WHERE ruleset_id = ?1 ORDER BY calculation, preferred",
  )?;
  let tie_breaks = stmt
    .query_map(params![ruleset_id], |r| Ok((r.get(0)?, r.get(1)?)))?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  Ok(Some(RawSnapshot {
    header,
    candidate_json,
    rules: load_members(conn, ruleset_id, RecordKind::Rule)?,
    references: load_members(conn, ruleset_id, RecordKind::Reference)?,
    assumptions: load_members(conn, ruleset_id, RecordKind::Assumption)?,
    tie_breaks,
  }))
}

fn load_links(conn: &rusqlite::Connection, fact_id: &str) -> rusqlite::Result<Links> {
  let mut stmt = conn.prepare(
    "SELECT role, target_json, window_json FROM provenance_links
     WHERE fact_id = ?1 ORDER BY seq",
  )?;
  stmt
    .query_map(params![fact_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
    .collect::<rusqlite::Result<Vec<_>>>()
}

fn load_run(
  conn: &rusqlite::Connection,
  run_id: &str,
) -> rusqlite::Result<Option<RawRun>> {
  let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1");
  let Some(mut run) = conn
    .query_row(&sql, params![run_id], RawRun::from_row)
    .optional()?
  else {
    return Ok(None);
  };

  let sql = format!("SELECT {FACT_COLUMNS} FROM facts WHERE run_id = ?1 ORDER BY seq");
  let mut stmt = conn.prepare(&sql)?;
  let mut facts = stmt
    .query_map(params![run_id], RawFact::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  for fact in &mut facts {
    fact.links = load_links(conn, &fact.fact_id)?;
  }
  run.facts = facts;

  let sql = format!(
    "SELECT {TRACE_COLUMNS} FROM trace_entries WHERE run_id = ?1 ORDER BY seq"
  );
  let mut stmt = conn.prepare(&sql)?;
  run.trace = stmt
    .query_map(params![run_id], RawTraceEntry::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  Ok(Some(run))
}

// ─── Header writes ───────────────────────────────────────────────────────────

/// A header whose stored revision was not the one a plan was built on.
struct Stale {
  ruleset_id: String,
  expected:   i64,
  actual:     Option<i64>,
}

impl Stale {
  fn into_error(self) -> Error {
    let expected = u64::try_from(self.expected).unwrap_or_default();
    match self.actual {
      Some(actual) => Error::Core(reckon_core::Error::ConcurrentModification {
        ruleset_id: self.ruleset_id.into(),
        expected,
        actual: u64::try_from(actual).unwrap_or_default(),
      }),
      None => Error::Core(reckon_core::Error::RulesetNotFound(
        self.ruleset_id.into(),
      )),
    }
  }
}

fn current_revision(
  conn: &rusqlite::Connection,
  ruleset_id: &str,
) -> rusqlite::Result<Option<i64>> {
  conn
    .query_row(
      "SELECT revision FROM snapshots WHERE ruleset_id = ?1",
      params![ruleset_id],
      |r| r.get(0),
    )
    .optional()
}

fn bump_registry(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
  conn.execute("UPDATE registry SET revision = revision + 1 WHERE id = 1", [])?;
  Ok(())
}

/// Apply header updates, each only if the stored revision is the one it
/// replaces. The caller commits only when this returns `Ok(None)`.
fn apply_updates(
  conn: &rusqlite::Connection,
  updates: &[HeaderUpdate],
) -> rusqlite::Result<Option<Stale>> {
  for update in updates {
    let changed = conn.execute(
      "UPDATE snapshots
       SET status = ?2, revision = ?3, activated_at = ?4, valid_to = ?5,
           superseded_at = ?6
       WHERE ruleset_id = ?1 AND revision = ?7",
      params![
        update.ruleset_id,
        update.status,
        update.revision,
        update.activated_at,
        update.valid_to,
        update.superseded_at,
        update.revision - 1,
      ],
    )?;
    if changed == 0 {
      return Ok(Some(Stale {
        ruleset_id: update.ruleset_id.clone(),
        expected:   update.revision - 1,
        actual:     current_revision(conn, &update.ruleset_id)?,
      }));
    }
  }
  bump_registry(conn)?;
  Ok(None)
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Reckon ruleset and result store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn headers(&self) -> Result<Vec<SnapshotHeader>> {
    let raw = self.conn.call(|conn| Ok(load_headers(conn)?)).await?;
    raw.into_iter().map(RawHeader::into_header).collect()
  }

  /// Apply a lifecycle plan atomically, failing if any header moved since
  /// the plan was built.
  async fn apply_plan(&self, plan: &HeaderPlan) -> Result<()> {
    let updates: Vec<HeaderUpdate> =
      plan.updates.iter().map(HeaderUpdate::new).collect();
    let stale = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if let Some(stale) = apply_updates(&tx, &updates)? {
          return Ok(Some(stale));
        }
        tx.commit()?;
        Ok(None)
      })
      .await?;
    match stale {
      Some(stale) => Err(stale.into_error()),
      None => Ok(()),
    }
  }
}

// ─── RuleStore impl ──────────────────────────────────────────────────────────

impl RuleStore for SqliteStore {
  type Error = Error;

  // ── Snapshot lifecycle ────────────────────────────────────────────────────

  async fn publish(&self, candidate: CandidateRuleset) -> Result<SnapshotHeader> {
    let candidate_json = serde_json::to_string(&candidate)?;
    let header = candidate.into_draft(Utc::now()).header;

    let id_str          = header.ruleset_id.to_string();
    let published_str   = encode_dt(header.published_at);
    let status_str      = header.status.to_string();
    let revision        = header.revision as i64;
    let recorded_str    = encode_dt(header.recorded_at);

    let inserted = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let inserted = tx.execute(
          "INSERT OR IGNORE INTO snapshots (
             ruleset_id, published_at, status, revision, recorded_at,
             candidate_json
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
          params![
            id_str,
            published_str,
            status_str,
            revision,
            recorded_str,
            candidate_json,
          ],
        )?;
        if inserted == 1 {
          bump_registry(&tx)?;
        }
        tx.commit()?;
        Ok(inserted)
      })
      .await?;

    if inserted == 0 {
      return Err(Error::Core(reckon_core::Error::RulesetExists(
        header.ruleset_id,
      )));
    }
    tracing::info!(ruleset = %header.ruleset_id, "published draft ruleset");
    Ok(header)
  }

  async fn validate(&self, ruleset_id: RulesetId) -> Result<ValidationReport> {
    let Some(snapshot) = self.get_snapshot(ruleset_id.clone()).await? else {
      return Err(Error::Core(reckon_core::Error::RulesetNotFound(ruleset_id)));
    };
    let next = plan_validation(&snapshot.header)?;

    let mut issues = validate_snapshot(&snapshot);
    let rows = encode_records(&snapshot)?;
    let well_formed = issues.is_empty();
    let update = HeaderUpdate::new(&next);
    let tie_breaks: Vec<(String, String)> = snapshot
      .tie_breaks
      .iter()
      .map(|tb| (tb.calculation.to_string(), tb.preferred.clone()))
      .collect();
    let recorded_str = encode_dt(Utc::now());

    let (conflicts, stale) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        // Checked in the same transaction as the inserts below, so a record
        // can't change between the check and `INSERT OR IGNORE`.
        let conflicts = conflicting_records(&tx, &rows)?;
        if !well_formed || !conflicts.is_empty() {
          // A rejected draft is discarded, not kept half-validated.
          let deleted = tx.execute(
            "DELETE FROM snapshots WHERE ruleset_id = ?1 AND revision = ?2",
            params![update.ruleset_id, update.revision - 1],
          )?;
          if deleted == 0 {
            let stale = Stale {
              ruleset_id: update.ruleset_id.clone(),
              expected:   update.revision - 1,
              actual:     current_revision(&tx, &update.ruleset_id)?,
            };
            return Ok((conflicts, Some(stale)));
          }
          bump_registry(&tx)?;
          tx.commit()?;
          return Ok((conflicts, None));
        }

        for row in &rows {
          let sql = format!(
            "INSERT OR IGNORE INTO {} (
               record_id, version, content_hash, body_json, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5)",
            record_table(row.kind)
          );
          tx.execute(
            &sql,
            params![
              row.record_id,
              row.version,
              row.content_hash,
              row.body_json,
              recorded_str,
            ],
          )?;
          tx.execute(
            "INSERT INTO snapshot_members (ruleset_id, kind, record_id, version)
             VALUES (?1, ?2, ?3, ?4)",
            params![
              update.ruleset_id,
              encode_record_kind(row.kind),
              row.record_id,
              row.version,
            ],
          )?;
        }
        for (calculation, preferred) in &tie_breaks {
          tx.execute(
            "INSERT INTO tie_breaks (ruleset_id, calculation, preferred)
             VALUES (?1, ?2, ?3)",
            params![update.ruleset_id, calculation, preferred],
          )?;
        }
        if let Some(stale) = apply_updates(&tx, std::slice::from_ref(&update))? {
          return Ok((conflicts, Some(stale)));
        }
        tx.execute(
          "UPDATE snapshots SET candidate_json = NULL WHERE ruleset_id = ?1",
          params![update.ruleset_id],
        )?;
        tx.commit()?;
        Ok((conflicts, None))
      })
      .await?;

    if let Some(stale) = stale {
      return Err(stale.into_error());
    }
    for (kind, id, version) in conflicts {
      let message = reckon_core::Error::VersionConflict {
        kind,
        id: id.clone(),
        version,
      }
      .to_string();
      issues.push(ValidationIssue::new(
        IssueCode::VersionConflict,
        Some(&RecordKey::new(id, version)),
        message,
      ));
    }
    let accepted = issues.is_empty();
    if accepted {
      tracing::info!(ruleset = %ruleset_id, "ruleset validated");
    } else {
      tracing::warn!(
        ruleset = %ruleset_id,
        issues = issues.len(),
        "ruleset failed validation; draft discarded"
      );
    }
    Ok(ValidationReport::new(ruleset_id, issues))
  }

  async fn activate(
    &self,
    ruleset_id: RulesetId,
    expected_revision: Option<u64>,
  ) -> Result<HeaderPlan> {
    let headers = self.headers().await?;
    let plan = plan_activation(&headers, &ruleset_id, expected_revision, Utc::now())?;
    self.apply_plan(&plan).await?;
    tracing::info!(ruleset = %ruleset_id, "ruleset activated");
    Ok(plan)
  }

  async fn rollback(
    &self,
    current: RulesetId,
    target: RulesetId,
  ) -> Result<HeaderPlan> {
    let headers = self.headers().await?;
    let plan = plan_rollback(&headers, &current, &target, Utc::now())?;
    self.apply_plan(&plan).await?;
    tracing::warn!(from = %current, to = %target, "ruleset rolled back");
    Ok(plan)
  }

  async fn get_snapshot(
    &self,
    ruleset_id: RulesetId,
  ) -> Result<Option<RulesetSnapshot>> {
    let id_str = ruleset_id.to_string();
    let raw = self
      .conn
      .call(move |conn| Ok(load_snapshot(conn, &id_str)?))
      .await?;
    raw.map(RawSnapshot::into_snapshot).transpose()
  }

  async fn list_snapshots(&self) -> Result<Vec<SnapshotHeader>> {
    self.headers().await
  }

  async fn registry_revision(&self) -> Result<u64> {
    let revision: i64 = self
      .conn
      .call(|conn| {
        Ok(conn.query_row("SELECT revision FROM registry WHERE id = 1", [], |r| {
          r.get(0)
        })?)
      })
      .await?;
    u64::try_from(revision).map_err(|_| Error::Corrupt {
      column: "registry.revision",
      value:  revision.to_string(),
    })
  }

  async fn load_index(&self) -> Result<SnapshotIndex> {
    let raw = self
      .conn
      .call(|conn| {
        let mut stmt = conn.prepare(
          "SELECT ruleset_id FROM snapshots
           WHERE status IN ('activated', 'superseded')
           ORDER BY published_at, ruleset_id",
        )?;
        let ids = stmt
          .query_map([], |r| r.get::<_, String>(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
          if let Some(snapshot) = load_snapshot(conn, &id)? {
            snapshots.push(snapshot);
          }
        }
        Ok(snapshots)
      })
      .await?;
    let snapshots = raw
      .into_iter()
      .map(RawSnapshot::into_snapshot)
      .collect::<Result<Vec<_>>>()?;
    Ok(SnapshotIndex::new(snapshots))
  }

  // ── Runs ──────────────────────────────────────────────────────────────────

  async fn find_run(&self, key: RunKey) -> Result<Option<RunRecord>> {
    let scenario_str = key.scenario_id.to_string();
    let ruleset_str  = key.ruleset_id.to_string();
    let as_of_str    = encode_date(key.as_of);
    let inputs_hash  = key.inputs_hash;

    let raw = self
      .conn
      .call(move |conn| {
        let run_id: Option<String> = conn
          .query_row(
            "SELECT run_id FROM runs
             WHERE scenario_id = ?1 AND ruleset_id = ?2 AND as_of = ?3
               AND inputs_hash = ?4",
            params![scenario_str, ruleset_str, as_of_str, inputs_hash],
            |r| r.get(0),
          )
          .optional()?;
        match run_id {
          Some(run_id) => Ok(load_run(conn, &run_id)?),
          None => Ok(None),
        }
      })
      .await?;
    raw.map(RawRun::into_run).transpose()
  }

  async fn find_idempotent(
    &self,
    idempotency_key: String,
  ) -> Result<Option<RunRecord>> {
    let raw = self
      .conn
      .call(move |conn| {
        let run_id: Option<String> = conn
          .query_row(
            "SELECT run_id FROM runs WHERE idempotency_key = ?1",
            params![idempotency_key],
            |r| r.get(0),
          )
          .optional()?;
        match run_id {
          Some(run_id) => Ok(load_run(conn, &run_id)?),
          None => Ok(None),
        }
      })
      .await?;
    raw.map(RawRun::into_run).transpose()
  }

  async fn record_run(&self, run: NewRun) -> Result<RunRecord> {
    let run_id = Uuid::new_v4();
    let calculated_at = Utc::now();
    let row = RunRow::new(&run, run_id, calculated_at)?;

    let existing = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let existing: Option<String> = tx
          .query_row(
            "SELECT run_id FROM runs
             WHERE scenario_id = ?1 AND ruleset_id = ?2 AND as_of = ?3
               AND inputs_hash = ?4",
            params![row.scenario_id, row.ruleset_id, row.as_of, row.inputs_hash],
            |r| r.get(0),
          )
          .optional()?;
        if let Some(existing) = existing {
          return Ok(load_run(&tx, &existing)?);
        }

        tx.execute(
          "INSERT INTO runs (
             run_id, scenario_id, ruleset_id, as_of, inputs_hash,
             idempotency_key, calculated_at, failures_json, reconciliation_json
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
          params![
            row.run_id,
            row.scenario_id,
            row.ruleset_id,
            row.as_of,
            row.inputs_hash,
            row.idempotency_key,
            row.calculated_at,
            row.failures_json,
            row.reconciliation_json,
          ],
        )?;

        for (seq, fact) in row.facts.iter().enumerate() {
          tx.execute(
            "INSERT INTO facts (
               fact_id, run_id, seq, scenario_id, ruleset_id, as_of,
               period_index, calculation, entity_id, value_json, inputs_hash,
               rounding_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
              fact.fact_id,
              row.run_id,
              seq as i64,
              fact.scenario_id,
              fact.ruleset_id,
              fact.as_of,
              fact.period_index,
              fact.calculation,
              fact.entity_id,
              fact.value_json,
              fact.inputs_hash,
              fact.rounding_json,
            ],
          )?;
          for (link_seq, link) in fact.links.iter().enumerate() {
            tx.execute(
              "INSERT INTO provenance_links (
                 fact_id, seq, role, target_kind, target_json, window_json
               ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
              params![
                fact.fact_id,
                link_seq as i64,
                link.role,
                link.target_kind,
                link.target_json,
                link.window_json,
              ],
            )?;
          }
        }

        for entry in &row.trace {
          tx.execute(
            "INSERT INTO trace_entries (
               run_id, seq, calculation, entity_id, field, severity,
               period_index, explanation, metadata_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
              row.run_id,
              entry.seq,
              entry.calculation,
              entry.entity_id,
              entry.field,
              entry.severity,
              entry.period_index,
              entry.explanation,
              entry.metadata_json,
            ],
          )?;
        }

        tx.commit()?;
        Ok(None)
      })
      .await?;

    if let Some(existing) = existing {
      return existing.into_run();
    }
    tracing::debug!(
      run = %run_id,
      scenario = %run.key.scenario_id,
      facts = run.facts.len(),
      "recorded run"
    );
    Ok(RunRecord {
      run_id,
      key: run.key,
      idempotency_key: run.idempotency_key,
      calculated_at,
      facts: run.facts,
      failures: run.failures,
      trace: run.trace,
      reconciliation: run.reconciliation,
    })
  }

  async fn get_fact(&self, fact_id: FactId) -> Result<Option<Fact>> {
    let id_str = fact_id.to_string();
    let raw = self
      .conn
      .call(move |conn| {
        let sql = format!("SELECT {FACT_COLUMNS} FROM facts WHERE fact_id = ?1");
        let fact = conn
          .query_row(&sql, params![id_str], RawFact::from_row)
          .optional()?;
        match fact {
          Some(mut fact) => {
            fact.links = load_links(conn, &fact.fact_id)?;
            Ok(Some(fact))
          }
          None => Ok(None),
        }
      })
      .await?;
    raw.map(RawFact::into_fact).transpose()
  }

  async fn scenario_trace(
    &self,
    scenario_id: ScenarioId,
    as_of: Option<NaiveDate>,
  ) -> Result<ScenarioTrace> {
    let scenario_str = scenario_id.to_string();
    let as_of_str = as_of.map(encode_date);

    let raw = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT run_id FROM runs
           WHERE scenario_id = ?1 AND (?2 IS NULL OR as_of = ?2)
           ORDER BY as_of, calculated_at, run_id",
        )?;
        let ids = stmt
          .query_map(params![scenario_str, as_of_str], |r| r.get::<_, String>(0))?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
          if let Some(run) = load_run(conn, &id)? {
            runs.push(run);
          }
        }
        Ok(runs)
      })
      .await?;

    let runs = raw
      .into_iter()
      .map(RawRun::into_run)
      .collect::<Result<Vec<_>>>()?;
    Ok(ScenarioTrace { scenario_id, runs })
  }
}

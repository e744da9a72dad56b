//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are RFC 3339 strings and calendar dates are `YYYY-MM-DD`.
//! Records, quantities, rounding steps and provenance targets are stored as
//! compact JSON. UUIDs are stored as hyphenated lowercase strings.

use chrono::{DateTime, NaiveDate, Utc};
use reckon_core::{
  eval::NodeFailure,
  fact::{Fact, ProvenanceLink},
  reconcile::ReconciliationReport,
  rule::{Assumption, RecordKind, Reference, Rule},
  snapshot::{
    CandidateRuleset, RulesetSnapshot, SnapshotHeader, SnapshotStatus, TieBreak,
  },
  store::{NewRun, RunKey, RunRecord},
  trace::{TraceEntry, TraceLog},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_opt_dt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
  s.map(decode_dt).transpose()
}

pub fn encode_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

pub fn decode_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s, "%Y-%m-%d")
    .map_err(|e| Error::DateParse(e.to_string()))
}

fn decode_u32(column: &'static str, v: i64) -> Result<u32> {
  u32::try_from(v).map_err(|_| Error::Corrupt {
    column,
    value: v.to_string(),
  })
}

// ─── Record kinds ────────────────────────────────────────────────────────────

/// The append-only table holding records of `kind`.
pub fn record_table(kind: RecordKind) -> &'static str {
  match kind {
    RecordKind::Rule => "rules",
    RecordKind::Reference => "refs",
    RecordKind::Assumption => "assumptions",
  }
}

pub fn encode_record_kind(kind: RecordKind) -> &'static str {
  match kind {
    RecordKind::Rule => "rule",
    RecordKind::Reference => "reference",
    RecordKind::Assumption => "assumption",
  }
}

/// One record version ready for the append-only tables.
#[derive(Debug, Clone)]
pub struct RecordRow {
  pub kind:         RecordKind,
  pub record_id:    String,
  pub version:      u32,
  pub content_hash: String,
  pub body_json:    String,
}

impl RecordRow {
  fn new(
    kind: RecordKind,
    record_id: &str,
    version: u32,
    content_hash: String,
    body_json: String,
  ) -> Self {
    Self {
      kind,
      record_id: record_id.to_owned(),
      version,
      content_hash,
      body_json,
    }
  }
}

/// Every record in `snapshot`, in canonical order.
pub fn encode_records(snapshot: &RulesetSnapshot) -> Result<Vec<RecordRow>> {
  let mut rows = Vec::with_capacity(
    snapshot.rules.len() + snapshot.references.len() + snapshot.assumptions.len(),
  );
  for rule in &snapshot.rules {
    rows.push(RecordRow::new(
      RecordKind::Rule,
      &rule.rule_id,
      rule.version,
      rule.content_hash()?,
      serde_json::to_string(rule)?,
    ));
  }
  for reference in &snapshot.references {
    rows.push(RecordRow::new(
      RecordKind::Reference,
      &reference.reference_id,
      reference.version,
      reference.content_hash()?,
      serde_json::to_string(reference)?,
    ));
  }
  for assumption in &snapshot.assumptions {
    rows.push(RecordRow::new(
      RecordKind::Assumption,
      &assumption.assumption_id,
      assumption.version,
      assumption.content_hash()?,
      serde_json::to_string(assumption)?,
    ));
  }
  Ok(rows)
}

// ─── Raw row types (used inside tokio_rusqlite closures) ──────────────────────

/// Column list matching [`RawHeader::from_row`].
pub const HEADER_COLUMNS: &str = "ruleset_id, published_at, status, revision, \
                                  recorded_at, activated_at, valid_to, \
                                  superseded_at";

/// Raw string values from a `snapshots` row.
pub struct RawHeader {
  pub ruleset_id:    String,
  pub published_at:  String,
  pub status:        String,
  pub revision:      i64,
  pub recorded_at:   String,
  pub activated_at:  Option<String>,
  pub valid_to:      Option<String>,
  pub superseded_at: Option<String>,
}

impl RawHeader {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      ruleset_id:    row.get(0)?,
      published_at:  row.get(1)?,
      status:        row.get(2)?,
      revision:      row.get(3)?,
      recorded_at:   row.get(4)?,
      activated_at:  row.get(5)?,
      valid_to:      row.get(6)?,
      superseded_at: row.get(7)?,
    })
  }

  pub fn into_header(self) -> Result<SnapshotHeader> {
    let status =
      self
        .status
        .parse::<SnapshotStatus>()
        .map_err(|_| Error::Corrupt {
          column: "snapshots.status",
          value:  self.status.clone(),
        })?;
    let revision = u64::try_from(self.revision).map_err(|_| Error::Corrupt {
      column: "snapshots.revision",
      value:  self.revision.to_string(),
    })?;
    Ok(SnapshotHeader {
      ruleset_id: self.ruleset_id.into(),
      published_at: decode_dt(&self.published_at)?,
      status,
      revision,
      recorded_at: decode_dt(&self.recorded_at)?,
      activated_at: decode_opt_dt(self.activated_at.as_deref())?,
      valid_to: decode_opt_dt(self.valid_to.as_deref())?,
      superseded_at: decode_opt_dt(self.superseded_at.as_deref())?,
    })
  }
}

/// Header values bound as parameters of an `UPDATE snapshots`.
pub struct HeaderUpdate {
  pub ruleset_id:    String,
  pub status:        String,
  pub revision:      i64,
  pub activated_at:  Option<String>,
  pub valid_to:      Option<String>,
  pub superseded_at: Option<String>,
}

impl HeaderUpdate {
  pub fn new(header: &SnapshotHeader) -> Self {
    Self {
      ruleset_id:    header.ruleset_id.to_string(),
      status:        header.status.to_string(),
      revision:      header.revision as i64,
      activated_at:  header.activated_at.map(encode_dt),
      valid_to:      header.valid_to.map(encode_dt),
      superseded_at: header.superseded_at.map(encode_dt),
    }
  }
}

/// A snapshot row with the bodies of its member records.
pub struct RawSnapshot {
  pub header:         RawHeader,
  pub candidate_json: Option<String>,
  pub rules:          Vec<String>,
  pub references:     Vec<String>,
  pub assumptions:    Vec<String>,
  pub tie_breaks:     Vec<(String, String)>,
}

impl RawSnapshot {
  pub fn into_snapshot(self) -> Result<RulesetSnapshot> {
    let header = self.header.into_header()?;

    // Drafts keep their contents on the header row until they validate.
    if let Some(json) = self.candidate_json {
      let candidate: CandidateRuleset = serde_json::from_str(&json)?;
      let mut snapshot = candidate.into_draft(header.recorded_at);
      snapshot.header = header;
      return Ok(snapshot);
    }

    let rules = self
      .rules
      .iter()
      .map(|s| serde_json::from_str::<Rule>(s))
      .collect::<serde_json::Result<Vec<_>>>()?;
    let references = self
      .references
      .iter()
      .map(|s| serde_json::from_str::<Reference>(s))
      .collect::<serde_json::Result<Vec<_>>>()?;
    let assumptions = self
      .assumptions
      .iter()
      .map(|s| serde_json::from_str::<Assumption>(s))
      .collect::<serde_json::Result<Vec<_>>>()?;
    let tie_breaks = self
      .tie_breaks
      .into_iter()
      .map(|(calculation, preferred)| TieBreak {
        calculation: calculation.into(),
        preferred,
      })
      .collect();

    let mut snapshot = RulesetSnapshot {
      header,
      rules,
      references,
      assumptions,
      tie_breaks,
    };
    snapshot.canonicalize();
    Ok(snapshot)
  }
}

// ─── Facts ───────────────────────────────────────────────────────────────────

/// Column list matching [`RawFact::from_row`].
pub const FACT_COLUMNS: &str = "fact_id, scenario_id, ruleset_id, as_of, \
                                period_index, calculation, entity_id, \
                                value_json, inputs_hash, rounding_json";

pub struct RawLink {
  pub role:        String,
  pub target_kind: &'static str,
  pub target_json: String,
  pub window_json: Option<String>,
}

/// Raw column values of a `facts` row and its provenance links.
pub struct RawFact {
  pub fact_id:       String,
  pub scenario_id:   String,
  pub ruleset_id:    String,
  pub as_of:         String,
  pub period_index:  i64,
  pub calculation:   String,
  pub entity_id:     Option<String>,
  pub value_json:    String,
  pub inputs_hash:   String,
  pub rounding_json: String,
  pub links:         Vec<(String, String, Option<String>)>,
}

impl RawFact {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      fact_id:       row.get(0)?,
      scenario_id:   row.get(1)?,
      ruleset_id:    row.get(2)?,
      as_of:         row.get(3)?,
      period_index:  row.get(4)?,
      calculation:   row.get(5)?,
      entity_id:     row.get(6)?,
      value_json:    row.get(7)?,
      inputs_hash:   row.get(8)?,
      rounding_json: row.get(9)?,
      links:         Vec::new(),
    })
  }

  pub fn into_fact(self) -> Result<Fact> {
    let provenance = self
      .links
      .into_iter()
      .map(|(role, target, window)| {
        Ok(ProvenanceLink {
          role,
          target: serde_json::from_str(&target)?,
          window: window.as_deref().map(serde_json::from_str).transpose()?,
        })
      })
      .collect::<Result<Vec<_>>>()?;
    Ok(Fact {
      fact_id: self.fact_id.into(),
      scenario_id: self.scenario_id.into(),
      ruleset_id: self.ruleset_id.into(),
      as_of: decode_date(&self.as_of)?,
      period_index: decode_u32("facts.period_index", self.period_index)?,
      calculation: self.calculation.into(),
      entity_id: self.entity_id.map(Into::into),
      value: serde_json::from_str(&self.value_json)?,
      inputs_hash: self.inputs_hash,
      provenance,
      rounding: serde_json::from_str(&self.rounding_json)?,
    })
  }
}

/// A fact flattened into column values for insertion.
pub struct FactRow {
  pub fact_id:       String,
  pub scenario_id:   String,
  pub ruleset_id:    String,
  pub as_of:         String,
  pub period_index:  i64,
  pub calculation:   String,
  pub entity_id:     Option<String>,
  pub value_json:    String,
  pub inputs_hash:   String,
  pub rounding_json: String,
  pub links:         Vec<RawLink>,
}

impl FactRow {
  pub fn new(fact: &Fact) -> Result<Self> {
    let links = fact
      .provenance
      .iter()
      .map(|link| {
        Ok(RawLink {
          role:        link.role.clone(),
          target_kind: link.target.kind(),
          target_json: serde_json::to_string(&link.target)?,
          window_json: link.window.as_ref().map(serde_json::to_string).transpose()?,
        })
      })
      .collect::<Result<Vec<_>>>()?;
    Ok(Self {
      fact_id: fact.fact_id.to_string(),
      scenario_id: fact.scenario_id.to_string(),
      ruleset_id: fact.ruleset_id.to_string(),
      as_of: encode_date(fact.as_of),
      period_index: i64::from(fact.period_index),
      calculation: fact.calculation.to_string(),
      entity_id: fact.entity_id.as_ref().map(ToString::to_string),
      value_json: serde_json::to_string(&fact.value)?,
      inputs_hash: fact.inputs_hash.clone(),
      rounding_json: serde_json::to_string(&fact.rounding)?,
      links,
    })
  }
}

// ─── Trace ───────────────────────────────────────────────────────────────────

/// Column list matching [`RawTraceEntry::from_row`].
pub const TRACE_COLUMNS: &str = "seq, calculation, entity_id, field, severity, \
                                 period_index, explanation, metadata_json";

/// Raw column values of a `trace_entries` row; also used for insertion.
pub struct RawTraceEntry {
  pub seq:           i64,
  pub calculation:   Option<String>,
  pub entity_id:     Option<String>,
  pub field:         Option<String>,
  pub severity:      String,
  pub period_index:  i64,
  pub explanation:   String,
  pub metadata_json: String,
}

impl RawTraceEntry {
  pub fn new(entry: &TraceEntry) -> Result<Self> {
    Ok(Self {
      seq:           i64::from(entry.seq),
      calculation:   entry.calculation.as_ref().map(ToString::to_string),
      entity_id:     entry.entity_id.as_ref().map(ToString::to_string),
      field:         entry.field.clone(),
      severity:      entry.severity.to_string(),
      period_index:  i64::from(entry.period_index),
      explanation:   entry.explanation.clone(),
      metadata_json: serde_json::to_string(&entry.metadata)?,
    })
  }

  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      seq:           row.get(0)?,
      calculation:   row.get(1)?,
      entity_id:     row.get(2)?,
      field:         row.get(3)?,
      severity:      row.get(4)?,
      period_index:  row.get(5)?,
      explanation:   row.get(6)?,
      metadata_json: row.get(7)?,
    })
  }

  pub fn into_entry(self) -> Result<TraceEntry> {
    let severity = self.severity.parse().map_err(|_| Error::Corrupt {
      column: "trace_entries.severity",
      value:  self.severity.clone(),
    })?;
    Ok(TraceEntry {
      seq: decode_u32("trace_entries.seq", self.seq)?,
      calculation: self.calculation.map(Into::into),
      entity_id: self.entity_id.map(Into::into),
      field: self.field,
      severity,
      period_index: decode_u32("trace_entries.period_index", self.period_index)?,
      explanation: self.explanation,
      metadata: serde_json::from_str(&self.metadata_json)?,
    })
  }
}

// ─── Runs ────────────────────────────────────────────────────────────────────

/// Column list matching [`RawRun::from_row`].
pub const RUN_COLUMNS: &str = "run_id, scenario_id, ruleset_id, as_of, \
                               inputs_hash, idempotency_key, calculated_at, \
                               failures_json, reconciliation_json";

/// Raw column values of a `runs` row with its facts and trace.
pub struct RawRun {
  pub run_id:              String,
  pub scenario_id:         String,
  pub ruleset_id:          String,
  pub as_of:               String,
  pub inputs_hash:         String,
  pub idempotency_key:     Option<String>,
  pub calculated_at:       String,
  pub failures_json:       String,
  pub reconciliation_json: String,
  pub facts:               Vec<RawFact>,
  pub trace:               Vec<RawTraceEntry>,
}

impl RawRun {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      run_id:              row.get(0)?,
      scenario_id:         row.get(1)?,
      ruleset_id:          row.get(2)?,
      as_of:               row.get(3)?,
      inputs_hash:         row.get(4)?,
      idempotency_key:     row.get(5)?,
      calculated_at:       row.get(6)?,
      failures_json:       row.get(7)?,
      reconciliation_json: row.get(8)?,
      facts:               Vec::new(),
      trace:               Vec::new(),
    })
  }

  pub fn into_run(self) -> Result<RunRecord> {
    let failures: Vec<NodeFailure> = serde_json::from_str(&self.failures_json)?;
    let reconciliation: ReconciliationReport =
      serde_json::from_str(&self.reconciliation_json)?;
    let facts = self
      .facts
      .into_iter()
      .map(RawFact::into_fact)
      .collect::<Result<Vec<_>>>()?;
    let trace = self
      .trace
      .into_iter()
      .map(RawTraceEntry::into_entry)
      .collect::<Result<Vec<_>>>()?;
    Ok(RunRecord {
      run_id: decode_uuid(&self.run_id)?,
      key: RunKey {
        scenario_id: self.scenario_id.into(),
        ruleset_id:  self.ruleset_id.into(),
        as_of:       decode_date(&self.as_of)?,
        inputs_hash: self.inputs_hash,
      },
      idempotency_key: self.idempotency_key,
      calculated_at: decode_dt(&self.calculated_at)?,
      facts,
      failures,
      trace: TraceLog::from(trace),
      reconciliation,
    })
  }
}

/// A new run flattened into column values for insertion.
pub struct RunRow {
  pub run_id:              String,
  pub scenario_id:         String,
  pub ruleset_id:          String,
  pub as_of:               String,
  pub inputs_hash:         String,
  pub idempotency_key:     Option<String>,
  pub calculated_at:       String,
  pub failures_json:       String,
  pub reconciliation_json: String,
  pub facts:               Vec<FactRow>,
  pub trace:               Vec<RawTraceEntry>,
}

impl RunRow {
  pub fn new(
    run: &NewRun,
    run_id: Uuid,
    calculated_at: DateTime<Utc>,
  ) -> Result<Self> {
    Ok(Self {
      run_id:              encode_uuid(run_id),
      scenario_id:         run.key.scenario_id.to_string(),
      ruleset_id:          run.key.ruleset_id.to_string(),
      as_of:               encode_date(run.key.as_of),
      inputs_hash:         run.key.inputs_hash.clone(),
      idempotency_key:     run.idempotency_key.clone(),
      calculated_at:       encode_dt(calculated_at),
      failures_json:       serde_json::to_string(&run.failures)?,
      reconciliation_json: serde_json::to_string(&run.reconciliation)?,
      facts:               run
        .facts
        .iter()
        .map(FactRow::new)
        .collect::<Result<_>>()?,
      trace:               run
        .trace
        .entries()
        .iter()
        .map(RawTraceEntry::new)
        .collect::<Result<_>>()?,
    })
  }
}

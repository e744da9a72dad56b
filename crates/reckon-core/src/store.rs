//! The `RuleStore` trait and the run records it persists.
//!
//! The trait is implemented by storage backends (e.g. `reckon-store-sqlite`).
//! The HTTP layer depends on this abstraction, not on any concrete backend.
//! Record tables are append-only; the only mutable rows are snapshot headers,
//! and those change only through the lifecycle plans in
//! [`snapshot`](crate::snapshot) under an optimistic revision check.

use std::{collections::BTreeSet, future::Future};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  FactId, Result, RulesetId, ScenarioId,
  eval::NodeFailure,
  fact::Fact,
  reconcile::ReconciliationReport,
  resolve::SnapshotIndex,
  snapshot::{CandidateRuleset, HeaderPlan, RulesetSnapshot, SnapshotHeader, ValidationReport},
  state::CalculationState,
  trace::TraceLog,
};

// ─── Runs ────────────────────────────────────────────────────────────────────

/// Identifies one canonical computation.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RunKey {
  pub scenario_id: ScenarioId,
  pub ruleset_id:  RulesetId,
  pub as_of:       NaiveDate,
  pub inputs_hash: String,
}

impl RunKey {
  pub fn new(state: &CalculationState, ruleset_id: RulesetId) -> Result<Self> {
    Ok(Self {
      scenario_id: state.scenario_id().clone(),
      ruleset_id,
      as_of: state.as_of(),
      inputs_hash: state.inputs_hash()?,
    })
  }
}

/// A completed evaluation, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
  pub key:             RunKey,
  pub idempotency_key: Option<String>,
  pub facts:           Vec<Fact>,
  pub failures:        Vec<NodeFailure>,
  pub trace:           TraceLog,
  pub reconciliation:  ReconciliationReport,
}

/// A persisted evaluation. `run_id` and `calculated_at` are assigned by the
/// store; everything else is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
  pub run_id:          Uuid,
  pub key:             RunKey,
  pub idempotency_key: Option<String>,
  pub calculated_at:   DateTime<Utc>,
  pub facts:           Vec<Fact>,
  pub failures:        Vec<NodeFailure>,
  pub trace:           TraceLog,
  pub reconciliation:  ReconciliationReport,
}

impl RunRecord {
  /// No failed nodes and no reconciliation failures.
  pub fn is_clean(&self) -> bool {
    self.failures.is_empty() && self.reconciliation.is_clean()
  }
}

/// Every stored run for a scenario, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioTrace {
  pub scenario_id: ScenarioId,
  pub runs:        Vec<RunRecord>,
}

impl ScenarioTrace {
  pub fn facts(&self) -> impl Iterator<Item = &Fact> {
    self.runs.iter().flat_map(|r| r.facts.iter())
  }

  /// Upstream links that point at facts not present in the trace, as
  /// `(fact, missing upstream)` pairs.
  pub fn dangling_links(&self) -> Vec<(FactId, FactId)> {
    let known: BTreeSet<&FactId> = self.facts().map(|f| &f.fact_id).collect();
    self
      .facts()
      .flat_map(|f| {
        f.upstream()
          .filter(|up| !known.contains(up))
          .map(|up| (f.fact_id.clone(), up.clone()))
      })
      .collect()
  }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Errors a backend reports, classified for retry decisions.
pub trait StoreError: std::error::Error + Send + Sync + 'static {
  /// Lock contention and similar conditions worth retrying.
  fn is_transient(&self) -> bool;

  /// The domain error behind this failure, if it is one.
  fn domain(&self) -> Option<&crate::Error>;
}

/// Abstraction over a ruleset and result store.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes (e.g. tokio with `axum`).
pub trait RuleStore: Send + Sync {
  type Error: StoreError;

  // ── Snapshot lifecycle ────────────────────────────────────────────────

  /// Record a candidate as a Draft snapshot. Records are not written to the
  /// record tables until the snapshot validates.
  fn publish(
    &self,
    candidate: CandidateRuleset,
  ) -> impl Future<Output = Result<SnapshotHeader, Self::Error>> + Send + '_;

  /// Validate a Draft. On success its records are appended and the snapshot
  /// becomes Validated; on failure the draft is discarded.
  fn validate(
    &self,
    ruleset_id: RulesetId,
  ) -> impl Future<Output = Result<ValidationReport, Self::Error>> + Send + '_;

  /// Activate a Validated snapshot, failing with `ConcurrentModification` if
  /// `expected_revision` is stale or a concurrent writer got there first.
  fn activate(
    &self,
    ruleset_id: RulesetId,
    expected_revision: Option<u64>,
  ) -> impl Future<Output = Result<HeaderPlan, Self::Error>> + Send + '_;

  /// Supersede `current` and restore coverage to `target`.
  fn rollback(
    &self,
    current: RulesetId,
    target: RulesetId,
  ) -> impl Future<Output = Result<HeaderPlan, Self::Error>> + Send + '_;

  fn get_snapshot(
    &self,
    ruleset_id: RulesetId,
  ) -> impl Future<Output = Result<Option<RulesetSnapshot>, Self::Error>> + Send + '_;

  /// All headers, ordered by publication.
  fn list_snapshots(
    &self,
  ) -> impl Future<Output = Result<Vec<SnapshotHeader>, Self::Error>> + Send + '_;

  /// A counter that changes whenever any header changes.
  fn registry_revision(
    &self,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Every Activated or Superseded snapshot, for resolution.
  fn load_index(
    &self,
  ) -> impl Future<Output = Result<SnapshotIndex, Self::Error>> + Send + '_;

  // ── Runs ──────────────────────────────────────────────────────────────

  fn find_run(
    &self,
    key: RunKey,
  ) -> impl Future<Output = Result<Option<RunRecord>, Self::Error>> + Send + '_;

  fn find_idempotent(
    &self,
    idempotency_key: String,
  ) -> impl Future<Output = Result<Option<RunRecord>, Self::Error>> + Send + '_;

  /// Persist a run with its facts, provenance and trace in one
  /// transaction. If the key is already stored the existing run is
  /// returned unchanged.
  fn record_run(
    &self,
    run: NewRun,
  ) -> impl Future<Output = Result<RunRecord, Self::Error>> + Send + '_;

  fn get_fact(
    &self,
    fact_id: FactId,
  ) -> impl Future<Output = Result<Option<Fact>, Self::Error>> + Send + '_;

  /// Stored runs for a scenario, optionally restricted to one `as_of`.
  fn scenario_trace(
    &self,
    scenario_id: ScenarioId,
    as_of: Option<NaiveDate>,
  ) -> impl Future<Output = Result<ScenarioTrace, Self::Error>> + Send + '_;
}

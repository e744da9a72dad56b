//! Handlers for `/calc` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/calc/run` | Body: [`RunRequest`]; optional `Idempotency-Key` header |
//! | `POST` | `/calc/project` | Body: [`ProjectRequest`] |
//! | `POST` | `/calc/batch` | Body: `{"items": [RunRequest, ...]}`; partial success |

use axum::{
  Json,
  extract::{State, rejection::JsonRejection},
  http::HeaderMap,
};
use chrono::{DateTime, NaiveDate, Utc};
use reckon_core::{
  RulesetId, ScenarioId,
  eval::NodeFailure,
  fact::Fact,
  reconcile::ReconciliationReport,
  state::CarriedBalance,
  store::{RuleStore, RunRecord},
  trace::TraceEntry,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  AppState,
  error::{ApiError, ErrorBody},
  json_body,
  service::{BatchResult, RunOutcome, RunRequest},
};

pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

// ─── Responses ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResponse {
  pub run_id:          Uuid,
  pub scenario_id:     ScenarioId,
  pub ruleset_id:      RulesetId,
  pub as_of:           NaiveDate,
  pub inputs_hash:     String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub idempotency_key: Option<String>,
  pub calculated_at:   DateTime<Utc>,
  pub cache_hit:       bool,
  /// No failed nodes and no reconciliation failures.
  pub clean:           bool,
  pub facts:           Vec<Fact>,
  pub failures:        Vec<NodeFailure>,
  pub trace:           Vec<TraceEntry>,
  pub reconciliation:  ReconciliationReport,
}

impl RunResponse {
  fn new(run: RunRecord, cache_hit: bool) -> Self {
    Self {
      run_id: run.run_id,
      clean: run.is_clean(),
      scenario_id: run.key.scenario_id,
      ruleset_id: run.key.ruleset_id,
      as_of: run.key.as_of,
      inputs_hash: run.key.inputs_hash,
      idempotency_key: run.idempotency_key,
      calculated_at: run.calculated_at,
      cache_hit,
      facts: run.facts,
      failures: run.failures,
      trace: run.trace.into_entries(),
      reconciliation: run.reconciliation,
    }
  }
}

impl From<RunOutcome> for RunResponse {
  fn from(outcome: RunOutcome) -> Self { Self::new(outcome.run, outcome.cache_hit) }
}

// ─── Run ──────────────────────────────────────────────────────────────────────

/// `POST /calc/run`
pub async fn run<S>(
  State(state): State<AppState<S>>,
  headers: HeaderMap,
  payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Json<RunResponse>, ApiError>
where
  S: RuleStore + 'static,
{
  let request = json_body(payload)?;
  let idempotency_key = match headers.get(IDEMPOTENCY_KEY) {
    None => None,
    Some(value) => Some(
      value
        .to_str()
        .map_err(|_| ApiError::BadRequest("Idempotency-Key must be ASCII".into()))?
        .to_owned(),
    ),
  };
  let outcome = state.service.run(request, idempotency_key).await?;
  Ok(Json(outcome.into()))
}

// ─── Batch ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
  pub items: Vec<RunRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchItem {
  Ok { index: usize, run: Box<RunResponse> },
  Error { index: usize, error: ErrorBody },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResponse {
  pub succeeded: usize,
  pub failed:    usize,
  pub items:     Vec<BatchItem>,
}

/// `POST /calc/batch`: always 200; each item reports its own outcome.
pub async fn batch<S>(
  State(state): State<AppState<S>>,
  payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Json<BatchResponse>, ApiError>
where
  S: RuleStore + 'static,
{
  let request = json_body(payload)?;
  let results = state.service.batch(request.items).await;

  let mut response = BatchResponse {
    succeeded: 0,
    failed:    0,
    items:     Vec::with_capacity(results.len()),
  };
  for (index, result) in results.into_iter().enumerate() {
    response.items.push(match result {
      BatchResult::Succeeded(outcome) => {
        response.succeeded += 1;
        BatchItem::Ok {
          index,
          run: Box::new(outcome.into()),
        }
      }
      BatchResult::Failed(error) => {
        response.failed += 1;
        BatchItem::Error { index, error }
      }
    });
  }
  Ok(Json(response))
}

// ─── Project ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ProjectRequest {
  pub periods: u32,
  /// Starting state; `ruleset_id` pins every period to one ruleset.
  pub base:    RunRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectedPeriod {
  pub period_index: u32,
  pub as_of:        NaiveDate,
  pub ruleset_id:   RulesetId,
  pub run_id:       Uuid,
  pub facts:        Vec<Fact>,
  pub failures:     Vec<NodeFailure>,
  pub carried:      Vec<CarriedBalance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectResponse {
  pub scenario_id:    ScenarioId,
  pub periods:        Vec<ProjectedPeriod>,
  pub reconciliation: ReconciliationReport,
}

/// `POST /calc/project`
pub async fn project<S>(
  State(state): State<AppState<S>>,
  payload: Result<Json<ProjectRequest>, JsonRejection>,
) -> Result<Json<ProjectResponse>, ApiError>
where
  S: RuleStore + 'static,
{
  let request = json_body(payload)?;
  let scenario_id = request.base.scenario_id.clone();
  let outcome = state.service.project(request.base, request.periods).await?;
  let periods = outcome
    .periods
    .into_iter()
    .zip(outcome.runs)
    .map(|(period, run)| ProjectedPeriod {
      period_index: period.period_index,
      as_of:        period.as_of,
      ruleset_id:   period.ruleset_id,
      run_id:       run.run_id,
      facts:        period.facts,
      failures:     period.failures,
      carried:      period.carried,
    })
    .collect();
  Ok(Json(ProjectResponse {
    scenario_id,
    periods,
    reconciliation: outcome.reconciliation,
  }))
}

//! Handlers for historical results.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/trace/{scenario_id}` | Optional `?as_of=YYYY-MM-DD`; 404 if no runs |
//! | `GET`  | `/facts/{id}` | Fact plus its explanation |

use axum::{
  Json,
  extract::{Path, Query, State},
};
use chrono::NaiveDate;
use reckon_core::{
  FactId, ScenarioId,
  fact::Fact,
  store::{RuleStore, RunRecord},
};
use serde::{Deserialize, Serialize};

use crate::{AppState, error::ApiError};

#[derive(Debug, Deserialize)]
pub struct TraceParams {
  pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceResponse {
  pub scenario_id:    ScenarioId,
  pub runs:           Vec<RunRecord>,
  /// `(fact, upstream)` pairs whose upstream fact is missing from `runs`.
  pub dangling_links: Vec<(FactId, FactId)>,
}

/// `GET /trace/{scenario_id}[?as_of=<date>]`
pub async fn scenario<S>(
  State(state): State<AppState<S>>,
  Path(scenario_id): Path<String>,
  Query(params): Query<TraceParams>,
) -> Result<Json<TraceResponse>, ApiError>
where
  S: RuleStore + 'static,
{
  let trace = state
    .service
    .trace(ScenarioId::new(scenario_id), params.as_of)
    .await?;
  let dangling_links = trace.dangling_links();
  if !dangling_links.is_empty() {
    tracing::warn!(
      scenario = %trace.scenario_id,
      count = dangling_links.len(),
      "trace has dangling provenance links"
    );
  }
  Ok(Json(TraceResponse {
    scenario_id: trace.scenario_id,
    runs: trace.runs,
    dangling_links,
  }))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactResponse {
  pub fact:        Fact,
  pub explanation: String,
}

/// `GET /facts/{id}`
pub async fn fact<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<String>,
) -> Result<Json<FactResponse>, ApiError>
where
  S: RuleStore + 'static,
{
  let (fact, explanation) = state.service.fact(FactId::new(id)).await?;
  Ok(Json(FactResponse { fact, explanation }))
}

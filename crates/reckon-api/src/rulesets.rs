//! Handlers for `/rulesets` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/rulesets` | Body: [`CandidateRuleset`]; returns 201 + draft header |
//! | `GET`  | `/rulesets` | Optional `?as_of=YYYY-MM-DD`; metadata only |
//! | `GET`  | `/rulesets/{id}` | Full snapshot |
//! | `POST` | `/rulesets/{id}/validate` | `{ok, errors}` |
//! | `POST` | `/rulesets/{id}/activate` | Body: `{"expected_revision": 3}` (optional) |
//! | `POST` | `/rulesets/{id}/rollback` | Body: `{"target_ruleset_id": "..."}`; admin only |

use axum::{
  Json,
  body::Bytes,
  extract::{Path, Query, State, rejection::JsonRejection},
  http::StatusCode,
  response::IntoResponse,
};
use chrono::{DateTime, NaiveDate, Utc};
use reckon_core::{
  CalcId, RulesetId,
  resolve::RulesetSource,
  rule::{EffectiveWindow, PrecedenceTier, RecordKey, Rule},
  snapshot::{CandidateRuleset, HeaderPlan, RulesetSnapshot, SnapshotHeader, ValidationReport},
  store::RuleStore,
};
use serde::{Deserialize, Serialize};

use crate::{AppState, auth::Admin, error::ApiError, json_body};

// ─── Metadata ─────────────────────────────────────────────────────────────────

/// A rule without its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSummary {
  pub rule_id:     String,
  pub version:     u32,
  pub calculation: CalcId,
  pub tier:        PrecedenceTier,
  pub window:      EffectiveWindow,
  pub references:  Vec<RecordKey>,
}

impl From<&Rule> for RuleSummary {
  fn from(rule: &Rule) -> Self {
    Self {
      rule_id:     rule.rule_id.clone(),
      version:     rule.version,
      calculation: rule.calculation.clone(),
      tier:        rule.tier,
      window:      rule.window,
      references:  rule.references.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetSummary {
  pub header: SnapshotHeader,
  /// The rule governing each calculation on the requested date.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub rules:  Option<Vec<RuleSummary>>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
  pub as_of: Option<NaiveDate>,
}

/// `GET /rulesets[?as_of=<date>]`
///
/// Without `as_of`, every snapshot header. With it, the single ruleset
/// governing that date and its applicable rules.
pub async fn list<S>(
  State(state): State<AppState<S>>,
  Query(params): Query<ListParams>,
) -> Result<Json<Vec<RulesetSummary>>, ApiError>
where
  S: RuleStore + 'static,
{
  let Some(as_of) = params.as_of else {
    let headers = state.service.headers().await?;
    return Ok(Json(
      headers
        .into_iter()
        .map(|header| RulesetSummary { header, rules: None })
        .collect(),
    ));
  };

  let index = state.service.index().await?;
  let resolved = index.resolve(as_of, None)?;
  let rules = resolved
    .calculations()
    .filter_map(|calc| resolved.rule_for(calc))
    .map(RuleSummary::from)
    .collect();
  Ok(Json(vec![RulesetSummary {
    header: resolved.snapshot().header.clone(),
    rules:  Some(rules),
  }]))
}

// ─── Publish ──────────────────────────────────────────────────────────────────

/// `POST /rulesets`
pub async fn publish<S>(
  State(state): State<AppState<S>>,
  payload: Result<Json<CandidateRuleset>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError>
where
  S: RuleStore + 'static,
{
  let candidate = json_body(payload)?;
  let header = state.service.publish(candidate).await?;
  Ok((StatusCode::CREATED, Json(header)))
}

/// `GET /rulesets/{id}`
pub async fn get_one<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<String>,
) -> Result<Json<RulesetSnapshot>, ApiError>
where
  S: RuleStore + 'static,
{
  Ok(Json(state.service.snapshot(RulesetId::new(id)).await?))
}

// ─── Lifecycle ────────────────────────────────────────────────────────────────

/// `POST /rulesets/{id}/validate`
pub async fn validate<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<String>,
) -> Result<Json<ValidationReport>, ApiError>
where
  S: RuleStore + 'static,
{
  Ok(Json(state.service.validate(RulesetId::new(id)).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ActivateBody {
  #[serde(default)]
  pub expected_revision: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateResponse {
  pub ruleset_id:   RulesetId,
  pub activated_at: Option<DateTime<Utc>>,
  pub revision:     u64,
  /// Every header the activation changed, including neighbours whose
  /// coverage moved.
  pub updates:      Vec<SnapshotHeader>,
}

/// `POST /rulesets/{id}/activate`
///
/// An empty body activates unconditionally; `expected_revision` makes the
/// activation fail with 409 if the header has moved on.
pub async fn activate<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<String>,
  payload: Bytes,
) -> Result<Json<ActivateResponse>, ApiError>
where
  S: RuleStore + 'static,
{
  let body: ActivateBody = if payload.is_empty() {
    ActivateBody::default()
  } else {
    serde_json::from_slice(&payload)
      .map_err(|err| ApiError::BadRequest(err.to_string()))?
  };
  let ruleset_id = RulesetId::new(id);
  let plan = state
    .service
    .activate(ruleset_id.clone(), body.expected_revision)
    .await?;
  let header = plan
    .header(&ruleset_id)
    .ok_or_else(|| ApiError::Internal(format!("activation plan omits {ruleset_id}")))?;
  Ok(Json(ActivateResponse {
    ruleset_id:   ruleset_id.clone(),
    activated_at: header.activated_at,
    revision:     header.revision,
    updates:      plan.updates.clone(),
  }))
}

#[derive(Debug, Deserialize)]
pub struct RollbackBody {
  pub target_ruleset_id: RulesetId,
}

/// `POST /rulesets/{id}/rollback`: supersedes `{id}` and restores the
/// target's coverage.
pub async fn rollback<S>(
  State(state): State<AppState<S>>,
  _admin: Admin,
  Path(id): Path<String>,
  payload: Result<Json<RollbackBody>, JsonRejection>,
) -> Result<Json<HeaderPlan>, ApiError>
where
  S: RuleStore + 'static,
{
  let body = json_body(payload)?;
  let current = RulesetId::new(id);
  let plan = state
    .service
    .rollback(current.clone(), body.target_ruleset_id.clone())
    .await?;
  tracing::warn!(
    %current,
    target = %body.target_ruleset_id,
    "rolled back ruleset"
  );
  Ok(Json(plan))
}

//! Router tests against an in-memory SQLite store.

use std::{
  future::Future,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use axum::{
  body::Body,
  http::{HeaderMap, Request, StatusCode, header},
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rand_core::OsRng;
use reckon_core::{
  FactId, RulesetId, ScenarioId,
  catalog::{INCOME_TAX, sample_ruleset, standard_checks, standard_registry},
  eval::Evaluator,
  fact::Fact,
  projection::CancelToken,
  reconcile::Reconciler,
  resolve::SnapshotIndex,
  settings::EngineSettings,
  snapshot::{CandidateRuleset, HeaderPlan, RulesetSnapshot, SnapshotHeader, ValidationReport},
  state::{CalculationState, CashflowKind, PositionKind},
  store::{NewRun, RuleStore, RunKey, RunRecord, ScenarioTrace},
  value::Currency,
};
use reckon_store_sqlite::SqliteStore;
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tower::ServiceExt as _;

use super::*;
use crate::service::{RunRequest, ScenarioInputs};

// ─── Helpers ──────────────────────────────────────────────────────────────────

async fn make_state(password: &str) -> AppState<SqliteStore> {
  app_state(SqliteStore::open_in_memory().await.unwrap(), password)
}

fn app_state<S: RuleStore>(store: S, password: &str) -> AppState<S> {
  let salt  = SaltString::generate(&mut OsRng);
  let hash  = Argon2::default()
    .hash_password(password.as_bytes(), &salt)
    .unwrap()
    .to_string();

  let service = RunService::new(
    Arc::new(store),
    Evaluator::new(Arc::new(standard_registry().unwrap())),
    Reconciler::new(dec!(0.01), standard_checks()),
    EngineSettings::default(),
  );
  AppState::new(service, AuthConfig {
    username:      "admin".to_string(),
    password_hash: hash,
  })
}

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
  NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn auth_header(user: &str, pass: &str) -> String {
  format!("Basic {}", B64.encode(format!("{user}:{pass}")))
}

struct Reply {
  status:  StatusCode,
  headers: HeaderMap,
  body:    Value,
}

async fn send<S: RuleStore + 'static>(
  state:   &AppState<S>,
  method:  &str,
  uri:     &str,
  headers: Vec<(&str, &str)>,
  body:    Option<Value>,
) -> Reply {
  let mut builder = Request::builder().method(method).uri(uri);
  for (k, v) in headers {
    builder = builder.header(k, v);
  }
  let req = match body {
    Some(body) => builder
      .header(header::CONTENT_TYPE, "application/json")
      .body(Body::from(body.to_string()))
      .unwrap(),
    None => builder.body(Body::empty()).unwrap(),
  };
  let resp = api_router(state.clone()).oneshot(req).await.unwrap();
  let status = resp.status();
  let headers = resp.headers().clone();
  let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
    .await
    .unwrap();
  let body = if bytes.is_empty() {
    Value::Null
  } else {
    serde_json::from_slice(&bytes).unwrap()
  };
  Reply {
    status,
    headers,
    body,
  }
}

async fn activate<S: RuleStore + 'static>(state: &AppState<S>, ruleset_id: &str, published: DateTime<Utc>) {
  let candidate = serde_json::to_value(sample_ruleset(ruleset_id, published)).unwrap();
  let reply = send(state, "POST", "/rulesets", vec![], Some(candidate)).await;
  assert_eq!(reply.status, StatusCode::CREATED, "{}", reply.body);
  let reply = send(state, "POST", &format!("/rulesets/{ruleset_id}/validate"), vec![], None).await;
  assert_eq!(reply.body["ok"], true, "{}", reply.body);
  let reply = send(state, "POST", &format!("/rulesets/{ruleset_id}/activate"), vec![], None).await;
  assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
}

fn household(as_of: NaiveDate, salary: rust_decimal::Decimal) -> CalculationState {
  CalculationState::builder("case-1", as_of, Currency::aud())
    .person("alex")
    .cashflow("alex", CashflowKind::Salary, salary)
    .cashflow("alex", CashflowKind::EmployerContribution, dec!(8625))
    .position("alex", PositionKind::SuperAccumulation, dec!(100000))
    .build()
    .unwrap()
}

fn request(state: &CalculationState) -> RunRequest {
  RunRequest {
    scenario_id: state.scenario_id().clone(),
    ruleset_id:  None,
    as_of:       state.as_of(),
    tenant:      None,
    inputs:      ScenarioInputs {
      currency:     state.currency().clone(),
      period_index: state.period_index(),
      entities:     state.entities().to_vec(),
      positions:    state.positions().to_vec(),
      cashflows:    state.cashflows().to_vec(),
      assumptions:  state.assumptions().clone(),
    },
  }
}

fn run_body(as_of: NaiveDate) -> Value {
  serde_json::to_value(request(&household(as_of, dec!(75000)))).unwrap()
}

/// SQLite store that fires `cancel` once `limit` runs have been recorded.
struct CancelAfter {
  inner:    SqliteStore,
  cancel:   CancelToken,
  limit:    usize,
  recorded: AtomicUsize,
}

impl RuleStore for CancelAfter {
  type Error = reckon_store_sqlite::Error;

  fn publish(
    &self,
    candidate: CandidateRuleset,
  ) -> impl Future<Output = Result<SnapshotHeader, Self::Error>> + Send + '_ {
    self.inner.publish(candidate)
  }

  fn validate(
    &self,
    ruleset_id: RulesetId,
  ) -> impl Future<Output = Result<ValidationReport, Self::Error>> + Send + '_ {
    self.inner.validate(ruleset_id)
  }

  fn activate(
    &self,
    ruleset_id: RulesetId,
    expected_revision: Option<u64>,
  ) -> impl Future<Output = Result<HeaderPlan, Self::Error>> + Send + '_ {
    self.inner.activate(ruleset_id, expected_revision)
  }

  fn rollback(
    &self,
    current: RulesetId,
    target: RulesetId,
  ) -> impl Future<Output = Result<HeaderPlan, Self::Error>> + Send + '_ {
    self.inner.rollback(current, target)
  }

  fn get_snapshot(
    &self,
    ruleset_id: RulesetId,
  ) -> impl Future<Output = Result<Option<RulesetSnapshot>, Self::Error>> + Send + '_ {
    self.inner.get_snapshot(ruleset_id)
  }

  fn list_snapshots(
    &self,
  ) -> impl Future<Output = Result<Vec<SnapshotHeader>, Self::Error>> + Send + '_ {
    self.inner.list_snapshots()
  }

  fn registry_revision(
    &self,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_ {
    self.inner.registry_revision()
  }

  fn load_index(
    &self,
  ) -> impl Future<Output = Result<SnapshotIndex, Self::Error>> + Send + '_ {
    self.inner.load_index()
  }

  fn find_run(
    &self,
    key: RunKey,
  ) -> impl Future<Output = Result<Option<RunRecord>, Self::Error>> + Send + '_ {
    self.inner.find_run(key)
  }

  fn find_idempotent(
    &self,
    idempotency_key: String,
  ) -> impl Future<Output = Result<Option<RunRecord>, Self::Error>> + Send + '_ {
    self.inner.find_idempotent(idempotency_key)
  }

  fn record_run(
    &self,
    run: NewRun,
  ) -> impl Future<Output = Result<RunRecord, Self::Error>> + Send + '_ {
    async move {
      let record = self.inner.record_run(run).await?;
      if self.recorded.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
        self.cancel.cancel();
      }
      Ok(record)
    }
  }

  fn get_fact(
    &self,
    fact_id: FactId,
  ) -> impl Future<Output = Result<Option<Fact>, Self::Error>> + Send + '_ {
    self.inner.get_fact(fact_id)
  }

  fn scenario_trace(
    &self,
    scenario_id: ScenarioId,
    as_of: Option<NaiveDate>,
  ) -> impl Future<Output = Result<ScenarioTrace, Self::Error>> + Send + '_ {
    self.inner.scenario_trace(scenario_id, as_of)
  }
}

// ── Rulesets ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn publish_validate_activate_flow() {
  let state = make_state("secret").await;
  let candidate = serde_json::to_value(sample_ruleset("au-2024", at(2024, 7, 1))).unwrap();

  let reply = send(&state, "POST", "/rulesets", vec![], Some(candidate.clone())).await;
  assert_eq!(reply.status, StatusCode::CREATED);
  assert_eq!(reply.body["status"], "draft");
  assert_eq!(reply.body["revision"], 1);

  let reply = send(&state, "POST", "/rulesets", vec![], Some(candidate)).await;
  assert_eq!(reply.status, StatusCode::CONFLICT);
  assert_eq!(reply.body["error_code"], "CONFLICT");

  let reply = send(&state, "POST", "/rulesets/au-2024/validate", vec![], None).await;
  assert_eq!(reply.status, StatusCode::OK);
  assert_eq!(reply.body["ok"], true);

  let reply = send(&state, "POST", "/rulesets/au-2024/activate", vec![], None).await;
  assert_eq!(reply.status, StatusCode::OK);
  assert_eq!(reply.body["ruleset_id"], "au-2024");
  assert!(reply.body["activated_at"].is_string());
  assert_eq!(reply.body["revision"], 3);

  let reply = send(&state, "GET", "/rulesets/au-2024", vec![], None).await;
  assert_eq!(reply.status, StatusCode::OK);
  assert_eq!(reply.body["header"]["status"], "activated");
  assert_eq!(reply.body["rules"].as_array().unwrap().len(), 11);
}

#[tokio::test]
async fn ruleset_listing_hides_rule_bodies() {
  let state = make_state("secret").await;
  activate(&state, "au-2024", at(2024, 7, 1)).await;

  let reply = send(&state, "GET", "/rulesets", vec![], None).await;
  assert_eq!(reply.status, StatusCode::OK);
  let all = reply.body.as_array().unwrap();
  assert_eq!(all.len(), 1);
  assert!(all[0].get("rules").is_none());

  let reply = send(&state, "GET", "/rulesets?as_of=2024-08-01", vec![], None).await;
  assert_eq!(reply.status, StatusCode::OK);
  let rules = reply.body[0]["rules"].as_array().unwrap();
  assert_eq!(rules.len(), 11);
  assert!(rules.iter().all(|r| r.get("parameters").is_none()));
  assert!(rules.iter().any(|r| r["calculation"] == INCOME_TAX));
}

#[tokio::test]
async fn unknown_ruleset_is_404() {
  let state = make_state("secret").await;
  let reply = send(&state, "GET", "/rulesets/nope", vec![], None).await;
  assert_eq!(reply.status, StatusCode::NOT_FOUND);
  assert_eq!(reply.body["error_code"], "NOT_FOUND");
}

#[tokio::test]
async fn stale_revision_is_retryable_conflict() {
  let state = make_state("secret").await;
  let candidate = serde_json::to_value(sample_ruleset("au-2024", at(2024, 7, 1))).unwrap();
  send(&state, "POST", "/rulesets", vec![], Some(candidate)).await;
  send(&state, "POST", "/rulesets/au-2024/validate", vec![], None).await;

  let reply = send(
    &state,
    "POST",
    "/rulesets/au-2024/activate",
    vec![],
    Some(json!({ "expected_revision": 1 })),
  )
  .await;
  assert_eq!(reply.status, StatusCode::CONFLICT);
  assert_eq!(reply.body["error_code"], "CONCURRENT_MODIFICATION");
  assert_eq!(reply.body["retryable"], true);
  assert_eq!(reply.headers.get(header::RETRY_AFTER).unwrap(), "1");

  let reply = send(
    &state,
    "POST",
    "/rulesets/au-2024/activate",
    vec![],
    Some(json!({ "expected_revision": 2 })),
  )
  .await;
  assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
}

#[tokio::test]
async fn rollback_requires_admin_and_restores_previous_ruleset() {
  let state = make_state("secret").await;
  activate(&state, "au-2023", at(2023, 7, 1)).await;
  activate(&state, "au-2024", at(2024, 7, 1)).await;

  let before = send(&state, "POST", "/calc/run", vec![], Some(run_body(date(2024, 8, 1)))).await;
  assert_eq!(before.body["ruleset_id"], "au-2024");

  let target = json!({ "target_ruleset_id": "au-2023" });
  let reply = send(&state, "POST", "/rulesets/au-2024/rollback", vec![], Some(target.clone())).await;
  assert_eq!(reply.status, StatusCode::FORBIDDEN);
  assert_eq!(reply.body["error_code"], "FORBIDDEN");

  let wrong = auth_header("admin", "guess");
  let reply = send(
    &state,
    "POST",
    "/rulesets/au-2024/rollback",
    vec![("authorization", wrong.as_str())],
    Some(target.clone()),
  )
  .await;
  assert_eq!(reply.status, StatusCode::FORBIDDEN);

  let good = auth_header("admin", "secret");
  let reply = send(
    &state,
    "POST",
    "/rulesets/au-2024/rollback",
    vec![("authorization", good.as_str())],
    Some(target),
  )
  .await;
  assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);

  let after = send(&state, "POST", "/calc/run", vec![], Some(run_body(date(2024, 8, 1)))).await;
  assert_eq!(after.body["ruleset_id"], "au-2023");
  assert_eq!(after.body["cache_hit"], false);

  // Facts computed before the rollback keep their ruleset.
  let fact_id = before.body["facts"][0]["fact_id"].as_str().unwrap();
  let reply = send(&state, "GET", &format!("/facts/{fact_id}"), vec![], None).await;
  assert_eq!(reply.status, StatusCode::OK);
  assert_eq!(reply.body["fact"], before.body["facts"][0]);
  assert_eq!(reply.body["fact"]["ruleset_id"], "au-2024");
}

// ── Runs ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn repeated_run_is_a_cache_hit_with_identical_facts() {
  let state = make_state("secret").await;
  activate(&state, "au-2024", at(2024, 7, 1)).await;

  let first = send(&state, "POST", "/calc/run", vec![], Some(run_body(date(2024, 8, 1)))).await;
  assert_eq!(first.status, StatusCode::OK, "{}", first.body);
  assert_eq!(first.body["cache_hit"], false);
  assert!(!first.body["facts"].as_array().unwrap().is_empty());
  assert!(!first.body["trace"].as_array().unwrap().is_empty());

  let second = send(&state, "POST", "/calc/run", vec![], Some(run_body(date(2024, 8, 1)))).await;
  assert_eq!(second.body["cache_hit"], true);
  assert_eq!(second.body["run_id"], first.body["run_id"]);
  assert_eq!(second.body["facts"], first.body["facts"]);
  assert_eq!(second.body["calculated_at"], first.body["calculated_at"]);
}

#[tokio::test]
async fn concurrent_runs_share_one_evaluation() {
  let state = make_state("secret").await;
  activate(&state, "au-2024", at(2024, 7, 1)).await;

  let a = send(&state, "POST", "/calc/run", vec![], Some(run_body(date(2024, 8, 1))));
  let b = send(&state, "POST", "/calc/run", vec![], Some(run_body(date(2024, 8, 1))));
  let (a, b) = tokio::join!(a, b);
  assert_eq!(a.body["run_id"], b.body["run_id"]);
  let hits = [&a, &b]
    .iter()
    .filter(|r| r.body["cache_hit"] == true)
    .count();
  assert_eq!(hits, 1);
}

#[tokio::test]
async fn date_before_any_ruleset_names_earliest_available() {
  let state = make_state("secret").await;
  activate(&state, "au-2024", at(2024, 7, 1)).await;

  let reply = send(&state, "POST", "/calc/run", vec![], Some(run_body(date(2023, 1, 1)))).await;
  assert_eq!(reply.status, StatusCode::NOT_FOUND);
  assert_eq!(reply.body["error_code"], "NO_RULESET_FOR_DATE");
  assert_eq!(reply.body["retryable"], false);
  assert!(
    reply.body["remediation"].as_str().unwrap().contains("2024-07-01"),
    "{}",
    reply.body
  );
}

#[tokio::test]
async fn idempotency_key_replays_and_rejects_reuse() {
  let state = make_state("secret").await;
  activate(&state, "au-2024", at(2024, 7, 1)).await;
  let key = vec![("idempotency-key", "req-1")];

  let first = send(&state, "POST", "/calc/run", key.clone(), Some(run_body(date(2024, 8, 1)))).await;
  assert_eq!(first.body["cache_hit"], false);
  assert_eq!(first.body["idempotency_key"], "req-1");

  let replay = send(&state, "POST", "/calc/run", key.clone(), Some(run_body(date(2024, 8, 1)))).await;
  assert_eq!(replay.body["cache_hit"], true);
  assert_eq!(replay.body["run_id"], first.body["run_id"]);

  let other = serde_json::to_value(request(&household(date(2024, 8, 1), dec!(90000)))).unwrap();
  let reply = send(&state, "POST", "/calc/run", key, Some(other)).await;
  assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
  assert_eq!(reply.body["error_code"], "IDEMPOTENCY_CONFLICT");
}

#[tokio::test]
async fn invalid_inputs_are_rejected() {
  let state = make_state("secret").await;
  activate(&state, "au-2024", at(2024, 7, 1)).await;

  let mut body = request(&household(date(2024, 8, 1), dec!(75000)));
  body.inputs.cashflows[0].entity_id = "ghost".into();
  let reply = send(
    &state,
    "POST",
    "/calc/run",
    vec![],
    Some(serde_json::to_value(body).unwrap()),
  )
  .await;
  assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
  assert_eq!(reply.body["error_code"], "VALIDATION_FAILED");

  let reply = send(&state, "POST", "/calc/run", vec![], Some(json!({ "as_of": 7 }))).await;
  assert_eq!(reply.status, StatusCode::BAD_REQUEST);
  assert_eq!(reply.body["error_code"], "BAD_REQUEST");
}

#[tokio::test]
async fn batch_reports_each_item() {
  let state = make_state("secret").await;
  activate(&state, "au-2024", at(2024, 7, 1)).await;

  let body = json!({ "items": [run_body(date(2024, 8, 1)), run_body(date(2020, 1, 1))] });
  let reply = send(&state, "POST", "/calc/batch", vec![], Some(body)).await;
  assert_eq!(reply.status, StatusCode::OK);
  assert_eq!(reply.body["succeeded"], 1);
  assert_eq!(reply.body["failed"], 1);

  let items = reply.body["items"].as_array().unwrap();
  assert_eq!(items[0]["status"], "ok");
  assert_eq!(items[0]["run"]["ruleset_id"], "au-2024");
  assert_eq!(items[1]["status"], "error");
  assert_eq!(items[1]["index"], 1);
  assert_eq!(items[1]["error"]["error_code"], "NO_RULESET_FOR_DATE");
}

// ── Projection ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn projection_returns_each_period() {
  let state = make_state("secret").await;
  activate(&state, "au-2024", at(2024, 7, 1)).await;

  let body = json!({ "periods": 3, "base": run_body(date(2024, 8, 1)) });
  let reply = send(&state, "POST", "/calc/project", vec![], Some(body)).await;
  assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);

  let periods = reply.body["periods"].as_array().unwrap();
  assert_eq!(periods.len(), 3);
  let dates: Vec<&str> = periods.iter().map(|p| p["as_of"].as_str().unwrap()).collect();
  assert_eq!(dates, ["2024-08-01", "2025-08-01", "2026-08-01"]);
  for (i, period) in periods.iter().enumerate() {
    assert_eq!(period["period_index"], i);
    assert_eq!(period["ruleset_id"], "au-2024");
  }

  // Every period was stored.
  let reply = send(&state, "GET", "/trace/case-1", vec![], None).await;
  assert_eq!(reply.body["runs"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn cancelled_projection_keeps_committed_periods() {
  let cancel = CancelToken::new();
  let store = CancelAfter {
    inner:    SqliteStore::open_in_memory().await.unwrap(),
    cancel:   cancel.clone(),
    limit:    2,
    recorded: AtomicUsize::new(0),
  };
  let state = app_state(store, "secret");
  activate(&state, "au-2024", at(2024, 7, 1)).await;

  let base = request(&household(date(2024, 8, 1), dec!(75000)));
  let err = state
    .service
    .project_with_cancel(base, 5, cancel)
    .await
    .unwrap_err();
  assert!(matches!(err, ApiError::Unavailable(_)), "{err}");
  assert!(err.to_string().contains("after 2 periods"), "{err}");

  let reply = send(&state, "GET", "/trace/case-1", vec![], None).await;
  assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
  let runs = reply.body["runs"].as_array().unwrap();
  let mut dates: Vec<&str> = runs.iter().map(|r| r["key"]["as_of"].as_str().unwrap()).collect();
  dates.sort();
  assert_eq!(dates, ["2024-08-01", "2025-08-01"]);
}

#[tokio::test]
async fn projection_past_the_horizon_is_rejected() {
  let state = make_state("secret").await;
  activate(&state, "au-2024", at(2024, 7, 1)).await;

  let body = json!({ "periods": 51, "base": run_body(date(2024, 8, 1)) });
  let reply = send(&state, "POST", "/calc/project", vec![], Some(body)).await;
  assert_eq!(reply.status, StatusCode::UNPROCESSABLE_ENTITY);
  assert_eq!(reply.body["error_code"], "HORIZON_EXCEEDED");
  assert_eq!(reply.body["retryable"], false);
}

// ── History ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn trace_returns_stored_runs_with_provenance() {
  let state = make_state("secret").await;
  activate(&state, "au-2024", at(2024, 7, 1)).await;
  let run = send(&state, "POST", "/calc/run", vec![], Some(run_body(date(2024, 8, 1)))).await;

  let reply = send(&state, "GET", "/trace/case-1?as_of=2024-08-01", vec![], None).await;
  assert_eq!(reply.status, StatusCode::OK);
  let runs = reply.body["runs"].as_array().unwrap();
  assert_eq!(runs.len(), 1);
  assert_eq!(runs[0]["run_id"], run.body["run_id"]);
  assert!(reply.body["dangling_links"].as_array().unwrap().is_empty());

  let reply = send(&state, "GET", "/trace/case-1?as_of=2025-08-01", vec![], None).await;
  assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn fact_explanation_names_its_rule() {
  let state = make_state("secret").await;
  activate(&state, "au-2024", at(2024, 7, 1)).await;
  let run = send(&state, "POST", "/calc/run", vec![], Some(run_body(date(2024, 8, 1)))).await;

  let tax = run.body["facts"]
    .as_array()
    .unwrap()
    .iter()
    .find(|f| f["calculation"] == INCOME_TAX)
    .unwrap();
  let fact_id = tax["fact_id"].as_str().unwrap();

  let reply = send(&state, "GET", &format!("/facts/{fact_id}"), vec![], None).await;
  assert_eq!(reply.status, StatusCode::OK);
  let explanation = reply.body["explanation"].as_str().unwrap();
  assert!(explanation.contains("au-2024/pit.income_tax"), "{explanation}");

  let reply = send(&state, "GET", "/facts/missing", vec![], None).await;
  assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

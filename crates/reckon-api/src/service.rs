//! The run service: everything between an HTTP handler and the store.
//!
//! A run is identified by its [`RunKey`]. Persisted runs are served from the
//! store as cache hits; concurrent requests for the same key share a single
//! evaluation. Evaluation itself is CPU-bound and runs on the blocking pool.
//! Transient store failures are retried with bounded exponential backoff;
//! every other failure is returned as-is, since re-running a deterministic
//! evaluation would only reproduce it.

use std::{
  collections::{BTreeMap, HashMap},
  future::Future,
  sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
  },
};

use chrono::NaiveDate;
use reckon_core::{
  FactId, RulesetId, ScenarioId,
  eval::Evaluator,
  fact::{Fact, explain},
  projection::{CancelToken, PeriodSnapshot, Projection},
  reconcile::{ReconciliationReport, Reconciler},
  resolve::{RulesetSource, SnapshotIndex},
  settings::EngineSettings,
  snapshot::{CandidateRuleset, HeaderPlan, RulesetSnapshot, SnapshotHeader, ValidationReport},
  state::{CalculationState, Cashflow, Entity, Position, StateInput},
  store::{NewRun, RuleStore, RunKey, RunRecord, ScenarioTrace, StoreError},
  value::{Currency, Quantity},
};
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};

use crate::error::{ApiError, ErrorBody};

// ─── Requests ────────────────────────────────────────────────────────────────

/// Scenario data for one evaluation date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioInputs {
  pub currency:     Currency,
  #[serde(default)]
  pub period_index: u32,
  #[serde(default)]
  pub entities:     Vec<Entity>,
  #[serde(default)]
  pub positions:    Vec<Position>,
  #[serde(default)]
  pub cashflows:    Vec<Cashflow>,
  #[serde(default)]
  pub assumptions:  BTreeMap<String, Quantity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
  pub scenario_id: ScenarioId,
  /// Evaluate under this ruleset instead of the one governing `as_of`.
  #[serde(default)]
  pub ruleset_id:  Option<RulesetId>,
  pub as_of:       NaiveDate,
  #[serde(default)]
  pub tenant:      Option<String>,
  pub inputs:      ScenarioInputs,
}

impl RunRequest {
  fn state(self) -> Result<(CalculationState, Option<RulesetId>), ApiError> {
    let input = StateInput {
      scenario_id:  self.scenario_id,
      tenant:       self.tenant,
      as_of:        self.as_of,
      period_index: self.inputs.period_index,
      currency:     self.inputs.currency,
      entities:     self.inputs.entities,
      positions:    self.inputs.positions,
      cashflows:    self.inputs.cashflows,
      assumptions:  self.inputs.assumptions,
    };
    Ok((CalculationState::try_from(input)?, self.ruleset_id))
  }
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RunOutcome {
  pub run:       RunRecord,
  /// The run was already stored, or another request evaluated it.
  pub cache_hit: bool,
}

#[derive(Debug, Clone)]
pub struct ProjectionOutcome {
  pub periods:        Vec<PeriodSnapshot>,
  /// Stored run for each period, in period order.
  pub runs:           Vec<RunRecord>,
  pub reconciliation: ReconciliationReport,
}

/// One item of a batch: the run, or why it failed.
#[derive(Debug)]
pub enum BatchResult {
  Succeeded(RunOutcome),
  Failed(ErrorBody),
}

// ─── Service ─────────────────────────────────────────────────────────────────

pub struct RunService<S: RuleStore> {
  store:      Arc<S>,
  evaluator:  Evaluator,
  reconciler: Reconciler,
  settings:   EngineSettings,
  /// Resolution index, tagged with the registry revision it was built at.
  index:      RwLock<Option<(u64, Arc<SnapshotIndex>)>>,
  inflight:   Mutex<HashMap<RunKey, Arc<OnceCell<RunRecord>>>>,
  /// Serialises lifecycle changes.
  admin:      tokio::sync::Mutex<()>,
}

impl<S: RuleStore> RunService<S> {
  pub fn new(
    store: Arc<S>,
    evaluator: Evaluator,
    reconciler: Reconciler,
    settings: EngineSettings,
  ) -> Self {
    Self {
      store,
      evaluator,
      reconciler,
      settings,
      index: RwLock::new(None),
      inflight: Mutex::new(HashMap::new()),
      admin: tokio::sync::Mutex::new(()),
    }
  }

  pub fn settings(&self) -> &EngineSettings { &self.settings }

  pub fn store(&self) -> &S { &self.store }

  /// Run a store operation, retrying transient failures.
  async fn retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, ApiError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, S::Error>>,
  {
    let policy = self.settings.retry;
    let mut attempt = 1;
    loop {
      match call().await {
        Ok(value) => return Ok(value),
        Err(err) if err.is_transient() && attempt < policy.max_attempts => {
          let delay = policy.delay(attempt);
          tracing::warn!(
            op,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient store failure; retrying"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => return Err(ApiError::store(err)),
      }
    }
  }

  /// The resolution index for the current registry revision.
  pub async fn index(&self) -> Result<Arc<SnapshotIndex>, ApiError> {
    let revision = self
      .retry("registry_revision", || self.store.registry_revision())
      .await?;
    {
      let cached = self.index.read().await;
      if let Some((at, index)) = cached.as_ref()
        && *at == revision
      {
        return Ok(Arc::clone(index));
      }
    }
    let index = Arc::new(self.retry("load_index", || self.store.load_index()).await?);
    tracing::debug!(revision, snapshots = index.len(), "rebuilt resolution index");
    *self.index.write().await = Some((revision, Arc::clone(&index)));
    Ok(index)
  }

  // ── Snapshot lifecycle ────────────────────────────────────────────────

  pub async fn publish(
    &self,
    candidate: CandidateRuleset,
  ) -> Result<SnapshotHeader, ApiError> {
    let _guard = self.admin.lock().await;
    self
      .retry("publish", || self.store.publish(candidate.clone()))
      .await
  }

  pub async fn validate(
    &self,
    ruleset_id: RulesetId,
  ) -> Result<ValidationReport, ApiError> {
    let _guard = self.admin.lock().await;
    self
      .retry("validate", || self.store.validate(ruleset_id.clone()))
      .await
  }

  pub async fn activate(
    &self,
    ruleset_id: RulesetId,
    expected_revision: Option<u64>,
  ) -> Result<HeaderPlan, ApiError> {
    let _guard = self.admin.lock().await;
    self
      .retry("activate", || {
        self.store.activate(ruleset_id.clone(), expected_revision)
      })
      .await
  }

  pub async fn rollback(
    &self,
    current: RulesetId,
    target: RulesetId,
  ) -> Result<HeaderPlan, ApiError> {
    let _guard = self.admin.lock().await;
    self
      .retry("rollback", || {
        self.store.rollback(current.clone(), target.clone())
      })
      .await
  }

  pub async fn snapshot(
    &self,
    ruleset_id: RulesetId,
  ) -> Result<RulesetSnapshot, ApiError> {
    self
      .retry("get_snapshot", || self.store.get_snapshot(ruleset_id.clone()))
      .await?
      .ok_or_else(|| ApiError::NotFound(format!("ruleset {ruleset_id}")))
  }

  pub async fn headers(&self) -> Result<Vec<SnapshotHeader>, ApiError> {
    self.retry("list_snapshots", || self.store.list_snapshots()).await
  }

  // ── Runs ──────────────────────────────────────────────────────────────

  /// Evaluate one scenario, or return the stored result for the same key.
  pub async fn run(
    &self,
    request: RunRequest,
    idempotency_key: Option<String>,
  ) -> Result<RunOutcome, ApiError> {
    let (state, pinned) = request.state()?;

    if let Some(key) = &idempotency_key
      && let Some(existing) = self
        .retry("find_idempotent", || self.store.find_idempotent(key.clone()))
        .await?
    {
      let same_request = existing.key.scenario_id == *state.scenario_id()
        && existing.key.as_of == state.as_of()
        && existing.key.inputs_hash == state.inputs_hash()?
        && pinned.as_ref().is_none_or(|id| *id == existing.key.ruleset_id);
      if !same_request {
        return Err(ApiError::IdempotencyConflict(key.clone()));
      }
      tracing::debug!(idempotency_key = %key, run_id = %existing.run_id, "idempotent replay");
      return Ok(RunOutcome {
        run:       existing,
        cache_hit: true,
      });
    }

    let index = self.index().await?;
    let resolved = index.resolve(state.as_of(), pinned.as_ref())?;
    let key = RunKey::new(&state, resolved.ruleset_id().clone())?;

    let cell = {
      let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
      Arc::clone(inflight.entry(key.clone()).or_default())
    };
    let evaluated = AtomicBool::new(false);
    let result = cell
      .get_or_try_init(|| async {
        if let Some(run) = self
          .retry("find_run", || self.store.find_run(key.clone()))
          .await?
        {
          tracing::debug!(run_id = %run.run_id, "served stored run");
          return Ok(run);
        }
        evaluated.store(true, Ordering::Relaxed);
        let evaluator = self.evaluator.clone();
        let reconciler = self.reconciler.clone();
        let (run, reconciliation) = tokio::task::spawn_blocking(move || {
          let run = evaluator.run(&state, &resolved)?;
          let reconciliation = reconciler.reconcile_run(&state, &run);
          Ok::<_, reckon_core::EvalError>((run, reconciliation))
        })
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))??;

        let new_run = NewRun {
          key: key.clone(),
          idempotency_key: idempotency_key.clone(),
          facts: run.facts,
          failures: run.failures,
          trace: run.trace,
          reconciliation,
        };
        let record = self
          .retry("record_run", || self.store.record_run(new_run.clone()))
          .await?;
        tracing::info!(
          run_id = %record.run_id,
          scenario = %record.key.scenario_id,
          ruleset = %record.key.ruleset_id,
          as_of = %record.key.as_of,
          facts = record.facts.len(),
          failures = record.failures.len(),
          clean = record.is_clean(),
          "evaluated run"
        );
        Ok::<_, ApiError>(record)
      })
      .await
      .cloned();

    {
      let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
      if inflight.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
        inflight.remove(&key);
      }
    }

    Ok(RunOutcome {
      run:       result?,
      cache_hit: !evaluated.load(Ordering::Relaxed),
    })
  }

  /// Run every request independently; one failure never affects another.
  pub async fn batch(&self, requests: Vec<RunRequest>) -> Vec<BatchResult> {
    let mut results = Vec::with_capacity(requests.len());
    for request in requests {
      let scenario = request.scenario_id.clone();
      results.push(match self.run(request, None).await {
        Ok(outcome) => BatchResult::Succeeded(outcome),
        Err(err) => {
          tracing::debug!(%scenario, error = %err, "batch item failed");
          BatchResult::Failed(err.body())
        }
      });
    }
    results
  }

  /// Project `periods` periods from the request's state and store each as
  /// a run. Dropping the returned future cancels the projection after the
  /// period in progress.
  pub async fn project(
    &self,
    request: RunRequest,
    periods: u32,
  ) -> Result<ProjectionOutcome, ApiError> {
    let cancel = CancelToken::new();
    let _guard = cancel.cancel_on_drop();
    self.project_with_cancel(request, periods, cancel).await
  }

  /// Like [`project`](Self::project), stopping once `cancel` fires.
  ///
  /// Periods are evaluated one at a time and each is stored before the next
  /// starts, so every period completed before cancellation stays in the
  /// trace.
  pub async fn project_with_cancel(
    &self,
    request: RunRequest,
    periods: u32,
    cancel: CancelToken,
  ) -> Result<ProjectionOutcome, ApiError> {
    let (state, pinned) = request.state()?;
    let index = self.index().await?;
    let source: Arc<dyn RulesetSource> = index;
    let mut projection = Projection::new(
      self.evaluator.clone(),
      source,
      state,
      periods,
      self.settings.clone(),
    )?
    .with_cancel(cancel);
    if let Some(ruleset_id) = pinned {
      projection = projection.pinned(ruleset_id);
    }

    let mut snapshots = Vec::with_capacity(periods as usize);
    let mut runs = Vec::with_capacity(periods as usize);
    let mut reconciliation = ReconciliationReport::default();
    loop {
      let (rest, next) = tokio::task::spawn_blocking(move || {
        let next = projection.next();
        (projection, next)
      })
      .await
      .map_err(|err| ApiError::Internal(err.to_string()))?;
      projection = rest;

      let Some(period) = next else { break };
      let period = match period {
        Ok(period) => period,
        Err(err) => {
          tracing::info!(
            committed = runs.len(),
            error = %err,
            "projection stopped"
          );
          return Err(err.into());
        }
      };

      let failures = self.reconciler.check_period(&period.state, &period.facts);
      reconciliation.failures.extend(failures.iter().cloned());
      let new_run = NewRun {
        key:             RunKey::new(&period.state, period.ruleset_id.clone())?,
        idempotency_key: None,
        facts:           period.facts.clone(),
        failures:        period.failures.clone(),
        trace:           period.trace.clone(),
        reconciliation:  ReconciliationReport { failures },
      };
      let run = self
        .retry("record_run", || self.store.record_run(new_run.clone()))
        .await?;
      tracing::debug!(
        period_index = period.period_index,
        run_id = %run.run_id,
        "committed projected period"
      );
      runs.push(run);
      snapshots.push(period);
    }
    tracing::info!(
      periods = snapshots.len(),
      reconciliation_failures = reconciliation.failures.len(),
      "projected scenario"
    );
    Ok(ProjectionOutcome {
      periods: snapshots,
      runs,
      reconciliation,
    })
  }

  // ── History ───────────────────────────────────────────────────────────

  pub async fn trace(
    &self,
    scenario_id: ScenarioId,
    as_of: Option<NaiveDate>,
  ) -> Result<ScenarioTrace, ApiError> {
    let trace = self
      .retry("scenario_trace", || {
        self.store.scenario_trace(scenario_id.clone(), as_of)
      })
      .await?;
    if trace.runs.is_empty() {
      return Err(ApiError::NotFound(format!("no runs for scenario {scenario_id}")));
    }
    Ok(trace)
  }

  /// A stored fact and its narrative explanation.
  pub async fn fact(&self, fact_id: FactId) -> Result<(Fact, String), ApiError> {
    let fact = self
      .retry("get_fact", || self.store.get_fact(fact_id.clone()))
      .await?
      .ok_or_else(|| ApiError::NotFound(format!("fact {fact_id}")))?;
    let history = self
      .retry("scenario_trace", || {
        self.store.scenario_trace(fact.scenario_id.clone(), Some(fact.as_of))
      })
      .await?;
    let explanation = match history
      .runs
      .iter()
      .find(|run| run.facts.iter().any(|f| f.fact_id == fact_id))
    {
      Some(run) => explain(&fact, run.trace.entries()),
      None => explain(&fact, &[]),
    };
    Ok((fact, explanation))
  }
}

//! Multi-period projection.
//!
//! A [`Projection`] is a lazy iterator of [`PeriodSnapshot`]s. Each period
//! resolves the ruleset for its own `as_of`, evaluates the full DAG, and
//! hands the outputs of carry-forward units to the next period's state. The
//! iterator never truncates silently: it ends after the requested number of
//! periods, or yields exactly one error and then stops.

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{
  Error, ProjectionError, RulesetId,
  eval::{Evaluator, NodeFailure},
  fact::Fact,
  resolve::RulesetSource,
  settings::EngineSettings,
  state::{CalculationState, CarriedBalance},
  trace::TraceLog,
  unit::Registry,
  value::Rate,
};

/// Assumption key for annual wage growth applied between periods.
pub const WAGE_GROWTH: &str = "wage_growth";

// ─── Cancellation ────────────────────────────────────────────────────────────

/// Cooperative cancellation, observed between periods only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self { Self::default() }

  pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }

  pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }

  /// A guard that cancels this token when dropped.
  pub fn cancel_on_drop(&self) -> CancelGuard { CancelGuard(self.clone()) }
}

/// Cancels its token on drop, e.g. when a request future is abandoned.
#[derive(Debug)]
pub struct CancelGuard(CancelToken);

impl Drop for CancelGuard {
  fn drop(&mut self) { self.0.cancel(); }
}

// ─── Period snapshot ─────────────────────────────────────────────────────────

/// The complete, immutable result of one projected period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodSnapshot {
  pub period_index: u32,
  pub as_of:        NaiveDate,
  pub ruleset_id:   RulesetId,
  /// The state this period was evaluated from.
  pub state:        CalculationState,
  pub facts:        Vec<Fact>,
  pub failures:     Vec<NodeFailure>,
  pub trace:        TraceLog,
  /// Balances handed to the following period.
  pub carried:      Vec<CarriedBalance>,
}

impl PeriodSnapshot {
  /// The starting state of the following period.
  pub fn successor(
    &self,
    settings: &EngineSettings,
  ) -> Result<CalculationState, ProjectionError> {
    successor(&self.state, &self.carried, settings)
  }
}

fn successor(
  state: &CalculationState,
  carried: &[CarriedBalance],
  settings: &EngineSettings,
) -> Result<CalculationState, ProjectionError> {
  let period_index = state.period_index();
  let wrap = |source: Error| ProjectionError::State {
    period_index,
    source,
  };
  let next_as_of = state
    .as_of()
    .checked_add_months(Months::new(settings.period_months))
    .ok_or_else(|| {
      wrap(Error::InvalidState(format!(
        "{} plus {} months is out of range",
        state.as_of(),
        settings.period_months
      )))
    })?;
  let growth = state
    .assumptions()
    .get(WAGE_GROWTH)
    .map(|q| q.to_rate())
    .transpose()
    .map_err(wrap)?
    .filter(|r: &Rate| !r.fraction().is_zero());
  state.advance(next_as_of, carried, growth).map_err(wrap)
}

/// Outputs of carry-forward units, as balances for the next period.
fn carried_balances(
  registry: &Registry,
  facts: &[Fact],
) -> Result<Vec<CarriedBalance>, Error> {
  let mut carried = Vec::new();
  for fact in facts {
    let (Some(entity_id), Ok(unit)) =
      (&fact.entity_id, registry.get(&fact.calculation))
    else {
      continue;
    };
    if let Some(kind) = unit.carry_forward() {
      carried.push(CarriedBalance {
        entity_id: entity_id.clone(),
        kind,
        balance: fact.value.to_money()?,
      });
    }
  }
  Ok(carried)
}

// ─── Projection ──────────────────────────────────────────────────────────────

pub struct Projection {
  evaluator: Evaluator,
  source:    Arc<dyn RulesetSource>,
  settings:  EngineSettings,
  pinned:    Option<RulesetId>,
  cancel:    CancelToken,
  next:      Option<CalculationState>,
  remaining: u32,
  completed: u32,
}

impl std::fmt::Debug for Projection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Projection")
      .field("pinned", &self.pinned)
      .field("remaining", &self.remaining)
      .field("completed", &self.completed)
      .finish_non_exhaustive()
  }
}

impl Projection {
  /// Project `periods` periods starting at `base` (inclusive).
  ///
  /// Fails up front when the last period would pass
  /// [`EngineSettings::max_horizon_periods`].
  pub fn new(
    evaluator: Evaluator,
    source: Arc<dyn RulesetSource>,
    base: CalculationState,
    periods: u32,
    settings: EngineSettings,
  ) -> Result<Self, ProjectionError> {
    let requested = base.period_index().saturating_add(periods);
    if requested > settings.max_horizon_periods {
      return Err(ProjectionError::HorizonExceeded {
        requested,
        limit: settings.max_horizon_periods,
      });
    }
    Ok(Self {
      evaluator,
      source,
      settings,
      pinned: None,
      cancel: CancelToken::new(),
      next: Some(base),
      remaining: periods,
      completed: 0,
    })
  }

  /// Re-run from a previously produced period, re-evaluating it.
  pub fn restart_from(
    evaluator: Evaluator,
    source: Arc<dyn RulesetSource>,
    snapshot: &PeriodSnapshot,
    periods: u32,
    settings: EngineSettings,
  ) -> Result<Self, ProjectionError> {
    Self::new(evaluator, source, snapshot.state.clone(), periods, settings)
  }

  /// Continue with the period after `snapshot`.
  pub fn resume_after(
    evaluator: Evaluator,
    source: Arc<dyn RulesetSource>,
    snapshot: &PeriodSnapshot,
    periods: u32,
    settings: EngineSettings,
  ) -> Result<Self, ProjectionError> {
    let base = snapshot.successor(&settings)?;
    Self::new(evaluator, source, base, periods, settings)
  }

  /// Evaluate every period under one ruleset instead of resolving by date.
  pub fn pinned(mut self, ruleset_id: RulesetId) -> Self {
    self.pinned = Some(ruleset_id);
    self
  }

  pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn cancel_token(&self) -> CancelToken { self.cancel.clone() }

  fn step(
    &self,
    state: CalculationState,
  ) -> Result<PeriodSnapshot, ProjectionError> {
    let period_index = state.period_index();
    let resolved = self
      .source
      .resolve(state.as_of(), self.pinned.as_ref())
      .map_err(|source| ProjectionError::Resolve {
        period_index,
        source,
      })?;
    let run = self
      .evaluator
      .run(&state, &resolved)
      .map_err(|source| ProjectionError::Eval {
        period_index,
        source,
      })?;
    let carried = carried_balances(self.evaluator.registry(), &run.facts)
      .map_err(|source| ProjectionError::State {
        period_index,
        source,
      })?;
    tracing::debug!(
      period_index,
      as_of = %state.as_of(),
      ruleset = %run.ruleset_id,
      facts = run.facts.len(),
      failures = run.failures.len(),
      "projected period"
    );
    Ok(PeriodSnapshot {
      period_index,
      as_of: state.as_of(),
      ruleset_id: run.ruleset_id,
      state,
      facts: run.facts,
      failures: run.failures,
      trace: run.trace,
      carried,
    })
  }
}

impl Iterator for Projection {
  type Item = Result<PeriodSnapshot, ProjectionError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.remaining == 0 {
      return None;
    }
    let state = self.next.take()?;
    if self.cancel.is_cancelled() {
      return Some(Err(ProjectionError::Cancelled {
        completed_periods: self.completed,
      }));
    }

    let result = self.step(state).and_then(|snapshot| {
      if self.remaining > 1 {
        self.next = Some(snapshot.successor(&self.settings)?);
      }
      Ok(snapshot)
    });
    if result.is_ok() {
      self.remaining -= 1;
      self.completed += 1;
    }
    Some(result)
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    let upper = if self.next.is_some() {
      self.remaining as usize
    } else {
      0
    };
    (0, Some(upper))
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use rust_decimal_macros::dec;

  use super::*;
  use crate::{
    CalcId, EvalError, ResolveError,
    fixtures::{at, date, rule, snapshot},
    resolve::SnapshotIndex,
    rule::{ParamValue, PrecedenceTier},
    snapshot::SnapshotStatus,
    state::{CashflowKind, PositionKind},
    unit::{CalculationUnit, UnitContext},
    value::{Currency, Quantity},
  };

  /// Opening balance plus a rule-set share of salary.
  struct Balance;

  impl CalculationUnit for Balance {
    fn id(&self) -> CalcId { "t.balance".into() }

    fn carry_forward(&self) -> Option<PositionKind> {
      Some(PositionKind::SuperAccumulation)
    }

    fn evaluate(
      &self,
      ctx: &mut UnitContext<'_>,
    ) -> Result<Quantity, EvalError> {
      let opening = ctx.required_position(PositionKind::SuperAccumulation)?;
      let salary = ctx.cashflow(CashflowKind::Salary)?;
      let share = salary.apply_rate(ctx.rate("share")?)?;
      Ok(opening.checked_add(&share)?.into())
    }
  }

  fn share_rule(id: &str, from: NaiveDate, percent: rust_decimal::Decimal) -> crate::rule::Rule {
    let mut r = rule(id, "t.balance", PrecedenceTier::Act, from);
    r.parameters = BTreeMap::from([(
      "share".to_owned(),
      ParamValue::Quantity(Quantity::percent(percent)),
    )]);
    r
  }

  fn source() -> Arc<dyn RulesetSource> {
    let mut later = share_rule("share-2025", date(2025, 7, 1), dec!(12));
    later.published_at = at(2025, 6, 1);
    Arc::new(SnapshotIndex::new([
      snapshot(
        "r2024",
        at(2024, 7, 1),
        SnapshotStatus::Activated,
        vec![share_rule("share-2024", date(2024, 7, 1), dec!(10))],
      ),
      snapshot("r2025", at(2025, 7, 1), SnapshotStatus::Activated, vec![
        later,
      ]),
    ]))
  }

  fn evaluator() -> Evaluator {
    let mut registry = Registry::new();
    registry.register(Balance).unwrap();
    Evaluator::new(Arc::new(registry))
  }

  fn base() -> CalculationState {
    CalculationState::builder("case-1", date(2024, 9, 1), Currency::aud())
      .person("alex")
      .position("alex", PositionKind::SuperAccumulation, dec!(1000))
      .cashflow("alex", CashflowKind::Salary, dec!(10000))
      .assumption(WAGE_GROWTH, Quantity::percent(dec!(10)))
      .build()
      .unwrap()
  }

  fn balance(snapshot: &PeriodSnapshot) -> rust_decimal::Decimal {
    snapshot
      .facts
      .iter()
      .find(|f| f.calculation.as_str() == "t.balance")
      .unwrap()
      .value
      .amount
  }

  #[test]
  fn periods_carry_balances_and_follow_rule_changes() {
    let periods: Vec<_> = Projection::new(
      evaluator(),
      source(),
      base(),
      3,
      EngineSettings::default(),
    )
    .unwrap()
    .collect::<Result<_, _>>()
    .unwrap();

    assert_eq!(periods.len(), 3);
    assert_eq!(periods[0].ruleset_id.as_str(), "r2024");
    assert_eq!(balance(&periods[0]), dec!(2000.00));
    // 2025-09-01: salary grown to 11000, share now 12%.
    assert_eq!(periods[1].as_of, date(2025, 9, 1));
    assert_eq!(periods[1].ruleset_id.as_str(), "r2025");
    assert_eq!(balance(&periods[1]), dec!(3320.00));
    assert_eq!(balance(&periods[2]), dec!(4772.00));
    assert_eq!(periods[2].period_index, 2);
  }

  #[test]
  fn horizon_is_checked_before_any_work() {
    let settings = EngineSettings {
      max_horizon_periods: 5,
      ..EngineSettings::default()
    };
    let err =
      Projection::new(evaluator(), source(), base(), 6, settings).unwrap_err();
    assert!(matches!(err, ProjectionError::HorizonExceeded {
      requested: 6,
      limit:     5,
    }));
  }

  #[test]
  fn restart_reproduces_the_tail() {
    let settings = EngineSettings::default();
    let full: Vec<_> =
      Projection::new(evaluator(), source(), base(), 3, settings.clone())
        .unwrap()
        .map(Result::unwrap)
        .collect();

    let restarted: Vec<_> = Projection::restart_from(
      evaluator(),
      source(),
      &full[1],
      2,
      settings.clone(),
    )
    .unwrap()
    .map(Result::unwrap)
    .collect();
    assert_eq!(restarted, full[1..]);

    let resumed: Vec<_> =
      Projection::resume_after(evaluator(), source(), &full[1], 1, settings)
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(resumed, full[2..]);
  }

  #[test]
  fn cancellation_takes_effect_between_periods() {
    let mut projection = Projection::new(
      evaluator(),
      source(),
      base(),
      3,
      EngineSettings::default(),
    )
    .unwrap();
    let cancel = projection.cancel_token();
    assert!(projection.next().unwrap().is_ok());
    cancel.cancel();
    assert!(matches!(
      projection.next(),
      Some(Err(ProjectionError::Cancelled {
        completed_periods: 1
      }))
    ));
    assert!(projection.next().is_none());
  }

  #[test]
  fn dropped_guard_cancels_the_projection() {
    let cancel = CancelToken::new();
    let mut projection = Projection::new(
      evaluator(),
      source(),
      base(),
      3,
      EngineSettings::default(),
    )
    .unwrap()
    .with_cancel(cancel.clone());

    let guard = cancel.cancel_on_drop();
    assert!(projection.next().unwrap().is_ok());
    assert!(!cancel.is_cancelled());
    drop(guard);
    assert!(cancel.is_cancelled());
    assert!(matches!(
      projection.next(),
      Some(Err(ProjectionError::Cancelled {
        completed_periods: 1
      }))
    ));
  }

  #[test]
  fn missing_ruleset_stops_the_projection() {
    let early = CalculationState::builder("case-1", date(2023, 9, 1), Currency::aud())
      .person("alex")
      .position("alex", PositionKind::SuperAccumulation, dec!(1000))
      .build()
      .unwrap();
    let mut projection =
      Projection::new(evaluator(), source(), early, 2, EngineSettings::default())
        .unwrap();
    match projection.next() {
      Some(Err(ProjectionError::Resolve {
        period_index: 0,
        source: ResolveError::NoRulesetForDate {
          earliest_available, ..
        },
      })) => assert_eq!(earliest_available, Some(date(2024, 7, 1))),
      other => panic!("unexpected {other:?}"),
    }
    assert!(projection.next().is_none());
  }
}

//! Post-run structural checks.
//!
//! Checks compare facts against each other and against the cashflow ledger
//! in the state they were computed from. Differences above the tolerance are
//! reported as [`ReconciliationFailure`]s; nothing is corrected. A run with
//! failures is still stored but is not presented as clean.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
  CalcId, EntityId,
  eval::EvaluationRun,
  fact::Fact,
  projection::PeriodSnapshot,
  rule::ParamValue,
  state::{CalculationState, CashflowKind, Direction},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
  /// `total` equals the sum of `component` facts: per entity for an
  /// entity-level total, across all entities for a household total.
  Total { total: CalcId, component: CalcId },
  /// `net` equals ledger inflows less ledger outflows less the `less`
  /// facts, per entity.
  Conservation { net: CalcId, less: Vec<CalcId> },
  /// `total` equals the ledger sum of `kinds`, and `remaining` equals the
  /// governing `cap` parameter less that sum, floored at zero.
  CapRollForward {
    remaining: CalcId,
    total:     CalcId,
    kinds:     Vec<CashflowKind>,
  },
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CheckKind {
  Total,
  Conservation,
  CapRollForward,
}

impl Check {
  pub fn kind(&self) -> CheckKind {
    match self {
      Self::Total { .. } => CheckKind::Total,
      Self::Conservation { .. } => CheckKind::Conservation,
      Self::CapRollForward { .. } => CheckKind::CapRollForward,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationFailure {
  pub period_index: u32,
  pub check:        CheckKind,
  /// The fact whose value disagrees.
  pub calculation:  CalcId,
  pub entity_id:    Option<EntityId>,
  pub expected:     Decimal,
  pub actual:       Decimal,
  pub delta:        Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
  pub failures: Vec<ReconciliationFailure>,
}

impl ReconciliationReport {
  pub fn is_clean(&self) -> bool { self.failures.is_empty() }
}

// ─── Reconciler ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciler {
  tolerance: Decimal,
  checks:    Vec<Check>,
}

impl Reconciler {
  pub fn new(tolerance: Decimal, checks: Vec<Check>) -> Self {
    Self { tolerance, checks }
  }

  pub fn tolerance(&self) -> Decimal { self.tolerance }

  pub fn checks(&self) -> &[Check] { &self.checks }

  pub fn reconcile_run(
    &self,
    state: &CalculationState,
    run: &EvaluationRun,
  ) -> ReconciliationReport {
    ReconciliationReport {
      failures: self.check_period(state, &run.facts),
    }
  }

  pub fn reconcile(&self, periods: &[PeriodSnapshot]) -> ReconciliationReport {
    ReconciliationReport {
      failures: periods
        .iter()
        .flat_map(|p| self.check_period(&p.state, &p.facts))
        .collect(),
    }
  }

  /// Run every check against one period's facts. Checks whose facts are
  /// absent (the node failed) are skipped.
  pub fn check_period(
    &self,
    state: &CalculationState,
    facts: &[Fact],
  ) -> Vec<ReconciliationFailure> {
    let mut period = PeriodCheck {
      reconciler: self,
      state,
      facts,
      failures: Vec::new(),
    };
    for check in &self.checks {
      period.run(check);
    }
    period.failures
  }
}

struct PeriodCheck<'a> {
  reconciler: &'a Reconciler,
  state:      &'a CalculationState,
  facts:      &'a [Fact],
  failures:   Vec<ReconciliationFailure>,
}

impl<'a> PeriodCheck<'a> {
  fn facts_of(
    &self,
    calculation: &'a CalcId,
  ) -> impl Iterator<Item = &'a Fact> + use<'a> {
    let facts = self.facts;
    facts.iter().filter(move |f| &f.calculation == calculation)
  }

  fn fact(&self, calculation: &CalcId, entity_id: &EntityId) -> Option<&'a Fact> {
    self.facts.iter().find(|f| {
      &f.calculation == calculation && f.entity_id.as_ref() == Some(entity_id)
    })
  }

  fn compare(&mut self, check: CheckKind, fact: &Fact, expected: Decimal) {
    let actual = fact.value.amount;
    let delta = actual - expected;
    if delta.abs() > self.reconciler.tolerance {
      tracing::warn!(
        %check,
        calculation = %fact.calculation,
        entity = ?fact.entity_id,
        %expected,
        %actual,
        "reconciliation failure"
      );
      self.failures.push(ReconciliationFailure {
        period_index: fact.period_index,
        check,
        calculation: fact.calculation.clone(),
        entity_id: fact.entity_id.clone(),
        expected,
        actual,
        delta,
      });
    }
  }

  /// Ledger inflows less outflows for an entity.
  fn net_ledger(&self, entity_id: &EntityId) -> Decimal {
    self
      .state
      .cashflows_of(entity_id)
      .map(|c| match c.kind.direction() {
        Direction::Inflow => c.amount.amount,
        Direction::Outflow => -c.amount.amount,
        Direction::Memo => Decimal::ZERO,
      })
      .sum()
  }

  /// Gross ledger total of `kinds` for an entity.
  fn gross_ledger(&self, entity_id: &EntityId, kinds: &[CashflowKind]) -> Decimal {
    self
      .state
      .cashflows_of(entity_id)
      .filter(|c| kinds.contains(&c.kind))
      .map(|c| c.amount.amount)
      .sum()
  }

  fn run(&mut self, check: &'a Check) {
    let kind = check.kind();
    match check {
      Check::Total { total, component } => {
        for fact in self.facts_of(total).collect::<Vec<_>>() {
          let expected: Decimal = match &fact.entity_id {
            Some(entity_id) => match self.fact(component, entity_id) {
              Some(f) => f.value.amount,
              None => continue,
            },
            None => self
              .facts_of(component)
              .filter(|f| f.entity_id.is_some())
              .map(|f| f.value.amount)
              .sum(),
          };
          self.compare(kind, fact, expected);
        }
      }

      Check::Conservation { net, less } => {
        for fact in self.facts_of(net).collect::<Vec<_>>() {
          let Some(entity_id) = &fact.entity_id else {
            continue;
          };
          let mut expected = self.net_ledger(entity_id);
          let mut complete = true;
          for calculation in less {
            match self.fact(calculation, entity_id) {
              Some(f) => expected -= f.value.amount,
              None => complete = false,
            }
          }
          if complete {
            self.compare(kind, fact, expected);
          }
        }
      }

      Check::CapRollForward {
        remaining,
        total,
        kinds,
      } => {
        for fact in self.facts_of(remaining).collect::<Vec<_>>() {
          let Some(entity_id) = &fact.entity_id else {
            continue;
          };
          let contributed = self.gross_ledger(entity_id, kinds);
          if let Some(total_fact) = self.fact(total, entity_id) {
            self.compare(kind, total_fact, contributed);
          }
          let Some(ParamValue::Quantity(cap)) = fact.parameter("cap") else {
            continue;
          };
          let unrounded = (cap.amount - contributed).max(Decimal::ZERO);
          // Replay the roundings the fact declares.
          let expected = fact.rounding.iter().try_fold(unrounded, |value, step| {
            step.policy.apply(value)
          });
          if let Ok(expected) = expected {
            self.compare(kind, fact, expected);
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use rust_decimal_macros::dec;

  use super::*;
  use crate::{
    fact::{FactKey, ProvenanceBuilder, RoundingStep},
    fixtures::{date, rule},
    rule::PrecedenceTier,
    value::{Currency, Quantity, RoundingMode, RoundingPolicy},
  };

  fn state() -> CalculationState {
    CalculationState::builder("case-1", date(2024, 9, 1), Currency::aud())
      .person("alex")
      .person("blair")
      .cashflow("alex", CashflowKind::Salary, dec!(90000))
      .cashflow("alex", CashflowKind::Expense, dec!(20000))
      .cashflow("alex", CashflowKind::EmployerContribution, dec!(10350))
      .cashflow("alex", CashflowKind::SalarySacrifice, dec!(5000.50))
      .build()
      .unwrap()
  }

  fn fact(
    calculation: &str,
    entity: Option<&str>,
    amount: Decimal,
    params: &[(&str, Decimal)],
    rounding: Vec<RoundingStep>,
  ) -> Fact {
    let mut r = rule("r", calculation, PrecedenceTier::Act, date(2024, 7, 1));
    r.parameters = params
      .iter()
      .map(|(k, v)| {
        (
          (*k).to_owned(),
          ParamValue::Quantity(Quantity::money(*v, Currency::aud())),
        )
      })
      .collect::<BTreeMap<_, _>>();
    let mut builder = ProvenanceBuilder::new();
    builder.rule("governing-rule", &r).unwrap();
    for (name, value) in &r.parameters {
      builder.parameter(name.as_str(), &r, name, value);
    }
    builder
      .build(
        FactKey {
          scenario_id:  "case-1".into(),
          ruleset_id:   "r1".into(),
          as_of:        date(2024, 9, 1),
          period_index: 0,
          calculation:  calculation.into(),
          entity_id:    entity.map(Into::into),
          inputs_hash:  "h".into(),
        },
        Quantity::money(amount, Currency::aud()),
        rounding,
      )
      .unwrap()
  }

  fn reconciler() -> Reconciler {
    Reconciler::new(dec!(0.01), vec![
      Check::Total {
        total:     "hh.tax".into(),
        component: "pit.tax".into(),
      },
      Check::Conservation {
        net:  "cash.net".into(),
        less: vec!["pit.tax".into()],
      },
      Check::CapRollForward {
        remaining: "sup.cap".into(),
        total:     "sup.total".into(),
        kinds:     vec![
          CashflowKind::EmployerContribution,
          CashflowKind::SalarySacrifice,
        ],
      },
    ])
  }

  fn whole_dollars() -> Vec<RoundingStep> {
    vec![RoundingStep {
      field:  "remaining".into(),
      before: dec!(14649.50),
      after:  dec!(14649),
      policy: RoundingPolicy::whole_units().with_mode(RoundingMode::Down),
    }]
  }

  #[test]
  fn consistent_facts_are_clean() {
    let facts = vec![
      fact("pit.tax", Some("alex"), dec!(20788.00), &[], vec![]),
      fact("pit.tax", Some("blair"), dec!(0.00), &[], vec![]),
      fact("hh.tax", None, dec!(20788.00), &[], vec![]),
      // 90000 - 20000 - 5000.50 - 20788
      fact("cash.net", Some("alex"), dec!(44211.50), &[], vec![]),
      fact("sup.total", Some("alex"), dec!(15350.50), &[], vec![]),
      fact(
        "sup.cap",
        Some("alex"),
        dec!(14649),
        &[("cap", dec!(30000))],
        whole_dollars(),
      ),
    ];
    let report = ReconciliationReport {
      failures: reconciler().check_period(&state(), &facts),
    };
    assert!(report.is_clean(), "{report:?}");
  }

  #[test]
  fn drift_beyond_tolerance_is_reported_with_delta() {
    let facts = vec![
      fact("pit.tax", Some("alex"), dec!(20788.00), &[], vec![]),
      fact("hh.tax", None, dec!(20788.02), &[], vec![]),
      fact("cash.net", Some("alex"), dec!(44211.51), &[], vec![]),
    ];
    let failures = reconciler().check_period(&state(), &facts);
    assert_eq!(failures.len(), 1);
    let failure = &failures[0];
    assert_eq!(failure.check, CheckKind::Total);
    assert_eq!(failure.calculation.as_str(), "hh.tax");
    assert_eq!(failure.delta, dec!(0.02));
    assert_eq!(failure.expected, dec!(20788.00));
  }

  #[test]
  fn cap_tracker_must_match_the_ledger() {
    let facts = vec![
      fact("sup.total", Some("alex"), dec!(15000), &[], vec![]),
      fact("sup.cap", Some("alex"), dec!(15000), &[("cap", dec!(30000))], vec![]),
    ];
    let failures = reconciler().check_period(&state(), &facts);
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.check == CheckKind::CapRollForward));
    assert_eq!(failures[0].delta, dec!(-350.50));
  }
}

//! The scenario inputs one evaluation runs against.
//!
//! A [`CalculationState`] is immutable once built: entities, positions and
//! cashflows are validated and kept in canonical order, so its
//! [`inputs_hash`](CalculationState::inputs_hash) is stable. Advancing to the
//! next projection period produces a new state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
  EntityId, Error, Result, ScenarioId,
  digest::canonical_digest,
  value::{Currency, Money, Quantity, Rate, RoundingPolicy, Unit},
};

// ─── Kinds ───────────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityKind {
  Person,
  Trust,
  Company,
  Partnership,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Default,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Residency {
  #[default]
  Resident,
  NonResident,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PositionKind {
  Cash,
  SuperAccumulation,
  SuperPension,
  Investment,
  Property,
  Loan,
}

/// Whether a cashflow moves cash in, out, or is a tax-only memo item.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Direction {
  Inflow,
  Outflow,
  Memo,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CashflowKind {
  Salary,
  Bonus,
  Interest,
  Dividend,
  Rental,
  EmployerContribution,
  SalarySacrifice,
  PersonalDeductibleContribution,
  NonConcessionalContribution,
  Deduction,
  Expense,
  TaxWithheld,
}

impl CashflowKind {
  pub fn direction(self) -> Direction {
    use CashflowKind::*;
    match self {
      Salary | Bonus | Interest | Dividend | Rental => Direction::Inflow,
      SalarySacrifice
      | PersonalDeductibleContribution
      | NonConcessionalContribution
      | Expense
      | TaxWithheld => Direction::Outflow,
      EmployerContribution | Deduction => Direction::Memo,
    }
  }

  /// Kinds indexed by wage growth when a period advances.
  pub fn is_wage(self) -> bool {
    matches!(self, Self::Salary | Self::Bonus)
  }
}

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
  pub entity_id:     EntityId,
  pub kind:          EntityKind,
  #[serde(default)]
  pub residency:     Residency,
  #[serde(default)]
  pub date_of_birth: Option<NaiveDate>,
}

/// A balance held by an entity at the start of the period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
  pub position_id: String,
  pub owner:       EntityId,
  pub kind:        PositionKind,
  pub balance:     Money,
}

/// An annualised flow for the period. Amounts are non-negative; the kind's
/// [`Direction`] carries the sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cashflow {
  pub cashflow_id: String,
  pub entity_id:   EntityId,
  pub kind:        CashflowKind,
  pub amount:      Money,
}

/// A position balance handed from one period to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarriedBalance {
  pub entity_id: EntityId,
  pub kind:      PositionKind,
  pub balance:   Money,
}

// ─── State ───────────────────────────────────────────────────────────────────

/// Raw scenario inputs as they arrive over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateInput {
  pub scenario_id:  ScenarioId,
  #[serde(default)]
  pub tenant:       Option<String>,
  pub as_of:        NaiveDate,
  #[serde(default)]
  pub period_index: u32,
  pub currency:     Currency,
  #[serde(default)]
  pub entities:     Vec<Entity>,
  #[serde(default)]
  pub positions:    Vec<Position>,
  #[serde(default)]
  pub cashflows:    Vec<Cashflow>,
  /// Scenario-supplied assumption values; these beat ruleset assumptions.
  #[serde(default)]
  pub assumptions:  BTreeMap<String, Quantity>,
}

/// Validated, canonically ordered scenario inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StateInput")]
pub struct CalculationState {
  scenario_id:  ScenarioId,
  tenant:       Option<String>,
  as_of:        NaiveDate,
  period_index: u32,
  currency:     Currency,
  entities:     Vec<Entity>,
  positions:    Vec<Position>,
  cashflows:    Vec<Cashflow>,
  assumptions:  BTreeMap<String, Quantity>,
}

fn ensure_unique<'a>(
  what: &str,
  ids: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
  let mut seen = BTreeSet::new();
  for id in ids {
    if !seen.insert(id) {
      return Err(Error::InvalidState(format!("duplicate {what} id {id:?}")));
    }
  }
  Ok(())
}

impl TryFrom<StateInput> for CalculationState {
  type Error = Error;

  fn try_from(input: StateInput) -> Result<Self> {
    let StateInput {
      scenario_id,
      tenant,
      as_of,
      period_index,
      currency,
      mut entities,
      mut positions,
      mut cashflows,
      assumptions,
    } = input;

    ensure_unique("entity", entities.iter().map(|e| e.entity_id.as_str()))?;
    ensure_unique("position", positions.iter().map(|p| p.position_id.as_str()))?;
    ensure_unique("cashflow", cashflows.iter().map(|c| c.cashflow_id.as_str()))?;

    let known: BTreeSet<&EntityId> = entities.iter().map(|e| &e.entity_id).collect();
    let check_money = |owner: &EntityId, money: &Money, what: &str| -> Result<()> {
      if !known.contains(owner) {
        return Err(Error::InvalidState(format!(
          "{what} refers to unknown entity {owner}"
        )));
      }
      if money.currency != currency {
        return Err(Error::UnitMismatch {
          left:  Unit::Currency(currency.clone()),
          right: Unit::Currency(money.currency.clone()),
        });
      }
      Ok(())
    };
    for position in &positions {
      check_money(&position.owner, &position.balance, "position")?;
    }
    for cashflow in &cashflows {
      check_money(&cashflow.entity_id, &cashflow.amount, "cashflow")?;
      if cashflow.amount.is_negative() {
        return Err(Error::InvalidState(format!(
          "cashflow {} is negative; direction is implied by its kind",
          cashflow.cashflow_id
        )));
      }
    }

    entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    positions.sort_by(|a, b| a.position_id.cmp(&b.position_id));
    cashflows.sort_by(|a, b| a.cashflow_id.cmp(&b.cashflow_id));

    Ok(Self {
      scenario_id,
      tenant,
      as_of,
      period_index,
      currency,
      entities,
      positions,
      cashflows,
      assumptions,
    })
  }
}

impl CalculationState {
  pub fn builder(
    scenario_id: impl Into<ScenarioId>,
    as_of: NaiveDate,
    currency: Currency,
  ) -> StateBuilder {
    StateBuilder {
      input: StateInput {
        scenario_id: scenario_id.into(),
        tenant: None,
        as_of,
        period_index: 0,
        currency,
        entities: Vec::new(),
        positions: Vec::new(),
        cashflows: Vec::new(),
        assumptions: BTreeMap::new(),
      },
    }
  }

  pub fn scenario_id(&self) -> &ScenarioId { &self.scenario_id }

  pub fn tenant(&self) -> Option<&str> { self.tenant.as_deref() }

  pub fn as_of(&self) -> NaiveDate { self.as_of }

  pub fn period_index(&self) -> u32 { self.period_index }

  pub fn currency(&self) -> &Currency { &self.currency }

  pub fn entities(&self) -> &[Entity] { &self.entities }

  pub fn entity(&self, entity_id: &EntityId) -> Option<&Entity> {
    self.entities.iter().find(|e| &e.entity_id == entity_id)
  }

  pub fn positions(&self) -> &[Position] { &self.positions }

  pub fn cashflows(&self) -> &[Cashflow] { &self.cashflows }

  pub fn assumptions(&self) -> &BTreeMap<String, Quantity> { &self.assumptions }

  pub fn cashflows_of<'a>(
    &'a self,
    entity_id: &'a EntityId,
  ) -> impl Iterator<Item = &'a Cashflow> {
    self.cashflows.iter().filter(move |c| &c.entity_id == entity_id)
  }

  pub fn positions_of<'a>(
    &'a self,
    entity_id: &'a EntityId,
  ) -> impl Iterator<Item = &'a Position> {
    self.positions.iter().filter(move |p| &p.owner == entity_id)
  }

  /// Total of `kind` cashflows for an entity; `None` if it has none.
  pub fn cashflow_total(
    &self,
    entity_id: &EntityId,
    kind: CashflowKind,
  ) -> Result<Option<Money>> {
    let flows: Vec<&Money> = self
      .cashflows_of(entity_id)
      .filter(|c| c.kind == kind)
      .map(|c| &c.amount)
      .collect();
    if flows.is_empty() {
      return Ok(None);
    }
    Money::sum(&self.currency, flows).map(Some)
  }

  /// Total balance of `kind` positions for an entity; `None` if it has none.
  pub fn position_balance(
    &self,
    entity_id: &EntityId,
    kind: PositionKind,
  ) -> Result<Option<Money>> {
    let balances: Vec<&Money> = self
      .positions_of(entity_id)
      .filter(|p| p.kind == kind)
      .map(|p| &p.balance)
      .collect();
    if balances.is_empty() {
      return Ok(None);
    }
    Money::sum(&self.currency, balances).map(Some)
  }

  /// Digest identifying these inputs; part of every fact's identity.
  pub fn inputs_hash(&self) -> Result<String> { canonical_digest(self) }

  /// The state for the following period.
  ///
  /// Carried balances replace the matching position (creating it when the
  /// entity had none), and wage cashflows grow by `wage_growth` rounded to
  /// cents when given.
  pub fn advance(
    &self,
    next_as_of: NaiveDate,
    carried: &[CarriedBalance],
    wage_growth: Option<Rate>,
  ) -> Result<Self> {
    let mut next = self.clone();
    next.as_of = next_as_of;
    next.period_index = self.period_index + 1;

    for carry in carried {
      match next
        .positions
        .iter_mut()
        .find(|p| p.owner == carry.entity_id && p.kind == carry.kind)
      {
        Some(position) => position.balance = carry.balance.clone(),
        None => next.positions.push(Position {
          position_id: format!("{}:{}", carry.entity_id, carry.kind),
          owner:       carry.entity_id.clone(),
          kind:        carry.kind,
          balance:     carry.balance.clone(),
        }),
      }
    }
    next.positions.sort_by(|a, b| a.position_id.cmp(&b.position_id));

    if let Some(growth) = wage_growth {
      for cashflow in next.cashflows.iter_mut().filter(|c| c.kind.is_wage()) {
        let increase = cashflow.amount.apply_rate(growth)?;
        cashflow.amount = cashflow
          .amount
          .checked_add(&increase)?
          .round(&RoundingPolicy::cents())?;
      }
    }
    Ok(next)
  }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Incremental construction of a [`CalculationState`]; validated on
/// [`build`](StateBuilder::build).
#[derive(Debug, Clone)]
pub struct StateBuilder {
  input: StateInput,
}

impl StateBuilder {
  pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
    self.input.tenant = Some(tenant.into());
    self
  }

  pub fn period_index(mut self, period_index: u32) -> Self {
    self.input.period_index = period_index;
    self
  }

  pub fn person(mut self, entity_id: impl Into<EntityId>) -> Self {
    self.input.entities.push(Entity {
      entity_id:     entity_id.into(),
      kind:          EntityKind::Person,
      residency:     Residency::Resident,
      date_of_birth: None,
    });
    self
  }

  pub fn entity(mut self, entity: Entity) -> Self {
    self.input.entities.push(entity);
    self
  }

  pub fn position(
    mut self,
    owner: impl Into<EntityId>,
    kind: PositionKind,
    balance: Decimal,
  ) -> Self {
    let owner = owner.into();
    self.input.positions.push(Position {
      position_id: format!("{owner}:{kind}"),
      owner,
      kind,
      balance: Money::new(balance, self.input.currency.clone()),
    });
    self
  }

  pub fn cashflow(
    mut self,
    entity_id: impl Into<EntityId>,
    kind: CashflowKind,
    amount: Decimal,
  ) -> Self {
    let entity_id = entity_id.into();
    let n = self
      .input
      .cashflows
      .iter()
      .filter(|c| c.entity_id == entity_id && c.kind == kind)
      .count();
    self.input.cashflows.push(Cashflow {
      cashflow_id: format!("{entity_id}:{kind}:{n}"),
      entity_id,
      kind,
      amount: Money::new(amount, self.input.currency.clone()),
    });
    self
  }

  pub fn assumption(mut self, key: impl Into<String>, value: Quantity) -> Self {
    self.input.assumptions.insert(key.into(), value);
    self
  }

  pub fn build(self) -> Result<CalculationState> {
    CalculationState::try_from(self.input)
  }
}

#[cfg(test)]
mod tests {
  use rust_decimal_macros::dec;

  use super::*;

  fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
  }

  fn base() -> StateBuilder {
    CalculationState::builder("case-1", date(2024, 7, 1), Currency::aud())
      .person("alex")
  }

  #[test]
  fn builder_orders_and_hashes_canonically() {
    let a = base()
      .person("blair")
      .cashflow("blair", CashflowKind::Salary, dec!(60000))
      .cashflow("alex", CashflowKind::Salary, dec!(75000))
      .build()
      .unwrap();
    let b = CalculationState::builder("case-1", date(2024, 7, 1), Currency::aud())
      .person("blair")
      .person("alex")
      .cashflow("alex", CashflowKind::Salary, dec!(75000))
      .cashflow("blair", CashflowKind::Salary, dec!(60000))
      .build()
      .unwrap();
    assert_eq!(a, b);
    assert_eq!(a.inputs_hash().unwrap(), b.inputs_hash().unwrap());
    assert_eq!(a.entities()[0].entity_id.as_str(), "alex");
  }

  #[test]
  fn unknown_owner_is_rejected() {
    let err = base()
      .cashflow("nobody", CashflowKind::Salary, dec!(1))
      .build()
      .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
  }

  #[test]
  fn negative_cashflow_is_rejected() {
    let err = base()
      .cashflow("alex", CashflowKind::Expense, dec!(-5))
      .build()
      .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
  }

  #[test]
  fn foreign_currency_is_a_unit_mismatch() {
    let mut input = StateInput {
      scenario_id:  "case-1".into(),
      tenant:       None,
      as_of:        date(2024, 7, 1),
      period_index: 0,
      currency:     Currency::aud(),
      entities:     base().build().unwrap().entities().to_vec(),
      positions:    vec![],
      cashflows:    vec![],
      assumptions:  BTreeMap::new(),
    };
    input.cashflows.push(Cashflow {
      cashflow_id: "c1".into(),
      entity_id:   "alex".into(),
      kind:        CashflowKind::Salary,
      amount:      Money::new(dec!(10), Currency::new("USD").unwrap()),
    });
    assert!(matches!(
      CalculationState::try_from(input),
      Err(Error::UnitMismatch { .. })
    ));
  }

  #[test]
  fn totals_sum_matching_flows() {
    let state = base()
      .cashflow("alex", CashflowKind::Salary, dec!(50000))
      .cashflow("alex", CashflowKind::Salary, dec!(25000))
      .build()
      .unwrap();
    let alex = EntityId::from("alex");
    assert_eq!(
      state.cashflow_total(&alex, CashflowKind::Salary).unwrap().unwrap().amount,
      dec!(75000)
    );
    assert!(state.cashflow_total(&alex, CashflowKind::Bonus).unwrap().is_none());
  }

  #[test]
  fn advance_carries_balances_and_grows_wages() {
    let state = base()
      .cashflow("alex", CashflowKind::Salary, dec!(100000))
      .cashflow("alex", CashflowKind::Interest, dec!(1000))
      .position("alex", PositionKind::SuperAccumulation, dec!(50000))
      .build()
      .unwrap();
    let carried = [CarriedBalance {
      entity_id: "alex".into(),
      kind:      PositionKind::SuperAccumulation,
      balance:   Money::new(dec!(61234.56), Currency::aud()),
    }];
    let growth = Rate::from_percent(dec!(3)).unwrap();
    let next = state.advance(date(2025, 7, 1), &carried, Some(growth)).unwrap();
    let alex = EntityId::from("alex");
    assert_eq!(next.period_index(), 1);
    assert_eq!(next.as_of(), date(2025, 7, 1));
    assert_eq!(
      next
        .position_balance(&alex, PositionKind::SuperAccumulation)
        .unwrap()
        .unwrap()
        .amount,
      dec!(61234.56)
    );
    assert_eq!(
      next.cashflow_total(&alex, CashflowKind::Salary).unwrap().unwrap().amount,
      dec!(103000)
    );
    assert_eq!(
      next.cashflow_total(&alex, CashflowKind::Interest).unwrap().unwrap().amount,
      dec!(1000)
    );
    assert_ne!(state.inputs_hash().unwrap(), next.inputs_hash().unwrap());
  }

  #[test]
  fn deserialization_validates() {
    let json = serde_json::json!({
      "scenario_id": "case-1",
      "as_of": "2024-07-01",
      "currency": "AUD",
      "entities": [{"entity_id": "alex", "kind": "person"}],
      "cashflows": [{
        "cashflow_id": "c1",
        "entity_id": "ghost",
        "kind": "salary",
        "amount": {"amount": "1", "currency": "AUD"}
      }]
    });
    assert!(serde_json::from_value::<CalculationState>(json).is_err());
  }
}

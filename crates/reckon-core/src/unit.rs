//! Calculation units and the context they evaluate in.
//!
//! A [`CalculationUnit`] is a pure function from a [`UnitContext`] to a
//! [`Quantity`]. Everything a unit reads (inputs, rule parameters,
//! assumptions, upstream facts) goes through the context, which records a
//! provenance link for each read. Units never see the clock or any I/O.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
  CalcId, EntityId, Error, EvalError, Result,
  fact::{Fact, InputSource, ProvenanceBuilder, RoundingStep},
  resolve::{ResolvedRuleset, ScopeContext},
  rule::{Bracket, ParamValue, Rule},
  state::{CalculationState, CashflowKind, Entity, PositionKind},
  trace::{Severity, TraceEntry},
  value::{Checkpoint, Currency, Money, Quantity, Rate, RoundingPolicy},
};

// ─── Nodes ───────────────────────────────────────────────────────────────────

/// One `(calculation, entity)` instance in the evaluation graph.
/// Household-level nodes have no entity.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Node {
  pub calculation: CalcId,
  pub entity_id:   Option<EntityId>,
}

impl Node {
  pub fn entity(calculation: &CalcId, entity_id: &EntityId) -> Self {
    Self {
      calculation: calculation.clone(),
      entity_id:   Some(entity_id.clone()),
    }
  }

  pub fn household(calculation: &CalcId) -> Self {
    Self {
      calculation: calculation.clone(),
      entity_id:   None,
    }
  }
}

/// Facts produced so far in a run, keyed by node.
pub type FactTable = BTreeMap<Node, Fact>;

// ─── Units ───────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Scope {
  /// One node per applicable entity.
  Entity,
  /// One node for the whole scenario.
  Household,
}

/// The dimension a unit's output must have.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutputKind {
  Currency,
  Percentage,
  Count,
}

pub trait CalculationUnit: Send + Sync {
  fn id(&self) -> CalcId;

  fn scope(&self) -> Scope { Scope::Entity }

  fn depends_on(&self) -> Vec<CalcId> { Vec::new() }

  fn output(&self) -> OutputKind { OutputKind::Currency }

  /// Position kind the output becomes in the next projection period.
  fn carry_forward(&self) -> Option<PositionKind> { None }

  /// Whether a node exists for `entity` (or for the household when `None`).
  fn applies_to(
    &self,
    _state: &CalculationState,
    _entity: Option<&Entity>,
  ) -> bool {
    true
  }

  fn evaluate(&self, ctx: &mut UnitContext<'_>) -> Result<Quantity, EvalError>;
}

/// Calculation units by id.
#[derive(Clone, Default)]
pub struct Registry {
  units: BTreeMap<CalcId, Arc<dyn CalculationUnit>>,
}

impl std::fmt::Debug for Registry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_set().entries(self.units.keys()).finish()
  }
}

impl Registry {
  pub fn new() -> Self { Self::default() }

  pub fn register(&mut self, unit: impl CalculationUnit + 'static) -> Result<()> {
    let id = unit.id();
    if self.units.contains_key(&id) {
      return Err(Error::DuplicateCalculation(id));
    }
    self.units.insert(id, Arc::new(unit));
    Ok(())
  }

  pub fn get(
    &self,
    calculation: &CalcId,
  ) -> Result<&Arc<dyn CalculationUnit>, EvalError> {
    self
      .units
      .get(calculation)
      .ok_or_else(|| EvalError::UnknownCalculation {
        calculation: calculation.clone(),
        available:   self.units.keys().cloned().collect(),
      })
  }

  pub fn ids(&self) -> impl Iterator<Item = &CalcId> { self.units.keys() }

  pub fn len(&self) -> usize { self.units.len() }

  pub fn is_empty(&self) -> bool { self.units.is_empty() }
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// Read access to one node's inputs, with provenance recorded on every read.
pub struct UnitContext<'a> {
  node:       &'a Node,
  state:      &'a CalculationState,
  resolved:   &'a ResolvedRuleset,
  rule:       &'a Rule,
  facts:      &'a FactTable,
  provenance: ProvenanceBuilder,
  rounding:   Vec<RoundingStep>,
  trace:      Vec<TraceEntry>,
}

impl<'a> UnitContext<'a> {
  pub(crate) fn new(
    node: &'a Node,
    state: &'a CalculationState,
    resolved: &'a ResolvedRuleset,
    rule: &'a Rule,
    facts: &'a FactTable,
  ) -> Self {
    Self {
      node,
      state,
      resolved,
      rule,
      facts,
      provenance: ProvenanceBuilder::new(),
      rounding: Vec::new(),
      trace: Vec::new(),
    }
  }

  pub(crate) fn provenance_mut(&mut self) -> &mut ProvenanceBuilder {
    &mut self.provenance
  }

  pub(crate) fn finish(
    self,
  ) -> (ProvenanceBuilder, Vec<RoundingStep>, Vec<TraceEntry>) {
    (self.provenance, self.rounding, self.trace)
  }

  pub fn calculation(&self) -> &CalcId { &self.node.calculation }

  pub fn state(&self) -> &CalculationState { self.state }

  pub fn rule(&self) -> &'a Rule { self.rule }

  pub fn currency(&self) -> &Currency { self.state.currency() }

  pub fn zero(&self) -> Money { Money::zero(self.state.currency()) }

  /// The entity this node evaluates for.
  pub fn entity_id(&self) -> Result<&'a EntityId, EvalError> {
    self
      .node
      .entity_id
      .as_ref()
      .ok_or_else(|| EvalError::ConstraintViolation {
        message: format!(
          "{} is household-level and has no entity",
          self.node.calculation
        ),
      })
  }

  // ── Inputs ────────────────────────────────────────────────────────────

  fn record_input(&mut self, field: String, value: &Money, source: InputSource) {
    self
      .provenance
      .input(field.clone(), field, value.clone().into(), source);
  }

  /// Total of `kind` cashflows for this entity, zero if there are none.
  pub fn cashflow(&mut self, kind: CashflowKind) -> Result<Money, EvalError> {
    let entity_id = self.entity_id()?;
    let (value, source) = match self.state.cashflow_total(entity_id, kind)? {
      Some(total) => (total, InputSource::Supplied),
      None => (self.zero(), InputSource::Default),
    };
    self.record_input(kind.to_string(), &value, source);
    Ok(value)
  }

  /// Total of `kind` cashflows for this entity; missing is an error.
  pub fn required_cashflow(
    &mut self,
    kind: CashflowKind,
  ) -> Result<Money, EvalError> {
    let entity_id = self.entity_id()?;
    let value = self.state.cashflow_total(entity_id, kind)?.ok_or_else(|| {
      EvalError::MissingRequiredInput {
        field: format!("{entity_id}.{kind}"),
      }
    })?;
    self.record_input(kind.to_string(), &value, InputSource::Supplied);
    Ok(value)
  }

  /// Opening balance of `kind` positions; missing is an error.
  pub fn required_position(
    &mut self,
    kind: PositionKind,
  ) -> Result<Money, EvalError> {
    let entity_id = self.entity_id()?;
    let value = self.state.position_balance(entity_id, kind)?.ok_or_else(|| {
      EvalError::MissingRequiredInput {
        field: format!("{entity_id}.{kind}"),
      }
    })?;
    self.record_input(kind.to_string(), &value, InputSource::Supplied);
    Ok(value)
  }

  /// Every cashflow of this entity, each recorded as an input.
  pub fn all_cashflows(
    &mut self,
  ) -> Result<Vec<(CashflowKind, Money)>, EvalError> {
    let entity_id = self.entity_id()?;
    let flows: Vec<(CashflowKind, Money)> = self
      .state
      .cashflows_of(entity_id)
      .map(|c| (c.kind, c.amount.clone()))
      .collect();
    for (kind, amount) in &flows {
      self.record_input(kind.to_string(), amount, InputSource::Supplied);
    }
    Ok(flows)
  }

  // ── Parameters ────────────────────────────────────────────────────────

  pub fn has_param(&self, name: &str) -> bool {
    self.rule.parameter(name).is_some()
  }

  /// A parameter of the governing rule.
  pub fn param(&mut self, name: &str) -> Result<&'a ParamValue, EvalError> {
    let rule = self.rule;
    let value =
      rule
        .parameter(name)
        .ok_or_else(|| EvalError::MissingParameter {
          rule_id:   rule.rule_id.clone(),
          parameter: name.to_owned(),
        })?;
    self.provenance.parameter(name, rule, name, value);
    Ok(value)
  }

  fn quantity_param(&mut self, name: &str) -> Result<&'a Quantity, EvalError> {
    match self.param(name)? {
      ParamValue::Quantity(q) => Ok(q),
      other => Err(EvalError::UnitMismatch {
        expected: "quantity".to_owned(),
        found:    format!("{other:?}"),
      }),
    }
  }

  pub fn rate(&mut self, name: &str) -> Result<Rate, EvalError> {
    Ok(self.quantity_param(name)?.to_rate()?)
  }

  /// A monetary parameter, which must be in the scenario's currency.
  pub fn money(&mut self, name: &str) -> Result<Money, EvalError> {
    let money = self.quantity_param(name)?.to_money()?;
    if &money.currency != self.currency() {
      return Err(EvalError::UnitMismatch {
        expected: self.currency().to_string(),
        found:    money.currency.to_string(),
      });
    }
    Ok(money)
  }

  pub fn schedule(&mut self, name: &str) -> Result<&'a [Bracket], EvalError> {
    match self.param(name)? {
      ParamValue::Schedule(brackets) => Ok(brackets),
      other => Err(EvalError::UnitMismatch {
        expected: "schedule".to_owned(),
        found:    format!("{other:?}"),
      }),
    }
  }

  // ── Assumptions ───────────────────────────────────────────────────────

  /// A rate assumption. Scenario-supplied values win over ruleset
  /// assumptions; `default` applies when neither exists.
  pub fn assumption_rate(
    &mut self,
    key: &str,
    default: Option<Rate>,
  ) -> Result<Rate, EvalError> {
    if let Some(value) = self.state.assumptions().get(key) {
      let rate = value.to_rate()?;
      self
        .provenance
        .input(key, key, value.clone(), InputSource::Supplied);
      return Ok(rate);
    }
    let scope = ScopeContext {
      tenant:   self.state.tenant(),
      scenario: self.state.scenario_id(),
    };
    if let Some(assumption) = self.resolved.assumption(key, scope) {
      let rate = assumption.value.to_rate()?;
      self.provenance.assumption(key, assumption);
      return Ok(rate);
    }
    match default {
      Some(rate) => {
        self.provenance.input(
          key,
          key,
          Quantity::percent(rate.as_percent()),
          InputSource::Default,
        );
        self.decision(key, format!("no {key} assumption; defaulted to {rate}"));
        Ok(rate)
      }
      None => Err(EvalError::MissingRequiredInput {
        field: key.to_owned(),
      }),
    }
  }

  // ── Upstream facts ────────────────────────────────────────────────────

  fn lookup(&self, calculation: &CalcId) -> Option<&'a Fact> {
    let facts = self.facts;
    self
      .node
      .entity_id
      .as_ref()
      .and_then(|e| facts.get(&Node::entity(calculation, e)))
      .or_else(|| facts.get(&Node::household(calculation)))
  }

  /// The monetary fact `calculation` produced for this node's entity.
  pub fn dependency(&mut self, calculation: &str) -> Result<Money, EvalError> {
    let calculation = CalcId::from(calculation);
    let fact = self.lookup(&calculation).ok_or_else(|| {
      EvalError::DependencyFailed {
        dependency: calculation.clone(),
        entity_id:  self.node.entity_id.clone(),
      }
    })?;
    self.provenance.fact(calculation.as_str(), fact);
    Ok(fact.value.to_money()?)
  }

  /// Every entity-level monetary fact of `calculation`.
  pub fn dependency_all(
    &mut self,
    calculation: &str,
  ) -> Result<Vec<(EntityId, Money)>, EvalError> {
    let calculation = CalcId::from(calculation);
    let facts = self.facts;
    let mut out = Vec::new();
    for (node, fact) in facts {
      if node.calculation != calculation {
        continue;
      }
      let Some(entity_id) = &node.entity_id else {
        continue;
      };
      self.provenance.fact(calculation.as_str(), fact);
      out.push((entity_id.clone(), fact.value.to_money()?));
    }
    Ok(out)
  }

  // ── Rounding ──────────────────────────────────────────────────────────

  fn record_rounding(
    &mut self,
    field: &str,
    before: &Money,
    after: &Money,
    policy: RoundingPolicy,
  ) {
    self.rounding.push(RoundingStep {
      field: field.to_owned(),
      before: before.amount,
      after: after.amount,
      policy,
    });
  }

  /// Sum components, rounding each first when the rule's final policy uses a
  /// per-component checkpoint.
  pub fn sum(&mut self, field: &str, parts: &[Money]) -> Result<Money, EvalError> {
    let policy = self.rule.rounding.unwrap_or_default();
    let mut total = self.zero();
    for (i, part) in parts.iter().enumerate() {
      let part = match policy.checkpoint {
        Checkpoint::PerComponent => {
          let rounded = part.round(&policy)?;
          if rounded != *part {
            self.record_rounding(&format!("{field}[{i}]"), part, &rounded, policy);
          }
          rounded
        }
        Checkpoint::Final => part.clone(),
      };
      total = total.checked_add(&part)?;
    }
    Ok(total)
  }

  /// Apply the rule's intermediate rounding, if it declares one.
  pub fn round_intermediate(
    &mut self,
    field: &str,
    value: Money,
  ) -> Result<Money, EvalError> {
    let Some(policy) = self.rule.intermediate else {
      return Ok(value);
    };
    let rounded = value.round(&policy)?;
    self.record_rounding(field, &value, &rounded, policy);
    Ok(rounded)
  }

  // ── Trace ─────────────────────────────────────────────────────────────

  pub fn trace(&mut self, severity: Severity, field: &str, explanation: String) {
    let entry = TraceEntry::new(severity, explanation)
      .calculation(&self.node.calculation)
      .entity(self.node.entity_id.as_ref())
      .field(field);
    self.trace.push(entry);
  }

  pub fn note(&mut self, field: &str, explanation: impl Into<String>) {
    self.trace(Severity::Info, field, explanation.into());
  }

  pub fn decision(&mut self, field: &str, explanation: impl Into<String>) {
    self.trace(Severity::DecisionPoint, field, explanation.into());
  }

  pub fn warn(&mut self, field: &str, explanation: impl Into<String>) {
    self.trace(Severity::Warning, field, explanation.into());
  }

  /// Fail the node with a constraint violation unless `holds`.
  pub fn ensure(
    &self,
    holds: bool,
    message: impl FnOnce() -> String,
  ) -> Result<(), EvalError> {
    if holds {
      Ok(())
    } else {
      Err(EvalError::ConstraintViolation { message: message() })
    }
  }
}

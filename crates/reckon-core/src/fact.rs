//! Facts: the immutable, fully provenanced outputs of evaluation.
//!
//! A fact records one calculated value for one calculation, entity and date,
//! together with the rule, reference, assumption, parameter, input and
//! upstream-fact links that produced it. Its identity is derived from
//! `(scenario, ruleset, as_of, period, calculation, entity, inputs hash)`, so
//! re-evaluating identical inputs yields the identical fact. Facts carry no
//! wall-clock time; run records do.

use std::fmt::Write as _;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::{
  CalcId, EntityId, EvalError, FactId, Result, RulesetId, ScenarioId,
  digest::digest_parts,
  rule::{
    Assumption, AssumptionScope, EffectiveWindow, ParamValue, PrecedenceTier,
    Reference, Rule,
  },
  trace::{Severity, TraceEntry},
  value::{Quantity, RoundingPolicy},
};

// ─── Provenance ──────────────────────────────────────────────────────────────

/// Whether an input value came from the scenario or from a default.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InputSource {
  Supplied,
  Default,
}

/// What a provenance link points at. Targets are denormalised so a fact can
/// be explained without loading the records it cites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvenanceTarget {
  Rule {
    rule_id:      String,
    version:      u32,
    tier:         PrecedenceTier,
    content_hash: String,
  },
  Reference {
    reference_id: String,
    version:      u32,
    document:     String,
    pinpoint:     Option<String>,
    checksum:     String,
  },
  Assumption {
    assumption_id: String,
    version:       u32,
    value:         Quantity,
    scope:         AssumptionScope,
  },
  Parameter {
    rule_id:      String,
    rule_version: u32,
    name:         String,
    value:        ParamValue,
  },
  Input {
    field:  String,
    value:  Quantity,
    source: InputSource,
  },
  Fact {
    fact_id:     FactId,
    calculation: CalcId,
    entity_id:   Option<EntityId>,
    value:       Quantity,
  },
}

impl ProvenanceTarget {
  /// The serialised `kind` tag.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Rule { .. } => "rule",
      Self::Reference { .. } => "reference",
      Self::Assumption { .. } => "assumption",
      Self::Parameter { .. } => "parameter",
      Self::Input { .. } => "input",
      Self::Fact { .. } => "fact",
    }
  }

  /// Rules, assumptions and parameters are authorities; a fact needs at least
  /// one.
  pub fn is_authority(&self) -> bool {
    matches!(
      self,
      Self::Rule { .. } | Self::Assumption { .. } | Self::Parameter { .. }
    )
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceLink {
  /// What the target contributed, e.g. `governing-rule` or `taxable-income`.
  pub role:   String,
  pub target: ProvenanceTarget,
  /// Effective window of the target, where it has one.
  pub window: Option<EffectiveWindow>,
}

/// Collects provenance links while a calculation runs.
#[derive(Debug, Clone, Default)]
pub struct ProvenanceBuilder {
  links: Vec<ProvenanceLink>,
}

impl ProvenanceBuilder {
  pub fn new() -> Self { Self::default() }

  fn push(
    &mut self,
    role: impl Into<String>,
    target: ProvenanceTarget,
    window: Option<EffectiveWindow>,
  ) {
    let link = ProvenanceLink {
      role: role.into(),
      target,
      window,
    };
    if !self.links.contains(&link) {
      self.links.push(link);
    }
  }

  pub fn rule(&mut self, role: impl Into<String>, rule: &Rule) -> Result<()> {
    let target = ProvenanceTarget::Rule {
      rule_id:      rule.rule_id.clone(),
      version:      rule.version,
      tier:         rule.tier,
      content_hash: rule.content_hash()?,
    };
    self.push(role, target, Some(rule.window));
    Ok(())
  }

  pub fn reference(&mut self, role: impl Into<String>, reference: &Reference) {
    let target = ProvenanceTarget::Reference {
      reference_id: reference.reference_id.clone(),
      version:      reference.version,
      document:     reference.document.clone(),
      pinpoint:     reference.pinpoint.clone(),
      checksum:     reference.checksum.clone(),
    };
    self.push(role, target, None);
  }

  pub fn assumption(&mut self, role: impl Into<String>, assumption: &Assumption) {
    let target = ProvenanceTarget::Assumption {
      assumption_id: assumption.assumption_id.clone(),
      version:       assumption.version,
      value:         assumption.value.clone(),
      scope:         assumption.scope.clone(),
    };
    self.push(role, target, Some(assumption.window));
  }

  pub fn parameter(
    &mut self,
    role: impl Into<String>,
    rule: &Rule,
    name: &str,
    value: &ParamValue,
  ) {
    let target = ProvenanceTarget::Parameter {
      rule_id:      rule.rule_id.clone(),
      rule_version: rule.version,
      name:         name.to_owned(),
      value:        value.clone(),
    };
    self.push(role, target, Some(rule.window));
  }

  pub fn input(
    &mut self,
    role: impl Into<String>,
    field: impl Into<String>,
    value: Quantity,
    source: InputSource,
  ) {
    let target = ProvenanceTarget::Input {
      field: field.into(),
      value,
      source,
    };
    self.push(role, target, None);
  }

  pub fn fact(&mut self, role: impl Into<String>, fact: &Fact) {
    let target = ProvenanceTarget::Fact {
      fact_id:     fact.fact_id.clone(),
      calculation: fact.calculation.clone(),
      entity_id:   fact.entity_id.clone(),
      value:       fact.value.clone(),
    };
    self.push(role, target, None);
  }

  pub fn links(&self) -> &[ProvenanceLink] { &self.links }

  /// Seal the links into a fact. Fails if no rule, assumption or parameter
  /// was cited.
  pub fn build(
    self,
    key: FactKey,
    value: Quantity,
    rounding: Vec<RoundingStep>,
  ) -> Result<Fact, EvalError> {
    if !self.links.iter().any(|l| l.target.is_authority()) {
      return Err(EvalError::Unprovenanced);
    }
    Ok(Fact {
      fact_id: key.fact_id(),
      scenario_id: key.scenario_id,
      ruleset_id: key.ruleset_id,
      as_of: key.as_of,
      period_index: key.period_index,
      calculation: key.calculation,
      entity_id: key.entity_id,
      value,
      inputs_hash: key.inputs_hash,
      provenance: self.links,
      rounding,
    })
  }
}

// ─── Rounding ────────────────────────────────────────────────────────────────

/// One rounding operation applied while producing a fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundingStep {
  pub field:  String,
  pub before: Decimal,
  pub after:  Decimal,
  pub policy: RoundingPolicy,
}

// ─── Fact ────────────────────────────────────────────────────────────────────

/// Everything that determines a fact's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactKey {
  pub scenario_id:  ScenarioId,
  pub ruleset_id:   RulesetId,
  pub as_of:        NaiveDate,
  pub period_index: u32,
  pub calculation:  CalcId,
  pub entity_id:    Option<EntityId>,
  pub inputs_hash:  String,
}

impl FactKey {
  pub fn fact_id(&self) -> FactId {
    let as_of = self.as_of.to_string();
    let period = self.period_index.to_string();
    FactId::new(digest_parts([
      self.scenario_id.as_str(),
      self.ruleset_id.as_str(),
      as_of.as_str(),
      period.as_str(),
      self.calculation.as_str(),
      self.entity_id.as_ref().map_or("", EntityId::as_str),
      self.inputs_hash.as_str(),
    ]))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
  pub fact_id:      FactId,
  pub scenario_id:  ScenarioId,
  pub ruleset_id:   RulesetId,
  pub as_of:        NaiveDate,
  pub period_index: u32,
  pub calculation:  CalcId,
  /// `None` for household-level facts.
  pub entity_id:    Option<EntityId>,
  pub value:        Quantity,
  pub inputs_hash:  String,
  pub provenance:   Vec<ProvenanceLink>,
  #[serde(default)]
  pub rounding:     Vec<RoundingStep>,
}

impl Fact {
  /// The governing rule's id and version.
  pub fn governing_rule(&self) -> Option<(&str, u32)> {
    self.provenance.iter().find_map(|l| match &l.target {
      ProvenanceTarget::Rule {
        rule_id, version, ..
      } => Some((rule_id.as_str(), *version)),
      _ => None,
    })
  }

  /// A rule parameter this fact cited, by name.
  pub fn parameter(&self, name: &str) -> Option<&ParamValue> {
    self.provenance.iter().find_map(|l| match &l.target {
      ProvenanceTarget::Parameter {
        name: n, value, ..
      } if n == name => Some(value),
      _ => None,
    })
  }

  pub fn upstream(&self) -> impl Iterator<Item = &FactId> {
    self.provenance.iter().filter_map(|l| match &l.target {
      ProvenanceTarget::Fact { fact_id, .. } => Some(fact_id),
      _ => None,
    })
  }
}

// ─── Explanation ─────────────────────────────────────────────────────────────

fn describe_param(value: &ParamValue) -> String {
  match value {
    ParamValue::Quantity(q) => q.to_string(),
    ParamValue::Schedule(brackets) => brackets
      .iter()
      .map(|b| format!("{}+ @ {}", b.threshold.amount, b.rate))
      .collect::<Vec<_>>()
      .join(", "),
    ParamValue::Flag(flag) => flag.to_string(),
    ParamValue::Text(text) => text.clone(),
  }
}

fn describe_window(window: &EffectiveWindow) -> String {
  match window.to {
    Some(to) => format!("{} to {}", window.from, to),
    None => format!("from {}", window.from),
  }
}

/// Render a fact and the trace entries that concern it as a narrative.
pub fn explain(fact: &Fact, trace: &[TraceEntry]) -> String {
  let mut out = String::new();
  let subject = fact
    .entity_id
    .as_ref()
    .map_or_else(|| "household".to_owned(), ToString::to_string);
  let _ = writeln!(
    out,
    "{} for {subject} as of {} = {}",
    fact.calculation, fact.as_of, fact.value
  );
  let _ = writeln!(
    out,
    "  ruleset {} (period {})",
    fact.ruleset_id, fact.period_index
  );

  for link in &fact.provenance {
    let window = link
      .window
      .as_ref()
      .map(|w| format!(" [{}]", describe_window(w)))
      .unwrap_or_default();
    let line = match &link.target {
      ProvenanceTarget::Rule {
        rule_id,
        version,
        tier,
        ..
      } => format!("rule {rule_id}@{version} ({tier})"),
      ProvenanceTarget::Reference {
        document, pinpoint, ..
      } => match pinpoint {
        Some(pinpoint) => format!("cites {document}, {pinpoint}"),
        None => format!("cites {document}"),
      },
      ProvenanceTarget::Assumption {
        assumption_id,
        version,
        value,
        ..
      } => format!("assumption {assumption_id}@{version} = {value}"),
      ProvenanceTarget::Parameter { name, value, .. } => {
        format!("parameter {name} = {}", describe_param(value))
      }
      ProvenanceTarget::Input {
        field,
        value,
        source,
      } => format!("input {field} = {value} ({source})"),
      ProvenanceTarget::Fact {
        calculation, value, ..
      } => format!("uses {calculation} = {value}"),
    };
    let _ = writeln!(out, "  {}: {line}{window}", link.role);
  }

  for step in &fact.rounding {
    let _ = writeln!(
      out,
      "  rounded {} from {} to {} ({})",
      step.field, step.before, step.after, step.policy.mode
    );
  }

  for entry in trace.iter().filter(|e| {
    e.calculation.as_ref() == Some(&fact.calculation)
      && (e.entity_id.is_none() || e.entity_id == fact.entity_id)
  }) {
    let marker = match entry.severity {
      Severity::Info => "note",
      Severity::Warning => "warning",
      Severity::DecisionPoint => "decision",
    };
    let _ = writeln!(out, "  {marker}: {}", entry.explanation);
  }
  out
}

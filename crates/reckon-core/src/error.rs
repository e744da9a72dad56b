//! Error types for `reckon-core`.
//!
//! [`Error`] covers record, value and lifecycle failures. Evaluation failures
//! are [`EvalError`], which is serialisable because failed nodes are reported
//! alongside successful facts. Ruleset selection and projection each have
//! their own error type so callers can match on them without string parsing.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  id::{CalcId, EntityId, RulesetId},
  rule::RecordKind,
  snapshot::SnapshotStatus,
  value::Unit,
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid currency code: {0:?}")]
  InvalidCurrency(String),

  #[error("unit mismatch: {left} vs {right}")]
  UnitMismatch { left: Unit, right: Unit },

  #[error("expected a {expected} quantity, found {found}")]
  WrongUnit {
    expected: &'static str,
    found:    Unit,
  },

  #[error("arithmetic overflow in {operation}")]
  ArithmeticOverflow { operation: &'static str },

  #[error("invalid rounding policy: {0}")]
  InvalidRounding(String),

  #[error("malformed effective window: {from} is not before {to}")]
  InvalidWindow { from: NaiveDate, to: NaiveDate },

  #[error("invalid calculation state: {0}")]
  InvalidState(String),

  #[error("snapshot cannot move from {from} to {to}")]
  InvalidTransition {
    from: SnapshotStatus,
    to:   SnapshotStatus,
  },

  #[error(
    "concurrent modification of {ruleset_id}: expected revision {expected}, \
     found {actual}"
  )]
  ConcurrentModification {
    ruleset_id: RulesetId,
    expected:   u64,
    actual:     u64,
  },

  #[error("calculation registered twice: {0}")]
  DuplicateCalculation(CalcId),

  #[error("ruleset not found: {0}")]
  RulesetNotFound(RulesetId),

  #[error("ruleset already published: {0}")]
  RulesetExists(RulesetId),

  #[error("{kind} {id}@{version} already exists with different content")]
  VersionConflict {
    kind:    RecordKind,
    id:      String,
    version: u32,
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

// ─── Evaluation ──────────────────────────────────────────────────────────────

/// Why a single calculation node produced no fact.
///
/// Node-level failures never abort a run: they are reported next to the facts
/// of the nodes that did succeed. Only [`EvalError::CyclicDependency`] and
/// [`EvalError::UnknownCalculation`] are fatal, since they mean no evaluation
/// order exists.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvalError {
  #[error("missing required input: {field}")]
  MissingRequiredInput { field: String },

  #[error("rule {rule_id} does not define parameter {parameter:?}")]
  MissingParameter { rule_id: String, parameter: String },

  #[error("unit mismatch: expected {expected}, found {found}")]
  UnitMismatch { expected: String, found: String },

  #[error("constraint violated: {message}")]
  ConstraintViolation { message: String },

  #[error("arithmetic overflow in {operation}")]
  ArithmeticOverflow { operation: String },

  #[error("no applicable rule as of {as_of}")]
  NoApplicableRule { as_of: NaiveDate },

  #[error("dependency {dependency} failed")]
  DependencyFailed {
    dependency: CalcId,
    entity_id:  Option<EntityId>,
  },

  #[error("cyclic dependency among calculations: {cycle:?}")]
  CyclicDependency { cycle: Vec<CalcId> },

  #[error("unknown calculation: {calculation} (available: {})", list(available))]
  UnknownCalculation {
    calculation: CalcId,
    available:   Vec<CalcId>,
  },

  #[error("fact would have no rule, assumption or parameter provenance")]
  Unprovenanced,

  #[error("internal evaluation error: {message}")]
  Internal { message: String },
}

fn list(ids: &[CalcId]) -> String {
  ids.iter().map(CalcId::as_str).collect::<Vec<_>>().join(", ")
}

impl EvalError {
  /// Fatal errors abort the whole run instead of a single node.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      Self::CyclicDependency { .. } | Self::UnknownCalculation { .. }
    )
  }
}

impl From<Error> for EvalError {
  fn from(err: Error) -> Self {
    match err {
      Error::UnitMismatch { left, right } => Self::UnitMismatch {
        expected: left.to_string(),
        found:    right.to_string(),
      },
      Error::WrongUnit { expected, found } => Self::UnitMismatch {
        expected: expected.to_owned(),
        found:    found.to_string(),
      },
      Error::ArithmeticOverflow { operation } => Self::ArithmeticOverflow {
        operation: operation.to_owned(),
      },
      other => Self::Internal {
        message: other.to_string(),
      },
    }
  }
}

// ─── Resolution ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
  #[error(
    "no activated ruleset covers {as_of} (earliest available: {})",
    earliest_available.map(|d| d.to_string()).unwrap_or_else(|| "none".into())
  )]
  NoRulesetForDate {
    as_of:              NaiveDate,
    earliest_available: Option<NaiveDate>,
  },

  #[error("unknown ruleset: {0}")]
  UnknownRuleset(RulesetId),

  #[error("ruleset {ruleset_id} is {status} and cannot be used for evaluation")]
  RulesetNotActivated {
    ruleset_id: RulesetId,
    status:     SnapshotStatus,
  },
}

// ─── Projection ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProjectionError {
  #[error("projection to period {requested} exceeds the horizon of {limit}")]
  HorizonExceeded { requested: u32, limit: u32 },

  #[error("period {period_index}: {source}")]
  Resolve {
    period_index: u32,
    #[source]
    source:       ResolveError,
  },

  #[error("period {period_index}: {source}")]
  Eval {
    period_index: u32,
    #[source]
    source:       EvalError,
  },

  #[error("period {period_index}: {source}")]
  State {
    period_index: u32,
    #[source]
    source:       Error,
  },

  #[error("projection cancelled after {completed_periods} periods")]
  Cancelled { completed_periods: u32 },
}

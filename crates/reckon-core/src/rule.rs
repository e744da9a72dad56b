//! Versioned rule, reference and assumption records.
//!
//! Records are immutable once published. A change is a new version, never an
//! in-place edit: stores compare [`content_hash`](Rule::content_hash) values
//! and reject a second write of the same `(id, version)` with different
//! content.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
  CalcId, Error, Result, ScenarioId,
  digest::canonical_digest,
  value::{Money, Quantity, Rate, RoundingPolicy},
};

// ─── Keys ────────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordKind {
  Rule,
  Reference,
  Assumption,
}

/// `(id, version)` pair addressing one immutable record.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RecordKey {
  pub id:      String,
  pub version: u32,
}

impl RecordKey {
  pub fn new(id: impl Into<String>, version: u32) -> Self {
    Self {
      id: id.into(),
      version,
    }
  }
}

impl fmt::Display for RecordKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.id, self.version)
  }
}

// ─── Precedence ──────────────────────────────────────────────────────────────

/// Authority of a rule's source. Declared weakest first so the derived `Ord`
/// ranks `Act` highest.
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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PrecedenceTier {
  Assumption,
  Guidance,
  Ruling,
  Regulation,
  Act,
}

// ─── Effective window ────────────────────────────────────────────────────────

/// Half-open validity interval `[from, to)`; `to: None` is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectiveWindow {
  pub from: NaiveDate,
  #[serde(default)]
  pub to:   Option<NaiveDate>,
}

impl EffectiveWindow {
  pub fn new(from: NaiveDate, to: Option<NaiveDate>) -> Result<Self> {
    let window = Self { from, to };
    window.check()?;
    Ok(window)
  }

  pub fn open(from: NaiveDate) -> Self { Self { from, to: None } }

  pub fn check(&self) -> Result<()> {
    match self.to {
      Some(to) if to <= self.from => Err(Error::InvalidWindow {
        from: self.from,
        to,
      }),
      _ => Ok(()),
    }
  }

  pub fn contains(&self, date: NaiveDate) -> bool {
    self.from <= date && self.to.is_none_or(|to| date < to)
  }

  pub fn overlaps(&self, other: &Self) -> bool {
    let starts_before_other_ends = other.to.is_none_or(|to| self.from < to);
    let other_starts_before_end = self.to.is_none_or(|to| other.from < to);
    starts_before_other_ends && other_starts_before_end
  }
}

// ─── Review ──────────────────────────────────────────────────────────────────

/// Authorship metadata. Publication requires a reviewer distinct from the
/// author.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Review {
  pub authored_by: String,
  #[serde(default)]
  pub reviewed_by: Option<String>,
}

impl Review {
  pub fn new(author: impl Into<String>, reviewer: impl Into<String>) -> Self {
    Self {
      authored_by: author.into(),
      reviewed_by: Some(reviewer.into()),
    }
  }
}

// ─── Parameters ──────────────────────────────────────────────────────────────

/// One band of a progressive schedule: `rate` applies to the portion of the
/// base above `threshold`, up to the next bracket's threshold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bracket {
  pub threshold: Money,
  pub rate:      Rate,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ParamValue {
  Quantity(Quantity),
  Schedule(Vec<Bracket>),
  Flag(bool),
  Text(String),
}

/// Outcome of applying a progressive schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOutcome {
  pub amount:        Money,
  /// Index of the highest bracket that received any of the base.
  pub marginal:      Option<usize>,
  pub marginal_rate: Rate,
}

/// Apply a progressive schedule to `base`.
///
/// Brackets are taken in threshold order regardless of their declared order.
/// A base at or below the lowest threshold attracts nothing.
pub fn progressive(brackets: &[Bracket], base: &Money) -> Result<ScheduleOutcome> {
  let mut ordered: Vec<&Bracket> = brackets.iter().collect();
  ordered.sort_by(|a, b| a.threshold.amount.cmp(&b.threshold.amount));

  let mut amount = Money::zero(&base.currency);
  let mut marginal = None;
  let mut marginal_rate = Rate::ZERO;
  for (i, bracket) in ordered.iter().enumerate() {
    if base.amount <= bracket.threshold.amount {
      break;
    }
    let ceiling = match ordered.get(i + 1) {
      Some(next) if next.threshold.amount < base.amount => next.threshold.clone(),
      _ => base.clone(),
    };
    let portion = ceiling.checked_sub(&bracket.threshold)?;
    amount = amount.checked_add(&portion.apply_rate(bracket.rate)?)?;
    marginal = Some(i);
    marginal_rate = bracket.rate;
  }
  Ok(ScheduleOutcome {
    amount,
    marginal,
    marginal_rate,
  })
}

// ─── Records ─────────────────────────────────────────────────────────────────

/// A versioned, effective-dated statement of how one calculation is
/// performed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
  pub rule_id:      String,
  pub version:      u32,
  pub calculation:  CalcId,
  pub tier:         PrecedenceTier,
  pub window:       EffectiveWindow,
  #[serde(default)]
  pub parameters:   BTreeMap<String, ParamValue>,
  #[serde(default)]
  pub references:   Vec<RecordKey>,
  /// Final-step rounding. Defaults to cents for currency outputs.
  #[serde(default)]
  pub rounding:     Option<RoundingPolicy>,
  /// Rounding applied where the calculation asks for an intermediate
  /// checkpoint, e.g. whole-dollar cap balances.
  #[serde(default)]
  pub intermediate: Option<RoundingPolicy>,
  pub published_at: DateTime<Utc>,
  pub review:       Review,
}

impl Rule {
  pub fn key(&self) -> RecordKey { RecordKey::new(&self.rule_id, self.version) }

  pub fn content_hash(&self) -> Result<String> { canonical_digest(self) }

  pub fn parameter(&self, name: &str) -> Option<&ParamValue> {
    self.parameters.get(name)
  }
}

/// A citation of an authoritative source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
  pub reference_id: String,
  pub version:      u32,
  pub document:     String,
  #[serde(default)]
  pub pinpoint:     Option<String>,
  /// Digest of the source document text this version cites.
  pub checksum:     String,
}

impl Reference {
  pub fn key(&self) -> RecordKey {
    RecordKey::new(&self.reference_id, self.version)
  }

  pub fn content_hash(&self) -> Result<String> { canonical_digest(self) }
}

/// Who an assumption applies to. More specific scopes win.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AssumptionScope {
  Global,
  Tenant(String),
  Scenario(ScenarioId),
}

impl AssumptionScope {
  pub fn specificity(&self) -> u8 {
    match self {
      Self::Global => 0,
      Self::Tenant(_) => 1,
      Self::Scenario(_) => 2,
    }
  }
}

/// A versioned value not fixed by authority (an indexation rate, a return).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assumption {
  pub assumption_id: String,
  pub version:       u32,
  pub value:         Quantity,
  pub window:        EffectiveWindow,
  #[serde(default = "global_scope")]
  pub scope:         AssumptionScope,
  pub review:        Review,
}

fn global_scope() -> AssumptionScope { AssumptionScope::Global }

impl Assumption {
  pub fn key(&self) -> RecordKey {
    RecordKey::new(&self.assumption_id, self.version)
  }

  pub fn content_hash(&self) -> Result<String> { canonical_digest(self) }
}

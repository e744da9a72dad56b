//! Human-readable explanation trace.
//!
//! Every decision the engine makes (which rule won, which branch of a
//! calculation applied, which default filled a gap) is appended to a
//! [`TraceLog`] as a [`TraceEntry`]. Sequence numbers are assigned on append,
//! so entries read back in the order they were produced.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{CalcId, EntityId};

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
pub enum Severity {
  Info,
  Warning,
  DecisionPoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
  /// Position within the run's log. Zero until appended.
  pub seq:          u32,
  pub calculation:  Option<CalcId>,
  pub entity_id:    Option<EntityId>,
  pub field:        Option<String>,
  pub severity:     Severity,
  pub period_index: u32,
  pub explanation:  String,
  #[serde(default)]
  pub metadata:     BTreeMap<String, String>,
}

impl TraceEntry {
  pub fn new(severity: Severity, explanation: impl Into<String>) -> Self {
    Self {
      seq: 0,
      calculation: None,
      entity_id: None,
      field: None,
      severity,
      period_index: 0,
      explanation: explanation.into(),
      metadata: BTreeMap::new(),
    }
  }

  pub fn info(explanation: impl Into<String>) -> Self {
    Self::new(Severity::Info, explanation)
  }

  pub fn warning(explanation: impl Into<String>) -> Self {
    Self::new(Severity::Warning, explanation)
  }

  pub fn decision(explanation: impl Into<String>) -> Self {
    Self::new(Severity::DecisionPoint, explanation)
  }

  pub fn calculation(mut self, calculation: &CalcId) -> Self {
    self.calculation = Some(calculation.clone());
    self
  }

  pub fn entity(mut self, entity_id: Option<&EntityId>) -> Self {
    self.entity_id = entity_id.cloned();
    self
  }

  pub fn field(mut self, field: impl Into<String>) -> Self {
    self.field = Some(field.into());
    self
  }

  pub fn meta(mut self, key: impl Into<String>, value: impl ToString) -> Self {
    self.metadata.insert(key.into(), value.to_string());
    self
  }
}

/// Append-only, ordered trace for one run or one projection period.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceLog {
  entries: Vec<TraceEntry>,
}

impl TraceLog {
  pub fn new() -> Self { Self::default() }

  /// Append `entry`, stamping its sequence number and period.
  pub fn push(&mut self, mut entry: TraceEntry, period_index: u32) {
    entry.seq = self.entries.len() as u32;
    entry.period_index = period_index;
    self.entries.push(entry);
  }

  pub fn extend(
    &mut self,
    entries: impl IntoIterator<Item = TraceEntry>,
    period_index: u32,
  ) {
    for entry in entries {
      self.push(entry, period_index);
    }
  }

  pub fn entries(&self) -> &[TraceEntry] { &self.entries }

  pub fn into_entries(self) -> Vec<TraceEntry> { self.entries }

  pub fn len(&self) -> usize { self.entries.len() }

  pub fn is_empty(&self) -> bool { self.entries.is_empty() }

  pub fn with_severity(
    &self,
    severity: Severity,
  ) -> impl Iterator<Item = &TraceEntry> {
    self.entries.iter().filter(move |e| e.severity == severity)
  }

  /// Entries concerning one calculation and, optionally, one entity.
  pub fn for_calculation<'a>(
    &'a self,
    calculation: &'a CalcId,
    entity_id: Option<&'a EntityId>,
  ) -> impl Iterator<Item = &'a TraceEntry> {
    self.entries.iter().filter(move |e| {
      e.calculation.as_ref() == Some(calculation)
        && (entity_id.is_none() || e.entity_id.as_ref() == entity_id)
    })
  }
}

impl From<Vec<TraceEntry>> for TraceLog {
  fn from(entries: Vec<TraceEntry>) -> Self { Self { entries } }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn push_assigns_sequence_and_period() {
    let mut log = TraceLog::new();
    log.push(TraceEntry::info("a"), 3);
    log.push(TraceEntry::warning("b").meta("k", 1), 3);
    assert_eq!(log.entries()[0].seq, 0);
    assert_eq!(log.entries()[1].seq, 1);
    assert_eq!(log.entries()[1].period_index, 3);
    assert_eq!(log.entries()[1].metadata["k"], "1");
    assert_eq!(log.with_severity(Severity::Warning).count(), 1);
  }

  #[test]
  fn filters_by_calculation_and_entity() {
    let tax = CalcId::from("pit.income_tax");
    let alex = EntityId::from("alex");
    let mut log = TraceLog::new();
    log.push(TraceEntry::info("x").calculation(&tax).entity(Some(&alex)), 0);
    log.push(TraceEntry::info("y").calculation(&tax), 0);
    log.push(TraceEntry::info("z"), 0);
    assert_eq!(log.for_calculation(&tax, None).count(), 2);
    assert_eq!(log.for_calculation(&tax, Some(&alex)).count(), 1);
  }
}

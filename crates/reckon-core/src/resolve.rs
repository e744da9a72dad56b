//! Ruleset selection and rule resolution.
//!
//! Given an evaluation date, [`SnapshotIndex`] picks the governing snapshot:
//! the activated snapshot with the latest publication on or before the date
//! whose coverage has not been ended by a later activation. Within the
//! snapshot, each calculation resolves to exactly one rule: the highest
//! precedence tier wins, then an explicit tie-break, then the earliest
//! published rule with the lexically smallest id. Every override and tie is
//! recorded as a trace entry.

use std::{
  collections::{BTreeMap, btree_map::Entry},
  sync::Arc,
};

use chrono::NaiveDate;

use crate::{
  CalcId, ResolveError, RulesetId, ScenarioId,
  rule::{Assumption, RecordKey, Reference, Rule},
  snapshot::{RulesetSnapshot, SnapshotStatus},
  trace::TraceEntry,
};

// ─── Source ──────────────────────────────────────────────────────────────────

/// Anything that can hand the evaluator a resolved ruleset without I/O.
pub trait RulesetSource: Send + Sync {
  /// Resolve for `as_of`, either by date selection or, when `pinned` is set,
  /// by explicit id.
  fn resolve(
    &self,
    as_of: NaiveDate,
    pinned: Option<&RulesetId>,
  ) -> Result<ResolvedRuleset, ResolveError>;
}

/// In-memory index of every known snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotIndex {
  snapshots: BTreeMap<RulesetId, Arc<RulesetSnapshot>>,
}

impl SnapshotIndex {
  pub fn new(snapshots: impl IntoIterator<Item = RulesetSnapshot>) -> Self {
    Self {
      snapshots: snapshots
        .into_iter()
        .map(|s| (s.header.ruleset_id.clone(), Arc::new(s)))
        .collect(),
    }
  }

  pub fn get(&self, ruleset_id: &RulesetId) -> Option<&Arc<RulesetSnapshot>> {
    self.snapshots.get(ruleset_id)
  }

  pub fn len(&self) -> usize { self.snapshots.len() }

  pub fn is_empty(&self) -> bool { self.snapshots.is_empty() }

  /// The earliest date any activated snapshot covers.
  pub fn earliest_available(&self) -> Option<NaiveDate> {
    self
      .snapshots
      .values()
      .filter(|s| s.status() == SnapshotStatus::Activated)
      .map(|s| s.header.published_on())
      .min()
  }

  /// Select the snapshot governing `as_of`.
  pub fn select(
    &self,
    as_of: NaiveDate,
  ) -> Result<&Arc<RulesetSnapshot>, ResolveError> {
    self
      .snapshots
      .values()
      .filter(|s| s.header.covers(as_of))
      .max_by_key(|s| (s.header.published_at, s.header.activated_at))
      .ok_or(ResolveError::NoRulesetForDate {
        as_of,
        earliest_available: self.earliest_available(),
      })
  }

  fn pinned(
    &self,
    ruleset_id: &RulesetId,
  ) -> Result<&Arc<RulesetSnapshot>, ResolveError> {
    let snapshot = self
      .get(ruleset_id)
      .ok_or_else(|| ResolveError::UnknownRuleset(ruleset_id.clone()))?;
    match snapshot.status() {
      SnapshotStatus::Activated | SnapshotStatus::Superseded => Ok(snapshot),
      status => Err(ResolveError::RulesetNotActivated {
        ruleset_id: ruleset_id.clone(),
        status,
      }),
    }
  }
}

impl RulesetSource for SnapshotIndex {
  fn resolve(
    &self,
    as_of: NaiveDate,
    pinned: Option<&RulesetId>,
  ) -> Result<ResolvedRuleset, ResolveError> {
    let snapshot = match pinned {
      Some(ruleset_id) => self.pinned(ruleset_id)?,
      None => self.select(as_of)?,
    };
    Ok(ResolvedRuleset::new(Arc::clone(snapshot), as_of))
  }
}

// ─── Resolved ruleset ────────────────────────────────────────────────────────

/// Scope of the run asking for an assumption.
#[derive(Debug, Clone, Copy)]
pub struct ScopeContext<'a> {
  pub tenant:   Option<&'a str>,
  pub scenario: &'a ScenarioId,
}

/// One snapshot with one rule chosen per calculation for a date.
#[derive(Debug, Clone)]
pub struct ResolvedRuleset {
  snapshot: Arc<RulesetSnapshot>,
  as_of:    NaiveDate,
  selected: BTreeMap<CalcId, usize>,
  notes:    Vec<TraceEntry>,
}

impl ResolvedRuleset {
  pub fn new(snapshot: Arc<RulesetSnapshot>, as_of: NaiveDate) -> Self {
    // Latest applicable version per rule id, grouped by calculation.
    let mut latest: BTreeMap<(&CalcId, &str), usize> = BTreeMap::new();
    for (i, rule) in snapshot.rules.iter().enumerate() {
      if !rule.window.contains(as_of) {
        continue;
      }
      match latest.entry((&rule.calculation, rule.rule_id.as_str())) {
        Entry::Vacant(slot) => {
          slot.insert(i);
        }
        Entry::Occupied(mut slot) => {
          if snapshot.rules[*slot.get()].version < rule.version {
            slot.insert(i);
          }
        }
      }
    }
    let mut candidates: BTreeMap<CalcId, Vec<usize>> = BTreeMap::new();
    for ((calculation, _), i) in latest {
      candidates.entry(calculation.clone()).or_default().push(i);
    }

    let mut selected = BTreeMap::new();
    let mut notes = Vec::new();
    for (calculation, indices) in candidates {
      if let Some(winner) = choose(&snapshot, &calculation, &indices, &mut notes)
      {
        selected.insert(calculation, winner);
      }
    }

    Self {
      snapshot,
      as_of,
      selected,
      notes,
    }
  }

  pub fn ruleset_id(&self) -> &RulesetId { self.snapshot.ruleset_id() }

  pub fn snapshot(&self) -> &RulesetSnapshot { &self.snapshot }

  pub fn as_of(&self) -> NaiveDate { self.as_of }

  /// The rule governing `calculation`, if any is effective.
  pub fn rule_for(&self, calculation: &CalcId) -> Option<&Rule> {
    self
      .selected
      .get(calculation)
      .map(|&i| &self.snapshot.rules[i])
  }

  pub fn calculations(&self) -> impl Iterator<Item = &CalcId> {
    self.selected.keys()
  }

  /// Decisions and warnings produced while resolving.
  pub fn notes(&self) -> &[TraceEntry] { &self.notes }

  pub fn reference(&self, key: &RecordKey) -> Option<&Reference> {
    self.snapshot.reference(key)
  }

  /// The most specific effective assumption named `assumption_id`.
  ///
  /// Scenario scope beats tenant scope beats global; then the latest window
  /// start; then the highest version.
  pub fn assumption(
    &self,
    assumption_id: &str,
    scope: ScopeContext<'_>,
  ) -> Option<&Assumption> {
    use crate::rule::AssumptionScope as S;
    self
      .snapshot
      .assumptions
      .iter()
      .filter(|a| a.assumption_id == assumption_id)
      .filter(|a| a.window.contains(self.as_of))
      .filter(|a| match &a.scope {
        S::Global => true,
        S::Tenant(tenant) => scope.tenant == Some(tenant.as_str()),
        S::Scenario(scenario) => scenario == scope.scenario,
      })
      .max_by_key(|a| (a.scope.specificity(), a.window.from, a.version))
  }
}

fn describe(rule: &Rule) -> String {
  format!("{}@{} ({})", rule.rule_id, rule.version, rule.tier)
}

/// Highest tier wins outright. Among equal tiers an explicit tie-break is
/// consulted first; failing that, earliest `published_at`, then smallest
/// `rule_id`, with a warning.
fn choose(
  snapshot: &RulesetSnapshot,
  calculation: &CalcId,
  indices: &[usize],
  notes: &mut Vec<TraceEntry>,
) -> Option<usize> {
  let rules = &snapshot.rules;
  let top = indices.iter().map(|&i| rules[i].tier).max()?;
  let mut tied: Vec<usize> =
    indices.iter().copied().filter(|&i| rules[i].tier == top).collect();
  let shadowed: Vec<usize> =
    indices.iter().copied().filter(|&i| rules[i].tier < top).collect();

  let winner = if tied.len() == 1 {
    tied[0]
  } else if let Some(i) = snapshot.tie_breaks.iter().find_map(|tb| {
    (tb.calculation == *calculation)
      .then(|| tied.iter().copied().find(|&i| rules[i].rule_id == tb.preferred))
      .flatten()
  }) {
    notes.push(
      TraceEntry::decision(format!(
        "explicit tie-break selects {} among {} {top} rules",
        describe(&rules[i]),
        tied.len()
      ))
      .calculation(calculation)
      .meta("rule_id", &rules[i].rule_id)
      .meta("tie_break", "explicit"),
    );
    i
  } else {
    tied.sort_by(|&a, &b| {
      (rules[a].published_at, &rules[a].rule_id)
        .cmp(&(rules[b].published_at, &rules[b].rule_id))
    });
    let i = tied[0];
    let candidates = tied
      .iter()
      .map(|&j| describe(&rules[j]))
      .collect::<Vec<_>>()
      .join(", ");
    tracing::warn!(
      %calculation,
      winner = %rules[i].rule_id,
      %candidates,
      "ambiguous rule precedence resolved by default ordering"
    );
    notes.push(
      TraceEntry::warning(format!(
        "ambiguous precedence among {candidates}; defaulted to {}",
        describe(&rules[i])
      ))
      .calculation(calculation)
      .meta("rule_id", &rules[i].rule_id)
      .meta("tie_break", "default")
      .meta("candidates", &candidates),
    );
    i
  };

  for &loser in &shadowed {
    notes.push(
      TraceEntry::decision(format!(
        "{} overrides {}",
        describe(&rules[winner]),
        describe(&rules[loser])
      ))
      .calculation(calculation)
      .meta("rule_id", &rules[winner].rule_id)
      .meta("overridden", &rules[loser].rule_id),
    );
  }
  Some(winner)
}

//! Ruleset snapshots and their lifecycle.
//!
//! A snapshot is the set of rule, reference and assumption versions published
//! together under one `ruleset_id`. It moves `Draft → Validated → Activated →
//! Superseded` and never backwards. Activation and rollback are planned here as
//! pure functions over snapshot headers; stores apply the resulting headers
//! atomically, guarded by each header's revision.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
  CalcId, Error, Result, RulesetId,
  rule::{Assumption, RecordKey, Reference, Review, Rule},
};

// ─── Status ──────────────────────────────────────────────────────────────────

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
pub enum SnapshotStatus {
  Draft,
  Validated,
  Activated,
  Superseded,
}

impl SnapshotStatus {
  /// Check a lifecycle step. Only single forward steps are allowed.
  pub fn transition(self, next: Self) -> Result<Self> {
    use SnapshotStatus::*;
    match (self, next) {
      (Draft, Validated) | (Validated, Activated) | (Activated, Superseded) => {
        Ok(next)
      }
      (from, to) => Err(Error::InvalidTransition { from, to }),
    }
  }
}

// ─── Header ──────────────────────────────────────────────────────────────────

/// Mutable lifecycle state of a snapshot; its contents never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
  pub ruleset_id:    RulesetId,
  pub published_at:  DateTime<Utc>,
  pub status:        SnapshotStatus,
  /// Bumped on every header change; used for optimistic concurrency.
  pub revision:      u64,
  pub recorded_at:   DateTime<Utc>,
  pub activated_at:  Option<DateTime<Utc>>,
  /// End of the coverage interval, set when a later snapshot is activated.
  pub valid_to:      Option<DateTime<Utc>>,
  pub superseded_at: Option<DateTime<Utc>>,
}

impl SnapshotHeader {
  pub fn published_on(&self) -> NaiveDate { self.published_at.date_naive() }

  /// Whether this snapshot is the candidate for evaluation dates on `as_of`.
  pub fn covers(&self, as_of: NaiveDate) -> bool {
    self.status == SnapshotStatus::Activated
      && self.published_on() <= as_of
      && self.valid_to.is_none_or(|to| as_of < to.date_naive())
  }

  fn bumped(&self) -> Self {
    Self {
      revision: self.revision + 1,
      ..self.clone()
    }
  }
}

// ─── Contents ────────────────────────────────────────────────────────────────

/// Explicit winner for a calculation whose top-tier candidates would
/// otherwise tie.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TieBreak {
  pub calculation: CalcId,
  /// `rule_id` of the preferred rule.
  pub preferred:   String,
}

/// A ruleset as submitted for publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRuleset {
  pub ruleset_id:   RulesetId,
  pub published_at: DateTime<Utc>,
  pub rules:        Vec<Rule>,
  #[serde(default)]
  pub references:   Vec<Reference>,
  #[serde(default)]
  pub assumptions:  Vec<Assumption>,
  #[serde(default)]
  pub tie_breaks:   Vec<TieBreak>,
}

impl CandidateRuleset {
  /// Turn the candidate into a draft snapshot with contents in canonical
  /// order.
  pub fn into_draft(self, recorded_at: DateTime<Utc>) -> RulesetSnapshot {
    let mut snapshot = RulesetSnapshot {
      header:      SnapshotHeader {
        ruleset_id: self.ruleset_id,
        published_at: self.published_at,
        status: SnapshotStatus::Draft,
        revision: 1,
        recorded_at,
        activated_at: None,
        valid_to: None,
        superseded_at: None,
      },
      rules:       self.rules,
      references:  self.references,
      assumptions: self.assumptions,
      tie_breaks:  self.tie_breaks,
    };
    snapshot.canonicalize();
    snapshot
  }
}

/// A snapshot header together with its immutable contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetSnapshot {
  pub header:      SnapshotHeader,
  pub rules:       Vec<Rule>,
  pub references:  Vec<Reference>,
  pub assumptions: Vec<Assumption>,
  pub tie_breaks:  Vec<TieBreak>,
}

impl RulesetSnapshot {
  pub fn ruleset_id(&self) -> &RulesetId { &self.header.ruleset_id }

  pub fn status(&self) -> SnapshotStatus { self.header.status }

  /// Sort contents by key so equal snapshots encode identically.
  pub fn canonicalize(&mut self) {
    self.rules.sort_by_key(Rule::key);
    self.references.sort_by_key(Reference::key);
    self.assumptions.sort_by_key(Assumption::key);
    self.tie_breaks.sort();
  }

  pub fn reference(&self, key: &RecordKey) -> Option<&Reference> {
    self.references.iter().find(|r| &r.key() == key)
  }
}

// ─── Validation ──────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IssueCode {
  MalformedWindow,
  EffectiveAfterPublication,
  PublishedAfterSnapshot,
  DanglingReference,
  DuplicateRecord,
  AmbiguousPrecedence,
  UnknownTieBreak,
  MissingReview,
  SelfReview,
  /// An `(id, version)` already stored with different content.
  VersionConflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
  pub code:    IssueCode,
  /// The offending record, formatted as `id@version`.
  pub record:  Option<String>,
  pub message: String,
}

impl ValidationIssue {
  pub fn new(
    code: IssueCode,
    record: Option<&RecordKey>,
    message: impl Into<String>,
  ) -> Self {
    Self {
      code,
      record: record.map(ToString::to_string),
      message: message.into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
  pub ruleset_id: RulesetId,
  pub ok:         bool,
  pub errors:     Vec<ValidationIssue>,
}

impl ValidationReport {
  pub fn new(ruleset_id: RulesetId, errors: Vec<ValidationIssue>) -> Self {
    Self {
      ruleset_id,
      ok: errors.is_empty(),
      errors,
    }
  }
}

fn check_review(
  issues: &mut Vec<ValidationIssue>,
  key: &RecordKey,
  review: &Review,
) {
  match review.reviewed_by.as_deref() {
    None => issues.push(ValidationIssue::new(
      IssueCode::MissingReview,
      Some(key),
      "record has no reviewer",
    )),
    Some(reviewer) if reviewer == review.authored_by => {
      issues.push(ValidationIssue::new(
        IssueCode::SelfReview,
        Some(key),
        format!("{reviewer} reviewed their own record"),
      ))
    }
    Some(_) => {}
  }
}

fn check_duplicates(
  issues: &mut Vec<ValidationIssue>,
  kind: &str,
  keys: impl IntoIterator<Item = RecordKey>,
) {
  let mut seen = BTreeSet::new();
  for key in keys {
    if !seen.insert(key.clone()) {
      issues.push(ValidationIssue::new(
        IssueCode::DuplicateRecord,
        Some(&key),
        format!("{kind} appears more than once"),
      ));
    }
  }
}

/// Check a snapshot's contents. An empty result means it may be validated.
///
/// Checks, in order: well-formed windows, no effective date or record
/// publication after the snapshot's publication, every cited reference
/// present, no duplicate records, distinct reviewers, and no unresolved tie
/// between same-tier rules with identical windows for one calculation.
pub fn validate_snapshot(snapshot: &RulesetSnapshot) -> Vec<ValidationIssue> {
  let mut issues = Vec::new();
  let published_at = snapshot.header.published_at;
  let published_on = snapshot.header.published_on();

  for rule in &snapshot.rules {
    let key = rule.key();
    if let Err(err) = rule.window.check() {
      issues.push(ValidationIssue::new(
        IssueCode::MalformedWindow,
        Some(&key),
        err.to_string(),
      ));
    }
    if rule.window.from > published_on {
      issues.push(ValidationIssue::new(
        IssueCode::EffectiveAfterPublication,
        Some(&key),
        format!(
          "effective from {} but the ruleset is published {published_on}",
          rule.window.from
        ),
      ));
    }
    if rule.published_at > published_at {
      issues.push(ValidationIssue::new(
        IssueCode::PublishedAfterSnapshot,
        Some(&key),
        format!("rule published at {} after the ruleset", rule.published_at),
      ));
    }
    for reference in &rule.references {
      if snapshot.reference(reference).is_none() {
        issues.push(ValidationIssue::new(
          IssueCode::DanglingReference,
          Some(&key),
          format!("reference {reference} is not part of the ruleset"),
        ));
      }
    }
    check_review(&mut issues, &key, &rule.review);
  }

  for assumption in &snapshot.assumptions {
    let key = assumption.key();
    if let Err(err) = assumption.window.check() {
      issues.push(ValidationIssue::new(
        IssueCode::MalformedWindow,
        Some(&key),
        err.to_string(),
      ));
    }
    if assumption.window.from > published_on {
      issues.push(ValidationIssue::new(
        IssueCode::EffectiveAfterPublication,
        Some(&key),
        format!(
          "effective from {} but the ruleset is published {published_on}",
          assumption.window.from
        ),
      ));
    }
    check_review(&mut issues, &key, &assumption.review);
  }

  check_duplicates(&mut issues, "rule", snapshot.rules.iter().map(Rule::key));
  check_duplicates(
    &mut issues,
    "reference",
    snapshot.references.iter().map(Reference::key),
  );
  check_duplicates(
    &mut issues,
    "assumption",
    snapshot.assumptions.iter().map(Assumption::key),
  );

  // Same calculation, same tier, identical window: precedence cannot decide.
  let mut groups: BTreeMap<_, Vec<&Rule>> = BTreeMap::new();
  for rule in &snapshot.rules {
    groups
      .entry((
        rule.calculation.clone(),
        rule.tier,
        rule.window.from,
        rule.window.to,
      ))
      .or_default()
      .push(rule);
  }
  for ((calculation, tier, ..), rules) in groups {
    let distinct: BTreeSet<&str> =
      rules.iter().map(|r| r.rule_id.as_str()).collect();
    if distinct.len() < 2 {
      continue;
    }
    let resolved = snapshot.tie_breaks.iter().any(|tb| {
      tb.calculation == calculation && distinct.contains(tb.preferred.as_str())
    });
    if !resolved {
      issues.push(ValidationIssue::new(
        IssueCode::AmbiguousPrecedence,
        rules.first().map(|r| r.key()).as_ref(),
        format!(
          "{} {tier} rules for {calculation} share a window without a \
           tie-break: {}",
          distinct.len(),
          distinct.into_iter().collect::<Vec<_>>().join(", ")
        ),
      ));
    }
  }

  for tie_break in &snapshot.tie_breaks {
    let known = snapshot.rules.iter().any(|r| {
      r.calculation == tie_break.calculation && r.rule_id == tie_break.preferred
    });
    if !known {
      issues.push(ValidationIssue::new(
        IssueCode::UnknownTieBreak,
        None,
        format!(
          "tie-break for {} prefers unknown rule {}",
          tie_break.calculation, tie_break.preferred
        ),
      ));
    }
  }

  issues
}

// ─── Activation planning ─────────────────────────────────────────────────────

/// Header changes a store must apply atomically. Each entry replaces the
/// stored header whose revision is one less than the entry's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPlan {
  pub updates: Vec<SnapshotHeader>,
}

impl HeaderPlan {
  pub fn header(&self, ruleset_id: &RulesetId) -> Option<&SnapshotHeader> {
    self.updates.iter().find(|h| &h.ruleset_id == ruleset_id)
  }
}

fn find<'a>(
  headers: &'a [SnapshotHeader],
  ruleset_id: &RulesetId,
) -> Result<&'a SnapshotHeader> {
  headers
    .iter()
    .find(|h| &h.ruleset_id == ruleset_id)
    .ok_or_else(|| Error::RulesetNotFound(ruleset_id.clone()))
}

fn check_revision(header: &SnapshotHeader, expected: Option<u64>) -> Result<()> {
  match expected {
    Some(expected) if expected != header.revision => {
      Err(Error::ConcurrentModification {
        ruleset_id: header.ruleset_id.clone(),
        expected,
        actual: header.revision,
      })
    }
    _ => Ok(()),
  }
}

/// Plan the `Draft → Validated` step for a snapshot that passed
/// [`validate_snapshot`].
pub fn plan_validation(header: &SnapshotHeader) -> Result<SnapshotHeader> {
  let mut next = header.bumped();
  next.status = header.status.transition(SnapshotStatus::Validated)?;
  Ok(next)
}

/// Plan the activation of `ruleset_id`.
///
/// The target covers dates from its publication until the next later
/// activated snapshot's publication. The activated snapshot it follows has
/// its coverage ended at the target's publication.
pub fn plan_activation(
  headers: &[SnapshotHeader],
  ruleset_id: &RulesetId,
  expected_revision: Option<u64>,
  now: DateTime<Utc>,
) -> Result<HeaderPlan> {
  let target = find(headers, ruleset_id)?;
  check_revision(target, expected_revision)?;

  let mut next = target.bumped();
  next.status = target.status.transition(SnapshotStatus::Activated)?;
  next.activated_at = Some(now);

  let activated = headers.iter().filter(|h| {
    h.status == SnapshotStatus::Activated && h.ruleset_id != *ruleset_id
  });
  next.valid_to = activated
    .clone()
    .filter(|h| h.published_at > target.published_at)
    .map(|h| h.published_at)
    .min();

  let mut updates = vec![next];
  let predecessor = activated
    .filter(|h| h.published_at <= target.published_at)
    .max_by_key(|h| (h.published_at, h.activated_at));
  if let Some(predecessor) = predecessor
    && predecessor
      .valid_to
      .is_none_or(|to| to > target.published_at)
  {
    let mut ended = predecessor.bumped();
    ended.valid_to = Some(target.published_at);
    updates.push(ended);
  }

  Ok(HeaderPlan { updates })
}

/// Plan a rollback from `current` to the earlier activated snapshot
/// `target`.
///
/// `current` becomes `Superseded`; `target` regains open-ended coverage.
/// Facts computed under `current` stay queryable by its id.
pub fn plan_rollback(
  headers: &[SnapshotHeader],
  current: &RulesetId,
  target: &RulesetId,
  now: DateTime<Utc>,
) -> Result<HeaderPlan> {
  let from = find(headers, current)?;
  let to = find(headers, target)?;
  if from.ruleset_id == to.ruleset_id {
    return Err(Error::InvalidTransition {
      from: from.status,
      to:   from.status,
    });
  }
  if to.status != SnapshotStatus::Activated {
    return Err(Error::InvalidTransition {
      from: to.status,
      to:   SnapshotStatus::Activated,
    });
  }

  let mut retired = from.bumped();
  retired.status = from.status.transition(SnapshotStatus::Superseded)?;
  retired.superseded_at = Some(now);
  retired.valid_to = Some(now);

  let mut restored = to.bumped();
  restored.valid_to = None;

  Ok(HeaderPlan {
    updates: vec![retired, restored],
  })
}

//! Shared builders for unit tests.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;

use crate::{
  rule::{EffectiveWindow, PrecedenceTier, Review, Rule},
  snapshot::{CandidateRuleset, RulesetSnapshot, SnapshotStatus},
  value::{Currency, Money},
};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
  NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub fn aud(amount: Decimal) -> Money { Money::new(amount, Currency::aud()) }

/// A reviewed rule with no parameters, published 2024-06-01.
pub fn rule(
  rule_id: &str,
  calculation: &str,
  tier: PrecedenceTier,
  from: NaiveDate,
) -> Rule {
  Rule {
    rule_id: rule_id.into(),
    version: 1,
    calculation: calculation.into(),
    tier,
    window: EffectiveWindow::open(from),
    parameters: BTreeMap::new(),
    references: vec![],
    rounding: None,
    intermediate: None,
    published_at: at(2024, 6, 1),
    review: Review::new("alice", "bob"),
  }
}

/// A snapshot forced into `status`, bypassing the lifecycle.
pub fn snapshot(
  ruleset_id: &str,
  published_at: DateTime<Utc>,
  status: SnapshotStatus,
  rules: Vec<Rule>,
) -> RulesetSnapshot {
  let mut snapshot = CandidateRuleset {
    ruleset_id: ruleset_id.into(),
    published_at,
    rules,
    references: vec![],
    assumptions: vec![],
    tie_breaks: vec![],
  }
  .into_draft(published_at);
  snapshot.header.status = status;
  if status == SnapshotStatus::Activated {
    snapshot.header.activated_at = Some(published_at);
  }
  snapshot
}

//! Engine tunables, deserialised from the `[engine]` table of the server
//! configuration. Every field has a default so the table may be omitted.

use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
  /// Upper bound on `period_index + periods` for a projection.
  pub max_horizon_periods:      u32,
  pub period_months:            u32,
  /// Absolute tolerance, in currency units, for reconciliation checks.
  pub reconciliation_tolerance: Decimal,
  pub retry:                    RetrySettings,
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      max_horizon_periods:      50,
      period_months:            12,
      reconciliation_tolerance: Decimal::new(1, 2),
      retry:                    RetrySettings::default(),
    }
  }
}

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
  pub max_attempts:  u32,
  pub base_delay_ms: u64,
  pub max_delay_ms:  u64,
}

impl Default for RetrySettings {
  fn default() -> Self {
    Self {
      max_attempts:  4,
      base_delay_ms: 25,
      max_delay_ms:  400,
    }
  }
}

impl RetrySettings {
  /// Delay before retry number `attempt` (1-based): doubling from the base,
  /// capped at the maximum.
  pub fn delay(&self, attempt: u32) -> Duration {
    let factor = 1u64
      .checked_shl(attempt.saturating_sub(1))
      .unwrap_or(u64::MAX);
    let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
    Duration::from_millis(ms)
  }
}

#[cfg(test)]
mod tests {
  use rust_decimal_macros::dec;

  use super::*;

  #[test]
  fn defaults_apply_to_missing_fields() {
    let settings: EngineSettings =
      serde_json::from_str(r#"{ "period_months": 6 }"#).unwrap();
    assert_eq!(settings.period_months, 6);
    assert_eq!(settings.max_horizon_periods, 50);
    assert_eq!(settings.reconciliation_tolerance, dec!(0.01));
    assert_eq!(settings.retry, RetrySettings::default());
  }

  #[test]
  fn backoff_doubles_and_caps() {
    let retry = RetrySettings::default();
    assert_eq!(retry.delay(1), Duration::from_millis(25));
    assert_eq!(retry.delay(2), Duration::from_millis(50));
    assert_eq!(retry.delay(4), Duration::from_millis(200));
    assert_eq!(retry.delay(5), Duration::from_millis(400));
    assert_eq!(retry.delay(80), Duration::from_millis(400));
  }
}

//! Fixed-point values with explicit unit tags.
//!
//! Monetary arithmetic never touches binary floating point. Mixing units is
//! rejected: statically for [`Money`] and [`Rate`] (there is no way to add a
//! rate to an amount), and at runtime for the dynamically tagged [`Quantity`]
//! that rule parameters, assumptions and facts carry.

use std::fmt;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{Error, Result};

// ─── Currency ────────────────────────────────────────────────────────────────

/// An ISO 4217 alphabetic currency code.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
  pub fn new(code: impl Into<String>) -> Result<Self> {
    let code = code.into();
    if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
      Ok(Self(code))
    } else {
      Err(Error::InvalidCurrency(code))
    }
  }

  pub fn aud() -> Self { Self("AUD".to_owned()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl TryFrom<String> for Currency {
  type Error = Error;

  fn try_from(code: String) -> Result<Self> { Self::new(code) }
}

impl From<Currency> for String {
  fn from(currency: Currency) -> Self { currency.0 }
}

impl fmt::Display for Currency {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// ─── Unit ────────────────────────────────────────────────────────────────────

/// The dimension of a [`Quantity`].
///
/// Percentages are stored in percent points (`30` means 30%), basis points in
/// basis points.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum Unit {
  Currency(Currency),
  Percentage,
  BasisPoints,
  Years,
  Count,
}

impl Unit {
  pub fn is_rate(&self) -> bool {
    matches!(self, Self::Percentage | Self::BasisPoints)
  }

  pub fn is_currency(&self) -> bool { matches!(self, Self::Currency(_)) }
}

impl fmt::Display for Unit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Currency(code) => write!(f, "{code}"),
      Self::Percentage => f.write_str("%"),
      Self::BasisPoints => f.write_str("bp"),
      Self::Years => f.write_str("years"),
      Self::Count => f.write_str("count"),
    }
  }
}

// ─── Quantity ────────────────────────────────────────────────────────────────

/// A decimal amount tagged with its unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Quantity {
  pub amount: Decimal,
  pub unit:   Unit,
}

impl Quantity {
  pub fn new(amount: Decimal, unit: Unit) -> Self { Self { amount, unit } }

  pub fn zero(unit: Unit) -> Self { Self::new(Decimal::ZERO, unit) }

  pub fn money(amount: Decimal, currency: Currency) -> Self {
    Self::new(amount, Unit::Currency(currency))
  }

  pub fn percent(amount: Decimal) -> Self {
    Self::new(amount, Unit::Percentage)
  }

  pub fn basis_points(amount: Decimal) -> Self {
    Self::new(amount, Unit::BasisPoints)
  }

  pub fn count(amount: Decimal) -> Self { Self::new(amount, Unit::Count) }

  fn ensure_same_unit(&self, other: &Self) -> Result<()> {
    if self.unit == other.unit {
      Ok(())
    } else {
      Err(Error::UnitMismatch {
        left:  self.unit.clone(),
        right: other.unit.clone(),
      })
    }
  }

  pub fn checked_add(&self, other: &Self) -> Result<Self> {
    self.ensure_same_unit(other)?;
    let amount = self
      .amount
      .checked_add(other.amount)
      .ok_or(Error::ArithmeticOverflow { operation: "addition" })?;
    Ok(Self::new(amount, self.unit.clone()))
  }

  pub fn checked_sub(&self, other: &Self) -> Result<Self> {
    self.ensure_same_unit(other)?;
    let amount = self
      .amount
      .checked_sub(other.amount)
      .ok_or(Error::ArithmeticOverflow {
        operation: "subtraction",
      })?;
    Ok(Self::new(amount, self.unit.clone()))
  }

  /// Reinterpret as [`Money`]; fails for non-currency units.
  pub fn to_money(&self) -> Result<Money> {
    match &self.unit {
      Unit::Currency(currency) => Ok(Money::new(self.amount, currency.clone())),
      other => Err(Error::WrongUnit {
        expected: "currency",
        found:    other.clone(),
      }),
    }
  }

  /// Reinterpret as a [`Rate`]; fails for anything but percentages and basis
  /// points.
  pub fn to_rate(&self) -> Result<Rate> {
    match self.unit {
      Unit::Percentage => Rate::from_percent(self.amount),
      Unit::BasisPoints => Rate::from_basis_points(self.amount),
      ref other => Err(Error::WrongUnit {
        expected: "rate",
        found:    other.clone(),
      }),
    }
  }

  pub fn round(&self, policy: &RoundingPolicy) -> Result<Self> {
    Ok(Self::new(policy.apply(self.amount)?, self.unit.clone()))
  }
}

impl fmt::Display for Quantity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.unit {
      Unit::Percentage => write!(f, "{}%", self.amount),
      _ => write!(f, "{} {}", self.amount, self.unit),
    }
  }
}

// ─── Money ───────────────────────────────────────────────────────────────────

/// A currency amount. Only same-currency arithmetic is expressible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
  pub amount:   Decimal,
  pub currency: Currency,
}

impl Money {
  pub fn new(amount: Decimal, currency: Currency) -> Self {
    Self { amount, currency }
  }

  pub fn zero(currency: &Currency) -> Self {
    Self::new(Decimal::ZERO, currency.clone())
  }

  fn ensure_same_currency(&self, other: &Self) -> Result<()> {
    if self.currency == other.currency {
      Ok(())
    } else {
      Err(Error::UnitMismatch {
        left:  Unit::Currency(self.currency.clone()),
        right: Unit::Currency(other.currency.clone()),
      })
    }
  }

  pub fn checked_add(&self, other: &Self) -> Result<Self> {
    self.ensure_same_currency(other)?;
    let amount = self
      .amount
      .checked_add(other.amount)
      .ok_or(Error::ArithmeticOverflow { operation: "addition" })?;
    Ok(Self::new(amount, self.currency.clone()))
  }

  pub fn checked_sub(&self, other: &Self) -> Result<Self> {
    self.ensure_same_currency(other)?;
    let amount = self
      .amount
      .checked_sub(other.amount)
      .ok_or(Error::ArithmeticOverflow {
        operation: "subtraction",
      })?;
    Ok(Self::new(amount, self.currency.clone()))
  }

  pub fn apply_rate(&self, rate: Rate) -> Result<Self> {
    let amount = self.amount.checked_mul(rate.fraction()).ok_or(
      Error::ArithmeticOverflow {
        operation: "multiplication",
      },
    )?;
    Ok(Self::new(amount, self.currency.clone()))
  }

  pub fn max(self, other: Self) -> Result<Self> {
    self.ensure_same_currency(&other)?;
    Ok(if other.amount > self.amount { other } else { self })
  }

  pub fn min(self, other: Self) -> Result<Self> {
    self.ensure_same_currency(&other)?;
    Ok(if other.amount < self.amount { other } else { self })
  }

  /// Clamp negative amounts to zero.
  pub fn floor_zero(self) -> Self {
    if self.amount.is_sign_negative() {
      Self::zero(&self.currency)
    } else {
      self
    }
  }

  pub fn is_zero(&self) -> bool { self.amount.is_zero() }

  pub fn is_negative(&self) -> bool {
    self.amount < Decimal::ZERO
  }

  pub fn round(&self, policy: &RoundingPolicy) -> Result<Self> {
    Ok(Self::new(policy.apply(self.amount)?, self.currency.clone()))
  }

  /// Sum amounts in `currency`; an empty iterator yields zero.
  pub fn sum<'a>(
    currency: &Currency,
    items: impl IntoIterator<Item = &'a Money>,
  ) -> Result<Self> {
    items
      .into_iter()
      .try_fold(Self::zero(currency), |acc, item| acc.checked_add(item))
  }
}

impl From<Money> for Quantity {
  fn from(money: Money) -> Self { Quantity::money(money.amount, money.currency) }
}

impl fmt::Display for Money {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.amount, self.currency)
  }
}

// ─── Rate ────────────────────────────────────────────────────────────────────

/// A dimensionless multiplier stored as a fraction (`0.3` for 30%).
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
)]
#[serde(transparent)]
pub struct Rate(Decimal);

impl Rate {
  pub const ZERO: Rate = Rate(Decimal::ZERO);

  pub fn from_fraction(fraction: Decimal) -> Self { Self(fraction) }

  pub fn from_percent(percent: Decimal) -> Result<Self> {
    percent
      .checked_div(Decimal::ONE_HUNDRED)
      .map(Self)
      .ok_or(Error::ArithmeticOverflow { operation: "division" })
  }

  pub fn from_basis_points(bp: Decimal) -> Result<Self> {
    bp.checked_div(Decimal::from(10_000))
      .map(Self)
      .ok_or(Error::ArithmeticOverflow { operation: "division" })
  }

  pub fn fraction(self) -> Decimal { self.0 }

  /// The rate expressed in percent points, normalised.
  pub fn as_percent(self) -> Decimal {
    (self.0 * Decimal::ONE_HUNDRED).normalize()
  }
}

impl fmt::Display for Rate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}%", self.as_percent())
  }
}

// ─── Rounding ────────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Default,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RoundingMode {
  /// Ties away from zero.
  #[default]
  HalfUp,
  /// Ties to the even neighbour (banker's rounding).
  HalfEven,
  /// Toward zero.
  Down,
  /// Away from zero.
  Up,
}

impl RoundingMode {
  fn strategy(self) -> RoundingStrategy {
    match self {
      Self::HalfUp => RoundingStrategy::MidpointAwayFromZero,
      Self::HalfEven => RoundingStrategy::MidpointNearestEven,
      Self::Down => RoundingStrategy::ToZero,
      Self::Up => RoundingStrategy::AwayFromZero,
    }
  }
}

/// Where rounding happens when a value is assembled from components.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Default,
  Serialize,
  Deserialize,
  Display,
  EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Checkpoint {
  /// Sum at full precision, round once.
  #[default]
  Final,
  /// Round each component, then sum.
  PerComponent,
}

/// An explicit rounding rule: increment, tie-breaking mode and checkpoint.
///
/// `increment: None` disables rounding (used for percentages).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundingPolicy {
  pub increment:  Option<Decimal>,
  #[serde(default)]
  pub mode:       RoundingMode,
  #[serde(default)]
  pub checkpoint: Checkpoint,
}

impl Default for RoundingPolicy {
  fn default() -> Self { Self::cents() }
}

impl RoundingPolicy {
  pub fn cents() -> Self {
    Self {
      increment:  Some(Decimal::new(1, 2)),
      mode:       RoundingMode::HalfUp,
      checkpoint: Checkpoint::Final,
    }
  }

  pub fn whole_units() -> Self {
    Self {
      increment: Some(Decimal::ONE),
      ..Self::cents()
    }
  }

  pub fn none() -> Self {
    Self {
      increment: None,
      ..Self::cents()
    }
  }

  pub fn with_mode(self, mode: RoundingMode) -> Self { Self { mode, ..self } }

  pub fn per_component(self) -> Self {
    Self {
      checkpoint: Checkpoint::PerComponent,
      ..self
    }
  }

  pub fn is_none(&self) -> bool { self.increment.is_none() }

  /// Round `amount` to a multiple of the increment.
  pub fn apply(&self, amount: Decimal) -> Result<Decimal> {
    let Some(increment) = self.increment else {
      return Ok(amount);
    };
    if increment <= Decimal::ZERO {
      return Err(Error::InvalidRounding(format!(
        "increment {increment} must be positive"
      )));
    }
    let steps = amount
      .checked_div(increment)
      .ok_or(Error::ArithmeticOverflow {
        operation: "rounding",
      })?;
    steps
      .round_dp_with_strategy(0, self.mode.strategy())
      .checked_mul(increment)
      .ok_or(Error::ArithmeticOverflow {
        operation: "rounding",
      })
  }
}

/// Sum `components` in `unit`, honouring the policy's checkpoint.
pub fn sum_rounded(
  components: &[Quantity],
  unit: &Unit,
  policy: &RoundingPolicy,
) -> Result<Quantity> {
  let mut total = Quantity::zero(unit.clone());
  for component in components {
    let component = match policy.checkpoint {
      Checkpoint::PerComponent => component.round(policy)?,
      Checkpoint::Final => component.clone(),
    };
    total = total.checked_add(&component)?;
  }
  total.round(policy)
}

#[cfg(test)]
mod tests {
  use proptest::prelude::*;
  use rust_decimal_macros::dec;

  use super::*;

  fn aud(amount: Decimal) -> Money { Money::new(amount, Currency::aud()) }

  #[test]
  fn currency_codes_are_validated() {
    assert!(Currency::new("AUD").is_ok());
    assert!(matches!(Currency::new("aud"), Err(Error::InvalidCurrency(_))));
    assert!(matches!(Currency::new("AUDD"), Err(Error::InvalidCurrency(_))));
  }

  #[test]
  fn half_up_and_half_even_differ_on_ties() {
    let half_up = RoundingPolicy::cents();
    let half_even = RoundingPolicy::cents().with_mode(RoundingMode::HalfEven);
    assert_eq!(half_up.apply(dec!(2.345)).unwrap(), dec!(2.35));
    assert_eq!(half_even.apply(dec!(2.345)).unwrap(), dec!(2.34));
    assert_eq!(half_even.apply(dec!(2.355)).unwrap(), dec!(2.36));
    assert_eq!(half_up.apply(dec!(-2.345)).unwrap(), dec!(-2.35));
  }

  #[test]
  fn directed_modes() {
    let down = RoundingPolicy::cents().with_mode(RoundingMode::Down);
    let up = RoundingPolicy::cents().with_mode(RoundingMode::Up);
    assert_eq!(down.apply(dec!(-2.349)).unwrap(), dec!(-2.34));
    assert_eq!(up.apply(dec!(2.341)).unwrap(), dec!(2.35));
  }

  #[test]
  fn whole_unit_increment() {
    let policy = RoundingPolicy::whole_units();
    assert_eq!(policy.apply(dec!(27499.50)).unwrap(), dec!(27500));
    assert_eq!(policy.apply(dec!(27499.49)).unwrap(), dec!(27499));
  }

  #[test]
  fn no_rounding_is_identity() {
    assert_eq!(
      RoundingPolicy::none().apply(dec!(1.23456789)).unwrap(),
      dec!(1.23456789)
    );
  }

  #[test]
  fn non_positive_increment_is_rejected() {
    let policy = RoundingPolicy {
      increment: Some(Decimal::ZERO),
      ..RoundingPolicy::cents()
    };
    assert!(matches!(
      policy.apply(dec!(1)),
      Err(Error::InvalidRounding(_))
    ));
  }

  #[test]
  fn mixed_currency_arithmetic_is_rejected() {
    let usd = Money::new(dec!(1), Currency::new("USD").unwrap());
    let err = aud(dec!(1)).checked_add(&usd).unwrap_err();
    assert!(matches!(err, Error::UnitMismatch { .. }));
  }

  #[test]
  fn percentage_and_currency_quantities_do_not_add() {
    let pct = Quantity::percent(dec!(30));
    let amount: Quantity = aud(dec!(100)).into();
    assert!(matches!(
      pct.checked_add(&amount),
      Err(Error::UnitMismatch { .. })
    ));
    assert!(matches!(pct.to_money(), Err(Error::WrongUnit { .. })));
    assert!(matches!(amount.to_rate(), Err(Error::WrongUnit { .. })));
  }

  #[test]
  fn rates_from_percent_and_basis_points() {
    let income = aud(dec!(1000));
    let pct = Quantity::percent(dec!(2)).to_rate().unwrap();
    let bp = Quantity::basis_points(dec!(200)).to_rate().unwrap();
    assert_eq!(pct, bp);
    assert_eq!(income.apply_rate(pct).unwrap().amount, dec!(20));
    assert_eq!(pct.to_string(), "2%");
  }

  #[test]
  fn floor_zero_clamps_negative_amounts() {
    assert!(aud(dec!(-5)).floor_zero().is_zero());
    assert_eq!(aud(dec!(5)).floor_zero().amount, dec!(5));
  }

  #[test]
  fn per_component_checkpoint_rounds_each_part() {
    let unit = Unit::Currency(Currency::aud());
    let parts = [
      Quantity::money(dec!(0.004), Currency::aud()),
      Quantity::money(dec!(0.004), Currency::aud()),
    ];
    let final_only = sum_rounded(&parts, &unit, &RoundingPolicy::cents());
    let each =
      sum_rounded(&parts, &unit, &RoundingPolicy::cents().per_component());
    assert_eq!(final_only.unwrap().amount, dec!(0.01));
    assert_eq!(each.unwrap().amount, dec!(0.00));
  }

  #[test]
  fn decimal_serializes_as_string() {
    let json = serde_json::to_value(aud(dec!(13288.00))).unwrap();
    assert_eq!(json["amount"], "13288.00");
    assert_eq!(json["currency"], "AUD");
  }

  fn amounts() -> impl Strategy<Value = Vec<Decimal>> {
    proptest::collection::vec(
      (-1_000_000_000i64..1_000_000_000).prop_map(|v| Decimal::new(v, 4)),
      1..24,
    )
  }

  proptest! {
    #[test]
    fn rounding_is_idempotent(v in -1_000_000_000i64..1_000_000_000) {
      let policy = RoundingPolicy::cents();
      let once = policy.apply(Decimal::new(v, 4)).unwrap();
      prop_assert_eq!(policy.apply(once).unwrap(), once);
    }

    #[test]
    fn rounding_moves_at_most_half_an_increment(
      v in -1_000_000_000i64..1_000_000_000,
    ) {
      let amount = Decimal::new(v, 4);
      let rounded = RoundingPolicy::cents().apply(amount).unwrap();
      prop_assert!((rounded - amount).abs() <= dec!(0.005));
    }

    #[test]
    fn final_and_per_component_sums_stay_close(values in amounts()) {
      let unit = Unit::Currency(Currency::aud());
      let parts: Vec<Quantity> = values
        .iter()
        .map(|v| Quantity::money(*v, Currency::aud()))
        .collect();
      let once = sum_rounded(&parts, &unit, &RoundingPolicy::cents()).unwrap();
      let each = sum_rounded(
        &parts,
        &unit,
        &RoundingPolicy::cents().per_component(),
      )
      .unwrap();
      let bound = dec!(0.005) * Decimal::from(parts.len() + 1);
      prop_assert!((once.amount - each.amount).abs() <= bound);
    }

    #[test]
    fn two_components_differ_by_at_most_one_minor_unit(
      a in -1_000_000_000i64..1_000_000_000,
      b in -1_000_000_000i64..1_000_000_000,
    ) {
      let unit = Unit::Currency(Currency::aud());
      let parts = [
        Quantity::money(Decimal::new(a, 4), Currency::aud()),
        Quantity::money(Decimal::new(b, 4), Currency::aud()),
      ];
      let once = sum_rounded(&parts, &unit, &RoundingPolicy::cents()).unwrap();
      let each = sum_rounded(
        &parts,
        &unit,
        &RoundingPolicy::cents().per_component(),
      )
      .unwrap();
      prop_assert!((once.amount - each.amount).abs() <= dec!(0.01));
    }
  }
}

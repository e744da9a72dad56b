//! Reference calculation units.
//!
//! A small personal-tax and superannuation catalog: enough to exercise
//! progressive schedules, thresholds, phase-outs, caps, household totals and
//! carried-forward balances. Every figure comes from the governing rule's
//! parameters; nothing is hard-coded here except the shape of each formula.
//! [`sample_ruleset`] provides a ruleset these units evaluate against.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

use crate::{
  CalcId, EvalError, Result, RulesetId,
  digest::digest_parts,
  reconcile::Check,
  rule::{
    Assumption, AssumptionScope, Bracket, EffectiveWindow, ParamValue,
    PrecedenceTier, RecordKey, Reference, Review, Rule, progressive,
  },
  snapshot::CandidateRuleset,
  state::{
    CalculationState, CashflowKind, Direction, Entity, EntityKind,
    PositionKind, Residency,
  },
  unit::{CalculationUnit, Registry, Scope, UnitContext},
  value::{
    Currency, Money, Quantity, Rate, RoundingMode, RoundingPolicy,
  },
};

pub const TAXABLE_INCOME: &str = "pit.taxable_income";
pub const INCOME_TAX: &str = "pit.income_tax";
pub const MEDICARE_LEVY: &str = "pit.medicare_levy";
pub const OFFSETS: &str = "pit.offsets";
pub const NET_TAX: &str = "pit.net_tax";
pub const CONCESSIONAL_TOTAL: &str = "sup.concessional_total";
pub const CONCESSIONAL_CAP: &str = "sup.concessional_cap";
pub const CONTRIBUTIONS_TAX: &str = "sup.contributions_tax";
pub const CLOSING_BALANCE: &str = "sup.closing_balance";
pub const NET_FLOW: &str = "cash.net_flow";
pub const HOUSEHOLD_NET_TAX: &str = "hh.net_tax";

/// Assumption key for the annual return on superannuation balances.
pub const SUPER_RETURN: &str = "super_return_rate";

const CONCESSIONAL_KINDS: [CashflowKind; 3] = [
  CashflowKind::EmployerContribution,
  CashflowKind::SalarySacrifice,
  CashflowKind::PersonalDeductibleContribution,
];

fn is_person(entity: Option<&Entity>) -> bool {
  entity.is_some_and(|e| e.kind == EntityKind::Person)
}

// ─── Personal income tax ─────────────────────────────────────────────────────

/// Assessable income less salary sacrifice and deductions, floored at zero.
pub struct TaxableIncome;

impl CalculationUnit for TaxableIncome {
  fn id(&self) -> CalcId { TAXABLE_INCOME.into() }

  fn applies_to(&self, _: &CalculationState, entity: Option<&Entity>) -> bool {
    is_person(entity)
  }

  fn evaluate(&self, ctx: &mut UnitContext<'_>) -> Result<Quantity, EvalError> {
    let flows = ctx.all_cashflows()?;
    let income: Vec<Money> = flows
      .iter()
      .filter(|(kind, _)| kind.direction() == Direction::Inflow)
      .map(|(_, amount)| amount.clone())
      .collect();
    let deductible: Vec<Money> = flows
      .iter()
      .filter(|(kind, _)| {
        matches!(
          kind,
          CashflowKind::SalarySacrifice
            | CashflowKind::PersonalDeductibleContribution
            | CashflowKind::Deduction
        )
      })
      .map(|(_, amount)| amount.clone())
      .collect();

    let assessable = ctx.sum("assessable_income", &income)?;
    let deductions = ctx.sum("deductions", &deductible)?;
    let taxable = assessable.checked_sub(&deductions)?;
    if taxable.is_negative() {
      ctx.note(
        "deductions",
        format!("deductions {deductions} exceed assessable income {assessable}"),
      );
    }
    Ok(taxable.floor_zero().into())
  }
}

/// Tax on taxable income under the rule's progressive `brackets`, or a flat
/// `rate` when the rule declares no schedule.
pub struct IncomeTax;

impl CalculationUnit for IncomeTax {
  fn id(&self) -> CalcId { INCOME_TAX.into() }

  fn depends_on(&self) -> Vec<CalcId> { vec![TAXABLE_INCOME.into()] }

  fn applies_to(&self, _: &CalculationState, entity: Option<&Entity>) -> bool {
    is_person(entity)
  }

  fn evaluate(&self, ctx: &mut UnitContext<'_>) -> Result<Quantity, EvalError> {
    let taxable = ctx.dependency(TAXABLE_INCOME)?;
    let entity_id = ctx.entity_id()?;
    let non_resident = ctx
      .state()
      .entity(entity_id)
      .is_some_and(|e| e.residency == Residency::NonResident);

    let schedule = if non_resident && ctx.has_param("non_resident_brackets") {
      ctx.decision("brackets", "non-resident schedule applied");
      Some("non_resident_brackets")
    } else if ctx.has_param("brackets") {
      Some("brackets")
    } else {
      None
    };

    match schedule {
      Some(name) => {
        let brackets = ctx.schedule(name)?;
        let outcome = progressive(brackets, &taxable)?;
        if let Some(index) = outcome.marginal {
          ctx.decision(
            "marginal_rate",
            format!(
              "{taxable} falls in bracket {index} with marginal rate {}",
              outcome.marginal_rate
            ),
          );
        }
        Ok(outcome.amount.into())
      }
      None => {
        let rate = ctx.rate("rate")?;
        ctx.decision("rate", format!("flat rate {rate} applied to {taxable}"));
        Ok(taxable.apply_rate(rate)?.into())
      }
    }
  }
}

/// Levy on taxable income above `threshold`, optionally shaded in at
/// `shade_in_rate` of the excess. Non-residents pay none.
pub struct MedicareLevy;

impl CalculationUnit for MedicareLevy {
  fn id(&self) -> CalcId { MEDICARE_LEVY.into() }

  fn depends_on(&self) -> Vec<CalcId> { vec![TAXABLE_INCOME.into()] }

  fn applies_to(&self, _: &CalculationState, entity: Option<&Entity>) -> bool {
    is_person(entity)
  }

  fn evaluate(&self, ctx: &mut UnitContext<'_>) -> Result<Quantity, EvalError> {
    let entity_id = ctx.entity_id()?;
    if ctx
      .state()
      .entity(entity_id)
      .is_some_and(|e| e.residency == Residency::NonResident)
    {
      ctx.decision("residency", "non-residents are exempt from the levy");
      return Ok(ctx.zero().into());
    }

    let taxable = ctx.dependency(TAXABLE_INCOME)?;
    let threshold = ctx.money("threshold")?;
    if taxable.amount <= threshold.amount {
      ctx.decision(
        "threshold",
        format!("{taxable} is at or below the threshold {threshold}"),
      );
      return Ok(ctx.zero().into());
    }

    let full = taxable.apply_rate(ctx.rate("rate")?)?;
    if ctx.has_param("shade_in_rate") {
      let excess = taxable.checked_sub(&threshold)?;
      let shaded = excess.apply_rate(ctx.rate("shade_in_rate")?)?;
      if shaded.amount < full.amount {
        ctx.decision(
          "shade_in_rate",
          format!("shade-in applies: {shaded} instead of {full}"),
        );
        return Ok(shaded.into());
      }
    }
    Ok(full.into())
  }
}

/// Low-income offset: `maximum`, reduced by `phase_out_rate` of income above
/// `phase_out_start` and, when declared, by `second_phase_rate` of income
/// above `second_phase_start`.
pub struct LowIncomeOffset;

impl CalculationUnit for LowIncomeOffset {
  fn id(&self) -> CalcId { OFFSETS.into() }

  fn depends_on(&self) -> Vec<CalcId> { vec![TAXABLE_INCOME.into()] }

  fn applies_to(&self, _: &CalculationState, entity: Option<&Entity>) -> bool {
    is_person(entity)
  }

  fn evaluate(&self, ctx: &mut UnitContext<'_>) -> Result<Quantity, EvalError> {
    let taxable = ctx.dependency(TAXABLE_INCOME)?;
    let maximum = ctx.money("maximum")?;
    let start = ctx.money("phase_out_start")?;
    let first_rate = ctx.rate("phase_out_rate")?;
    let second_start = if ctx.has_param("second_phase_start") {
      Some(ctx.money("second_phase_start")?)
    } else {
      None
    };

    let first_ceiling = match &second_start {
      Some(end) => taxable.clone().min(end.clone())?,
      None => taxable.clone(),
    };
    let mut reduction = first_ceiling
      .checked_sub(&start)?
      .floor_zero()
      .apply_rate(first_rate)?;
    if let Some(second_start) = &second_start
      && taxable.amount > second_start.amount
    {
      let second_rate = ctx.rate("second_phase_rate")?;
      let second = taxable.checked_sub(second_start)?.apply_rate(second_rate)?;
      reduction = reduction.checked_add(&second)?;
    }

    let offset = maximum.checked_sub(&reduction)?;
    if offset.is_negative() || offset.is_zero() {
      ctx.decision("phase_out", format!("offset fully phased out at {taxable}"));
    }
    Ok(offset.floor_zero().into())
  }
}

/// Income tax less offsets (never below zero), plus the levy, less tax
/// already withheld. Negative results are refunds.
pub struct NetTax;

impl CalculationUnit for NetTax {
  fn id(&self) -> CalcId { NET_TAX.into() }

  fn depends_on(&self) -> Vec<CalcId> {
    vec![INCOME_TAX.into(), MEDICARE_LEVY.into(), OFFSETS.into()]
  }

  fn applies_to(&self, _: &CalculationState, entity: Option<&Entity>) -> bool {
    is_person(entity)
  }

  fn evaluate(&self, ctx: &mut UnitContext<'_>) -> Result<Quantity, EvalError> {
    let tax = ctx.dependency(INCOME_TAX)?;
    let levy = ctx.dependency(MEDICARE_LEVY)?;
    let offsets = ctx.dependency(OFFSETS)?;
    let after_offsets = tax.checked_sub(&offsets)?;
    if after_offsets.is_negative() {
      ctx.note("offsets", "offsets exceed income tax; the excess is not refundable");
    }
    let liability = after_offsets.floor_zero().checked_add(&levy)?;
    let withheld = ctx.cashflow(CashflowKind::TaxWithheld)?;
    Ok(liability.checked_sub(&withheld)?.into())
  }
}

// ─── Superannuation ──────────────────────────────────────────────────────────

pub struct ConcessionalTotal;

impl CalculationUnit for ConcessionalTotal {
  fn id(&self) -> CalcId { CONCESSIONAL_TOTAL.into() }

  fn applies_to(&self, _: &CalculationState, entity: Option<&Entity>) -> bool {
    is_person(entity)
  }

  fn evaluate(&self, ctx: &mut UnitContext<'_>) -> Result<Quantity, EvalError> {
    let mut parts = Vec::with_capacity(CONCESSIONAL_KINDS.len());
    for kind in CONCESSIONAL_KINDS {
      parts.push(ctx.cashflow(kind)?);
    }
    Ok(ctx.sum("concessional_contributions", &parts)?.into())
  }
}

/// Unused concessional cap: `cap` less contributions, floored at zero and
/// rounded by the rule's intermediate policy. Excess is traced as a warning.
pub struct ConcessionalCap;

impl CalculationUnit for ConcessionalCap {
  fn id(&self) -> CalcId { CONCESSIONAL_CAP.into() }

  fn depends_on(&self) -> Vec<CalcId> { vec![CONCESSIONAL_TOTAL.into()] }

  fn applies_to(&self, _: &CalculationState, entity: Option<&Entity>) -> bool {
    is_person(entity)
  }

  fn evaluate(&self, ctx: &mut UnitContext<'_>) -> Result<Quantity, EvalError> {
    let total = ctx.dependency(CONCESSIONAL_TOTAL)?;
    let cap = ctx.money("cap")?;
    let remaining = cap.checked_sub(&total)?;
    if remaining.is_negative() {
      let excess = total.checked_sub(&cap)?;
      ctx.warn("cap", format!("concessional cap {cap} exceeded by {excess}"));
    }
    let remaining = ctx.round_intermediate("remaining", remaining.floor_zero())?;
    Ok(remaining.into())
  }
}

pub struct ContributionsTax;

impl CalculationUnit for ContributionsTax {
  fn id(&self) -> CalcId { CONTRIBUTIONS_TAX.into() }

  fn depends_on(&self) -> Vec<CalcId> { vec![CONCESSIONAL_TOTAL.into()] }

  fn applies_to(&self, _: &CalculationState, entity: Option<&Entity>) -> bool {
    is_person(entity)
  }

  fn evaluate(&self, ctx: &mut UnitContext<'_>) -> Result<Quantity, EvalError> {
    let total = ctx.dependency(CONCESSIONAL_TOTAL)?;
    let rate = ctx.rate("rate")?;
    Ok(total.apply_rate(rate)?.into())
  }
}

/// Opening accumulation balance plus net contributions and earnings. The
/// result becomes the next period's opening balance.
pub struct ClosingBalance;

impl CalculationUnit for ClosingBalance {
  fn id(&self) -> CalcId { CLOSING_BALANCE.into() }

  fn depends_on(&self) -> Vec<CalcId> {
    vec![CONCESSIONAL_TOTAL.into(), CONTRIBUTIONS_TAX.into()]
  }

  fn carry_forward(&self) -> Option<PositionKind> {
    Some(PositionKind::SuperAccumulation)
  }

  /// Members with a balance, or with contributions that need one.
  fn applies_to(&self, state: &CalculationState, entity: Option<&Entity>) -> bool {
    let Some(entity) = entity.filter(|e| e.kind == EntityKind::Person) else {
      return false;
    };
    state
      .positions_of(&entity.entity_id)
      .any(|p| p.kind == PositionKind::SuperAccumulation)
      || state.cashflows_of(&entity.entity_id).any(|c| {
        CONCESSIONAL_KINDS.contains(&c.kind)
          || c.kind == CashflowKind::NonConcessionalContribution
      })
  }

  fn evaluate(&self, ctx: &mut UnitContext<'_>) -> Result<Quantity, EvalError> {
    let opening = ctx.required_position(PositionKind::SuperAccumulation)?;
    let concessional = ctx.dependency(CONCESSIONAL_TOTAL)?;
    let tax = ctx.dependency(CONTRIBUTIONS_TAX)?;
    let non_concessional = ctx.cashflow(CashflowKind::NonConcessionalContribution)?;
    let return_rate = ctx.assumption_rate(SUPER_RETURN, Some(Rate::ZERO))?;
    let earnings =
      ctx.round_intermediate("earnings", opening.apply_rate(return_rate)?)?;

    let closing = opening
      .checked_add(&concessional)?
      .checked_sub(&tax)?
      .checked_add(&non_concessional)?
      .checked_add(&earnings)?;
    ctx.ensure(!closing.is_negative(), || {
      format!("closing balance {closing} is negative")
    })?;
    Ok(closing.into())
  }
}

// ─── Cash and household ──────────────────────────────────────────────────────

/// Ledger inflows less outflows less net tax.
pub struct NetCashFlow;

impl CalculationUnit for NetCashFlow {
  fn id(&self) -> CalcId { NET_FLOW.into() }

  fn depends_on(&self) -> Vec<CalcId> { vec![NET_TAX.into()] }

  fn applies_to(&self, _: &CalculationState, entity: Option<&Entity>) -> bool {
    is_person(entity)
  }

  fn evaluate(&self, ctx: &mut UnitContext<'_>) -> Result<Quantity, EvalError> {
    let flows = ctx.all_cashflows()?;
    let by_direction = |direction: Direction| -> Vec<Money> {
      flows
        .iter()
        .filter(|(kind, _)| kind.direction() == direction)
        .map(|(_, amount)| amount.clone())
        .collect()
    };
    let inflows = ctx.sum("inflows", &by_direction(Direction::Inflow))?;
    let outflows = ctx.sum("outflows", &by_direction(Direction::Outflow))?;
    let tax = ctx.dependency(NET_TAX)?;
    Ok(inflows.checked_sub(&outflows)?.checked_sub(&tax)?.into())
  }
}

pub struct HouseholdNetTax;

impl CalculationUnit for HouseholdNetTax {
  fn id(&self) -> CalcId { HOUSEHOLD_NET_TAX.into() }

  fn scope(&self) -> Scope { Scope::Household }

  fn depends_on(&self) -> Vec<CalcId> { vec![NET_TAX.into()] }

  fn evaluate(&self, ctx: &mut UnitContext<'_>) -> Result<Quantity, EvalError> {
    let parts: Vec<Money> = ctx
      .dependency_all(NET_TAX)?
      .into_iter()
      .map(|(_, amount)| amount)
      .collect();
    Ok(ctx.sum("members", &parts)?.into())
  }
}

// ─── Registry and checks ─────────────────────────────────────────────────────

/// Every unit in this catalog.
pub fn standard_registry() -> Result<Registry> {
  let mut registry = Registry::new();
  registry.register(TaxableIncome)?;
  registry.register(IncomeTax)?;
  registry.register(MedicareLevy)?;
  registry.register(LowIncomeOffset)?;
  registry.register(NetTax)?;
  registry.register(ConcessionalTotal)?;
  registry.register(ConcessionalCap)?;
  registry.register(ContributionsTax)?;
  registry.register(ClosingBalance)?;
  registry.register(NetCashFlow)?;
  registry.register(HouseholdNetTax)?;
  Ok(registry)
}

/// Reconciliation checks that hold for the catalog's outputs.
pub fn standard_checks() -> Vec<Check> {
  vec![
    Check::Total {
      total:     HOUSEHOLD_NET_TAX.into(),
      component: NET_TAX.into(),
    },
    Check::Conservation {
      net:  NET_FLOW.into(),
      less: vec![NET_TAX.into()],
    },
    Check::CapRollForward {
      remaining: CONCESSIONAL_CAP.into(),
      total:     CONCESSIONAL_TOTAL.into(),
      kinds:     CONCESSIONAL_KINDS.to_vec(),
    },
  ]
}

// ─── Sample ruleset ──────────────────────────────────────────────────────────

fn dollars(amount: i64) -> ParamValue {
  ParamValue::Quantity(Quantity::money(Decimal::from(amount), Currency::aud()))
}

/// `mantissa × 10^-scale` percent.
fn percent(mantissa: i64, scale: u32) -> ParamValue {
  ParamValue::Quantity(Quantity::percent(Decimal::new(mantissa, scale)))
}

fn bracket(threshold: i64, percent: i64) -> Bracket {
  Bracket {
    threshold: Money::new(Decimal::from(threshold), Currency::aud()),
    rate:      Rate::from_fraction(Decimal::new(percent, 2)),
  }
}

fn reference(id: &str, document: &str, pinpoint: &str) -> Reference {
  Reference {
    reference_id: id.to_owned(),
    version:      1,
    document:     document.to_owned(),
    pinpoint:     Some(pinpoint.to_owned()),
    checksum:     digest_parts([document, pinpoint]),
  }
}

/// A reviewed, internally consistent ruleset for the catalog, published and
/// effective at `published_at`. Rule ids are qualified by the ruleset id so
/// several sample rulesets can share one store.
pub fn sample_ruleset(
  ruleset_id: impl Into<RulesetId>,
  published_at: DateTime<Utc>,
) -> CandidateRuleset {
  let ruleset_id = ruleset_id.into();
  let from = published_at.date_naive();
  let review = Review::new("rules-author", "rules-reviewer");
  let references = vec![
    reference("itaa97-4-10", "Income Tax Assessment Act 1997", "s 4-10"),
    reference("mla86-6", "Medicare Levy Act 1986", "s 6"),
    reference("itaa97-61-115", "Income Tax Assessment Act 1997", "s 61-115"),
    reference("itaa97-291-20", "Income Tax Assessment Act 1997", "s 291-20"),
    reference("itaa97-295-160", "Income Tax Assessment Act 1997", "s 295-160"),
  ];
  let cite = |id: &str| vec![RecordKey::new(id, 1)];

  let rule = |calculation: &str,
              tier: PrecedenceTier,
              parameters: Vec<(&str, ParamValue)>,
              references: Vec<RecordKey>| Rule {
    rule_id: format!("{ruleset_id}/{calculation}"),
    version: 1,
    calculation: calculation.into(),
    tier,
    window: EffectiveWindow::open(from),
    parameters: parameters
      .into_iter()
      .map(|(name, value)| (name.to_owned(), value))
      .collect(),
    references,
    rounding: None,
    intermediate: None,
    published_at,
    review: review.clone(),
  };

  let mut cap = rule(
    CONCESSIONAL_CAP,
    PrecedenceTier::Act,
    vec![("cap", dollars(30_000))],
    cite("itaa97-291-20"),
  );
  cap.intermediate =
    Some(RoundingPolicy::whole_units().with_mode(RoundingMode::Down));

  let rules = vec![
    rule(TAXABLE_INCOME, PrecedenceTier::Act, vec![], cite("itaa97-4-10")),
    rule(
      INCOME_TAX,
      PrecedenceTier::Act,
      vec![(
        "brackets",
        ParamValue::Schedule(vec![
          bracket(0, 0),
          bracket(18_200, 16),
          bracket(45_000, 30),
          bracket(135_000, 37),
          bracket(190_000, 45),
        ]),
      )],
      cite("itaa97-4-10"),
    ),
    rule(
      MEDICARE_LEVY,
      PrecedenceTier::Act,
      vec![
        ("rate", percent(2, 0)),
        ("threshold", dollars(27_222)),
        ("shade_in_rate", percent(10, 0)),
      ],
      cite("mla86-6"),
    ),
    rule(
      OFFSETS,
      PrecedenceTier::Act,
      vec![
        ("maximum", dollars(700)),
        ("phase_out_start", dollars(37_500)),
        ("phase_out_rate", percent(5, 0)),
        ("second_phase_start", dollars(45_000)),
        ("second_phase_rate", percent(15, 1)),
      ],
      cite("itaa97-61-115"),
    ),
    rule(NET_TAX, PrecedenceTier::Act, vec![], cite("itaa97-4-10")),
    rule(
      CONCESSIONAL_TOTAL,
      PrecedenceTier::Act,
      vec![],
      cite("itaa97-291-20"),
    ),
    cap,
    rule(
      CONTRIBUTIONS_TAX,
      PrecedenceTier::Act,
      vec![("rate", percent(15, 0))],
      cite("itaa97-295-160"),
    ),
    rule(CLOSING_BALANCE, PrecedenceTier::Guidance, vec![], vec![]),
    rule(NET_FLOW, PrecedenceTier::Guidance, vec![], vec![]),
    rule(HOUSEHOLD_NET_TAX, PrecedenceTier::Guidance, vec![], vec![]),
  ];

  // Shared by every sample ruleset, so its window must not move with them.
  let returns_from = NaiveDate::from_ymd_opt(1992, 7, 1).unwrap_or(from);
  let assumptions = vec![Assumption {
    assumption_id: SUPER_RETURN.to_owned(),
    version:       1,
    value:         Quantity::percent(Decimal::from(7)),
    window:        EffectiveWindow::open(returns_from.min(from)),
    scope:         AssumptionScope::Global,
    review:        review.clone(),
  }];

  CandidateRuleset {
    ruleset_id,
    published_at,
    rules,
    references,
    assumptions,
    tie_breaks: vec![],
  }
}

//! Dependency-ordered evaluation.
//!
//! The evaluator builds a DAG over calculation units, rejects cycles, expands
//! each unit into one node per applicable entity (or a single household
//! node), and evaluates the nodes layer by layer. Nodes within a layer have
//! no dependencies on one another and run in parallel; results are merged in
//! node order so output is identical to a serial run.
//!
//! A node that fails is reported and its dependents fail with
//! [`EvalError::DependencyFailed`]; everything else still evaluates.

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::Arc,
};

use petgraph::{
  Direction,
  algo::{tarjan_scc, toposort},
  graphmap::DiGraphMap,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
  CalcId, EntityId, EvalError, RulesetId,
  fact::{Fact, FactKey, RoundingStep},
  resolve::ResolvedRuleset,
  state::CalculationState,
  trace::{TraceEntry, TraceLog},
  unit::{
    CalculationUnit, FactTable, Node, OutputKind, Registry, Scope, UnitContext,
  },
  value::{Quantity, RoundingPolicy, Unit},
};

/// A node that produced no fact, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
  pub calculation: CalcId,
  pub entity_id:   Option<EntityId>,
  pub error:       EvalError,
}

/// Everything one evaluation of one state produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRun {
  pub ruleset_id:  RulesetId,
  pub inputs_hash: String,
  pub facts:       Vec<Fact>,
  pub failures:    Vec<NodeFailure>,
  pub trace:       TraceLog,
}

impl EvaluationRun {
  pub fn fact(
    &self,
    calculation: &str,
    entity_id: Option<&str>,
  ) -> Option<&Fact> {
    self.facts.iter().find(|f| {
      f.calculation.as_str() == calculation
        && f.entity_id.as_ref().map(EntityId::as_str) == entity_id
    })
  }

  pub fn failure(
    &self,
    calculation: &str,
    entity_id: Option<&str>,
  ) -> Option<&NodeFailure> {
    self.failures.iter().find(|f| {
      f.calculation.as_str() == calculation
        && f.entity_id.as_ref().map(EntityId::as_str) == entity_id
    })
  }
}

// ─── Plan ────────────────────────────────────────────────────────────────────

struct Plan {
  units:  BTreeMap<CalcId, Arc<dyn CalculationUnit>>,
  deps:   BTreeMap<Node, Vec<Node>>,
  layers: Vec<Vec<Node>>,
}

/// Longest dependency chain below each calculation. Sources are depth 0.
fn depths(
  depends: &BTreeMap<CalcId, Vec<CalcId>>,
) -> Result<BTreeMap<CalcId, usize>, EvalError> {
  let mut graph: DiGraphMap<&CalcId, ()> = DiGraphMap::new();
  for id in depends.keys() {
    graph.add_node(id);
  }
  for (id, deps) in depends {
    for dep in deps {
      if let Some((dep, _)) = depends.get_key_value(dep) {
        graph.add_edge(dep, id, ());
      }
    }
  }
  let order = toposort(&graph, None).map_err(|cycle| {
    EvalError::CyclicDependency {
      cycle: cycle_members(&graph, cycle.node_id()),
    }
  })?;

  let mut depth: BTreeMap<CalcId, usize> = BTreeMap::new();
  for id in order {
    let d = graph
      .neighbors_directed(id, Direction::Incoming)
      .filter_map(|dep| depth.get(dep).map(|d| d + 1))
      .max()
      .unwrap_or(0);
    depth.insert(id.clone(), d);
  }
  Ok(depth)
}

fn cycle_members(graph: &DiGraphMap<&CalcId, ()>, at: &CalcId) -> Vec<CalcId> {
  let mut members: Vec<CalcId> = tarjan_scc(graph)
    .into_iter()
    .find(|component| component.contains(&at))
    .unwrap_or_default()
    .into_iter()
    .cloned()
    .collect();
  members.sort();
  members
}

// ─── Evaluator ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Evaluator {
  registry: Arc<Registry>,
}

impl Evaluator {
  pub fn new(registry: Arc<Registry>) -> Self { Self { registry } }

  pub fn registry(&self) -> &Registry { &self.registry }

  /// Build the evaluation plan. With `target`, only the nodes it
  /// transitively depends on are included; otherwise every unit with a
  /// governing rule, plus its dependencies.
  fn plan(
    &self,
    state: &CalculationState,
    resolved: &ResolvedRuleset,
    target: Option<&Node>,
  ) -> Result<Plan, EvalError> {
    let roots: Vec<CalcId> = match target {
      Some(node) => vec![node.calculation.clone()],
      None => self
        .registry
        .ids()
        .filter(|id| resolved.rule_for(id).is_some())
        .cloned()
        .collect(),
    };

    let mut units = BTreeMap::new();
    let mut stack = roots;
    while let Some(id) = stack.pop() {
      if units.contains_key(&id) {
        continue;
      }
      let unit = Arc::clone(self.registry.get(&id)?);
      stack.extend(unit.depends_on());
      units.insert(id, unit);
    }

    let depends: BTreeMap<CalcId, Vec<CalcId>> = units
      .iter()
      .map(|(id, unit)| (id.clone(), unit.depends_on()))
      .collect();
    let depth = depths(&depends)?;

    // Expand calculations into nodes.
    let mut nodes: BTreeSet<Node> = BTreeSet::new();
    for (id, unit) in &units {
      match unit.scope() {
        Scope::Entity => {
          for entity in state.entities() {
            if unit.applies_to(state, Some(entity)) {
              nodes.insert(Node::entity(id, &entity.entity_id));
            }
          }
        }
        Scope::Household => {
          if unit.applies_to(state, None) {
            nodes.insert(Node::household(id));
          }
        }
      }
    }
    if let Some(target) = target {
      nodes.insert(target.clone());
    }

    let node_deps = |node: &Node| -> Vec<Node> {
      let mut out = Vec::new();
      for dep in &depends[&node.calculation] {
        match &node.entity_id {
          Some(entity_id) => {
            let same_entity = Node::entity(dep, entity_id);
            let household = Node::household(dep);
            if nodes.contains(&same_entity) {
              out.push(same_entity);
            } else if nodes.contains(&household) {
              out.push(household);
            }
          }
          None => out.extend(
            nodes.iter().filter(|n| &n.calculation == dep).cloned(),
          ),
        }
      }
      out
    };

    let included: BTreeSet<Node> = match target {
      None => nodes.clone(),
      Some(target) => {
        let mut seen = BTreeSet::new();
        let mut stack = vec![target.clone()];
        while let Some(node) = stack.pop() {
          if seen.insert(node.clone()) {
            stack.extend(node_deps(&node));
          }
        }
        seen
      }
    };

    let mut deps = BTreeMap::new();
    let mut layers: BTreeMap<usize, Vec<Node>> = BTreeMap::new();
    for node in included {
      deps.insert(node.clone(), node_deps(&node));
      layers
        .entry(depth[&node.calculation])
        .or_default()
        .push(node);
    }

    Ok(Plan {
      units,
      deps,
      layers: layers.into_values().collect(),
    })
  }

  /// Evaluate every calculation the resolved ruleset governs.
  ///
  /// Only cycles and unknown calculations are errors; per-node failures are
  /// reported in [`EvaluationRun::failures`].
  pub fn run(
    &self,
    state: &CalculationState,
    resolved: &ResolvedRuleset,
  ) -> Result<EvaluationRun, EvalError> {
    let plan = self.plan(state, resolved, None)?;
    self.execute(&plan, state, resolved)
  }

  /// Evaluate one calculation for one entity (or the household), computing
  /// only what it depends on.
  pub fn evaluate(
    &self,
    calculation: &CalcId,
    entity_id: Option<&EntityId>,
    state: &CalculationState,
    resolved: &ResolvedRuleset,
  ) -> Result<Fact, EvalError> {
    let target = Node {
      calculation: calculation.clone(),
      entity_id:   entity_id.cloned(),
    };
    let plan = self.plan(state, resolved, Some(&target))?;
    let mut run = self.execute(&plan, state, resolved)?;
    if let Some(i) = run.facts.iter().position(|f| {
      f.calculation == target.calculation && f.entity_id == target.entity_id
    }) {
      return Ok(run.facts.swap_remove(i));
    }
    Err(
      run
        .failures
        .into_iter()
        .find(|f| {
          f.calculation == target.calculation && f.entity_id == target.entity_id
        })
        .map(|f| f.error)
        .unwrap_or(EvalError::Internal {
          message: format!("{calculation} produced neither fact nor failure"),
        }),
    )
  }

  fn execute(
    &self,
    plan: &Plan,
    state: &CalculationState,
    resolved: &ResolvedRuleset,
  ) -> Result<EvaluationRun, EvalError> {
    let period = state.period_index();
    let inputs_hash = state.inputs_hash()?;
    let mut trace = TraceLog::new();
    trace.extend(
      resolved
        .notes()
        .iter()
        .filter(|n| {
          n.calculation
            .as_ref()
            .is_none_or(|c| plan.units.contains_key(c))
        })
        .cloned(),
      period,
    );

    let mut facts = FactTable::new();
    let mut failures: BTreeMap<Node, EvalError> = BTreeMap::new();
    for layer in &plan.layers {
      let outcomes: Vec<(Result<Fact, EvalError>, Vec<TraceEntry>)> = layer
        .par_iter()
        .map(|node| {
          let unit = plan.units[&node.calculation].as_ref();
          let deps = &plan.deps[node];
          evaluate_node(
            unit,
            node,
            deps,
            state,
            resolved,
            &facts,
            &failures,
            &inputs_hash,
          )
        })
        .collect();

      for (node, (result, entries)) in layer.iter().zip(outcomes) {
        trace.extend(entries, period);
        match result {
          Ok(fact) => {
            facts.insert(node.clone(), fact);
          }
          Err(error) => {
            tracing::debug!(
              calculation = %node.calculation,
              entity = ?node.entity_id,
              %error,
              "calculation failed"
            );
            trace.push(
              TraceEntry::warning(format!("calculation failed: {error}"))
                .calculation(&node.calculation)
                .entity(node.entity_id.as_ref()),
              period,
            );
            failures.insert(node.clone(), error);
          }
        }
      }
    }

    Ok(EvaluationRun {
      ruleset_id: resolved.ruleset_id().clone(),
      inputs_hash,
      facts: facts.into_values().collect(),
      failures: failures
        .into_iter()
        .map(|(node, error)| NodeFailure {
          calculation: node.calculation,
          entity_id: node.entity_id,
          error,
        })
        .collect(),
      trace,
    })
  }
}

fn expected_unit(output: OutputKind, state: &CalculationState) -> Unit {
  match output {
    OutputKind::Currency => Unit::Currency(state.currency().clone()),
    OutputKind::Percentage => Unit::Percentage,
    OutputKind::Count => Unit::Count,
  }
}

/// Run `unit` inside `ctx` and apply the final rounding.
fn compute(
  unit: &dyn CalculationUnit,
  ctx: &mut UnitContext<'_>,
  resolved: &ResolvedRuleset,
  state: &CalculationState,
) -> Result<(Quantity, Quantity, RoundingPolicy), EvalError> {
  let rule = ctx.rule();
  ctx.provenance_mut().rule("governing-rule", rule)?;
  for key in &rule.references {
    if let Some(reference) = resolved.reference(key) {
      ctx.provenance_mut().reference("authority", reference);
    }
  }
  let raw = unit.evaluate(ctx)?;
  let expected = expected_unit(unit.output(), state);
  if raw.unit != expected {
    return Err(EvalError::UnitMismatch {
      expected: expected.to_string(),
      found:    raw.unit.to_string(),
    });
  }
  let policy = rule.rounding.unwrap_or(match unit.output() {
    OutputKind::Currency => RoundingPolicy::cents(),
    _ => RoundingPolicy::none(),
  });
  let value = raw.round(&policy)?;
  Ok((raw, value, policy))
}

#[allow(clippy::too_many_arguments)]
fn evaluate_node(
  unit: &dyn CalculationUnit,
  node: &Node,
  deps: &[Node],
  state: &CalculationState,
  resolved: &ResolvedRuleset,
  facts: &FactTable,
  failures: &BTreeMap<Node, EvalError>,
  inputs_hash: &str,
) -> (Result<Fact, EvalError>, Vec<TraceEntry>) {
  if let Some(failed) = deps.iter().find(|d| failures.contains_key(*d)) {
    let error = EvalError::DependencyFailed {
      dependency: failed.calculation.clone(),
      entity_id:  failed.entity_id.clone(),
    };
    return (Err(error), Vec::new());
  }
  let Some(rule) = resolved.rule_for(&node.calculation) else {
    let error = EvalError::NoApplicableRule {
      as_of: resolved.as_of(),
    };
    return (Err(error), Vec::new());
  };

  let mut ctx = UnitContext::new(node, state, resolved, rule, facts);
  let outcome = compute(unit, &mut ctx, resolved, state);
  let (provenance, mut rounding, mut entries) = ctx.finish();
  let (raw, value, policy) = match outcome {
    Ok(parts) => parts,
    Err(error) => return (Err(error), entries),
  };
  if !policy.is_none() {
    rounding.push(RoundingStep {
      field: "result".to_owned(),
      before: raw.amount,
      after: value.amount,
      policy,
    });
  }
  entries.push(
    TraceEntry::info(format!(
      "{} = {value} under {}@{}",
      node.calculation, rule.rule_id, rule.version
    ))
    .calculation(&node.calculation)
    .entity(node.entity_id.as_ref())
    .meta("rule_id", &rule.rule_id)
    .meta("rule_version", rule.version),
  );

  let key = FactKey {
    scenario_id:  state.scenario_id().clone(),
    ruleset_id:   resolved.ruleset_id().clone(),
    as_of:        state.as_of(),
    period_index: state.period_index(),
    calculation:  node.calculation.clone(),
    entity_id:    node.entity_id.clone(),
    inputs_hash:  inputs_hash.to_owned(),
  };
  (provenance.build(key, value, rounding), entries)
}

#[cfg(test)]
mod tests {
  use std::collections::BTreeMap;

  use rust_decimal_macros::dec;

  use super::*;
  use crate::{
    fixtures::{at, date, rule, snapshot},
    rule::{ParamValue, PrecedenceTier},
    snapshot::SnapshotStatus,
    state::CashflowKind,
    value::{Currency, Quantity},
  };

  struct Salary;

  impl CalculationUnit for Salary {
    fn id(&self) -> CalcId { "t.salary".into() }

    fn evaluate(
      &self,
      ctx: &mut UnitContext<'_>,
    ) -> Result<Quantity, EvalError> {
      Ok(ctx.required_cashflow(CashflowKind::Salary)?.into())
    }
  }

  struct Levy;

  impl CalculationUnit for Levy {
    fn id(&self) -> CalcId { "t.levy".into() }

    fn depends_on(&self) -> Vec<CalcId> { vec!["t.salary".into()] }

    fn evaluate(
      &self,
      ctx: &mut UnitContext<'_>,
    ) -> Result<Quantity, EvalError> {
      let salary = ctx.dependency("t.salary")?;
      let rate = ctx.rate("rate")?;
      Ok(salary.apply_rate(rate)?.into())
    }
  }

  struct Total;

  impl CalculationUnit for Total {
    fn id(&self) -> CalcId { "t.total".into() }

    fn scope(&self) -> Scope { Scope::Household }

    fn depends_on(&self) -> Vec<CalcId> { vec!["t.levy".into()] }

    fn evaluate(
      &self,
      ctx: &mut UnitContext<'_>,
    ) -> Result<Quantity, EvalError> {
      let parts: Vec<_> = ctx
        .dependency_all("t.levy")?
        .into_iter()
        .map(|(_, m)| m)
        .collect();
      Ok(ctx.sum("total", &parts)?.into())
    }
  }

  struct Loop(&'static str, &'static str);

  impl CalculationUnit for Loop {
    fn id(&self) -> CalcId { self.0.into() }

    fn depends_on(&self) -> Vec<CalcId> { vec![self.1.into()] }

    fn evaluate(
      &self,
      ctx: &mut UnitContext<'_>,
    ) -> Result<Quantity, EvalError> {
      Ok(ctx.zero().into())
    }
  }

  fn registry() -> Arc<Registry> {
    let mut registry = Registry::new();
    registry.register(Salary).unwrap();
    registry.register(Levy).unwrap();
    registry.register(Total).unwrap();
    Arc::new(registry)
  }

  fn resolved() -> ResolvedRuleset {
    let mut levy = rule("levy", "t.levy", PrecedenceTier::Act, date(2024, 7, 1));
    levy.parameters = BTreeMap::from([(
      "rate".to_owned(),
      ParamValue::Quantity(Quantity::percent(dec!(2.5))),
    )]);
    let s = snapshot(
      "r1",
      at(2024, 7, 1),
      SnapshotStatus::Activated,
      vec![
        rule("salary", "t.salary", PrecedenceTier::Act, date(2024, 7, 1)),
        levy,
        rule("total", "t.total", PrecedenceTier::Act, date(2024, 7, 1)),
      ],
    );
    ResolvedRuleset::new(Arc::new(s), date(2024, 9, 1))
  }

  fn state() -> CalculationState {
    CalculationState::builder("case-1", date(2024, 9, 1), Currency::aud())
      .person("alex")
      .person("blair")
      .person("casey")
      .cashflow("alex", CashflowKind::Salary, dec!(80000.10))
      .cashflow("blair", CashflowKind::Salary, dec!(60000))
      .build()
      .unwrap()
  }

  #[test]
  fn duplicate_registration_is_rejected() {
    let mut registry = Registry::new();
    registry.register(Salary).unwrap();
    assert!(registry.register(Salary).is_err());
  }

  #[test]
  fn run_isolates_failures_and_reports_the_rest() {
    let run = Evaluator::new(registry()).run(&state(), &resolved()).unwrap();

    // 80000.10 * 2.5% = 2000.0025 -> 2000.00
    let alex = run.fact("t.levy", Some("alex")).unwrap();
    assert_eq!(alex.value.amount, dec!(2000.00));
    assert_eq!(run.fact("t.levy", Some("blair")).unwrap().value.amount, dec!(1500.00));

    assert_eq!(
      run.failure("t.salary", Some("casey")).unwrap().error,
      EvalError::MissingRequiredInput {
        field: "casey.salary".into()
      }
    );
    assert!(matches!(
      run.failure("t.levy", Some("casey")).unwrap().error,
      EvalError::DependencyFailed { .. }
    ));
    assert!(matches!(
      run.failure("t.total", None).unwrap().error,
      EvalError::DependencyFailed { .. }
    ));
  }

  #[test]
  fn tied_guidance_rules_still_produce_the_fact() {
    let levy = |id: &str, rate| {
      let mut r = rule(id, "t.levy", PrecedenceTier::Guidance, date(2024, 7, 1));
      r.parameters = BTreeMap::from([(
        "rate".to_owned(),
        ParamValue::Quantity(Quantity::percent(rate)),
      )]);
      r
    };
    let mut late = levy("levy-a", dec!(1));
    late.window = crate::rule::EffectiveWindow::open(date(2024, 8, 1));
    let s = snapshot(
      "r1",
      at(2024, 8, 1),
      SnapshotStatus::Activated,
      vec![
        rule("salary", "t.salary", PrecedenceTier::Act, date(2024, 7, 1)),
        levy("levy-b", dec!(2.5)),
        late,
        rule("total", "t.total", PrecedenceTier::Act, date(2024, 7, 1)),
      ],
    );
    let resolved = ResolvedRuleset::new(Arc::new(s), date(2024, 9, 1));
    let state = CalculationState::builder("case-1", date(2024, 9, 1), Currency::aud())
      .person("alex")
      .cashflow("alex", CashflowKind::Salary, dec!(80000))
      .build()
      .unwrap();

    let run = Evaluator::new(registry()).run(&state, &resolved).unwrap();
    assert!(run.failures.is_empty(), "{:?}", run.failures);
    let fact = run.fact("t.levy", Some("alex")).unwrap();
    assert_eq!(fact.value.amount, dec!(800.00));
    assert!(fact.provenance.iter().any(|link| matches!(
      &link.target,
      crate::fact::ProvenanceTarget::Rule { rule_id, .. } if rule_id == "levy-a"
    )));

    let warnings: Vec<_> = run
      .trace
      .entries()
      .iter()
      .filter(|e| e.severity == crate::trace::Severity::Warning)
      .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].metadata["rule_id"], "levy-a");
  }

  #[test]
  fn facts_carry_provenance_and_rounding() {
    let run = Evaluator::new(registry()).run(&state(), &resolved()).unwrap();
    let levy = run.fact("t.levy", Some("alex")).unwrap();
    assert_eq!(levy.governing_rule(), Some(("levy", 1)));
    assert!(levy.parameter("rate").is_some());
    assert_eq!(levy.upstream().count(), 1);
    let step = levy.rounding.last().unwrap();
    assert_eq!(step.before, dec!(2000.0025));
    assert_eq!(step.after, dec!(2000.00));
  }

  #[test]
  fn runs_are_deterministic() {
    let evaluator = Evaluator::new(registry());
    let a = evaluator.run(&state(), &resolved()).unwrap();
    let b = evaluator.run(&state(), &resolved()).unwrap();
    assert_eq!(a, b);
    assert_eq!(
      serde_json::to_string(&a.facts).unwrap(),
      serde_json::to_string(&b.facts).unwrap()
    );
  }

  #[test]
  fn targeted_evaluation_skips_unrelated_entities() {
    let evaluator = Evaluator::new(registry());
    let fact = evaluator
      .evaluate(&"t.levy".into(), Some(&"blair".into()), &state(), &resolved())
      .unwrap();
    assert_eq!(fact.value.amount, dec!(1500.00));

    let err = evaluator
      .evaluate(&"t.levy".into(), Some(&"casey".into()), &state(), &resolved())
      .unwrap_err();
    assert!(matches!(err, EvalError::DependencyFailed { .. }));
  }

  #[test]
  fn unknown_dependency_is_fatal() {
    let mut registry = Registry::new();
    registry.register(Loop("t.a", "t.missing")).unwrap();
    let s = snapshot(
      "r1",
      at(2024, 7, 1),
      SnapshotStatus::Activated,
      vec![rule("a", "t.a", PrecedenceTier::Act, date(2024, 7, 1))],
    );
    let resolved = ResolvedRuleset::new(Arc::new(s), date(2024, 9, 1));
    let err = Evaluator::new(Arc::new(registry))
      .run(&state(), &resolved)
      .unwrap_err();
    assert_eq!(
      err,
      EvalError::UnknownCalculation {
        calculation: "t.missing".into(),
        available:   vec!["t.a".into()],
      }
    );
  }

  #[test]
  fn cycles_are_rejected_before_evaluation() {
    let mut registry = Registry::new();
    registry.register(Loop("t.a", "t.b")).unwrap();
    registry.register(Loop("t.b", "t.a")).unwrap();
    let s = snapshot(
      "r1",
      at(2024, 7, 1),
      SnapshotStatus::Activated,
      vec![rule("a", "t.a", PrecedenceTier::Act, date(2024, 7, 1))],
    );
    let resolved = ResolvedRuleset::new(Arc::new(s), date(2024, 9, 1));
    let err = Evaluator::new(Arc::new(registry))
      .run(&state(), &resolved)
      .unwrap_err();
    assert_eq!(
      err,
      EvalError::CyclicDependency {
        cycle: vec!["t.a".into(), "t.b".into()]
      }
    );
    assert!(err.is_fatal());
  }

  #[test]
  fn calculation_without_rule_is_not_applicable() {
    let s = snapshot(
      "r1",
      at(2024, 7, 1),
      SnapshotStatus::Activated,
      vec![rule("total", "t.total", PrecedenceTier::Act, date(2024, 7, 1))],
    );
    let resolved = ResolvedRuleset::new(Arc::new(s), date(2024, 9, 1));
    let run = Evaluator::new(registry()).run(&state(), &resolved).unwrap();
    assert!(matches!(
      run.failure("t.salary", Some("alex")).unwrap().error,
      EvalError::NoApplicableRule { .. }
    ));
    assert!(run.facts.is_empty());
  }
}

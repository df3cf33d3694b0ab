//! End-to-end tests for calculation runs

use pretty_assertions::assert_eq;
use ratecard::prelude::*;
use ratecard::{CalculationStep, RunMode, SnapshotCache, ANNUAL_COST, CREDITS_PER_TRANSACTION};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn snapshot(vars: &[(&str, f64)]) -> VariableSnapshot {
    VariableSnapshot::from_pairs(vars.iter().map(|(k, v)| (*k, *v))).unwrap()
}

fn registry(formulas: &[(&str, &str)]) -> FormulaRegistry {
    FormulaRegistry::from_records(formulas.iter().map(|(k, e)| FormulaRecord::new(*k, *e)))
        .unwrap()
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {}, got {}",
        expected,
        actual
    );
}

fn step_keys(trace: &Trace) -> Vec<&str> {
    trace.steps.iter().map(|s| s.formula_key.as_str()).collect()
}

fn error_kind(step: &CalculationStep) -> &str {
    step.error.as_ref().map(|e| e.kind.as_str()).unwrap_or("")
}

// === Default mode ===

#[test]
fn test_default_pipeline() {
    let vars = snapshot(&[
        ("base_credits", 40.0),
        ("complexityMultiplier", 1.2),
        ("agentMultiplier", 1.2),
        ("scenarioMultiplier", 0.8),
        ("registrationsPerDay", 100.0),
        ("workingDaysPerMonth", 22.0),
        ("credit_price_usd", 0.01),
    ]);
    let trace = CalculationPipeline::default().run_default(&vars, &FormulaRegistry::new());

    assert_eq!(trace.mode, RunMode::Default);
    assert_eq!(
        step_keys(&trace),
        vec![
            "complexity_adjusted",
            "agent_adjusted",
            "credits_per_transaction",
            "monthly_credits",
            "monthly_cost",
            "annual_cost",
        ]
    );
    assert_eq!(
        trace.steps[0].explanation,
        "Starting with base value 40, multiply by complexity multiplier 1.2 to get 48."
    );
    assert_close(trace.steps[1].result, 57.6);

    let results = &trace.final_results;
    assert_close(results.credits_per_transaction, 46.08);
    assert_close(results.monthly_credits, 101376.0);
    assert_close(results.monthly_cost, 1013.76);
    assert_close(results.annual_cost, 12165.12);
    assert!(!results.degraded);
    assert!(trace.failed_steps().next().is_none());
}

#[test]
fn test_default_pipeline_uses_literal_defaults() {
    let trace = CalculationPipeline::default().run_default(&snapshot(&[]), &FormulaRegistry::new());

    let first = &trace.steps[0];
    assert_eq!(first.inputs_used.get("base_credits"), Some(&40.0));
    assert_eq!(first.inputs_used.get("complexityMultiplier"), Some(&1.0));

    assert_close(trace.final_results.credits_per_transaction, 40.0);
    assert_close(trace.final_results.monthly_credits, 88000.0);
    assert_close(trace.final_results.monthly_cost, 880.0);
    assert_close(trace.final_results.annual_cost, 10560.0);
    assert!(!trace.final_results.degraded);
}

#[test]
fn test_default_stage_replaced_by_registry_formula() {
    let formulas = registry(&[("credits_per_transaction", "agent_adjusted * 2")]);
    let trace = CalculationPipeline::default().run_default(&snapshot(&[]), &formulas);

    let step = trace.step(CREDITS_PER_TRANSACTION).unwrap();
    assert_eq!(step.expression, "agent_adjusted * 2");
    assert_close(step.result, 80.0);
    assert_close(trace.final_results.monthly_credits, 176000.0);
    assert_close(trace.final_results.annual_cost, 21120.0);
}

#[test]
fn test_registry_stage_inputs_use_literal_defaults() {
    let formulas = registry(&[("complexity_adjusted", "base_credits * complexityMultiplier * 1.1")]);
    let trace = CalculationPipeline::default().run_default(&snapshot(&[]), &formulas);

    let step = trace.step("complexity_adjusted").unwrap();
    assert!(step.error.is_none());
    assert_eq!(step.inputs_used.get("base_credits"), Some(&40.0));
    assert_close(step.result, 44.0);
    assert_close(trace.final_results.credits_per_transaction, 44.0);
    assert!(!trace.final_results.degraded);
}

#[test]
fn test_strict_policy_after_stage_failure() {
    let formulas = registry(&[
        ("complexity_adjusted", "missing_input * 2"),
        ("agent_adjusted", "complexity_adjusted * 2"),
    ]);
    let options = PipelineOptions {
        collision_policy: CollisionPolicy::Error,
        ..PipelineOptions::default()
    };
    let trace = CalculationPipeline::new(options).run_default(&snapshot(&[]), &formulas);

    assert_eq!(error_kind(trace.step("complexity_adjusted").unwrap()), "UnresolvedIdentifier");
    let agent = trace.step("agent_adjusted").unwrap();
    assert!(agent.error.is_none());
    assert_eq!(agent.result, 0.0);
    assert_eq!(trace.final_results.degraded_reasons.len(), 1);
}

#[test]
fn test_default_stage_supplied_by_variable() {
    let vars = snapshot(&[("credits_per_transaction", 10.0)]);
    let trace = CalculationPipeline::default().run_default(&vars, &FormulaRegistry::new());

    assert!(trace.step(CREDITS_PER_TRANSACTION).is_none());
    assert_eq!(trace.steps.len(), 5);
    assert_close(trace.final_results.credits_per_transaction, 10.0);
    assert_close(trace.final_results.monthly_credits, 22000.0);
}

#[test]
fn test_default_stage_failure_degrades() {
    let formulas = registry(&[("complexity_adjusted", "missing_input * 2")]);
    let trace = CalculationPipeline::default().run_default(&snapshot(&[]), &formulas);

    let failed = trace.step("complexity_adjusted").unwrap();
    assert_eq!(error_kind(failed), "UnresolvedIdentifier");
    assert_eq!(failed.result, 0.0);

    // Later stages still run on the substituted zero
    assert!(trace.step(ANNUAL_COST).is_some());
    assert_eq!(trace.final_results.credits_per_transaction, 0.0);
    assert_eq!(trace.final_results.annual_cost, 0.0);
    assert!(trace.final_results.degraded);
    assert_eq!(trace.final_results.degraded_reasons.len(), 1);
}

// === Targeted mode ===

#[test]
fn test_targeted_dependencies_first() {
    let vars = snapshot(&[("a", 5.0)]);
    let formulas = registry(&[("b", "a * 2"), ("target", "a + b")]);
    let trace = CalculationPipeline::default().run_targeted(&["target"], &vars, &formulas);

    assert_eq!(trace.mode, RunMode::Targeted);
    assert_eq!(step_keys(&trace), vec!["b", "target"]);
    assert_eq!(trace.steps[0].result, 10.0);
    assert_eq!(trace.steps[0].step_index, 0);

    let target = &trace.steps[1];
    assert_eq!(target.step_index, 1);
    assert_eq!(target.result, 15.0);
    assert_eq!(target.inputs_used.len(), 2);
    assert_eq!(target.inputs_used["a"], 5.0);
    assert_eq!(target.inputs_used["b"], 10.0);

    let results = &trace.final_results;
    assert_close(results.credits_per_transaction, 15.0);
    assert_close(results.monthly_credits, 33000.0);
    assert_close(results.monthly_cost, 330.0);
    assert_close(results.annual_cost, 3960.0);
    assert!(!results.degraded);
}

#[test]
fn test_targeted_memoizes_shared_dependencies() {
    let vars = snapshot(&[("a", 5.0)]);
    let formulas = registry(&[("b", "a * 2"), ("c", "b + 1"), ("d", "b + c")]);
    let trace = CalculationPipeline::default().run_targeted(&["b", "c", "d"], &vars, &formulas);

    assert_eq!(step_keys(&trace), vec!["b", "c", "d"]);
    assert_eq!(trace.step("d").unwrap().result, 21.0);
}

#[test]
fn test_cycle_reported() {
    let formulas = registry(&[("a", "b + 1"), ("b", "a + 1")]);
    let trace = CalculationPipeline::default().run_targeted(&["a"], &snapshot(&[]), &formulas);

    assert_eq!(trace.steps.len(), 1);
    let step = &trace.steps[0];
    assert_eq!(step.formula_key, "a");
    assert_eq!(error_kind(step), "CyclicDependency");
    assert_eq!(
        step.error.as_ref().unwrap().message,
        "Cyclic dependency: a -> b -> a"
    );
    assert_eq!(trace.final_results.credits_per_transaction, 0.0);
    assert!(trace.final_results.degraded);
}

#[test]
fn test_unresolved_identifier_reported() {
    let formulas = registry(&[("x", "y * 2")]);
    let trace = CalculationPipeline::default().run_targeted(&["x"], &snapshot(&[]), &formulas);

    let step = trace.step("x").unwrap();
    assert_eq!(error_kind(step), "UnresolvedIdentifier");
    assert!(step.error.as_ref().unwrap().message.contains("'y'"));
    assert_eq!(step.expression, "y * 2");
}

#[test]
fn test_unknown_and_inactive_formulas() {
    let formulas = FormulaRegistry::from_records(vec![
        FormulaRecord::new("retired", "1 + 1").inactive(),
    ])
    .unwrap();
    let trace =
        CalculationPipeline::default().run_targeted(&["nope", "retired"], &snapshot(&[]), &formulas);

    assert_eq!(step_keys(&trace), vec!["nope", "retired"]);
    assert!(trace.steps.iter().all(|s| error_kind(s) == "UnknownFormula"));
}

#[test]
fn test_failure_does_not_abort_siblings() {
    let vars = snapshot(&[("a", 5.0)]);
    let formulas = registry(&[("broken", "missing + 1"), ("ok", "a * 3")]);
    let trace = CalculationPipeline::default().run_targeted(&["broken", "ok"], &vars, &formulas);

    assert_eq!(error_kind(trace.step("broken").unwrap()), "UnresolvedIdentifier");
    let ok = trace.step("ok").unwrap();
    assert!(ok.error.is_none());
    assert_eq!(ok.result, 15.0);

    assert_close(trace.final_results.credits_per_transaction, 15.0);
    assert!(trace.final_results.degraded);
}

#[test]
fn test_dependent_of_failed_formula() {
    let vars = snapshot(&[("a", 1.0)]);
    let formulas = registry(&[("zero", "a - 1"), ("ratio", "a / zero"), ("total", "ratio + 1")]);
    let trace = CalculationPipeline::default().run_targeted(&["total"], &vars, &formulas);

    assert_eq!(step_keys(&trace), vec!["zero", "ratio", "total"]);
    assert_eq!(error_kind(trace.step("ratio").unwrap()), "NonFiniteResult");
    assert_eq!(error_kind(trace.step("total").unwrap()), "Upstream");
    assert_eq!(trace.final_results.credits_per_transaction, 0.0);
    assert_eq!(trace.failed_steps().count(), 2);
}

#[test]
fn test_non_finite_step_survives_json() {
    let vars = snapshot(&[("a", 1.0)]);
    let formulas = registry(&[("zero", "a - 1"), ("ratio", "a / zero")]);
    let trace = CalculationPipeline::default().run_targeted(&["ratio"], &vars, &formulas);

    let json = trace.to_json().unwrap();
    assert!(json.contains("\"result\":\"Infinity\""), "{}", json);

    let back: Trace = serde_json::from_str(&json).unwrap();
    let ratio = back.step("ratio").unwrap();
    assert_eq!(ratio.result, f64::INFINITY);
    assert_eq!(error_kind(ratio), "NonFiniteResult");
    assert_eq!(back.steps, trace.steps);
    assert_eq!(back.final_results, trace.final_results);
}

#[test]
fn test_oversized_formula_is_a_syntax_error() {
    let long = vec!["1"; 10_000].join(" + ");
    let formulas = registry(&[("big", long.as_str()), ("small", "2 + 3")]);
    let trace =
        CalculationPipeline::default().run_targeted(&["big", "small"], &snapshot(&[]), &formulas);

    assert_eq!(error_kind(trace.step("big").unwrap()), "SyntaxError");
    assert_eq!(trace.step("small").unwrap().result, 5.0);
}

#[test]
fn test_syntax_error_reported() {
    let formulas = registry(&[("bad", "a * (b +")]);
    let trace = CalculationPipeline::default().run_targeted(&["bad"], &snapshot(&[]), &formulas);

    assert_eq!(error_kind(trace.step("bad").unwrap()), "SyntaxError");
}

#[test]
fn test_collision_policy() {
    let vars = snapshot(&[("a", 5.0), ("b", 1.0)]);
    let formulas = registry(&[("b", "a * 2"), ("target", "a + b")]);

    // The variable wins by default
    let trace = CalculationPipeline::default().run_targeted(&["target"], &vars, &formulas);
    assert_eq!(step_keys(&trace), vec!["target"]);
    assert_eq!(trace.step("target").unwrap().result, 6.0);

    let options = PipelineOptions {
        collision_policy: CollisionPolicy::Error,
        ..PipelineOptions::default()
    };
    let trace = CalculationPipeline::new(options).run_targeted(&["target"], &vars, &formulas);
    assert_eq!(error_kind(trace.step("target").unwrap()), "AmbiguousIdentifier");
}

#[test]
fn test_empty_selection_degrades() {
    let trace = CalculationPipeline::default().run_targeted::<&str>(
        &[],
        &snapshot(&[]),
        &FormulaRegistry::new(),
    );
    assert!(trace.steps.is_empty());
    assert!(trace.final_results.degraded);
}

#[test]
fn test_run_dispatches_on_request() {
    let vars = snapshot(&[("a", 5.0)]);
    let formulas = registry(&[("b", "a * 2")]);
    let pipeline = CalculationPipeline::default();

    let targeted = pipeline.run(&CalculationRequest::from_selection(["b"]), &vars, &formulas);
    assert_eq!(targeted.mode, RunMode::Targeted);

    let default = pipeline.run(&CalculationRequest::from_selection(Vec::<String>::new()), &vars, &formulas);
    assert_eq!(default.mode, RunMode::Default);
    assert_eq!(default.steps.len(), 6);
}

// === Run-level properties ===

#[test]
fn test_runs_are_deterministic() {
    let vars = snapshot(&[("a", 3.0), ("registrationsPerDay", 250.0)]);
    let formulas = registry(&[("b", "a / 7"), ("c", "b * a % 2"), ("d", "c - b")]);
    let pipeline = CalculationPipeline::default();

    let first = pipeline.run_targeted(&["d", "c"], &vars, &formulas);
    let second = pipeline.run_targeted(&["d", "c"], &vars, &formulas);
    assert_eq!(first.steps, second.steps);
    assert_eq!(first.final_results, second.final_results);
}

#[test]
fn test_concurrent_runs() {
    let vars = snapshot(&[("a", 5.0)]);
    let formulas = registry(&[("b", "a * 2"), ("target", "a + b")]);
    let pipeline = CalculationPipeline::default();
    let expected = pipeline.run_targeted(&["target"], &vars, &formulas);

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| pipeline.run_targeted(&["target"], &vars, &formulas)))
            .collect();
        for handle in handles {
            let trace = handle.join().unwrap();
            assert_eq!(trace.steps, expected.steps);
            assert_eq!(trace.final_results, expected.final_results);
        }
    });
}

#[test]
fn test_trace_json_shape() {
    let vars = snapshot(&[("a", 5.0)]);
    let formulas = registry(&[("b", "a * 2")]);
    let trace = CalculationPipeline::default().run_targeted(&["b"], &vars, &formulas);

    let value: serde_json::Value = serde_json::from_str(&trace.to_json().unwrap()).unwrap();
    assert_eq!(value["mode"], "targeted");
    assert_eq!(value["steps"][0]["formulaKey"], "b");
    assert_eq!(value["steps"][0]["inputsUsed"]["a"], 5.0);
    assert_eq!(value["finalResults"]["creditsPerTransaction"], 10.0);
    assert_eq!(value["finalResults"]["degraded"], false);
    assert!(value["executionDurationMs"].is_number());
    assert!(value["computedAt"].is_string());

    let back: Trace = serde_json::from_value(value).unwrap();
    assert_eq!(back.steps, trace.steps);
}

// === Cached snapshots ===

struct StaticSource {
    loads: Arc<AtomicUsize>,
}

impl SnapshotSource for StaticSource {
    fn load_variables(&self) -> Result<Vec<Variable>, SourceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(vec![
            Variable::new("a", 5.0),
            Variable::new("unused", 1.0).inactive(),
        ])
    }

    fn load_formulas(&self) -> Result<Vec<FormulaRecord>, SourceError> {
        Ok(vec![
            FormulaRecord::new("b", "a * 2"),
            FormulaRecord::new("target", "a + b").with_name("Target"),
        ])
    }
}

#[test]
fn test_run_cached() {
    let loads = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(SnapshotCache::new(
        StaticSource {
            loads: Arc::clone(&loads),
        },
        Duration::from_secs(60),
    ));
    let pipeline = CalculationPipeline::with_cache(PipelineOptions::default(), Arc::clone(&cache));

    let request = CalculationRequest::from_selection(["target"]);
    let first = pipeline.run_cached(&request).unwrap();
    let second = pipeline.run_cached(&request).unwrap();

    assert_eq!(first.step("target").unwrap().formula_name, "Target");
    assert_eq!(first.steps, second.steps);
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    cache.invalidate();
    pipeline.run_cached(&request).unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 2);
}

//! Calculation pipeline
//!
//! Runs formulas from a [`FormulaRegistry`] against a [`VariableSnapshot`] and
//! records a [`Trace`] of every step. Two modes:
//!
//! - **Targeted**: evaluate caller-selected formulas in order, then derive the
//!   headline metrics from the last one as the per-transaction credit figure.
//! - **Default**: run the built-in stage sequence (complexity, agent and
//!   scenario multipliers, monthly volume, cost, annualized cost). A registry
//!   formula with a stage's key replaces that stage. Stage inputs missing from
//!   the snapshot fall back to literal defaults.
//!
//! A failure never aborts the run: the failing formula's step carries the
//! error, zero stands in for its value and the final results are flagged as
//! degraded.
//!
//! # Example
//!
//! ```rust
//! use ratecard::prelude::*;
//!
//! let snapshot = VariableSnapshot::from_pairs(vec![
//!     ("base_credits", 40.0),
//!     ("complexityMultiplier", 1.2),
//!     ("agentMultiplier", 1.2),
//!     ("scenarioMultiplier", 0.8),
//! ])
//! .unwrap();
//!
//! let pipeline = CalculationPipeline::new(PipelineOptions::default());
//! let trace = pipeline.run_default(&snapshot, &FormulaRegistry::new());
//!
//! assert_eq!(trace.final_results.credits_per_transaction, 46.08);
//! assert_eq!(trace.final_results.monthly_cost, 1013.76);
//! ```

use crate::cache::{CacheError, SnapshotCache};
use crate::explain::{explain_failure, label_for, synthesize};
use crate::trace::{CalculationStep, FinalResults, RunMode, StepError, Trace, TraceRecorder};
use once_cell::sync::Lazy;
use ratecard_core::VariableSnapshot;
use ratecard_formula::{
    evaluate, parse_expression, BindingOrigin, CollisionPolicy, EvaluationContext, Expr,
    FormulaError, FormulaOutcome, FormulaRegistry, FormulaResult, ResolveOptions, Resolver,
    DEFAULT_MAX_DEPTH,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Stage key: base credits after the complexity multiplier
pub const COMPLEXITY_ADJUSTED: &str = "complexity_adjusted";
/// Stage key: after the agent multiplier
pub const AGENT_ADJUSTED: &str = "agent_adjusted";
/// Stage key: after the scenario multiplier
pub const CREDITS_PER_TRANSACTION: &str = "credits_per_transaction";
/// Stage key: credits per month at the configured volume
pub const MONTHLY_CREDITS: &str = "monthly_credits";
/// Stage key: monthly credits converted to currency
pub const MONTHLY_COST: &str = "monthly_cost";
/// Stage key: monthly cost over a year
pub const ANNUAL_COST: &str = "annual_cost";

const STAGE_SOURCES: [(&str, &str); 6] = [
    (COMPLEXITY_ADJUSTED, "base_credits * complexityMultiplier"),
    (AGENT_ADJUSTED, "complexity_adjusted * agentMultiplier"),
    (CREDITS_PER_TRANSACTION, "agent_adjusted * scenarioMultiplier"),
    (
        MONTHLY_CREDITS,
        "credits_per_transaction * registrationsPerDay * workingDaysPerMonth",
    ),
    (MONTHLY_COST, "monthly_credits * credit_price_usd"),
    (ANNUAL_COST, "monthly_cost * monthsPerYear"),
];

/// A built-in default-mode stage
struct DefaultStage {
    key: &'static str,
    expression: &'static str,
    parsed: FormulaResult<Expr>,
}

static DEFAULT_STAGES: Lazy<Vec<DefaultStage>> = Lazy::new(|| {
    STAGE_SOURCES
        .iter()
        .map(|&(key, expression)| DefaultStage {
            key,
            expression,
            parsed: parse_expression(expression),
        })
        .collect()
});

/// Literal fallbacks for default-mode stage inputs
pub fn default_inputs() -> BTreeMap<String, f64> {
    [
        ("base_credits", 40.0),
        ("complexityMultiplier", 1.0),
        ("agentMultiplier", 1.0),
        ("scenarioMultiplier", 1.0),
        ("registrationsPerDay", 100.0),
        ("workingDaysPerMonth", 22.0),
        ("credit_price_usd", 0.01),
        ("monthsPerYear", 12.0),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Keys the headline metrics are derived from in targeted mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadlineKeys {
    /// Transactions per day
    pub volume_per_day_key: String,
    /// Working days per month
    pub working_days_key: String,
    /// Currency per credit
    pub unit_price_key: String,
    /// Months per year
    pub months_per_year_key: String,
}

impl Default for HeadlineKeys {
    fn default() -> Self {
        Self {
            volume_per_day_key: "registrationsPerDay".to_string(),
            working_days_key: "workingDaysPerMonth".to_string(),
            unit_price_key: "credit_price_usd".to_string(),
            months_per_year_key: "monthsPerYear".to_string(),
        }
    }
}

/// Decimal places used when reporting numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Precision {
    /// Step results, inputs and credit figures (default: 4)
    pub intermediate_places: u32,
    /// Currency figures (default: 2)
    pub currency_places: u32,
}

impl Default for Precision {
    fn default() -> Self {
        Self {
            intermediate_places: 4,
            currency_places: 2,
        }
    }
}

/// Options for calculation runs
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes. A `defaults` table given in JSON replaces the built-in one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Most formulas on one dependency path (default: 64)
    pub max_depth: usize,
    /// Variable/formula key collisions (default: variable wins)
    pub collision_policy: CollisionPolicy,
    /// Headline metric inputs for targeted runs
    pub headline: HeadlineKeys,
    /// Literal fallbacks for inputs missing from the snapshot
    pub defaults: BTreeMap<String, f64>,
    /// Reporting precision
    pub precision: Precision,
    /// Snapshot cache time-to-live in seconds (default: 30)
    pub cache_ttl_secs: u64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            collision_policy: CollisionPolicy::default(),
            headline: HeadlineKeys::default(),
            defaults: default_inputs(),
            precision: Precision::default(),
            cache_ttl_secs: 30,
        }
    }
}

impl PipelineOptions {
    /// Parse options from JSON
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// The resolver's share of these options
    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            max_depth: self.max_depth,
            collision_policy: self.collision_policy,
        }
    }
}

/// What a caller asks the pipeline to compute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum CalculationRequest {
    /// Evaluate these formulas, in this order
    Targeted {
        #[serde(rename = "formulaKeys")]
        formula_keys: Vec<String>,
    },
    /// Run the built-in stage sequence
    Default,
}

impl CalculationRequest {
    /// Targeted when anything is selected, default otherwise
    pub fn from_selection<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let formula_keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if formula_keys.is_empty() {
            CalculationRequest::Default
        } else {
            CalculationRequest::Targeted { formula_keys }
        }
    }
}

/// Orchestrates calculation runs
///
/// Holds no per-run state; one pipeline can serve concurrent runs.
#[derive(Debug, Clone, Default)]
pub struct CalculationPipeline {
    options: PipelineOptions,
    cache: Option<Arc<SnapshotCache>>,
}

impl CalculationPipeline {
    /// Create a pipeline that is always handed its snapshot
    pub fn new(options: PipelineOptions) -> Self {
        Self {
            options,
            cache: None,
        }
    }

    /// Create a pipeline that can load snapshots through `cache`
    pub fn with_cache(options: PipelineOptions, cache: Arc<SnapshotCache>) -> Self {
        Self {
            options,
            cache: Some(cache),
        }
    }

    /// The options runs use
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// The snapshot cache, if any
    pub fn cache(&self) -> Option<&Arc<SnapshotCache>> {
        self.cache.as_ref()
    }

    /// Run `request` against the given snapshot and registry
    pub fn run(
        &self,
        request: &CalculationRequest,
        snapshot: &VariableSnapshot,
        registry: &FormulaRegistry,
    ) -> Trace {
        match request {
            CalculationRequest::Targeted { formula_keys } => {
                self.run_targeted(formula_keys, snapshot, registry)
            }
            CalculationRequest::Default => self.run_default(snapshot, registry),
        }
    }

    /// Run `request` against the cached snapshot, loading it if stale
    pub fn run_cached(&self, request: &CalculationRequest) -> Result<Trace, CacheError> {
        let cache = self.cache.as_ref().ok_or(CacheError::NotConfigured)?;
        let bundle = cache.load()?;
        Ok(self.run(request, &bundle.variables, &bundle.registry))
    }

    /// Evaluate `keys` in order; the last one is the per-transaction figure
    pub fn run_targeted<S: AsRef<str>>(
        &self,
        keys: &[S],
        snapshot: &VariableSnapshot,
        registry: &FormulaRegistry,
    ) -> Trace {
        let mut engine = CalculationEngine::new(&self.options, snapshot, registry, RunMode::Targeted);

        let mut per_unit = None;
        for key in keys {
            let value = engine.resolve_formula(key.as_ref()).unwrap_or(0.0);
            per_unit = Some(value);
        }

        let per_unit = match per_unit {
            Some(value) => value,
            None => {
                engine.degrade("no formula selected".to_string());
                0.0
            }
        };

        engine.finish_targeted(per_unit)
    }

    /// Run the built-in stage sequence
    pub fn run_default(&self, snapshot: &VariableSnapshot, registry: &FormulaRegistry) -> Trace {
        let mut engine = CalculationEngine::new(&self.options, snapshot, registry, RunMode::Default);
        for stage in DEFAULT_STAGES.iter() {
            engine.run_stage(stage);
        }
        engine.finish_default()
    }
}

/// State of a single run
struct CalculationEngine<'a> {
    options: &'a PipelineOptions,
    registry: &'a FormulaRegistry,
    resolver: Resolver<'a>,
    ctx: EvaluationContext,
    recorder: TraceRecorder,
    degraded_reasons: Vec<String>,
}

impl<'a> CalculationEngine<'a> {
    fn new(
        options: &'a PipelineOptions,
        snapshot: &VariableSnapshot,
        registry: &'a FormulaRegistry,
        mode: RunMode,
    ) -> Self {
        for key in registry.collisions(snapshot) {
            tracing::warn!(key, policy = ?options.collision_policy, "variable and formula share a key");
        }

        Self {
            options,
            registry,
            resolver: Resolver::new(registry, options.resolve_options()),
            ctx: EvaluationContext::from_snapshot(snapshot),
            recorder: TraceRecorder::for_mode(options.precision, mode),
            degraded_reasons: Vec::new(),
        }
    }

    fn degrade(&mut self, reason: String) {
        tracing::debug!(%reason, "run degraded");
        self.degraded_reasons.push(reason);
    }

    /// Resolve a registry formula, recording a step for everything evaluated
    fn resolve_formula(&mut self, key: &str) -> FormulaResult<f64> {
        let registry = self.registry;
        let recorder = &mut self.recorder;
        let reasons = &mut self.degraded_reasons;

        let result = self.resolver.resolve_into(key, &mut self.ctx, |outcome| {
            if let Some(err) = &outcome.error {
                reasons.push(format!("{}: {}", outcome.key, err));
            }
            recorder.record(step_from_outcome(registry, outcome));
        });

        if let Err(err) = &result {
            // Planning failures evaluate nothing, so nothing was recorded yet
            if !self.recorder.contains(key) {
                let expression = registry
                    .get(key)
                    .map(|f| f.expression.clone())
                    .unwrap_or_default();
                self.record_failure(key, expression, BTreeMap::new(), 0.0, err);
            }
        }
        result
    }

    fn record_failure(
        &mut self,
        key: &str,
        expression: String,
        inputs: BTreeMap<String, f64>,
        value: f64,
        err: &FormulaError,
    ) {
        self.degrade(format!("{}: {}", key, err));
        self.recorder.record(CalculationStep {
            step_index: 0,
            formula_key: key.to_string(),
            formula_name: display_name(self.registry, key),
            expression,
            inputs_used: inputs,
            result: value,
            explanation: explain_failure(err),
            error: Some(StepError::from(err)),
        });
    }

    fn run_stage(&mut self, stage: &DefaultStage) {
        if self.ctx.is_input(stage.key) {
            tracing::debug!(stage = stage.key, "stage value supplied by a variable");
            return;
        }

        let registry = self.registry;
        if let Some(entry) = registry.get_active(stage.key) {
            tracing::debug!(stage = stage.key, "stage replaced by registry formula");
            self.bind_stage_inputs(&entry.identifiers());
            if self.resolve_formula(stage.key).is_err() {
                self.ctx.bind_default(stage.key, 0.0);
            }
            return;
        }

        let expr = match &stage.parsed {
            Ok(expr) => expr,
            Err(err) => {
                self.record_failure(stage.key, stage.expression.to_string(), BTreeMap::new(), 0.0, err);
                self.ctx.bind_default(stage.key, 0.0);
                return;
            }
        };

        let identifiers = expr.identifiers();
        self.bind_stage_inputs(&identifiers);

        let inputs = self.ctx.restrict(&identifiers);
        let result = evaluate(expr, &self.ctx).and_then(|value| {
            if !value.is_finite() {
                return Err(FormulaError::NonFiniteResult {
                    formula: stage.key.to_string(),
                    value,
                });
            }
            self.ctx.bind(stage.key, value, BindingOrigin::Formula)?;
            Ok(value)
        });

        match result {
            Ok(value) => {
                tracing::debug!(stage = stage.key, value, "evaluated stage");
                self.recorder.record(CalculationStep {
                    step_index: 0,
                    formula_key: stage.key.to_string(),
                    formula_name: label_for(stage.key),
                    expression: stage.expression.to_string(),
                    explanation: synthesize(expr, &inputs, value),
                    inputs_used: inputs,
                    result: value,
                    error: None,
                });
            }
            Err(err) => {
                tracing::warn!(stage = stage.key, error = %err, "stage failed");
                let value = match &err {
                    FormulaError::NonFiniteResult { value, .. } => *value,
                    _ => 0.0,
                };
                self.record_failure(stage.key, stage.expression.to_string(), inputs, value, &err);
                self.ctx.bind_default(stage.key, 0.0);
            }
        }
    }

    /// Settle the inputs of a stage: registry formula first, then literal default
    ///
    /// Identifiers with neither are left unbound and fail the stage.
    fn bind_stage_inputs(&mut self, identifiers: &[&str]) {
        for ident in identifiers {
            if self.ctx.contains(ident) {
                continue;
            }
            if self.registry.is_active(ident) {
                if self.resolve_formula(ident).is_err() {
                    self.ctx.bind_default(ident, 0.0);
                }
                continue;
            }
            if let Some(value) = self.options.defaults.get(*ident) {
                self.ctx.bind_default(ident, *value);
            }
        }
    }

    /// Value for a headline input: context, then literal default
    fn headline_input(&mut self, key: &str) -> f64 {
        if let Some(value) = self.ctx.get(key) {
            return value;
        }
        match self.options.defaults.get(key) {
            Some(value) => *value,
            None => {
                self.degrade(format!("{}: no value available", key));
                0.0
            }
        }
    }

    fn finish_targeted(mut self, per_unit: f64) -> Trace {
        let options = self.options;
        let headline = &options.headline;
        let volume = self.headline_input(&headline.volume_per_day_key);
        let days = self.headline_input(&headline.working_days_key);
        let price = self.headline_input(&headline.unit_price_key);
        let months = self.headline_input(&headline.months_per_year_key);

        let monthly_credits = per_unit * volume * days;
        let monthly_cost = monthly_credits * price;
        self.finish(FinalResults {
            credits_per_transaction: per_unit,
            monthly_credits,
            monthly_cost,
            annual_cost: monthly_cost * months,
            ..FinalResults::default()
        })
    }

    fn finish_default(self) -> Trace {
        let stage_value = |key: &str| self.ctx.get(key).unwrap_or(0.0);
        let results = FinalResults {
            credits_per_transaction: stage_value(CREDITS_PER_TRANSACTION),
            monthly_credits: stage_value(MONTHLY_CREDITS),
            monthly_cost: stage_value(MONTHLY_COST),
            annual_cost: stage_value(ANNUAL_COST),
            ..FinalResults::default()
        };
        self.finish(results)
    }

    fn finish(mut self, mut results: FinalResults) -> Trace {
        results.degraded = !self.degraded_reasons.is_empty();
        results.degraded_reasons = std::mem::take(&mut self.degraded_reasons);
        if results.degraded {
            tracing::warn!(
                reasons = results.degraded_reasons.len(),
                "calculation finished with substituted values"
            );
        }
        self.recorder.set_final_results(results);

        let trace = self.recorder.finalize();
        tracing::debug!(
            mode = ?trace.mode,
            steps = trace.steps.len(),
            duration_ms = trace.execution_duration_ms,
            "calculation finished"
        );
        trace
    }
}

fn display_name(registry: &FormulaRegistry, key: &str) -> String {
    registry
        .get(key)
        .map(|f| f.name.as_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| label_for(key))
}

/// Turn a resolver outcome into a trace step
fn step_from_outcome(registry: &FormulaRegistry, outcome: &FormulaOutcome) -> CalculationStep {
    let entry = registry.get_active(&outcome.key);
    let expression = entry
        .map(|e| e.formula().expression.clone())
        .unwrap_or_default();

    let explanation = match &outcome.error {
        Some(err) => explain_failure(err),
        None => {
            let description = entry
                .and_then(|e| e.formula().description.as_deref())
                .filter(|d| !d.trim().is_empty());
            match (description, entry.map(|e| e.expr())) {
                (Some(description), _) => description.to_string(),
                (None, Some(Ok(expr))) => synthesize(expr, &outcome.inputs, outcome.value),
                _ => String::new(),
            }
        }
    };

    CalculationStep {
        step_index: 0,
        formula_key: outcome.key.clone(),
        formula_name: display_name(registry, &outcome.key),
        expression,
        inputs_used: outcome.inputs.clone(),
        result: outcome.value,
        explanation,
        error: outcome.error.as_ref().map(StepError::from),
    }
}

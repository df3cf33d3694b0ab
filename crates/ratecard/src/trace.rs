//! Calculation traces
//!
//! A [`Trace`] is what a calculation run hands back to the UI: one
//! [`CalculationStep`] per formula evaluated, in evaluation order, plus the
//! headline [`FinalResults`]. Field names serialize in camelCase and numbers
//! are rounded to a fixed number of places, since the UI renders both
//! verbatim.
//!
//! # Example
//!
//! ```rust
//! use ratecard::trace::{CalculationStep, TraceRecorder};
//! use ratecard::Precision;
//!
//! let mut recorder = TraceRecorder::new(Precision::default());
//! recorder.record(CalculationStep::new("monthly", "daily * 22", 10.0 / 3.0 * 22.0));
//! let trace = recorder.finalize();
//!
//! assert_eq!(trace.steps[0].step_index, 0);
//! assert_eq!(trace.steps[0].result, 73.3333);
//! ```

use crate::calculation::Precision;
use chrono::{DateTime, Utc};
use ratecard_formula::FormulaError;
use rust_decimal::prelude::{Decimal, FromPrimitive, ToPrimitive};
use rust_decimal::RoundingStrategy;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Instant;

/// Round to `places` decimal places, half away from zero
///
/// Non-finite values and values outside the decimal range pass through.
pub fn round_to(value: f64, places: u32) -> f64 {
    if !value.is_finite() {
        return value;
    }
    Decimal::from_f64(value)
        .map(|d| d.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero))
        .and_then(|d| d.to_f64())
        .unwrap_or(value)
}

/// Write a non-finite number as `"NaN"`, `"Infinity"` or `"-Infinity"`
///
/// JSON has no literal for these, and serde_json would write `null`.
fn serialize_number<S>(value: &f64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if value.is_finite() {
        serializer.serialize_f64(*value)
    } else if value.is_nan() {
        serializer.serialize_str("NaN")
    } else if value.is_sign_positive() {
        serializer.serialize_str("Infinity")
    } else {
        serializer.serialize_str("-Infinity")
    }
}

/// Read a number written by [`serialize_number`]
fn deserialize_number<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Finite(f64),
        Label(String),
    }

    match Number::deserialize(deserializer)? {
        Number::Finite(value) => Ok(value),
        Number::Label(label) => match label.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => Err(D::Error::custom(format!("invalid number {:?}", other))),
        },
    }
}

/// Which pipeline mode produced a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunMode {
    /// Caller-selected formulas
    Targeted,
    /// Built-in stage sequence
    Default,
}

/// Error attached to a trace step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    /// Error variant, e.g. `CyclicDependency`
    pub kind: String,
    /// Message fit for an end user
    pub message: String,
}

impl From<&FormulaError> for StepError {
    fn from(error: &FormulaError) -> Self {
        Self {
            kind: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

/// One evaluated formula
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculationStep {
    /// Position in the trace, assigned by the recorder
    pub step_index: usize,
    pub formula_key: String,
    /// Display label
    pub formula_name: String,
    pub expression: String,
    /// Values of the identifiers the formula declared, and nothing else
    pub inputs_used: BTreeMap<String, f64>,
    /// Raw value of a non-finite result is kept, written as a string label
    #[serde(serialize_with = "serialize_number", deserialize_with = "deserialize_number")]
    pub result: f64,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl CalculationStep {
    /// Create a step with no inputs and an empty explanation
    pub fn new(key: impl Into<String>, expression: impl Into<String>, result: f64) -> Self {
        let key = key.into();
        Self {
            step_index: 0,
            formula_name: key.clone(),
            formula_key: key,
            expression: expression.into(),
            inputs_used: BTreeMap::new(),
            result,
            explanation: String::new(),
            error: None,
        }
    }

    /// Whether the step failed
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Headline metrics, always present even when the run degraded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResults {
    #[serde(serialize_with = "serialize_number", deserialize_with = "deserialize_number")]
    pub credits_per_transaction: f64,
    #[serde(serialize_with = "serialize_number", deserialize_with = "deserialize_number")]
    pub monthly_credits: f64,
    #[serde(serialize_with = "serialize_number", deserialize_with = "deserialize_number")]
    pub monthly_cost: f64,
    #[serde(serialize_with = "serialize_number", deserialize_with = "deserialize_number")]
    pub annual_cost: f64,
    /// Whether any value above rests on a zero substituted for a failure
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded_reasons: Vec<String>,
}

impl FinalResults {
    /// Round every metric to its display precision
    pub fn rounded(mut self, precision: &Precision) -> Self {
        self.credits_per_transaction =
            round_to(self.credits_per_transaction, precision.intermediate_places);
        self.monthly_credits = round_to(self.monthly_credits, precision.intermediate_places);
        self.monthly_cost = round_to(self.monthly_cost, precision.currency_places);
        self.annual_cost = round_to(self.annual_cost, precision.currency_places);
        self
    }
}

/// Result of one calculation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub mode: RunMode,
    pub steps: Vec<CalculationStep>,
    pub final_results: FinalResults,
    pub execution_duration_ms: f64,
    pub computed_at: DateTime<Utc>,
}

impl Trace {
    /// Step for `formula_key`, if it was evaluated
    pub fn step(&self, formula_key: &str) -> Option<&CalculationStep> {
        self.steps.iter().find(|s| s.formula_key == formula_key)
    }

    /// Steps that carry an error
    pub fn failed_steps(&self) -> impl Iterator<Item = &CalculationStep> + '_ {
        self.steps.iter().filter(|s| s.is_error())
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Serialize to indented JSON
    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Collects steps during a run
#[derive(Debug)]
pub struct TraceRecorder {
    precision: Precision,
    mode: RunMode,
    steps: Vec<CalculationStep>,
    final_results: FinalResults,
    started: Instant,
}

impl TraceRecorder {
    /// Start recording a targeted run
    pub fn new(precision: Precision) -> Self {
        Self::for_mode(precision, RunMode::Targeted)
    }

    /// Start recording a run of the given mode
    pub fn for_mode(precision: Precision, mode: RunMode) -> Self {
        Self {
            precision,
            mode,
            steps: Vec::new(),
            final_results: FinalResults::default(),
            started: Instant::now(),
        }
    }

    /// Append a step, assigning its index and rounding its numbers
    pub fn record(&mut self, mut step: CalculationStep) {
        let places = self.precision.intermediate_places;
        step.step_index = self.steps.len();
        step.result = round_to(step.result, places);
        for value in step.inputs_used.values_mut() {
            *value = round_to(*value, places);
        }
        self.steps.push(step);
    }

    /// Whether a step for `formula_key` has been recorded
    pub fn contains(&self, formula_key: &str) -> bool {
        self.steps.iter().any(|s| s.formula_key == formula_key)
    }

    /// Steps recorded so far
    pub fn steps(&self) -> &[CalculationStep] {
        &self.steps
    }

    /// Set the headline metrics; they are rounded on the way in
    pub fn set_final_results(&mut self, results: FinalResults) {
        self.final_results = results.rounded(&self.precision);
    }

    /// Stop the clock and produce the trace
    pub fn finalize(self) -> Trace {
        let elapsed = self.started.elapsed();
        Trace {
            mode: self.mode,
            steps: self.steps,
            final_results: self.final_results,
            execution_duration_ms: round_to(elapsed.as_secs_f64() * 1000.0, 3),
            computed_at: Utc::now(),
        }
    }
}

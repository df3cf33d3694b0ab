//! # ratecard
//!
//! Formula evaluation engine for usage-based pricing.
//!
//! Admins define numeric variables (base credits, multipliers, volumes,
//! prices) and formulas over them. Ratecard resolves the formulas in
//! dependency order and returns a [`Trace`]: every intermediate step with its
//! inputs and a plain-language explanation, plus the headline cost figures.
//!
//! ## Features
//!
//! - Arithmetic expressions over named variables and other formulas
//! - Dependency resolution with cycle detection and per-run memoization
//! - Failures isolated per formula; zero substituted and flagged as degraded
//! - A built-in default pricing pipeline when no formula is selected
//! - A TTL snapshot cache in front of any storage backend
//!
//! ## Example
//!
//! ```rust
//! use ratecard::prelude::*;
//!
//! let snapshot = VariableSnapshot::from_pairs(vec![("a", 5.0)]).unwrap();
//! let registry = FormulaRegistry::from_records(vec![
//!     FormulaRecord::new("b", "a * 2"),
//!     FormulaRecord::new("target", "a + b"),
//! ])
//! .unwrap();
//!
//! let pipeline = CalculationPipeline::default();
//! let trace = pipeline.run_targeted(&["target"], &snapshot, &registry);
//!
//! let keys: Vec<&str> = trace.steps.iter().map(|s| s.formula_key.as_str()).collect();
//! assert_eq!(keys, ["b", "target"]);
//! assert_eq!(trace.final_results.credits_per_transaction, 15.0);
//! ```

pub mod cache;
pub mod calculation;
pub mod explain;
pub mod prelude;
pub mod trace;

// Re-export pipeline types
pub use calculation::{
    default_inputs, CalculationPipeline, CalculationRequest, HeadlineKeys, PipelineOptions,
    Precision, AGENT_ADJUSTED, ANNUAL_COST, COMPLEXITY_ADJUSTED, CREDITS_PER_TRANSACTION,
    MONTHLY_COST, MONTHLY_CREDITS,
};

// Re-export trace types
pub use trace::{
    round_to, CalculationStep, FinalResults, RunMode, StepError, Trace, TraceRecorder,
};

// Re-export cache types
pub use cache::{CacheError, SnapshotBundle, SnapshotCache, SnapshotSource, SourceError};

// Re-export core types
pub use ratecard_core::{
    humanize_key, is_valid_key, Error, Formula, FormulaRecord, Result, Variable, VariableSnapshot,
};

// Re-export formula types
pub use ratecard_formula::{
    evaluate, extract_identifiers, parse_expression, resolve, resolve_all, BindingOrigin,
    CollisionPolicy, EvaluationContext, Expr, FormulaError, FormulaOutcome, FormulaRegistry,
    FormulaResult, ResolveOptions, Resolver,
};

//! # ratecard-formula
//!
//! Expression parser, evaluator and dependency resolver for ratecard.
//!
//! This crate provides:
//! - Expression parsing (text → AST)
//! - Expression evaluation (AST → `f64`)
//! - A formula registry parsed once per snapshot
//! - Dependency resolution with cycle detection and per-run memoization
//!
//! ## Example
//!
//! ```rust
//! use ratecard_core::{FormulaRecord, VariableSnapshot};
//! use ratecard_formula::{EvaluationContext, FormulaRegistry, ResolveOptions, Resolver};
//!
//! let registry = FormulaRegistry::from_records(vec![
//!     FormulaRecord::new("monthly", "daily * 22"),
//!     FormulaRecord::new("annual", "monthly * 12"),
//! ])
//! .unwrap();
//! let snapshot = VariableSnapshot::from_pairs(vec![("daily", 10.0)]).unwrap();
//!
//! let mut ctx = EvaluationContext::from_snapshot(&snapshot);
//! let resolver = Resolver::new(&registry, ResolveOptions::default());
//! let annual = resolver.resolve_into("annual", &mut ctx, |_| {}).unwrap();
//! assert_eq!(annual, 2640.0);
//! ```

pub mod ast;
pub mod context;
pub mod dependency;
pub mod error;
pub mod evaluator;
pub mod parser;
pub mod registry;

pub use ast::{BinaryOperator, Expr, UnaryOperator};
pub use context::{BindingOrigin, EvaluationContext};
pub use dependency::{
    resolve, resolve_all, CollisionPolicy, FormulaOutcome, ResolveOptions, Resolver,
    DEFAULT_MAX_DEPTH,
};
pub use error::{FormulaError, FormulaResult};
pub use evaluator::{evaluate, evaluate_str, NumericContext};
pub use parser::{extract_identifiers, parse_expression};
pub use registry::{FormulaRegistry, RegisteredFormula};

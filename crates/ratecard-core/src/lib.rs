//! # ratecard-core
//!
//! Core records for the ratecard pricing engine.
//!
//! This crate provides the data the engine reads, never writes:
//! - [`Variable`] and [`VariableSnapshot`] - named numeric inputs
//! - [`FormulaRecord`] and [`Formula`] - named arithmetic expressions
//! - [`is_valid_key`] - the identifier rule shared by both
//!
//! ## Example
//!
//! ```rust
//! use ratecard_core::{Variable, VariableSnapshot};
//!
//! let snapshot = VariableSnapshot::from_records(vec![
//!     Variable::new("base_credits", 40.0),
//!     Variable::new("complexityMultiplier", 1.2),
//! ])
//! .unwrap();
//!
//! assert_eq!(snapshot.get("base_credits"), Some(40.0));
//! ```

pub mod error;
pub mod formula;
pub mod key;
pub mod variable;

// Re-exports for convenience
pub use error::{Error, Result};
pub use formula::{Formula, FormulaRecord};
pub use key::{humanize_key, is_valid_key};
pub use variable::{Variable, VariableSnapshot};

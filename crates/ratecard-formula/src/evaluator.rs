//! Expression evaluator
//!
//! Evaluates expression ASTs against a read-only [`NumericContext`]. Arithmetic
//! follows IEEE-754: division by zero yields an infinity or NaN rather than an
//! error. Callers that require finite values check the result themselves.

use crate::ast::{BinaryOperator, Expr, UnaryOperator};
use crate::error::{FormulaError, FormulaResult};
use crate::parser::parse_expression;
use ahash::AHashMap;
use ratecard_core::VariableSnapshot;
use std::collections::{BTreeMap, HashMap};

/// Anything identifiers can be looked up in
pub trait NumericContext {
    /// Value bound to `name`, if any
    fn lookup(&self, name: &str) -> Option<f64>;
}

impl<T: NumericContext + ?Sized> NumericContext for &T {
    fn lookup(&self, name: &str) -> Option<f64> {
        (**self).lookup(name)
    }
}

impl<S: std::hash::BuildHasher> NumericContext for HashMap<String, f64, S> {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }
}

impl NumericContext for AHashMap<String, f64> {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }
}

impl NumericContext for BTreeMap<String, f64> {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.get(name).copied()
    }
}

impl NumericContext for VariableSnapshot {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.get(name)
    }
}

/// Evaluate an expression
///
/// Fails with [`FormulaError::UnknownIdentifier`] for the first identifier (in
/// evaluation order) that `ctx` does not bind.
pub fn evaluate<C: NumericContext + ?Sized>(expr: &Expr, ctx: &C) -> FormulaResult<f64> {
    match expr {
        Expr::Number(n) => Ok(*n),

        Expr::Identifier { name, position } => {
            ctx.lookup(name)
                .ok_or_else(|| FormulaError::UnknownIdentifier {
                    name: name.clone(),
                    position: *position,
                })
        }

        Expr::BinaryOp { op, left, right } => evaluate_binary_op(*op, left, right, ctx),

        Expr::UnaryOp { op, operand } => {
            let value = evaluate(operand, ctx)?;
            match op {
                UnaryOperator::Negate => Ok(-value),
            }
        }
    }
}

/// Evaluate a binary operation
fn evaluate_binary_op<C: NumericContext + ?Sized>(
    op: BinaryOperator,
    left: &Expr,
    right: &Expr,
    ctx: &C,
) -> FormulaResult<f64> {
    // Left operand first, so the leftmost unknown identifier is reported
    let l = evaluate(left, ctx)?;
    let r = evaluate(right, ctx)?;
    Ok(op.apply(l, r))
}

/// Parse and evaluate an expression string in one step
///
/// # Example
/// ```rust
/// use ratecard_formula::evaluate_str;
/// use std::collections::HashMap;
///
/// let mut vars = HashMap::new();
/// vars.insert("base_credits".to_string(), 40.0);
/// vars.insert("complexityMultiplier".to_string(), 1.2);
///
/// let value = evaluate_str("base_credits * complexityMultiplier", &vars).unwrap();
/// assert!((value - 48.0).abs() < 1e-9);
/// ```
pub fn evaluate_str<C: NumericContext + ?Sized>(expression: &str, ctx: &C) -> FormulaResult<f64> {
    let expr = parse_expression(expression)?;
    evaluate(&expr, ctx)
}

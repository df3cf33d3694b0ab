//! Natural-language explanations for trace steps
//!
//! Explanations are for people reading a trace. Nothing reads them back.

use ratecard_core::humanize_key;
use ratecard_formula::{BinaryOperator, Expr, FormulaError};
use std::collections::BTreeMap;

use crate::trace::round_to;

/// Decimal places shown for numbers inside explanation text
const EXPLANATION_PLACES: u32 = 4;

/// Display label for a variable or formula key
pub fn label_for(key: &str) -> String {
    match key {
        "base_credits" => "base value".to_string(),
        _ => humanize_key(key),
    }
}

/// Format a number the way explanations print it
pub fn format_number(value: f64) -> String {
    format!("{}", round_to(value, EXPLANATION_PLACES))
}

/// Explain how `result` was computed from `expr` and the bound `inputs`
///
/// Chains of the form `x op y op z` with plain operands read as a sentence:
/// "Starting with base value 40, multiply by complexity multiplier 1.2 to get
/// 48." Anything else falls back to listing the substitutions.
pub fn synthesize(expr: &Expr, inputs: &BTreeMap<String, f64>, result: f64) -> String {
    let result = format_number(result);

    if let Some((first, rest)) = flatten_chain(expr) {
        if rest.is_empty() {
            return format!("Takes {} as is, giving {}.", describe(first, inputs), result);
        }
        let steps: Vec<String> = rest
            .iter()
            .map(|(op, operand)| format!("{} {}", verb(*op), describe(operand, inputs)))
            .collect();
        return format!(
            "Starting with {}, {} to get {}.",
            describe(first, inputs),
            steps.join(", "),
            result
        );
    }

    if inputs.is_empty() {
        return format!("Computed {} to get {}.", expr, result);
    }
    let substitutions: Vec<String> = inputs
        .iter()
        .map(|(k, v)| format!("{} = {}", k, format_number(*v)))
        .collect();
    format!(
        "Computed {} using {} to get {}.",
        expr,
        substitutions.join(", "),
        result
    )
}

/// Explain a failed step
pub fn explain_failure(error: &FormulaError) -> String {
    match error {
        FormulaError::NonFiniteResult { value, .. } => format!(
            "The result ({}) is not a finite number; 0 is used in its place.",
            value
        ),
        other => format!("Could not be calculated: {}. 0 is used in its place.", other),
    }
}

/// Split a left-deep chain of binary operations over plain operands
fn flatten_chain(expr: &Expr) -> Option<(&Expr, Vec<(BinaryOperator, &Expr)>)> {
    let mut rest = Vec::new();
    let mut node = expr;
    loop {
        match node {
            Expr::BinaryOp { op, left, right } => {
                if !is_operand(right) {
                    return None;
                }
                rest.push((*op, right.as_ref()));
                node = left;
            }
            leaf if is_operand(leaf) => {
                rest.reverse();
                return Some((leaf, rest));
            }
            _ => return None,
        }
    }
}

fn is_operand(expr: &Expr) -> bool {
    matches!(expr, Expr::Number(_) | Expr::Identifier { .. })
}

fn describe(operand: &Expr, inputs: &BTreeMap<String, f64>) -> String {
    match operand {
        Expr::Number(n) => format_number(*n),
        Expr::Identifier { name, .. } => match inputs.get(name) {
            Some(v) => format!("{} {}", label_for(name), format_number(*v)),
            None => label_for(name),
        },
        other => other.to_string(),
    }
}

fn verb(op: BinaryOperator) -> &'static str {
    match op {
        BinaryOperator::Add => "add",
        BinaryOperator::Subtract => "subtract",
        BinaryOperator::Multiply => "multiply by",
        BinaryOperator::Divide => "divide by",
        BinaryOperator::Remainder => "take the remainder after dividing by",
    }
}

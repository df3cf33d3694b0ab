//! Formula registry
//!
//! The registry is the read-only set of formulas one calculation run resolves
//! against. Each expression is parsed once, at load time. A formula whose
//! expression does not parse is still registered; it fails when evaluated.

use crate::ast::Expr;
use crate::error::FormulaError;
use crate::parser::{extract_identifiers, parse_expression};
use ahash::AHashMap;
use ratecard_core::{Error, Formula, FormulaRecord, Result, VariableSnapshot};
use std::sync::Arc;

/// A formula together with its parsed expression
#[derive(Debug, Clone)]
pub struct RegisteredFormula {
    formula: Formula,
    parsed: std::result::Result<Expr, FormulaError>,
}

impl RegisteredFormula {
    /// The formula record
    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    /// Parsed expression, or the syntax error it failed with
    pub fn expr(&self) -> std::result::Result<&Expr, &FormulaError> {
        self.parsed.as_ref()
    }

    /// Identifiers the expression looks up when evaluated
    ///
    /// Empty when the expression does not parse: nothing can be evaluated, so
    /// nothing needs resolving.
    pub fn identifiers(&self) -> Vec<&str> {
        match &self.parsed {
            Ok(expr) => expr.identifiers(),
            Err(_) => Vec::new(),
        }
    }
}

/// Immutable formula lookup table
///
/// Cloning is cheap; the table is shared behind an [`Arc`].
#[derive(Debug, Clone, Default)]
pub struct FormulaRegistry {
    formulas: Arc<AHashMap<String, RegisteredFormula>>,
    /// Keys in load order
    order: Arc<Vec<String>>,
}

impl FormulaRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from persisted formula records
    ///
    /// Keys must be valid and unique across all records, active or not.
    pub fn from_records<I>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = FormulaRecord>,
    {
        let mut formulas = AHashMap::new();
        let mut order = Vec::new();

        for record in records {
            if formulas.contains_key(&record.key) {
                return Err(Error::duplicate_key("formula", record.key));
            }

            let parsed = parse_expression(&record.expression);
            let derived = extract_identifiers(&record.expression).unwrap_or_default();
            if let Err(e) = &parsed {
                tracing::warn!(formula = %record.key, error = %e, "formula expression does not parse");
            }

            let formula = Formula::from_record(record, derived)?;
            order.push(formula.key.clone());
            formulas.insert(formula.key.clone(), RegisteredFormula { formula, parsed });
        }

        tracing::debug!(count = order.len(), "loaded formula registry");

        Ok(Self {
            formulas: Arc::new(formulas),
            order: Arc::new(order),
        })
    }

    /// Look up a formula regardless of its active flag
    pub fn get(&self, key: &str) -> Option<&Formula> {
        self.formulas.get(key).map(|f| &f.formula)
    }

    /// Look up an active formula
    pub fn get_active(&self, key: &str) -> Option<&RegisteredFormula> {
        self.formulas.get(key).filter(|f| f.formula.active)
    }

    /// Whether `key` names an active formula
    pub fn is_active(&self, key: &str) -> bool {
        self.get_active(key).is_some()
    }

    /// Number of formulas, active or not
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the registry holds no formulas
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Keys in load order
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().map(String::as_str)
    }

    /// Active formulas in load order
    pub fn active(&self) -> impl Iterator<Item = &RegisteredFormula> + '_ {
        self.order.iter().filter_map(move |k| self.get_active(k))
    }

    /// Active formula keys that are also variable keys in `snapshot`, sorted
    pub fn collisions(&self, snapshot: &VariableSnapshot) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .active()
            .map(|f| f.formula.key.as_str())
            .filter(|k| snapshot.contains(k))
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Active formulas that reference `key` directly, in load order
    pub fn dependents_of(&self, key: &str) -> Vec<&str> {
        self.active()
            .filter(|f| f.formula.declared_references.iter().any(|r| r == key))
            .map(|f| f.formula.key.as_str())
            .collect()
    }
}

//! Per-run evaluation context
//!
//! An [`EvaluationContext`] starts as a copy of the variable snapshot and
//! grows as formulas are evaluated. Bindings are append-only for the lifetime
//! of a run: once a key is bound, it can never silently change value.

use crate::error::{FormulaError, FormulaResult};
use crate::evaluator::NumericContext;
use ahash::AHashMap;
use ratecard_core::VariableSnapshot;
use std::collections::BTreeMap;

/// Where a binding came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingOrigin {
    /// Taken from the variable snapshot
    Variable,
    /// Result of a formula evaluated in this run
    Formula,
    /// Literal fallback supplied by the caller
    Default,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    value: f64,
    origin: BindingOrigin,
}

/// Key-value bindings for a single calculation run
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    bindings: AHashMap<String, Binding>,
    /// Every formula evaluated successfully in this run, including ones whose
    /// key is shadowed by a variable and therefore not bound
    results: AHashMap<String, f64>,
    failures: AHashMap<String, FormulaError>,
}

impl EvaluationContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context seeded with every variable in `snapshot`
    pub fn from_snapshot(snapshot: &VariableSnapshot) -> Self {
        let bindings = snapshot
            .iter()
            .map(|(key, value)| {
                (
                    key.to_string(),
                    Binding {
                        value,
                        origin: BindingOrigin::Variable,
                    },
                )
            })
            .collect();
        Self {
            bindings,
            ..Self::default()
        }
    }

    /// Bind `key` to `value`
    ///
    /// Rebinding a key to the value it already holds is a no-op. Rebinding it
    /// to a different value is refused with [`FormulaError::DuplicateBinding`].
    pub fn bind(
        &mut self,
        key: impl Into<String>,
        value: f64,
        origin: BindingOrigin,
    ) -> FormulaResult<()> {
        let key = key.into();
        if let Some(existing) = self.bindings.get(&key) {
            if same_value(existing.value, value) {
                return Ok(());
            }
            return Err(FormulaError::DuplicateBinding {
                key,
                existing: existing.value,
                attempted: value,
            });
        }
        self.bindings.insert(key, Binding { value, origin });
        Ok(())
    }

    /// Bind `key` to a literal fallback unless it is already bound
    ///
    /// Returns whether the default was used.
    pub fn bind_default(&mut self, key: &str, value: f64) -> bool {
        if self.bindings.contains_key(key) {
            return false;
        }
        self.bindings.insert(
            key.to_string(),
            Binding {
                value,
                origin: BindingOrigin::Default,
            },
        );
        true
    }

    /// Bound value for `key`
    pub fn get(&self, key: &str) -> Option<f64> {
        self.bindings.get(key).map(|b| b.value)
    }

    /// Whether `key` is bound
    pub fn contains(&self, key: &str) -> bool {
        self.bindings.contains_key(key)
    }

    /// Origin of the binding for `key`
    pub fn origin(&self, key: &str) -> Option<BindingOrigin> {
        self.bindings.get(key).map(|b| b.origin)
    }

    /// Whether `key` is bound to something other than a formula result
    pub fn is_input(&self, key: &str) -> bool {
        matches!(
            self.origin(key),
            Some(BindingOrigin::Variable) | Some(BindingOrigin::Default)
        )
    }

    /// Whether `key` is bound to a value from the variable snapshot
    pub fn is_variable(&self, key: &str) -> bool {
        self.origin(key) == Some(BindingOrigin::Variable)
    }

    /// Number of bindings
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether nothing is bound
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Result of formula `key`, if it was evaluated successfully in this run
    pub fn result_of(&self, key: &str) -> Option<f64> {
        self.results.get(key).copied()
    }

    /// Failure recorded for formula `key` in this run
    pub fn failure(&self, key: &str) -> Option<&FormulaError> {
        self.failures.get(key)
    }

    /// Whether formula `key` has already been attempted in this run
    pub fn is_settled(&self, key: &str) -> bool {
        self.results.contains_key(key) || self.failures.contains_key(key)
    }

    /// All failures recorded so far, sorted by key
    pub fn failures(&self) -> BTreeMap<&str, &FormulaError> {
        self.failures.iter().map(|(k, e)| (k.as_str(), e)).collect()
    }

    pub(crate) fn record_result(&mut self, key: &str, value: f64) {
        self.results.insert(key.to_string(), value);
    }

    pub(crate) fn record_failure(&mut self, key: &str, error: FormulaError) {
        self.failures.insert(key.to_string(), error);
    }

    /// Values for `keys` that are bound, in a sorted map
    ///
    /// Unbound keys are left out.
    pub fn restrict<S: AsRef<str>>(&self, keys: &[S]) -> BTreeMap<String, f64> {
        keys.iter()
            .filter_map(|k| {
                let k = k.as_ref();
                self.get(k).map(|v| (k.to_string(), v))
            })
            .collect()
    }

    /// All bindings in a sorted map
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.bindings
            .iter()
            .map(|(k, b)| (k.clone(), b.value))
            .collect()
    }
}

impl NumericContext for EvaluationContext {
    fn lookup(&self, name: &str) -> Option<f64> {
        self.get(name)
    }
}

fn same_value(a: f64, b: f64) -> bool {
    a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
}

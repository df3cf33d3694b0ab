//! Dependency resolution for formula calculation
//!
//! Resolving a target formula happens in two passes over the same context:
//!
//! 1. **Plan**: a depth-first walk from the target through the identifiers
//!    each formula uses, producing a post-order list of formulas to evaluate.
//!    Cycles, unresolvable identifiers and over-deep chains are found here,
//!    before anything is evaluated.
//! 2. **Evaluate**: each planned formula is evaluated in order and its result
//!    bound into the context, so later formulas see it as an ordinary input.
//!
//! A formula already evaluated (or failed) in the same context is never
//! planned again, so repeated requests within one run are memoized.

use crate::context::{BindingOrigin, EvaluationContext};
use crate::error::{FormulaError, FormulaResult};
use crate::evaluator::evaluate;
use crate::registry::{FormulaRegistry, RegisteredFormula};
use ahash::AHashSet;
use ratecard_core::VariableSnapshot;
use std::collections::BTreeMap;

/// Default limit on the length of a dependency chain
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// What to do when a key names both a variable and an active formula
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum CollisionPolicy {
    /// The variable value wins wherever the key is referenced
    #[default]
    VariablePrecedence,
    /// Referencing or requesting the key fails with
    /// [`FormulaError::AmbiguousIdentifier`]
    Error,
}

/// Resolution options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Most formulas allowed on one dependency path
    pub max_depth: usize,
    /// Variable/formula key collision handling
    pub collision_policy: CollisionPolicy,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            collision_policy: CollisionPolicy::default(),
        }
    }
}

/// Outcome of evaluating one formula
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaOutcome {
    pub key: String,
    /// Computed value; zero when evaluation failed outright
    pub value: f64,
    /// Declared references and the values they were bound to
    pub inputs: BTreeMap<String, f64>,
    pub error: Option<FormulaError>,
}

impl FormulaOutcome {
    /// Whether the formula evaluated to a finite value
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Resolves formulas from a registry into an evaluation context
#[derive(Debug, Clone)]
pub struct Resolver<'r> {
    registry: &'r FormulaRegistry,
    options: ResolveOptions,
}

impl<'r> Resolver<'r> {
    /// Create a resolver over `registry`
    pub fn new(registry: &'r FormulaRegistry, options: ResolveOptions) -> Self {
        Self { registry, options }
    }

    /// The options this resolver was built with
    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    /// Compute the order in which formulas must be evaluated to produce `target`
    ///
    /// Dependencies come before the formulas that use them and the target comes
    /// last. Formulas already settled in `ctx` are left out. Returns an empty
    /// plan when the target itself is settled.
    pub fn plan(&self, target: &str, ctx: &EvaluationContext) -> FormulaResult<Vec<String>> {
        if ctx.is_settled(target) {
            return Ok(Vec::new());
        }

        let entry = self
            .registry
            .get_active(target)
            .ok_or_else(|| FormulaError::UnknownFormula {
                key: target.to_string(),
            })?;

        if ctx.is_variable(target) && self.options.collision_policy == CollisionPolicy::Error {
            return Err(FormulaError::AmbiguousIdentifier {
                key: target.to_string(),
            });
        }

        let mut order = Vec::new();
        let mut planned = AHashSet::new();
        let mut path = Vec::new();
        self.visit(entry, ctx, &mut path, &mut planned, &mut order)?;
        Ok(order)
    }

    /// Depth-first walk; `path` holds the formulas currently being visited
    fn visit(
        &self,
        entry: &RegisteredFormula,
        ctx: &EvaluationContext,
        path: &mut Vec<String>,
        planned: &mut AHashSet<String>,
        order: &mut Vec<String>,
    ) -> FormulaResult<()> {
        let key = entry.formula().key.as_str();
        if path.len() >= self.options.max_depth {
            return Err(FormulaError::DepthExceeded {
                formula: key.to_string(),
                limit: self.options.max_depth,
            });
        }
        path.push(key.to_string());

        for ident in entry.identifiers() {
            if ctx.contains(ident) {
                // Only snapshot values collide; caller fallbacks do not
                if ctx.is_variable(ident)
                    && self.registry.is_active(ident)
                    && self.options.collision_policy == CollisionPolicy::Error
                {
                    return Err(FormulaError::AmbiguousIdentifier {
                        key: ident.to_string(),
                    });
                }
                continue;
            }

            if ctx.is_settled(ident) || planned.contains(ident) {
                continue;
            }

            if let Some(pos) = path.iter().position(|k| k == ident) {
                return Err(FormulaError::CyclicDependency {
                    cycle: path[pos..].to_vec(),
                });
            }

            match self.registry.get_active(ident) {
                Some(dependency) => self.visit(dependency, ctx, path, planned, order)?,
                None => {
                    return Err(FormulaError::UnresolvedIdentifier {
                        identifier: ident.to_string(),
                        formula: key.to_string(),
                    })
                }
            }
        }

        path.pop();
        planned.insert(key.to_string());
        order.push(key.to_string());
        Ok(())
    }

    /// Resolve `target` into `ctx`, reporting every formula evaluated on the way
    ///
    /// Planning errors are recorded against the target and returned without
    /// evaluating anything. Evaluation errors are recorded against the formula
    /// that failed; formulas depending on it fail with
    /// [`FormulaError::Upstream`]. When the target key is shadowed by a
    /// variable, the formula is still evaluated and reported, but the variable
    /// keeps its binding.
    pub fn resolve_into<F>(
        &self,
        target: &str,
        ctx: &mut EvaluationContext,
        mut on_formula: F,
    ) -> FormulaResult<f64>
    where
        F: FnMut(&FormulaOutcome),
    {
        if let Some(value) = ctx.result_of(target) {
            return Ok(value);
        }
        if let Some(err) = ctx.failure(target) {
            return Err(err.clone());
        }

        let order = match self.plan(target, ctx) {
            Ok(order) => order,
            Err(err) => {
                tracing::warn!(formula = %target, error = %err, "cannot plan formula");
                ctx.record_failure(target, err.clone());
                return Err(err);
            }
        };
        tracing::debug!(formula = %target, steps = order.len(), "planned formula evaluation");

        let target_shadowed = ctx.is_input(target);
        for key in &order {
            let bind = !(target_shadowed && key == target);
            let outcome = self.evaluate_formula(key, bind, ctx);
            on_formula(&outcome);
        }

        match ctx.result_of(target) {
            Some(value) => Ok(value),
            None => Err(ctx
                .failure(target)
                .cloned()
                .unwrap_or_else(|| FormulaError::UnknownFormula {
                    key: target.to_string(),
                })),
        }
    }

    /// Evaluate one planned formula and settle it in `ctx`
    fn evaluate_formula(&self, key: &str, bind: bool, ctx: &mut EvaluationContext) -> FormulaOutcome {
        let entry = match self.registry.get_active(key) {
            Some(entry) => entry,
            None => {
                let err = FormulaError::UnknownFormula {
                    key: key.to_string(),
                };
                ctx.record_failure(key, err.clone());
                return FormulaOutcome {
                    key: key.to_string(),
                    value: 0.0,
                    inputs: BTreeMap::new(),
                    error: Some(err),
                };
            }
        };

        let inputs = ctx.restrict(&entry.formula().declared_references);
        let result = compute(entry, ctx).and_then(|value| {
            if !value.is_finite() {
                return Err(FormulaError::NonFiniteResult {
                    formula: key.to_string(),
                    value,
                });
            }
            if bind {
                ctx.bind(key, value, BindingOrigin::Formula)?;
            }
            Ok(value)
        });

        match result {
            Ok(value) => {
                tracing::debug!(formula = %key, value, "evaluated formula");
                ctx.record_result(key, value);
                FormulaOutcome {
                    key: key.to_string(),
                    value,
                    inputs,
                    error: None,
                }
            }
            Err(err) => {
                tracing::warn!(formula = %key, error = %err, "formula evaluation failed");
                let value = match &err {
                    FormulaError::NonFiniteResult { value, .. } => *value,
                    _ => 0.0,
                };
                ctx.record_failure(key, err.clone());
                FormulaOutcome {
                    key: key.to_string(),
                    value,
                    inputs,
                    error: Some(err),
                }
            }
        }
    }
}

/// Evaluate a formula whose dependencies have all been settled
fn compute(entry: &RegisteredFormula, ctx: &EvaluationContext) -> FormulaResult<f64> {
    let expr = entry.expr().map_err(Clone::clone)?;

    for ident in entry.identifiers() {
        if ctx.contains(ident) {
            continue;
        }
        if let Some(err) = ctx.failure(ident) {
            return Err(FormulaError::Upstream {
                formula: entry.formula().key.clone(),
                dependency: ident.to_string(),
                source: Box::new(err.clone()),
            });
        }
    }

    evaluate(expr, ctx)
}

/// Resolve `target` against a fresh context seeded from `snapshot`
///
/// # Example
/// ```rust
/// use ratecard_core::{FormulaRecord, VariableSnapshot};
/// use ratecard_formula::{resolve, FormulaRegistry};
///
/// let registry = FormulaRegistry::from_records(vec![
///     FormulaRecord::new("b", "a * 2"),
///     FormulaRecord::new("target", "a + b"),
/// ])
/// .unwrap();
/// let snapshot = VariableSnapshot::from_pairs(vec![("a", 5.0)]).unwrap();
///
/// let ctx = resolve("target", &registry, &snapshot).unwrap();
/// assert_eq!(ctx.get("b"), Some(10.0));
/// assert_eq!(ctx.get("target"), Some(15.0));
/// ```
pub fn resolve(
    target: &str,
    registry: &FormulaRegistry,
    snapshot: &VariableSnapshot,
) -> FormulaResult<EvaluationContext> {
    let mut ctx = EvaluationContext::from_snapshot(snapshot);
    Resolver::new(registry, ResolveOptions::default()).resolve_into(target, &mut ctx, |_| {})?;
    Ok(ctx)
}

/// Resolve several targets, in order, into one fresh context
///
/// A target that fails does not stop the others; its error is left in the
/// context (see [`EvaluationContext::failures`]).
pub fn resolve_all<S: AsRef<str>>(
    targets: &[S],
    registry: &FormulaRegistry,
    snapshot: &VariableSnapshot,
) -> EvaluationContext {
    let mut ctx = EvaluationContext::from_snapshot(snapshot);
    let resolver = Resolver::new(registry, ResolveOptions::default());
    for target in targets {
        if let Err(err) = resolver.resolve_into(target.as_ref(), &mut ctx, |_| {}) {
            tracing::debug!(formula = %target.as_ref(), error = %err, "target failed, continuing");
        }
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ratecard_core::FormulaRecord;

    fn registry(formulas: &[(&str, &str)]) -> FormulaRegistry {
        FormulaRegistry::from_records(
            formulas
                .iter()
                .map(|(k, e)| FormulaRecord::new(*k, *e)),
        )
        .unwrap()
    }

    fn snapshot(vars: &[(&str, f64)]) -> VariableSnapshot {
        VariableSnapshot::from_pairs(vars.iter().copied()).unwrap()
    }

    fn run(
        reg: &FormulaRegistry,
        snap: &VariableSnapshot,
        target: &str,
    ) -> (FormulaResult<f64>, Vec<FormulaOutcome>) {
        let mut ctx = EvaluationContext::from_snapshot(snap);
        let mut outcomes = Vec::new();
        let result = Resolver::new(reg, ResolveOptions::default())
            .resolve_into(target, &mut ctx, |o| outcomes.push(o.clone()));
        (result, outcomes)
    }

    #[test]
    fn test_dependency_evaluated_first() {
        let reg = registry(&[("target", "a + b"), ("b", "a * 2")]);
        let snap = snapshot(&[("a", 5.0)]);

        let (result, outcomes) = run(&reg, &snap, "target");
        assert_eq!(result, Ok(15.0));
        assert_eq!(
            outcomes.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(),
            vec!["b", "target"]
        );
        assert_eq!(outcomes[0].value, 10.0);
        assert_eq!(outcomes[1].inputs.get("b"), Some(&10.0));
        assert_eq!(outcomes[1].inputs.get("a"), Some(&5.0));
    }

    #[test]
    fn test_shared_dependency_evaluated_once() {
        let reg = registry(&[
            ("base", "x * 2"),
            ("left", "base + 1"),
            ("right", "base + 2"),
            ("top", "left * right"),
        ]);
        let snap = snapshot(&[("x", 1.0)]);

        let (result, outcomes) = run(&reg, &snap, "top");
        assert_eq!(result, Ok(12.0));
        assert_eq!(
            outcomes.iter().map(|o| o.key.as_str()).collect::<Vec<_>>(),
            vec!["base", "left", "right", "top"]
        );
    }

    #[test]
    fn test_cycle_reports_path() {
        let reg = registry(&[("a", "b + 1"), ("b", "a + 1")]);
        let (result, outcomes) = run(&reg, &snapshot(&[]), "a");
        assert_eq!(
            result,
            Err(FormulaError::CyclicDependency {
                cycle: vec!["a".into(), "b".into()],
            })
        );
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_cycle_below_target() {
        let reg = registry(&[("t", "a"), ("a", "b"), ("b", "c"), ("c", "a")]);
        let (result, _) = run(&reg, &snapshot(&[]), "t");
        assert_eq!(
            result,
            Err(FormulaError::CyclicDependency {
                cycle: vec!["a".into(), "b".into(), "c".into()],
            })
        );
    }

    #[test]
    fn test_self_reference() {
        let reg = registry(&[("a", "a + 1")]);
        let (result, _) = run(&reg, &snapshot(&[]), "a");
        assert_eq!(
            result,
            Err(FormulaError::CyclicDependency {
                cycle: vec!["a".into()],
            })
        );
    }

    #[test]
    fn test_unresolved_identifier() {
        let reg = registry(&[("y", "x + 1")]);
        let (result, outcomes) = run(&reg, &snapshot(&[]), "y");
        assert_eq!(
            result,
            Err(FormulaError::UnresolvedIdentifier {
                identifier: "x".into(),
                formula: "y".into(),
            })
        );
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_inactive_formula_is_unresolved() {
        let reg = FormulaRegistry::from_records(vec![
            FormulaRecord::new("y", "x + 1"),
            FormulaRecord::new("x", "2").inactive(),
        ])
        .unwrap();
        let (result, _) = run(&reg, &snapshot(&[]), "y");
        assert!(matches!(
            result,
            Err(FormulaError::UnresolvedIdentifier { .. })
        ));

        let (result, _) = run(&reg, &snapshot(&[]), "x");
        assert_eq!(result, Err(FormulaError::UnknownFormula { key: "x".into() }));
    }

    #[test]
    fn test_depth_limit() {
        let mut formulas: Vec<(String, String)> = (0..10)
            .map(|i| (format!("f{}", i), format!("f{} + 1", i + 1)))
            .collect();
        formulas.push(("f10".into(), "1".into()));
        let reg = FormulaRegistry::from_records(
            formulas.iter().map(|(k, e)| FormulaRecord::new(k.as_str(), e.as_str())),
        )
        .unwrap();

        let mut ctx = EvaluationContext::new();
        let shallow = ResolveOptions {
            max_depth: 5,
            ..ResolveOptions::default()
        };
        let err = Resolver::new(&reg, shallow)
            .resolve_into("f0", &mut ctx, |_| {})
            .unwrap_err();
        assert_eq!(
            err,
            FormulaError::DepthExceeded {
                formula: "f5".into(),
                limit: 5,
            }
        );

        let mut ctx = EvaluationContext::new();
        let value = Resolver::new(&reg, ResolveOptions::default())
            .resolve_into("f0", &mut ctx, |_| {})
            .unwrap();
        assert_eq!(value, 11.0);
    }

    #[test]
    fn test_variable_wins_collision() {
        let reg = registry(&[("rate", "99"), ("total", "rate * 2")]);
        let snap = snapshot(&[("rate", 3.0)]);

        let (result, outcomes) = run(&reg, &snap, "total");
        assert_eq!(result, Ok(6.0));
        assert_eq!(outcomes.len(), 1);
    }

    #[test]
    fn test_shadowed_target_is_evaluated_not_bound() {
        let reg = registry(&[("rate", "1 + 1")]);
        let snap = snapshot(&[("rate", 3.0)]);

        let mut ctx = EvaluationContext::from_snapshot(&snap);
        let value = Resolver::new(&reg, ResolveOptions::default())
            .resolve_into("rate", &mut ctx, |_| {})
            .unwrap();
        assert_eq!(value, 2.0);
        assert_eq!(ctx.get("rate"), Some(3.0));
    }

    #[test]
    fn test_strict_collision_policy() {
        let reg = registry(&[("rate", "99"), ("total", "rate * 2")]);
        let snap = snapshot(&[("rate", 3.0)]);
        let strict = ResolveOptions {
            collision_policy: CollisionPolicy::Error,
            ..ResolveOptions::default()
        };

        let mut ctx = EvaluationContext::from_snapshot(&snap);
        let err = Resolver::new(&reg, strict.clone())
            .resolve_into("total", &mut ctx, |_| {})
            .unwrap_err();
        assert_eq!(err, FormulaError::AmbiguousIdentifier { key: "rate".into() });

        let mut ctx = EvaluationContext::from_snapshot(&snap);
        let err = Resolver::new(&reg, strict)
            .resolve_into("rate", &mut ctx, |_| {})
            .unwrap_err();
        assert_eq!(err, FormulaError::AmbiguousIdentifier { key: "rate".into() });
    }

    #[test]
    fn test_strict_policy_ignores_fallback_bindings() {
        let reg = registry(&[("rate", "missing * 2"), ("total", "rate + 1")]);
        let strict = ResolveOptions {
            collision_policy: CollisionPolicy::Error,
            ..ResolveOptions::default()
        };

        // A zero substituted for a failed formula is not a variable
        let mut ctx = EvaluationContext::new();
        assert!(ctx.bind_default("rate", 0.0));
        let value = Resolver::new(&reg, strict)
            .resolve_into("total", &mut ctx, |_| {})
            .unwrap();
        assert_eq!(value, 1.0);
    }

    #[test]
    fn test_non_finite_fails_dependents() {
        let reg = registry(&[("ratio", "a / zero"), ("scaled", "ratio * 2")]);
        let snap = snapshot(&[("a", 1.0), ("zero", 0.0)]);

        let (result, outcomes) = run(&reg, &snap, "scaled");
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].value, f64::INFINITY);
        assert!(matches!(
            outcomes[0].error,
            Some(FormulaError::NonFiniteResult { .. })
        ));

        match result {
            Err(FormulaError::Upstream {
                formula,
                dependency,
                source,
            }) => {
                assert_eq!(formula, "scaled");
                assert_eq!(dependency, "ratio");
                assert!(source.is_soft());
            }
            other => panic!("expected upstream error, got {:?}", other),
        }
        assert_eq!(outcomes[1].value, 0.0);
    }

    #[test]
    fn test_syntax_error_surfaces_at_evaluation() {
        let reg = registry(&[("broken", "a *"), ("user", "broken + 1")]);
        let snap = snapshot(&[("a", 1.0)]);

        let (result, outcomes) = run(&reg, &snap, "user");
        assert!(matches!(outcomes[0].error, Some(FormulaError::Syntax { .. })));
        assert_eq!(result.unwrap_err().root_cause().kind(), "SyntaxError");
    }

    #[test]
    fn test_memoized_within_context() {
        let reg = registry(&[("b", "a * 2"), ("c", "b + 1"), ("d", "b + 2")]);
        let snap = snapshot(&[("a", 5.0)]);
        let resolver = Resolver::new(&reg, ResolveOptions::default());
        let mut ctx = EvaluationContext::from_snapshot(&snap);

        let mut seen = Vec::new();
        resolver
            .resolve_into("c", &mut ctx, |o| seen.push(o.key.clone()))
            .unwrap();
        resolver
            .resolve_into("d", &mut ctx, |o| seen.push(o.key.clone()))
            .unwrap();
        resolver
            .resolve_into("c", &mut ctx, |o| seen.push(o.key.clone()))
            .unwrap();

        assert_eq!(seen, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_failed_target_is_memoized() {
        let reg = registry(&[("y", "x + 1"), ("z", "y * 2")]);
        let resolver = Resolver::new(&reg, ResolveOptions::default());
        let mut ctx = EvaluationContext::new();

        let first = resolver.resolve_into("y", &mut ctx, |_| {}).unwrap_err();
        let again = resolver.resolve_into("y", &mut ctx, |_| {}).unwrap_err();
        assert_eq!(first, again);

        // Dependents of a failed formula fail upstream without re-planning it
        let err = resolver.resolve_into("z", &mut ctx, |_| {}).unwrap_err();
        assert!(matches!(err, FormulaError::Upstream { .. }));
    }

    #[test]
    fn test_resolve_convenience() {
        let reg = registry(&[("b", "a * 2"), ("target", "a + b")]);
        let snap = snapshot(&[("a", 5.0)]);
        let ctx = resolve("target", &reg, &snap).unwrap();
        assert_eq!(ctx.get("target"), Some(15.0));
        assert_eq!(ctx.result_of("b"), Some(10.0));
    }

    #[test]
    fn test_resolve_all_isolates_failures() {
        let reg = registry(&[("broken", "nope + 1"), ("b", "a * 2"), ("c", "b + 1")]);
        let snap = snapshot(&[("a", 5.0)]);
        let ctx = resolve_all(&["broken", "c"], &reg, &snap);

        assert_eq!(ctx.get("c"), Some(11.0));
        assert!(matches!(
            ctx.failure("broken"),
            Some(FormulaError::UnresolvedIdentifier { .. })
        ));
        assert_eq!(ctx.failures().len(), 1);
    }
}

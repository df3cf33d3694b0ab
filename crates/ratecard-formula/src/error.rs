//! Formula error types

use thiserror::Error;

/// Result type for formula operations
pub type FormulaResult<T> = std::result::Result<T, FormulaError>;

/// Errors that can occur during parsing, resolution or evaluation
///
/// Every variant names the offending key, formula or position so the message
/// can be shown to an operator as-is.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    /// Expression could not be parsed
    #[error("Syntax error at position {position}: {message}")]
    Syntax { message: String, position: usize },

    /// Identifier not bound in the evaluation context
    #[error("Unknown identifier '{name}' at position {position}")]
    UnknownIdentifier { name: String, position: usize },

    /// Identifier is neither a variable nor an active formula
    #[error("Formula '{formula}' references '{identifier}', which is neither a variable nor an active formula")]
    UnresolvedIdentifier { identifier: String, formula: String },

    /// Requested formula is not in the registry, or is inactive
    #[error("Unknown formula: {key}")]
    UnknownFormula { key: String },

    /// Formula graph contains a cycle
    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<String> },

    /// Evaluation produced NaN or an infinity
    #[error("Formula '{formula}' produced a non-finite result ({value})")]
    NonFiniteResult { formula: String, value: f64 },

    /// A context key was bound twice with different values in one run
    #[error("Key '{key}' is already bound to {existing}; refusing to rebind it to {attempted}")]
    DuplicateBinding {
        key: String,
        existing: f64,
        attempted: f64,
    },

    /// A key names both a variable and an active formula
    #[error("'{key}' is both a variable and an active formula")]
    AmbiguousIdentifier { key: String },

    /// Dependency chain deeper than the configured limit
    #[error("Dependency chain through '{formula}' exceeds the depth limit of {limit}")]
    DepthExceeded { formula: String, limit: usize },

    /// A dependency failed earlier in the same run
    #[error("Formula '{formula}' depends on '{dependency}', which failed: {source}")]
    Upstream {
        formula: String,
        dependency: String,
        source: Box<FormulaError>,
    },
}

impl FormulaError {
    pub(crate) fn syntax(message: impl Into<String>, position: usize) -> Self {
        FormulaError::Syntax {
            message: message.into(),
            position,
        }
    }

    /// Short machine-friendly name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            FormulaError::Syntax { .. } => "SyntaxError",
            FormulaError::UnknownIdentifier { .. } => "UnknownIdentifier",
            FormulaError::UnresolvedIdentifier { .. } => "UnresolvedIdentifier",
            FormulaError::UnknownFormula { .. } => "UnknownFormula",
            FormulaError::CyclicDependency { .. } => "CyclicDependency",
            FormulaError::NonFiniteResult { .. } => "NonFiniteResult",
            FormulaError::DuplicateBinding { .. } => "DuplicateBinding",
            FormulaError::AmbiguousIdentifier { .. } => "AmbiguousIdentifier",
            FormulaError::DepthExceeded { .. } => "DepthExceeded",
            FormulaError::Upstream { .. } => "Upstream",
        }
    }

    /// Soft failures keep their computed value in the trace
    pub fn is_soft(&self) -> bool {
        matches!(self, FormulaError::NonFiniteResult { .. })
    }

    /// Innermost error behind any chain of upstream failures
    pub fn root_cause(&self) -> &FormulaError {
        match self {
            FormulaError::Upstream { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

fn format_cycle(cycle: &[String]) -> String {
    match cycle.first() {
        Some(first) => format!("{} -> {}", cycle.join(" -> "), first),
        None => String::new(),
    }
}

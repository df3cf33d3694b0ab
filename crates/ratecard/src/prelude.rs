//! Prelude module - common imports for ratecard users
//!
//! ```rust
//! use ratecard::prelude::*;
//! ```

pub use crate::{
    // Pipeline types
    CalculationPipeline,
    CalculationRequest,
    PipelineOptions,
    Precision,

    // Trace types
    CalculationStep,
    FinalResults,
    Trace,

    // Cache types
    SnapshotCache,
    SnapshotSource,
    SourceError,

    // Records
    FormulaRecord,
    Variable,
    VariableSnapshot,

    // Formula types
    CollisionPolicy,
    FormulaError,
    FormulaRegistry,
};

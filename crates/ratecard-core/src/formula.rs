//! Formula records
//!
//! [`FormulaRecord`] is the shape the persistence layer stores. [`Formula`] is
//! the registry's view of it, with the list of identifiers the expression may
//! reference filled in.

use crate::error::{Error, Result};
use crate::key::is_valid_key;

fn default_active() -> bool {
    true
}

/// A formula as stored by the host application
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FormulaRecord {
    /// Unique identifier; other formulas reference this formula's result by it
    pub key: String,
    /// Display label
    #[cfg_attr(feature = "serde", serde(default))]
    pub name: String,
    /// Expression source text
    pub expression: String,
    /// Grouping label (no effect on evaluation)
    #[cfg_attr(feature = "serde", serde(default))]
    pub category: String,
    /// Inactive formulas are excluded from resolution
    #[cfg_attr(feature = "serde", serde(default = "default_active"))]
    pub active: bool,
    /// Author-supplied explanation shown in traces
    #[cfg_attr(feature = "serde", serde(default))]
    pub description: Option<String>,
    /// Declared references; derived from the expression when absent
    #[cfg_attr(feature = "serde", serde(default))]
    pub references: Option<Vec<String>>,
}

impl FormulaRecord {
    /// Create an active formula record whose name is its key
    pub fn new(key: impl Into<String>, expression: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            name: key.clone(),
            key,
            expression: expression.into(),
            category: String::new(),
            active: default_active(),
            description: None,
            references: None,
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the category label
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Set the author-supplied description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Declare the references explicitly instead of deriving them
    pub fn with_references<I, S>(mut self, references: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.references = Some(references.into_iter().map(Into::into).collect());
        self
    }

    /// Mark this formula as inactive
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// A registered formula
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub key: String,
    pub name: String,
    pub expression: String,
    /// Identifiers the expression may use, in first-use order, without duplicates
    pub declared_references: Vec<String>,
    pub category: String,
    pub active: bool,
    pub description: Option<String>,
}

impl Formula {
    /// Build a formula from its record and the references to declare
    ///
    /// Explicit references on the record win over `derived`. Reference names
    /// are deduplicated keeping first occurrence.
    pub fn from_record(record: FormulaRecord, derived: Vec<String>) -> Result<Self> {
        if !is_valid_key(&record.key) {
            return Err(Error::invalid_key("formula", record.key));
        }

        let references = record.references.unwrap_or(derived);
        let mut declared_references: Vec<String> = Vec::with_capacity(references.len());
        for reference in references {
            if !is_valid_key(&reference) {
                return Err(Error::invalid_key("reference", reference));
            }
            if !declared_references.contains(&reference) {
                declared_references.push(reference);
            }
        }

        Ok(Self {
            key: record.key,
            name: record.name,
            expression: record.expression,
            declared_references,
            category: record.category,
            active: record.active,
            description: record.description,
        })
    }

    /// Whether the expression references nothing
    pub fn is_constant(&self) -> bool {
        self.declared_references.is_empty()
    }
}

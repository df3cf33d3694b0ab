//! Variables and the immutable per-run variable snapshot
//!
//! A [`Variable`] is a named numeric input as stored by the host application.
//! A [`VariableSnapshot`] is the read-only view of all active variables that a
//! single calculation run evaluates against.

use crate::error::{Error, Result};
use crate::key::is_valid_key;
use ahash::AHashMap;
use std::sync::Arc;

fn default_active() -> bool {
    true
}

/// A variable record as supplied by the persistence layer
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Variable {
    /// Unique identifier, usable inside formula expressions
    pub key: String,
    /// Numeric value
    pub value: f64,
    /// Grouping label (no effect on evaluation)
    #[cfg_attr(feature = "serde", serde(default))]
    pub category: String,
    /// Inactive variables are left out of snapshots
    #[cfg_attr(feature = "serde", serde(default = "default_active"))]
    pub active: bool,
}

impl Variable {
    /// Create an active, uncategorized variable
    pub fn new(key: impl Into<String>, value: f64) -> Self {
        Self {
            key: key.into(),
            value,
            category: String::new(),
            active: default_active(),
        }
    }

    /// Set the category label
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Mark this variable as inactive
    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Immutable mapping of variable key to value
///
/// Cloning is cheap: the map is shared behind an [`Arc`], so a snapshot handed
/// to a running evaluation is never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct VariableSnapshot {
    values: Arc<AHashMap<String, f64>>,
}

impl VariableSnapshot {
    /// Create an empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from persisted variable records
    ///
    /// Inactive records are skipped. Invalid or duplicate keys among the
    /// active records are rejected.
    pub fn from_records<I>(records: I) -> Result<Self>
    where
        I: IntoIterator<Item = Variable>,
    {
        let mut values = AHashMap::new();
        for record in records {
            if !record.active {
                continue;
            }
            if !is_valid_key(&record.key) {
                return Err(Error::invalid_key("variable", record.key));
            }
            if values.contains_key(&record.key) {
                return Err(Error::duplicate_key("variable", record.key));
            }
            values.insert(record.key, record.value);
        }
        Ok(Self {
            values: Arc::new(values),
        })
    }

    /// Build a snapshot from `(key, value)` pairs
    pub fn from_pairs<I, K>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self::from_records(
            pairs
                .into_iter()
                .map(|(key, value)| Variable::new(key, value)),
        )
    }

    /// Look up a variable value
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    /// Check whether a key is bound in this snapshot
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of variables
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the snapshot holds no variables
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate over all `(key, value)` pairs in unspecified order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// All keys, sorted
    pub fn sorted_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.values.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

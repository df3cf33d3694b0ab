//! Read-through snapshot cache
//!
//! The persistence layer is reached through [`SnapshotSource`]. A
//! [`SnapshotCache`] keeps the last loaded [`SnapshotBundle`] for a
//! time-to-live and swaps in a new `Arc` on reload, so a bundle already handed
//! to a running calculation is never mutated. The persistence layer calls
//! [`SnapshotCache::invalidate`] after every write.

use crate::calculation::PipelineOptions;
use chrono::{DateTime, Utc};
use ratecard_core::{FormulaRecord, Variable, VariableSnapshot};
use ratecard_formula::FormulaRegistry;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Failure reported by a [`SnapshotSource`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SourceError(pub String);

impl SourceError {
    /// Create a source error with a message
    pub fn new<S: Into<String>>(msg: S) -> Self {
        SourceError(msg.into())
    }
}

/// Errors that can occur while loading a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The source could not be read
    #[error("Failed to load snapshot: {0}")]
    Source(#[from] SourceError),

    /// The records read do not form a valid snapshot
    #[error("Invalid snapshot: {0}")]
    Invalid(#[from] ratecard_core::Error),

    /// The pipeline was built without a cache
    #[error("No snapshot cache is configured")]
    NotConfigured,
}

/// Where variables and formulas are loaded from
pub trait SnapshotSource: Send + Sync {
    /// All variable records, active or not
    fn load_variables(&self) -> Result<Vec<Variable>, SourceError>;

    /// All formula records, active or not
    fn load_formulas(&self) -> Result<Vec<FormulaRecord>, SourceError>;
}

/// Variables and formulas loaded together
#[derive(Debug, Clone)]
pub struct SnapshotBundle {
    pub variables: VariableSnapshot,
    pub registry: FormulaRegistry,
    /// Cache generation this bundle was loaded under
    pub generation: u64,
    pub loaded_at: DateTime<Utc>,
}

impl SnapshotBundle {
    /// Build a bundle from raw records
    pub fn from_records(
        variables: Vec<Variable>,
        formulas: Vec<FormulaRecord>,
    ) -> ratecard_core::Result<Self> {
        Ok(Self {
            variables: VariableSnapshot::from_records(variables)?,
            registry: FormulaRegistry::from_records(formulas)?,
            generation: 0,
            loaded_at: Utc::now(),
        })
    }
}

struct Slot {
    bundle: Arc<SnapshotBundle>,
    fetched_at: Instant,
}

/// TTL cache in front of a [`SnapshotSource`]
pub struct SnapshotCache {
    source: Box<dyn SnapshotSource>,
    ttl: Duration,
    slot: RwLock<Option<Slot>>,
    generation: AtomicU64,
}

impl fmt::Debug for SnapshotCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCache")
            .field("ttl", &self.ttl)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl SnapshotCache {
    /// Create an empty cache; nothing is loaded until the first [`load`](Self::load)
    pub fn new<S: SnapshotSource + 'static>(source: S, ttl: Duration) -> Self {
        Self {
            source: Box::new(source),
            ttl,
            slot: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Create a cache using the TTL from `options`
    pub fn from_options<S: SnapshotSource + 'static>(source: S, options: &PipelineOptions) -> Self {
        Self::new(source, Duration::from_secs(options.cache_ttl_secs))
    }

    /// Time-to-live of a loaded bundle
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of invalidations so far
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// The cached bundle, fresh or not, without loading
    pub fn peek(&self) -> Option<Arc<SnapshotBundle>> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().map(|s| Arc::clone(&s.bundle))
    }

    /// The current bundle, reloading it from the source when stale
    ///
    /// A failed reload leaves the previous bundle in place for the next
    /// attempt but is still reported to the caller.
    pub fn load(&self) -> Result<Arc<SnapshotBundle>, CacheError> {
        {
            let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(bundle) = self.fresh(slot.as_ref()) {
                return Ok(bundle);
            }
        }

        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have reloaded while we waited for the lock
        if let Some(bundle) = self.fresh(slot.as_ref()) {
            return Ok(bundle);
        }

        let generation = self.generation();
        let bundle = match self.fetch(generation) {
            Ok(bundle) => Arc::new(bundle),
            Err(e) => {
                tracing::warn!(error = %e, generation, "snapshot reload failed");
                return Err(e);
            }
        };

        tracing::info!(
            generation,
            variables = bundle.variables.len(),
            formulas = bundle.registry.len(),
            "loaded snapshot"
        );
        *slot = Some(Slot {
            bundle: Arc::clone(&bundle),
            fetched_at: Instant::now(),
        });
        Ok(bundle)
    }

    /// Drop the cached bundle so the next [`load`](Self::load) refetches
    ///
    /// Bundles already handed out stay valid.
    pub fn invalidate(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
        tracing::debug!(generation, "snapshot cache invalidated");
    }

    fn fresh(&self, slot: Option<&Slot>) -> Option<Arc<SnapshotBundle>> {
        let slot = slot?;
        let current = slot.bundle.generation == self.generation();
        if current && slot.fetched_at.elapsed() < self.ttl {
            Some(Arc::clone(&slot.bundle))
        } else {
            None
        }
    }

    fn fetch(&self, generation: u64) -> Result<SnapshotBundle, CacheError> {
        let variables = self.source.load_variables()?;
        let formulas = self.source.load_formulas()?;
        let mut bundle = SnapshotBundle::from_records(variables, formulas)?;
        bundle.generation = generation;
        Ok(bundle)
    }
}

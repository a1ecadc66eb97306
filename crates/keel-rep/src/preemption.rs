//! Invalidation of database handles by replicated naming operations.
//!
//! Removing, renaming or truncating a database is committed as a
//! [`crate::RecordKind::Naming`] record. Applying that record, on the master
//! at commit and on every replica at replay, bumps the database's
//! generation. A [`DatabaseHandle`] remembers the generation it was opened
//! at and refuses to run once it is stale.
//!
//! The generation is checked when an operation starts, so an operation that
//! was already running when the record applied completes. The next one fails
//! with [`RepError::DatabasePreempted`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use keel_types::DatabaseName;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{RepError, RepResult};

/// A replicated database naming operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamingOp {
    /// The database is deleted.
    Remove(DatabaseName),
    /// The database is renamed.
    Rename {
        from: DatabaseName,
        to: DatabaseName,
    },
    /// Every record of the database is deleted.
    Truncate(DatabaseName),
}

impl NamingOp {
    /// Returns every database name whose handles become stale.
    pub fn affected(&self) -> Vec<&DatabaseName> {
        match self {
            NamingOp::Remove(name) | NamingOp::Truncate(name) => vec![name],
            NamingOp::Rename { from, to } => vec![from, to],
        }
    }
}

impl fmt::Display for NamingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamingOp::Remove(name) => write!(f, "remove {name}"),
            NamingOp::Rename { from, to } => write!(f, "rename {from} -> {to}"),
            NamingOp::Truncate(name) => write!(f, "truncate {name}"),
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Per-database generations for one environment.
#[derive(Debug, Default)]
pub struct PreemptionRegistry {
    generations: RwLock<BTreeMap<DatabaseName, u64>>,
}

impl PreemptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current generation of `database`.
    pub fn generation(&self, database: &DatabaseName) -> u64 {
        self.generations
            .read()
            .expect("lock poisoned")
            .get(database)
            .copied()
            .unwrap_or(0)
    }

    /// Makes every open handle to the databases named by `op` stale.
    pub fn preempt(&self, op: &NamingOp) {
        let mut generations = self.generations.write().expect("lock poisoned");
        for name in op.affected() {
            *generations.entry(name.clone()).or_insert(0) += 1;
        }
        info!(op = %op, "database handles preempted");
    }

    /// Opens a handle to `database`.
    pub fn open(self: &Arc<Self>, database: DatabaseName) -> DatabaseHandle {
        let generation = self.generation(&database);
        debug!(database = %database, generation, "database handle opened");
        DatabaseHandle {
            registry: Arc::clone(self),
            database,
            generation,
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// An open handle to a replicated database.
#[derive(Debug, Clone)]
pub struct DatabaseHandle {
    registry: Arc<PreemptionRegistry>,
    database: DatabaseName,
    generation: u64,
}

impl DatabaseHandle {
    /// Returns the database name.
    pub fn database(&self) -> &DatabaseName {
        &self.database
    }

    /// Returns true if no naming operation has touched the database since
    /// the handle was opened.
    pub fn is_valid(&self) -> bool {
        self.registry.generation(&self.database) == self.generation
    }

    /// Runs `op` against the database.
    ///
    /// # Errors
    ///
    /// Returns [`RepError::DatabasePreempted`] if the handle is stale.
    pub fn run<T, F>(&self, op: F) -> RepResult<T>
    where
        F: FnOnce(&DatabaseName) -> T,
    {
        if !self.is_valid() {
            return Err(RepError::DatabasePreempted {
                database: self.database.clone(),
            });
        }
        Ok(op(&self.database))
    }
}

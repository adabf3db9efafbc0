#![deny(warnings)]

//! Persistence layer: the repository collaborator settlements write through,
//! and an in-memory implementation with transactional semantics.
//!
//! Every economic effect is applied inside [`Repository::transact`], which is
//! the serialization point of the whole simulation: a transaction sees a
//! consistent state and either commits all of its changes or none of them.

pub mod state;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sim_core::{CompanyId, ResourceId};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::warn;

pub use state::{CashMovement, EconomyState, Stock};

/// Why cash moved, recorded in the journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Construction,
    Production,
    Loan,
    LoanInterest,
    Bond,
    BondInterest,
    Recruiting,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Classification::Construction => "construction",
            Classification::Production => "production",
            Classification::Loan => "loan",
            Classification::LoanInterest => "loan interest",
            Classification::Bond => "bond",
            Classification::BondInterest => "bond interest",
            Classification::Recruiting => "recruiting",
        };
        f.write_str(s)
    }
}

/// Errors returned by stores.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("company {company} has {available} USD available, needs {needed}")]
    InsufficientFunds {
        company: CompanyId,
        needed: Decimal,
        available: Decimal,
    },
    #[error("company {company} has {available} units of resource {resource}, needs {needed}")]
    InsufficientStock {
        company: CompanyId,
        resource: ResourceId,
        needed: u64,
        available: u64,
    },
    #[error("invalid amount {0}")]
    InvalidAmount(Decimal),
    /// The store could not be reached; the operation may succeed later.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Access to the persisted economy.
///
/// Transactions must not be nested: `f` must not call back into the same
/// repository.
pub trait Repository: Send + Sync + 'static {
    /// Runs `f` atomically. When `f` (or the store) fails nothing is written.
    ///
    /// The journal handed to `f` holds only the movements `f` records; they are
    /// appended to the full journal on commit.
    fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut EconomyState) -> Result<T, E>,
        E: From<StoreError>;

    /// Runs `f` against a consistent view of the state.
    fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&EconomyState) -> T;
}

/// Store keeping the whole economy in memory behind one lock.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<EconomyState>,
}

impl InMemoryStore {
    pub fn new(state: EconomyState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> EconomyState {
        self.state.lock().clone()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.state.lock())
    }
}

impl Repository for InMemoryStore {
    fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut EconomyState) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut state = self.state.lock();
        let journal = std::mem::take(&mut state.journal);
        let mut working = state.clone();
        state.journal = journal;
        let out = f(&mut working)?;
        let mut recorded = std::mem::take(&mut working.journal);
        working.journal = std::mem::take(&mut state.journal);
        working.journal.append(&mut recorded);
        *state = working;
        Ok(out)
    }

    fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&EconomyState) -> T,
    {
        f(&self.state.lock())
    }
}

/// Wrapper failing a configurable number of upcoming transactions with
/// [`StoreError::Unavailable`], for exercising settlement retries.
#[derive(Debug, Default)]
pub struct FaultyStore<R> {
    inner: R,
    failures_left: AtomicU32,
}

impl<R: Repository> FaultyStore<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(0),
        }
    }

    /// Makes the next `n` transactions fail.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn failures_left(&self) -> u32 {
        self.failures_left.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: Repository> Repository for FaultyStore<R> {
    fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut EconomyState) -> Result<T, E>,
        E: From<StoreError>,
    {
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            warn!("injected store fault");
            return Err(StoreError::Unavailable("injected fault".to_string()).into());
        }
        self.inner.transact(f)
    }

    fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&EconomyState) -> T,
    {
        self.inner.read(f)
    }
}

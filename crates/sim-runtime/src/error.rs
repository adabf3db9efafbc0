//! Errors returned by domain services.

use chrono::{DateTime, Utc};
use persistence::StoreError;
use rust_decimal::Decimal;
use sim_core::{BondId, BuildingId, CompanyId, ProductionId, ResourceId, StaffId, ValidationError};
use sim_econ::EconError;
use thiserror::Error;

/// Failure of a domain operation.
///
/// Everything except a transient store failure is a business-rule violation:
/// it is reported to the caller of the immediate phase and never retried.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Econ(#[from] EconError),
    #[error("{what} is busy until {until}")]
    Busy { what: String, until: DateTime<Utc> },
    #[error("building {0} is under construction")]
    UnderConstruction(BuildingId),
    #[error("company {0} has no free terrain")]
    NoTerrain(CompanyId),
    #[error("building {building} cannot produce resource {resource}")]
    NotProducible {
        building: BuildingId,
        resource: ResourceId,
    },
    #[error("production {0} is no longer running")]
    ProductionClosed(ProductionId),
    #[error("amount {amount} exceeds outstanding principal {outstanding}")]
    ExceedsOutstanding {
        amount: Decimal,
        outstanding: Decimal,
    },
    #[error("loan of {amount} exceeds the limit of {limit}")]
    LoanLimit { amount: Decimal, limit: Decimal },
    #[error("bond {bond} has only {available} left to sell")]
    BondExhausted { bond: BondId, available: Decimal },
    #[error("company {0} cannot trade its own bond")]
    OwnBond(CompanyId),
    #[error("staff member {staff} was not found by company {company}")]
    NotACandidate { company: CompanyId, staff: StaffId },
    #[error("company {0} already has a search running")]
    SearchInProgress(CompanyId),
    /// A settlement was asked for before its gate time.
    #[error("{what} is not due before {due}")]
    NotDue { what: String, due: DateTime<Utc> },
}

impl ServiceError {
    /// True when retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Store(e) if e.is_transient())
    }
}

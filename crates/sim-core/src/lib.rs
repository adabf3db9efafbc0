#![deny(warnings)]

//! Core domain models and invariants for the company economy simulation.
//!
//! This crate defines the serializable entities shared by every other crate:
//! companies, buildings, productions, debts and staff, together with the
//! identity keys used to register deferred settlements and the validation
//! helpers guarding basic invariants.
//!
//! Every time-gated entity carries a nullable timestamp (its gate marker).
//! A set marker means a deferred settlement is outstanding for the entity and
//! conflicting operations must be refused until it clears.

pub mod clock;
pub mod config;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use clock::{delay_until, Clock, ManualClock};
pub use config::{ConfigError, EconomyConfig};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a company.
    CompanyId
);
id_type!(
    /// Identifier of a tradeable resource.
    ResourceId
);
id_type!(
    /// Identifier of a building type from the catalog.
    BuildingKindId
);
id_type!(
    /// Identifier of a building owned by a company.
    BuildingId
);
id_type!(
    /// Identifier of a production run.
    ProductionId
);
id_type!(
    /// Identifier of a bank loan.
    LoanId
);
id_type!(
    /// Identifier of an issued bond.
    BondId
);
id_type!(
    /// Identifier of a staff search.
    SearchId
);
id_type!(
    /// Identifier of a staff member or candidate.
    StaffId
);
id_type!(
    /// Identifier of a hiring offer.
    OfferId
);

/// Identity of a deferred settlement. One key maps to at most one pending
/// timer at any instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKey {
    /// Construction or upgrade completion of a building.
    Construction(BuildingId),
    /// End of a production run.
    Production(ProductionId),
    /// Interest cycle of a loan.
    LoanInterest(LoanId),
    /// Interest cycle of one creditor position on a bond.
    BondInterest(BondId, CompanyId),
    /// Completion of a staff search.
    Search(SearchId),
    /// Expiry of a hiring offer.
    Offer(OfferId),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Construction(id) => write!(f, "construction:{id}"),
            TaskKey::Production(id) => write!(f, "production:{id}"),
            TaskKey::LoanInterest(id) => write!(f, "loan-interest:{id}"),
            TaskKey::BondInterest(bond, creditor) => write!(f, "bond-interest:{bond}/{creditor}"),
            TaskKey::Search(id) => write!(f, "search:{id}"),
            TaskKey::Offer(id) => write!(f, "offer:{id}"),
        }
    }
}

/// A company participating in the economy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    /// Brand name.
    pub name: String,
    /// Cash that can be spent right now.
    pub available_cash: Decimal,
    /// Owned terrains with no building on them.
    pub available_terrains: u32,
}

/// Quantity of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQty {
    pub resource_id: ResourceId,
    pub qty: u64,
}

/// Quantity of a resource valued at a unit cost, used for inventory moves.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StockItem {
    pub resource_id: ResourceId,
    pub qty: u64,
    /// Cost of a single unit in USD.
    pub unit_cost: Decimal,
}

/// A resource a building type is able to produce.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub resource_id: ResourceId,
    /// Units produced per hour by a level 1 building.
    pub qty_per_hour: u64,
    /// Cash spent per produced unit (labour, energy).
    pub unit_cost: Decimal,
    /// Resources consumed per produced unit.
    pub inputs: Vec<ResourceQty>,
}

/// A building type from the catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BuildingKind {
    pub id: BuildingKindId,
    pub name: String,
    /// Cost in USD to construct a level 1 building.
    pub construction_cost: Decimal,
    /// Construction time in minutes for a level 1 building.
    pub construction_minutes: i64,
    pub products: Vec<Product>,
}

impl BuildingKind {
    /// Returns the product definition for `resource_id`, if this kind makes it.
    pub fn product(&self, resource_id: ResourceId) -> Option<&Product> {
        self.products.iter().find(|p| p.resource_id == resource_id)
    }
}

/// A building placed on one of a company's terrains.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Building {
    pub id: BuildingId,
    pub company_id: CompanyId,
    pub kind_id: BuildingKindId,
    /// Current level (>= 1).
    pub level: u32,
    /// Set while construction or an upgrade is in progress.
    pub completes_at: Option<DateTime<Utc>>,
    /// Set while a production run occupies the building.
    pub busy_until: Option<DateTime<Utc>>,
}

impl Building {
    /// True when construction or upgrade has not finished.
    pub fn is_under_construction(&self) -> bool {
        self.completes_at.is_some()
    }
}

/// A production run of a single resource in a building.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Production {
    pub id: ProductionId,
    pub company_id: CompanyId,
    pub building_id: BuildingId,
    pub resource_id: ResourceId,
    /// Total units ordered.
    pub qty: u64,
    /// Output rate fixed when the run started.
    pub qty_per_hour: u64,
    /// Sourcing cost of one produced unit (inputs plus cash cost).
    pub unit_cost: Decimal,
    pub started_at: DateTime<Utc>,
    pub finishes_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub last_collection: Option<DateTime<Utc>>,
    /// Units already credited to the inventory.
    pub collected: u64,
}

/// A bank loan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    /// Borrower, who pays the interest.
    pub company_id: CompanyId,
    pub principal: Decimal,
    pub principal_paid: Decimal,
    /// Interest rate applied per interest period.
    pub interest_rate: Decimal,
    /// Consecutive missed interest payments.
    pub delayed_payments: u32,
    /// Set while an interest cycle is scheduled.
    pub next_payment_at: Option<DateTime<Utc>>,
}

impl Loan {
    pub fn outstanding(&self) -> Decimal {
        self.principal - self.principal_paid
    }
}

/// A bond issued by a company.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bond {
    pub id: BondId,
    /// Issuer, who pays the interest.
    pub company_id: CompanyId,
    pub interest_rate: Decimal,
    /// Total amount offered to the market.
    pub emitted: Decimal,
    /// Amount already bought by creditors.
    pub sold: Decimal,
}

impl Bond {
    pub fn available(&self) -> Decimal {
        self.emitted - self.sold
    }
}

/// A company holding part of a bond.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Creditor {
    pub bond_id: BondId,
    pub company_id: CompanyId,
    pub principal: Decimal,
    pub principal_paid: Decimal,
    pub interest_rate: Decimal,
    pub delayed_payments: u32,
    pub next_payment_at: Option<DateTime<Utc>>,
}

impl Creditor {
    pub fn outstanding(&self) -> Decimal {
        self.principal - self.principal_paid
    }
}

/// Kind of staff search.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchKind {
    /// Generates a fresh candidate.
    Graduate,
    /// Poaches a staff member working for another company.
    Experienced,
}

/// A staff search in progress. Exists only while its settlement is pending.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Search {
    pub id: SearchId,
    pub company_id: CompanyId,
    pub kind: SearchKind,
    pub started_at: DateTime<Utc>,
    pub finishes_at: DateTime<Utc>,
}

/// A staff member, hired or still a candidate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Staff {
    pub id: StaffId,
    pub name: String,
    /// Skill in [1, 100].
    pub skill: u8,
    pub salary: Decimal,
    pub employer: Option<CompanyId>,
    /// Company whose search surfaced this person as a graduate.
    pub candidate_of: Option<CompanyId>,
    /// Company trying to hire this person away from their employer.
    pub poacher: Option<CompanyId>,
}

/// A hiring offer waiting for expiry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: OfferId,
    pub company_id: CompanyId,
    pub staff_id: StaffId,
    pub salary: Decimal,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Validation errors for domain invariants.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// Name fields must not be blank.
    #[error("name must not be empty")]
    EmptyName,
    /// Price or cost must be non-negative.
    #[error("negative monetary value is invalid")]
    NegativeMoney,
    /// Amount must be strictly positive.
    #[error("amount must be > 0")]
    NonPositiveAmount,
    /// Durations must be strictly positive.
    #[error("duration must be > 0 minutes")]
    NonPositiveDuration,
    /// Rates must be within [0, 1].
    #[error("rate {0} must be within [0,1]")]
    RateOutOfRange(Decimal),
    /// Output rate must be strictly positive.
    #[error("production rate must be > 0 units/hour")]
    NonPositiveRate,
    /// Levels start at 1.
    #[error("building level must be >= 1")]
    InvalidLevel,
}

/// Validate a company.
pub fn validate_company(c: &Company) -> Result<(), ValidationError> {
    if c.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if c.available_cash < Decimal::ZERO {
        return Err(ValidationError::NegativeMoney);
    }
    Ok(())
}

/// Validate a building type and its products.
pub fn validate_building_kind(k: &BuildingKind) -> Result<(), ValidationError> {
    if k.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if k.construction_cost < Decimal::ZERO {
        return Err(ValidationError::NegativeMoney);
    }
    if k.construction_minutes <= 0 {
        return Err(ValidationError::NonPositiveDuration);
    }
    for p in &k.products {
        if p.qty_per_hour == 0 {
            return Err(ValidationError::NonPositiveRate);
        }
        if p.unit_cost < Decimal::ZERO {
            return Err(ValidationError::NegativeMoney);
        }
    }
    Ok(())
}

/// Validate a building.
pub fn validate_building(b: &Building) -> Result<(), ValidationError> {
    if b.level == 0 {
        return Err(ValidationError::InvalidLevel);
    }
    Ok(())
}

/// Validate an interest rate.
pub fn validate_rate(rate: Decimal) -> Result<(), ValidationError> {
    if rate < Decimal::ZERO || rate > Decimal::ONE {
        return Err(ValidationError::RateOutOfRange(rate));
    }
    Ok(())
}

/// Validate a monetary amount that has to be spent or borrowed.
pub fn validate_amount(amount: Decimal) -> Result<(), ValidationError> {
    if amount <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveAmount);
    }
    Ok(())
}

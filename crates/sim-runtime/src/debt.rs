//! Interest cycle and forced principal payment shared by loans and bonds.

use chrono::{DateTime, Utc};
use persistence::{Classification, EconomyState, StoreError};
use rust_decimal::Decimal;
use sim_core::{CompanyId, TaskKey};
use sim_econ::{building_value, interest_due, plan_liquidation, LiquidationPlan};
use tracing::{info, warn};

/// Result of one interest settlement.
#[derive(Clone, Debug, PartialEq)]
pub enum InterestOutcome {
    /// Interest was paid; the counter is back to zero.
    Paid {
        amount: Decimal,
        next_payment_at: DateTime<Utc>,
    },
    /// The payer could not cover the interest.
    Missed {
        delayed_payments: u32,
        next_payment_at: DateTime<Utc>,
    },
    /// Too many missed payments: assets were seized and the debt is settled.
    /// `released` lists the settlements of demolished buildings.
    Liquidated {
        plan: LiquidationPlan,
        released: Vec<TaskKey>,
    },
    /// The debt no longer runs an interest cycle.
    Closed,
}

impl InterestOutcome {
    /// When the next cycle is due, if there is one.
    pub fn next_payment_at(&self) -> Option<DateTime<Utc>> {
        match self {
            InterestOutcome::Paid {
                next_payment_at, ..
            }
            | InterestOutcome::Missed {
                next_payment_at, ..
            } => Some(*next_payment_at),
            InterestOutcome::Liquidated { .. } | InterestOutcome::Closed => None,
        }
    }
}

/// Terms of a debt as seen by one interest cycle.
pub(crate) struct DebtTerms {
    pub payer: CompanyId,
    pub outstanding: Decimal,
    pub rate: Decimal,
    pub delayed_payments: u32,
}

/// What the cycle decided. The caller applies it to its own entity.
pub(crate) enum Cycle {
    Paid(Decimal),
    Missed(u32),
    Default(u32),
}

/// Charges one period of interest to the payer. A payer short of cash leaves
/// the ledger untouched and counts one more missed payment; reaching
/// `max_delayed` turns it into a default.
pub(crate) fn run_cycle(
    state: &mut EconomyState,
    terms: &DebtTerms,
    classification: Classification,
    description: String,
    max_delayed: u32,
) -> Result<Cycle, StoreError> {
    let interest = interest_due(terms.outstanding, terms.rate);
    match state.debit(terms.payer, interest, classification, description) {
        Ok(()) => Ok(Cycle::Paid(interest)),
        Err(StoreError::InsufficientFunds { .. }) => {
            let delayed = terms.delayed_payments.saturating_add(1);
            if delayed >= max_delayed {
                Ok(Cycle::Default(delayed))
            } else {
                Ok(Cycle::Missed(delayed))
            }
        }
        Err(err) => Err(err),
    }
}

/// Seizes the payer's assets until they cover `target`.
///
/// Buildings go first in ascending id and take their terrain with them; free
/// terrains follow. Construction and production in a seized building stop:
/// the matching settlements are returned so the caller can deregister them.
pub(crate) fn liquidate(
    state: &mut EconomyState,
    payer: CompanyId,
    target: Decimal,
    terrain_price: Decimal,
    now: DateTime<Utc>,
) -> Result<(LiquidationPlan, Vec<TaskKey>), StoreError> {
    let mut valued = Vec::new();
    for building in state.buildings_of(payer) {
        let kind = state.kind(building.kind_id)?;
        valued.push((
            building.id,
            building_value(terrain_price, kind.construction_cost, building.level),
        ));
    }
    let free_terrains = state.company(payer)?.available_terrains;
    let plan = plan_liquidation(&valued, free_terrains, terrain_price, target);

    let mut released = Vec::new();
    for &building_id in &plan.buildings {
        if let Some(run) = state.gated_production(building_id).map(|p| p.id) {
            state.production_mut(run)?.cancelled_at = Some(now);
            released.push(TaskKey::Production(run));
        }
        if let Some(building) = state.buildings.remove(&building_id) {
            if building.is_under_construction() {
                released.push(TaskKey::Construction(building_id));
            }
        }
    }
    let company = state.company_mut(payer)?;
    company.available_terrains = company.available_terrains.saturating_sub(plan.terrains);

    if plan.value < target {
        warn!(company = %payer, value = %plan.value, %target, "assets do not cover the principal");
    }
    info!(
        company = %payer,
        buildings = plan.buildings.len(),
        terrains = plan.terrains_lost(),
        value = %plan.value,
        "assets liquidated"
    );
    Ok((plan, released))
}

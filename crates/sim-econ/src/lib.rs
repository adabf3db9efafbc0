#![deny(warnings)]

//! Economic formulas used by settlements.
//!
//! This module provides validated utilities for:
//! - Production accrual between two collections
//! - Production duration and unit sourcing cost
//! - Interest due per cycle and weighted inventory costing
//! - Greedy asset selection for a forced principal payment

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sim_core::{BuildingId, Production, StockItem};
use thiserror::Error;

/// Errors produced by economic helpers.
#[derive(Debug, Error, PartialEq)]
pub enum EconError {
    /// Production rate must be strictly positive.
    #[error("production rate must be > 0 units/hour")]
    ZeroRate,
    /// Ordered quantity must be strictly positive.
    #[error("quantity must be > 0")]
    ZeroQuantity,
    /// Monetary values must be non-negative.
    #[error("invalid price or cost value")]
    InvalidPrice,
    /// Duration does not fit the calendar.
    #[error("duration overflow")]
    Overflow,
}

/// Units accrued between `origin` and `end` at `qty_per_hour`.
///
/// Only whole elapsed minutes count: qty = minutes × qty_per_hour / 60, floored.
/// Returns 0 when `end` is not after `origin`.
///
/// Example:
/// let q = accrued(t0, t0 + Duration::minutes(60), 1000);
/// assert_eq!(q, 1000);
pub fn accrued(origin: DateTime<Utc>, end: DateTime<Utc>, qty_per_hour: u64) -> u64 {
    let minutes = (end - origin).num_minutes();
    if minutes <= 0 {
        return 0;
    }
    let q = (minutes as u128) * (qty_per_hour as u128) / 60;
    u64::try_from(q).unwrap_or(u64::MAX)
}

/// Units of `p` that are ready to be collected at `now`.
///
/// Accrual starts at the later of the start time and the last collection and
/// stops at the finish time (or the cancellation time). Whole minutes are
/// counted from the start of the run, so a partial minute left by one
/// collection is picked up by the next. Once the finish time is reached the
/// whole remainder is returned, so a run always yields exactly its ordered
/// quantity.
pub fn collectable(p: &Production, now: DateTime<Utc>) -> u64 {
    let remaining = p.qty.saturating_sub(p.collected);
    if remaining == 0 {
        return 0;
    }
    let origin = match p.last_collection {
        Some(last) if last > p.started_at => last,
        _ => p.started_at,
    };
    let stop = p.cancelled_at.unwrap_or(p.finishes_at).min(p.finishes_at);
    if now >= p.finishes_at && stop == p.finishes_at {
        return remaining;
    }
    let end = now.min(stop);
    if end <= origin {
        return 0;
    }
    let through_end = accrued(p.started_at, end, p.qty_per_hour);
    let through_origin = accrued(p.started_at, origin, p.qty_per_hour);
    through_end.saturating_sub(through_origin).min(remaining)
}

/// Time needed to produce `qty` units at `qty_per_hour`, rounded up to a minute.
///
/// Example:
/// assert_eq!(production_duration(1500, 1000).unwrap(), Duration::minutes(90));
pub fn production_duration(qty: u64, qty_per_hour: u64) -> Result<Duration, EconError> {
    if qty_per_hour == 0 {
        return Err(EconError::ZeroRate);
    }
    if qty == 0 {
        return Err(EconError::ZeroQuantity);
    }
    let minutes = ((qty as u128) * 60).div_ceil(qty_per_hour as u128);
    let minutes = i64::try_from(minutes).map_err(|_| EconError::Overflow)?;
    Duration::try_minutes(minutes).ok_or(EconError::Overflow)
}

/// Sourcing cost of one produced unit: the cash cost plus every input valued
/// at its inventory unit cost. `inputs` are quantities per produced unit.
///
/// Example:
/// let inputs = [StockItem { resource_id: ResourceId(2), qty: 2, unit_cost: Decimal::new(3, 0) }];
/// assert_eq!(unit_sourcing_cost(Decimal::ONE, &inputs).unwrap(), Decimal::new(7, 0));
pub fn unit_sourcing_cost(cash_unit_cost: Decimal, inputs: &[StockItem]) -> Result<Decimal, EconError> {
    if cash_unit_cost < Decimal::ZERO {
        return Err(EconError::InvalidPrice);
    }
    let mut total = cash_unit_cost;
    for item in inputs {
        if item.unit_cost < Decimal::ZERO {
            return Err(EconError::InvalidPrice);
        }
        total += item.unit_cost * Decimal::from(item.qty);
    }
    Ok(total)
}

/// Interest due for one cycle, rounded to cents.
///
/// Example:
/// assert_eq!(interest_due(Decimal::new(10_000, 0), Decimal::new(5, 2)), Decimal::new(500, 0));
pub fn interest_due(outstanding: Decimal, rate: Decimal) -> Decimal {
    if outstanding <= Decimal::ZERO || rate <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (outstanding * rate).round_dp(2)
}

/// Unit cost after adding `add_qty` units at `add_cost` to `qty` units at `cost`.
pub fn weighted_unit_cost(qty: u64, cost: Decimal, add_qty: u64, add_cost: Decimal) -> Decimal {
    let total = qty.saturating_add(add_qty);
    if total == 0 {
        return Decimal::ZERO;
    }
    (cost * Decimal::from(qty) + add_cost * Decimal::from(add_qty)) / Decimal::from(total)
}

/// Cost of upgrading a building currently at `level`.
pub fn upgrade_cost(construction_cost: Decimal, level: u32) -> Decimal {
    construction_cost * Decimal::from(level.max(1))
}

/// Upgrade duration for a building currently at `level`.
pub fn upgrade_duration(construction_minutes: i64, level: u32) -> Result<Duration, EconError> {
    let minutes = construction_minutes
        .checked_mul(i64::from(level.max(1)))
        .ok_or(EconError::Overflow)?;
    Duration::try_minutes(minutes).ok_or(EconError::Overflow)
}

/// Liquidation value of a building: the terrain under it plus what was spent
/// raising it to its level.
pub fn building_value(terrain_price: Decimal, construction_cost: Decimal, level: u32) -> Decimal {
    terrain_price + construction_cost * Decimal::from(level)
}

/// Assets selected for a forced principal payment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiquidationPlan {
    /// Buildings to demolish, ascending id.
    pub buildings: Vec<BuildingId>,
    /// Free terrains to seize.
    pub terrains: u32,
    /// Cumulative value of the selection.
    pub value: Decimal,
}

impl LiquidationPlan {
    /// Terrains leaving the company: one under each building plus the free ones.
    pub fn terrains_lost(&self) -> u32 {
        self.terrains
            .saturating_add(u32::try_from(self.buildings.len()).unwrap_or(u32::MAX))
    }
}

/// Greedily select assets until their value covers `target`.
///
/// Buildings are taken in ascending id order, then free terrains at
/// `terrain_price` each. If every asset together is worth less than `target`
/// all of them are selected.
///
/// Example:
/// let plan = plan_liquidation(&[(BuildingId(2), v2), (BuildingId(1), v1)], 3, price, target);
/// assert_eq!(plan.buildings[0], BuildingId(1));
pub fn plan_liquidation(
    buildings: &[(BuildingId, Decimal)],
    free_terrains: u32,
    terrain_price: Decimal,
    target: Decimal,
) -> LiquidationPlan {
    let mut plan = LiquidationPlan::default();
    if target <= Decimal::ZERO {
        return plan;
    }
    let mut sorted: Vec<(BuildingId, Decimal)> = buildings.to_vec();
    sorted.sort_by_key(|(id, _)| *id);
    for (id, value) in sorted {
        if plan.value >= target {
            return plan;
        }
        plan.buildings.push(id);
        plan.value += value;
    }
    while plan.value < target && plan.terrains < free_terrains {
        plan.terrains += 1;
        plan.value += terrain_price;
    }
    plan
}

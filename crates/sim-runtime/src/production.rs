//! Production runs: resources and cash are reserved up front, output accrues
//! with time and is credited to the inventory on collection.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use persistence::{Classification, EconomyState, Repository, StoreError};
use rust_decimal::Decimal;
use sim_core::{
    BuildingId, Clock, CompanyId, Production, ProductionId, ResourceId, ResourceQty, StockItem,
    TaskKey,
};
use sim_econ::{collectable, production_duration, unit_sourcing_cost, EconError};
use std::sync::Arc;
use tracing::{debug, info};

use crate::facade::Scheduled;
use crate::gate::{ensure_building_free, ensure_due};
use crate::ServiceError;

/// Units credited by one collection, with the run as it was left.
#[derive(Clone, Debug, PartialEq)]
pub struct Collection {
    pub production: Production,
    pub collected: u64,
}

/// Production operations. A running production keeps its building's
/// `busy_until` set until the run is cancelled or its end is settled.
#[async_trait]
pub trait Productions: Send + Sync {
    /// Starts producing `qty` units of `resource` in an idle building,
    /// consuming the inputs and paying the cash cost of the whole run.
    async fn start_production(
        &self,
        company: CompanyId,
        building: BuildingId,
        resource: ResourceId,
        qty: u64,
    ) -> Result<Production, ServiceError>;

    /// Credits what was produced since the previous collection. Never frees
    /// the building.
    async fn collect_production(
        &self,
        company: CompanyId,
        production: ProductionId,
    ) -> Result<Collection, ServiceError>;

    /// Credits what was produced so far, stops the run and frees the
    /// building.
    async fn cancel_production(
        &self,
        company: CompanyId,
        production: ProductionId,
    ) -> Result<Collection, ServiceError>;

    /// Settlement: credits the remainder of a run that reached its end and
    /// frees the building. A cancelled or already settled run is left alone;
    /// one still running is refused with [`ServiceError::NotDue`].
    async fn finish_production(
        &self,
        production: ProductionId,
    ) -> Result<Option<Collection>, ServiceError>;
}

pub struct ProductionService<R> {
    repo: Arc<R>,
    clock: Arc<dyn Clock>,
}

impl<R: Repository> ProductionService<R> {
    pub fn new(repo: Arc<R>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }
}

/// Moves everything collectable at `at` into the company's inventory.
fn credit_output(
    state: &mut EconomyState,
    production: ProductionId,
    at: DateTime<Utc>,
) -> Result<Collection, StoreError> {
    let run = state.production(production)?;
    let qty = collectable(run, at);
    let item = StockItem {
        resource_id: run.resource_id,
        qty,
        unit_cost: run.unit_cost,
    };
    let company = run.company_id;
    state.increment_stock(company, &[item]);
    let run = state.production_mut(production)?;
    run.collected += qty;
    run.last_collection = Some(at);
    debug!(production = %production, qty, "output collected");
    Ok(Collection {
        production: run.clone(),
        collected: qty,
    })
}

/// True while `run` holds its building's gate.
fn is_running(state: &EconomyState, run: &Production) -> bool {
    run.cancelled_at.is_none()
        && state
            .gated_production(run.building_id)
            .is_some_and(|gated| gated.id == run.id)
}

fn owned(run: &Production, company: CompanyId) -> Result<&Production, ServiceError> {
    if run.company_id != company {
        return Err(StoreError::not_found("production", run.id).into());
    }
    Ok(run)
}

#[async_trait]
impl<R: Repository> Productions for ProductionService<R> {
    async fn start_production(
        &self,
        company: CompanyId,
        building: BuildingId,
        resource: ResourceId,
        qty: u64,
    ) -> Result<Production, ServiceError> {
        let now = self.clock.now();
        let run = self.repo.transact(|state| {
            let site = state.building(building)?.clone();
            if site.company_id != company {
                return Err(StoreError::not_found("building", building).into());
            }
            ensure_building_free(&site)?;
            let kind = state.kind(site.kind_id)?;
            let product = kind
                .product(resource)
                .cloned()
                .ok_or(ServiceError::NotProducible { building, resource })?;
            let qty_per_hour = product.qty_per_hour * u64::from(site.level);
            let duration = production_duration(qty, qty_per_hour)?;

            let mut needed = Vec::with_capacity(product.inputs.len());
            for input in &product.inputs {
                needed.push(ResourceQty {
                    resource_id: input.resource_id,
                    qty: input.qty.checked_mul(qty).ok_or(EconError::Overflow)?,
                });
            }
            let taken = state.reduce_stock(company, &needed)?;
            let per_unit: Vec<StockItem> = product
                .inputs
                .iter()
                .map(|input| StockItem {
                    resource_id: input.resource_id,
                    qty: input.qty,
                    unit_cost: taken
                        .iter()
                        .find(|t| t.resource_id == input.resource_id)
                        .map_or(Decimal::ZERO, |t| t.unit_cost),
                })
                .collect();
            let unit_cost = unit_sourcing_cost(product.unit_cost, &per_unit)?;
            state.debit(
                company,
                product.unit_cost * Decimal::from(qty),
                Classification::Production,
                format!("production of {qty} units of resource {resource}"),
            )?;

            let run = Production {
                id: ProductionId(state.allocate_id()),
                company_id: company,
                building_id: building,
                resource_id: resource,
                qty,
                qty_per_hour,
                unit_cost,
                started_at: now,
                finishes_at: now + duration,
                cancelled_at: None,
                last_collection: None,
                collected: 0,
            };
            state.building_mut(building)?.busy_until = Some(run.finishes_at);
            state.productions.insert(run.id, run.clone());
            Ok::<_, ServiceError>(run)
        })?;
        info!(
            company = %company,
            building = %building,
            production = %run.id,
            qty,
            finishes_at = %run.finishes_at,
            "production started"
        );
        Ok(run)
    }

    async fn collect_production(
        &self,
        company: CompanyId,
        production: ProductionId,
    ) -> Result<Collection, ServiceError> {
        let now = self.clock.now();
        self.repo.transact(|state| {
            let run = owned(state.production(production)?, company)?;
            if run.cancelled_at.is_some() {
                return Err(ServiceError::ProductionClosed(production));
            }
            Ok(credit_output(state, production, now)?)
        })
    }

    async fn cancel_production(
        &self,
        company: CompanyId,
        production: ProductionId,
    ) -> Result<Collection, ServiceError> {
        let now = self.clock.now();
        let collection = self.repo.transact(|state| {
            let run = owned(state.production(production)?, company)?;
            if !is_running(state, run) {
                return Err(ServiceError::ProductionClosed(production));
            }
            let building = run.building_id;
            let mut collection = credit_output(state, production, now)?;
            let run = state.production_mut(production)?;
            run.cancelled_at = Some(now);
            collection.production = run.clone();
            state.building_mut(building)?.busy_until = None;
            Ok(collection)
        })?;
        info!(
            company = %company,
            production = %production,
            collected = collection.production.collected,
            ordered = collection.production.qty,
            "production cancelled"
        );
        Ok(collection)
    }

    async fn finish_production(
        &self,
        production: ProductionId,
    ) -> Result<Option<Collection>, ServiceError> {
        let now = self.clock.now();
        let finished = self.repo.transact(|state| {
            let Some(run) = state.productions.get(&production) else {
                return Ok::<_, ServiceError>(None);
            };
            if !is_running(state, run) {
                return Ok(None);
            }
            ensure_due(|| format!("production {production}"), run.finishes_at, now)?;
            let building = run.building_id;
            let collection = credit_output(state, production, now)?;
            state.building_mut(building)?.busy_until = None;
            Ok(Some(collection))
        })?;
        if let Some(done) = &finished {
            info!(production = %production, collected = done.collected, "production finished");
        }
        Ok(finished)
    }
}

#[async_trait]
impl<S: Productions + 'static> Productions for Scheduled<S> {
    async fn start_production(
        &self,
        company: CompanyId,
        building: BuildingId,
        resource: ResourceId,
        qty: u64,
    ) -> Result<Production, ServiceError> {
        let run = self
            .inner
            .start_production(company, building, resource, qty)
            .await?;
        self.arm_production(run.id, run.finishes_at);
        Ok(run)
    }

    async fn collect_production(
        &self,
        company: CompanyId,
        production: ProductionId,
    ) -> Result<Collection, ServiceError> {
        self.inner.collect_production(company, production).await
    }

    async fn cancel_production(
        &self,
        company: CompanyId,
        production: ProductionId,
    ) -> Result<Collection, ServiceError> {
        let collection = self.inner.cancel_production(company, production).await?;
        self.disarm(TaskKey::Production(production)).await;
        Ok(collection)
    }

    async fn finish_production(
        &self,
        production: ProductionId,
    ) -> Result<Option<Collection>, ServiceError> {
        let finished = self.inner.finish_production(production).await?;
        if finished.is_some() {
            self.disarm(TaskKey::Production(production)).await;
        }
        Ok(finished)
    }
}

impl<S: Productions + 'static> Scheduled<S> {
    pub(crate) fn arm_production(&self, production: ProductionId, at: DateTime<Utc>) {
        let inner = Arc::clone(&self.inner);
        self.arm(TaskKey::Production(production), at, move || {
            let inner = Arc::clone(&inner);
            async move { inner.finish_production(production).await.map(|_| ()) }
        });
    }
}

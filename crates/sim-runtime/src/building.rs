//! Construction, upgrade and demolition of buildings.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use persistence::{Classification, Repository, StoreError};
use sim_core::{
    validate_building, Building, BuildingId, BuildingKindId, Clock, CompanyId, TaskKey,
};
use sim_econ::{upgrade_cost, upgrade_duration, EconError};
use std::sync::Arc;
use tracing::info;

use crate::facade::Scheduled;
use crate::gate::{ensure_building_free, ensure_due};
use crate::ServiceError;

/// Building operations. A building under construction or upgrade carries
/// `completes_at` until [`Buildings::complete_construction`] settles it.
#[async_trait]
pub trait Buildings: Send + Sync {
    /// Builds a level 1 building of `kind` on a free terrain.
    async fn construct(
        &self,
        company: CompanyId,
        kind: BuildingKindId,
    ) -> Result<Building, ServiceError>;

    /// Raises a finished, idle building by one level.
    async fn upgrade(
        &self,
        company: CompanyId,
        building: BuildingId,
    ) -> Result<Building, ServiceError>;

    /// Tears a building down and gives its terrain back. Returns the removed
    /// building.
    async fn demolish(
        &self,
        company: CompanyId,
        building: BuildingId,
    ) -> Result<Building, ServiceError>;

    /// Settlement: ends construction. A building that is gone or already
    /// finished is left alone; one still being built is refused with
    /// [`ServiceError::NotDue`].
    async fn complete_construction(
        &self,
        building: BuildingId,
    ) -> Result<Option<Building>, ServiceError>;
}

pub struct BuildingService<R> {
    repo: Arc<R>,
    clock: Arc<dyn Clock>,
}

impl<R: Repository> BuildingService<R> {
    pub fn new(repo: Arc<R>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }
}

#[async_trait]
impl<R: Repository> Buildings for BuildingService<R> {
    async fn construct(
        &self,
        company: CompanyId,
        kind: BuildingKindId,
    ) -> Result<Building, ServiceError> {
        let now = self.clock.now();
        let building = self.repo.transact(|state| {
            let kind = state.kind(kind)?.clone();
            if state.company(company)?.available_terrains == 0 {
                return Err(ServiceError::NoTerrain(company));
            }
            let duration =
                Duration::try_minutes(kind.construction_minutes).ok_or(EconError::Overflow)?;
            state.debit(
                company,
                kind.construction_cost,
                Classification::Construction,
                format!("construction of {}", kind.name),
            )?;
            state.company_mut(company)?.available_terrains -= 1;
            let building = Building {
                id: BuildingId(state.allocate_id()),
                company_id: company,
                kind_id: kind.id,
                level: 1,
                completes_at: Some(now + duration),
                busy_until: None,
            };
            validate_building(&building)?;
            state.buildings.insert(building.id, building.clone());
            Ok(building)
        })?;
        info!(company = %company, building = %building.id, completes_at = ?building.completes_at, "construction started");
        Ok(building)
    }

    async fn upgrade(
        &self,
        company: CompanyId,
        building: BuildingId,
    ) -> Result<Building, ServiceError> {
        let now = self.clock.now();
        let building = self.repo.transact(|state| {
            let current = owned(state.building(building)?, company)?.clone();
            ensure_building_free(&current)?;
            let kind = state.kind(current.kind_id)?.clone();
            let cost = upgrade_cost(kind.construction_cost, current.level);
            let duration = upgrade_duration(kind.construction_minutes, current.level)?;
            state.debit(
                company,
                cost,
                Classification::Construction,
                format!("upgrade of {} to level {}", kind.name, current.level + 1),
            )?;
            let upgraded = state.building_mut(building)?;
            upgraded.level += 1;
            upgraded.completes_at = Some(now + duration);
            Ok::<_, ServiceError>(upgraded.clone())
        })?;
        info!(company = %company, building = %building.id, level = building.level, "upgrade started");
        Ok(building)
    }

    async fn demolish(
        &self,
        company: CompanyId,
        building: BuildingId,
    ) -> Result<Building, ServiceError> {
        let removed = self.repo.transact(|state| {
            let current = owned(state.building(building)?, company)?;
            if let Some(until) = current.busy_until {
                return Err(ServiceError::Busy {
                    what: format!("building {building}"),
                    until,
                });
            }
            let removed = state
                .buildings
                .remove(&building)
                .ok_or_else(|| StoreError::not_found("building", building))?;
            state.company_mut(company)?.available_terrains += 1;
            Ok(removed)
        })?;
        info!(company = %company, building = %building, "building demolished");
        Ok(removed)
    }

    async fn complete_construction(
        &self,
        building: BuildingId,
    ) -> Result<Option<Building>, ServiceError> {
        let now = self.clock.now();
        let completed = self.repo.transact(|state| {
            let Some(current) = state.buildings.get_mut(&building) else {
                return Ok::<_, ServiceError>(None);
            };
            let Some(due) = current.completes_at else {
                return Ok(None);
            };
            ensure_due(|| format!("construction of building {building}"), due, now)?;
            current.completes_at = None;
            Ok(Some(current.clone()))
        })?;
        if let Some(done) = &completed {
            info!(building = %done.id, level = done.level, "construction completed");
        }
        Ok(completed)
    }
}

/// Hides buildings of other companies behind the same error as missing ones.
fn owned(building: &Building, company: CompanyId) -> Result<&Building, ServiceError> {
    if building.company_id != company {
        return Err(StoreError::not_found("building", building.id).into());
    }
    Ok(building)
}

#[async_trait]
impl<S: Buildings + 'static> Buildings for Scheduled<S> {
    async fn construct(
        &self,
        company: CompanyId,
        kind: BuildingKindId,
    ) -> Result<Building, ServiceError> {
        let building = self.inner.construct(company, kind).await?;
        if let Some(at) = building.completes_at {
            self.arm_construction(building.id, at);
        }
        Ok(building)
    }

    async fn upgrade(
        &self,
        company: CompanyId,
        building: BuildingId,
    ) -> Result<Building, ServiceError> {
        let building = self.inner.upgrade(company, building).await?;
        if let Some(at) = building.completes_at {
            self.arm_construction(building.id, at);
        }
        Ok(building)
    }

    async fn demolish(
        &self,
        company: CompanyId,
        building: BuildingId,
    ) -> Result<Building, ServiceError> {
        let removed = self.inner.demolish(company, building).await?;
        self.disarm(TaskKey::Construction(building)).await;
        Ok(removed)
    }

    async fn complete_construction(
        &self,
        building: BuildingId,
    ) -> Result<Option<Building>, ServiceError> {
        let completed = self.inner.complete_construction(building).await?;
        if completed.is_some() {
            self.disarm(TaskKey::Construction(building)).await;
        }
        Ok(completed)
    }
}

impl<S: Buildings + 'static> Scheduled<S> {
    pub(crate) fn arm_construction(&self, building: BuildingId, at: DateTime<Utc>) {
        let inner = Arc::clone(&self.inner);
        self.arm(TaskKey::Construction(building), at, move || {
            let inner = Arc::clone(&inner);
            async move { inner.complete_construction(building).await.map(|_| ()) }
        });
    }
}

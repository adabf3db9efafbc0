#![deny(warnings)]

//! Runtime of the economy: domain services with their immediate and
//! settlement phases, the scheduling facades tying them to the deferred task
//! registry, and [`Economy`], which wires one of each around a shared
//! repository and registry.
//!
//! Every gated operation follows the same shape. The service validates and
//! applies the immediate effect in one repository transaction and returns the
//! entity with its gate set. The facade registers the settlement for the gate
//! time. When the timer fires the settlement re-reads the entity, does nothing
//! if the gate was cleared meanwhile, and otherwise applies its effect and
//! clears the gate in one transaction. Cancelling operations clear the gate
//! first and then deregister the settlement.

pub mod bonds;
pub mod building;
pub mod clock;
mod debt;
pub mod error;
pub mod facade;
pub mod gate;
pub mod loans;
pub mod notify;
pub mod production;
pub mod recruiting;

#[cfg(test)]
mod scenarios;

use persistence::Repository;
use sim_core::{Clock, EconomyConfig, TaskKey};
use sim_scheduler::Scheduler;
use std::sync::Arc;
use tracing::info;

pub use bonds::{BondPurchase, BondService, Bonds};
pub use building::{BuildingService, Buildings};
pub use clock::RuntimeClock;
pub use debt::InterestOutcome;
pub use error::ServiceError;
pub use facade::Scheduled;
pub use gate::{open_gates, GateAudit};
pub use loans::{LoanService, Loans};
pub use notify::{Notifier, RecordingNotifier, TracingNotifier};
pub use production::{Collection, ProductionService, Productions};
pub use recruiting::{Recruiting, RecruitingService};

/// One scheduling facade per domain over a shared repository and registry.
pub struct Economy<R> {
    repo: Arc<R>,
    scheduler: Scheduler<TaskKey>,
    pub buildings: Scheduled<BuildingService<R>>,
    pub production: Scheduled<ProductionService<R>>,
    pub loans: Scheduled<LoanService<R>>,
    pub bonds: Scheduled<BondService<R>>,
    pub recruiting: Scheduled<RecruitingService<R>>,
}

impl<R: Repository> Economy<R> {
    /// Builds the services and an empty registry. Timers are only spawned by
    /// operations, so this may run outside a tokio runtime.
    pub fn new(
        repo: Arc<R>,
        clock: Arc<dyn Clock>,
        config: EconomyConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let config = Arc::new(config);
        let scheduler = Scheduler::new(config.retry_delay());
        let timeout = config.settlement_timeout();

        let buildings = Scheduled::new(
            Arc::new(BuildingService::new(Arc::clone(&repo), Arc::clone(&clock))),
            scheduler.clone(),
            Arc::clone(&clock),
            timeout,
        );
        let production = Scheduled::new(
            Arc::new(ProductionService::new(Arc::clone(&repo), Arc::clone(&clock))),
            scheduler.clone(),
            Arc::clone(&clock),
            timeout,
        );
        let loans = Scheduled::new(
            Arc::new(LoanService::new(
                Arc::clone(&repo),
                Arc::clone(&clock),
                Arc::clone(&config),
                Arc::clone(&notifier),
            )),
            scheduler.clone(),
            Arc::clone(&clock),
            timeout,
        );
        let bonds = Scheduled::new(
            Arc::new(BondService::new(
                Arc::clone(&repo),
                Arc::clone(&clock),
                Arc::clone(&config),
                Arc::clone(&notifier),
            )),
            scheduler.clone(),
            Arc::clone(&clock),
            timeout,
        );
        let recruiting = Scheduled::new(
            Arc::new(RecruitingService::new(
                Arc::clone(&repo),
                Arc::clone(&clock),
                Arc::clone(&config),
            )),
            scheduler.clone(),
            Arc::clone(&clock),
            timeout,
        );

        Self {
            repo,
            scheduler,
            buildings,
            production,
            loans,
            bonds,
            recruiting,
        }
    }

    pub fn repo(&self) -> &Arc<R> {
        &self.repo
    }

    pub fn scheduler(&self) -> &Scheduler<TaskKey> {
        &self.scheduler
    }

    /// Compares gate markers with registered settlements.
    pub fn audit(&self) -> GateAudit {
        let registered = self.scheduler.keys();
        self.repo.read(|state| gate::audit(state, &registered))
    }

    /// Registers a settlement for every set gate that has none, e.g. after
    /// loading a saved state or once a stuck gate has been investigated.
    /// Overdue settlements fire right away. Returns how many were registered.
    pub fn resume(&self) -> usize {
        let gates = self.repo.read(open_gates);
        let mut armed = 0;
        for (key, at) in gates {
            if self.scheduler.is_scheduled(&key) {
                continue;
            }
            match key {
                TaskKey::Construction(id) => self.buildings.arm_construction(id, at),
                TaskKey::Production(id) => self.production.arm_production(id, at),
                TaskKey::LoanInterest(id) => self.loans.arm_loan_interest(id, at),
                TaskKey::BondInterest(bond, creditor) => {
                    self.bonds.arm_bond_interest(bond, creditor, at)
                }
                TaskKey::Search(id) => self.recruiting.arm_search(id, at),
                TaskKey::Offer(id) => self.recruiting.arm_offer(id, at),
            }
            armed += 1;
        }
        info!(armed, "settlements resumed");
        armed
    }

    /// Deregisters every pending settlement, leaving gates as they are.
    pub async fn shutdown(&self) -> usize {
        let stopped = self.scheduler.cancel_all().await;
        info!(stopped, "economy shut down");
        stopped
    }
}

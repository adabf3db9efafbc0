//! Economic gates: the nullable markers on entities that block conflicting
//! operations while a settlement is outstanding, and the audit checking them
//! against the registry.

use chrono::{DateTime, Utc};
use persistence::EconomyState;
use sim_core::{Building, TaskKey};

use crate::ServiceError;

/// Refuses gated work on a building that is being built or is producing.
pub(crate) fn ensure_building_free(building: &Building) -> Result<(), ServiceError> {
    if building.is_under_construction() {
        return Err(ServiceError::UnderConstruction(building.id));
    }
    if let Some(until) = building.busy_until {
        return Err(ServiceError::Busy {
            what: format!("building {}", building.id),
            until,
        });
    }
    Ok(())
}

/// Refuses a settlement whose gate time has not been reached.
pub(crate) fn ensure_due(
    what: impl FnOnce() -> String,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    if now < due {
        return Err(ServiceError::NotDue { what: what(), due });
    }
    Ok(())
}

/// Every set gate marker with the key of the settlement it waits for and the
/// time that settlement is due.
pub fn open_gates(state: &EconomyState) -> Vec<(TaskKey, DateTime<Utc>)> {
    let mut gates = Vec::new();
    for building in state.buildings.values() {
        if let Some(at) = building.completes_at {
            gates.push((TaskKey::Construction(building.id), at));
        }
        if let Some(run) = state.gated_production(building.id) {
            gates.push((TaskKey::Production(run.id), run.finishes_at));
        }
    }
    for loan in state.loans.values() {
        if let Some(at) = loan.next_payment_at {
            gates.push((TaskKey::LoanInterest(loan.id), at));
        }
    }
    for creditor in state.creditors.values().flat_map(|by_company| by_company.values()) {
        if let Some(at) = creditor.next_payment_at {
            gates.push((
                TaskKey::BondInterest(creditor.bond_id, creditor.company_id),
                at,
            ));
        }
    }
    for search in state.searches.values() {
        gates.push((TaskKey::Search(search.id), search.finishes_at));
    }
    for offer in state.offers.values() {
        gates.push((TaskKey::Offer(offer.id), offer.expires_at));
    }
    gates
}

/// Disagreement between gate markers and registered tasks.
///
/// Only meaningful while no settlement is firing: a settlement clears its gate
/// a moment before its task leaves the registry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GateAudit {
    /// Gates set with nothing registered to clear them.
    pub unscheduled: Vec<TaskKey>,
    /// Registered tasks whose entity has no gate set.
    pub orphaned: Vec<TaskKey>,
}

impl GateAudit {
    pub fn is_consistent(&self) -> bool {
        self.unscheduled.is_empty() && self.orphaned.is_empty()
    }
}

/// Compares the open gates of `state` with the keys currently registered.
pub fn audit(state: &EconomyState, registered: &[TaskKey]) -> GateAudit {
    let open: Vec<TaskKey> = open_gates(state).into_iter().map(|(key, _)| key).collect();
    GateAudit {
        unscheduled: open
            .iter()
            .filter(|key| !registered.contains(key))
            .copied()
            .collect(),
        orphaned: registered
            .iter()
            .filter(|key| !open.contains(key))
            .copied()
            .collect(),
    }
}

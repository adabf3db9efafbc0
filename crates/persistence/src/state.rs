//! Whole-economy state held by a store, with the ledger and inventory
//! operations settlements are built from.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sim_core::{
    Bond, BondId, Building, BuildingId, BuildingKind, BuildingKindId, Company, CompanyId,
    Creditor, Loan, LoanId, Offer, OfferId, Production, ProductionId, ResourceId, ResourceQty,
    Search, SearchId, Staff, StaffId, StockItem,
};
use std::collections::BTreeMap;
use tracing::debug;

use crate::{Classification, StoreError};

/// Units of one resource held by a company, valued at their average unit cost.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub qty: u64,
    pub unit_cost: Decimal,
}

/// One line of the cash journal. Debits are negative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CashMovement {
    pub company_id: CompanyId,
    pub amount: Decimal,
    pub classification: Classification,
    pub description: String,
}

/// Every persisted entity of the economy.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EconomyState {
    next_id: u64,
    pub companies: BTreeMap<CompanyId, Company>,
    pub kinds: BTreeMap<BuildingKindId, BuildingKind>,
    pub buildings: BTreeMap<BuildingId, Building>,
    pub productions: BTreeMap<ProductionId, Production>,
    pub inventories: BTreeMap<CompanyId, BTreeMap<ResourceId, Stock>>,
    pub loans: BTreeMap<LoanId, Loan>,
    pub bonds: BTreeMap<BondId, Bond>,
    pub creditors: BTreeMap<BondId, BTreeMap<CompanyId, Creditor>>,
    pub searches: BTreeMap<SearchId, Search>,
    pub staff: BTreeMap<StaffId, Staff>,
    pub offers: BTreeMap<OfferId, Offer>,
    pub journal: Vec<CashMovement>,
}

macro_rules! lookup {
    ($get:ident, $field:ident, $id:ty, $entity:ty, $name:literal) => {
        pub fn $get(&self, id: $id) -> Result<&$entity, StoreError> {
            self.$field
                .get(&id)
                .ok_or_else(|| StoreError::not_found($name, id))
        }
    };
    ($get:ident, $get_mut:ident, $field:ident, $id:ty, $entity:ty, $name:literal) => {
        lookup!($get, $field, $id, $entity, $name);

        pub fn $get_mut(&mut self, id: $id) -> Result<&mut $entity, StoreError> {
            self.$field
                .get_mut(&id)
                .ok_or_else(|| StoreError::not_found($name, id))
        }
    };
}

impl EconomyState {
    /// Hands out a fresh identifier, unique across every entity type.
    pub fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn add_company(&mut self, name: &str, cash: Decimal, terrains: u32) -> CompanyId {
        let id = CompanyId(self.allocate_id());
        self.companies.insert(
            id,
            Company {
                id,
                name: name.to_string(),
                available_cash: cash,
                available_terrains: terrains,
            },
        );
        id
    }

    /// Adds a catalog entry, replacing its id with a freshly allocated one.
    pub fn add_building_kind(&mut self, mut kind: BuildingKind) -> BuildingKindId {
        kind.id = BuildingKindId(self.allocate_id());
        let id = kind.id;
        self.kinds.insert(id, kind);
        id
    }

    /// Adds a staff member, replacing its id with a freshly allocated one.
    pub fn add_staff(&mut self, mut staff: Staff) -> StaffId {
        staff.id = StaffId(self.allocate_id());
        let id = staff.id;
        self.staff.insert(id, staff);
        id
    }

    lookup!(company, company_mut, companies, CompanyId, Company, "company");
    lookup!(kind, kinds, BuildingKindId, BuildingKind, "building kind");
    lookup!(building, building_mut, buildings, BuildingId, Building, "building");
    lookup!(production, production_mut, productions, ProductionId, Production, "production");
    lookup!(loan, loan_mut, loans, LoanId, Loan, "loan");
    lookup!(bond, bond_mut, bonds, BondId, Bond, "bond");
    lookup!(search, searches, SearchId, Search, "search");
    lookup!(staff_member, staff_member_mut, staff, StaffId, Staff, "staff member");
    lookup!(offer, offers, OfferId, Offer, "offer");

    pub fn creditor(&self, bond: BondId, company: CompanyId) -> Result<&Creditor, StoreError> {
        self.creditors
            .get(&bond)
            .and_then(|by_company| by_company.get(&company))
            .ok_or_else(|| StoreError::not_found("creditor", format!("{bond}/{company}")))
    }

    pub fn creditor_mut(
        &mut self,
        bond: BondId,
        company: CompanyId,
    ) -> Result<&mut Creditor, StoreError> {
        self.creditors
            .get_mut(&bond)
            .and_then(|by_company| by_company.get_mut(&company))
            .ok_or_else(|| StoreError::not_found("creditor", format!("{bond}/{company}")))
    }

    /// Removes `amount` from a company's available cash, failing without any
    /// change when the company cannot cover it.
    pub fn debit(
        &mut self,
        company_id: CompanyId,
        amount: Decimal,
        classification: Classification,
        description: impl Into<String>,
    ) -> Result<(), StoreError> {
        if amount < Decimal::ZERO {
            return Err(StoreError::InvalidAmount(amount));
        }
        let company = self.company_mut(company_id)?;
        if company.available_cash < amount {
            return Err(StoreError::InsufficientFunds {
                company: company_id,
                needed: amount,
                available: company.available_cash,
            });
        }
        company.available_cash -= amount;
        self.record(company_id, -amount, classification, description.into());
        Ok(())
    }

    pub fn credit(
        &mut self,
        company_id: CompanyId,
        amount: Decimal,
        classification: Classification,
        description: impl Into<String>,
    ) -> Result<(), StoreError> {
        if amount < Decimal::ZERO {
            return Err(StoreError::InvalidAmount(amount));
        }
        self.company_mut(company_id)?.available_cash += amount;
        self.record(company_id, amount, classification, description.into());
        Ok(())
    }

    fn record(
        &mut self,
        company_id: CompanyId,
        amount: Decimal,
        classification: Classification,
        description: String,
    ) {
        debug!(company = %company_id, %amount, %classification, %description, "cash movement");
        self.journal.push(CashMovement {
            company_id,
            amount,
            classification,
            description,
        });
    }

    pub fn stock(&self, company_id: CompanyId, resource_id: ResourceId) -> Stock {
        self.inventories
            .get(&company_id)
            .and_then(|inv| inv.get(&resource_id))
            .copied()
            .unwrap_or_default()
    }

    /// Takes `items` out of a company's inventory, all or nothing. Returns the
    /// removed quantities valued at their average unit cost.
    pub fn reduce_stock(
        &mut self,
        company_id: CompanyId,
        items: &[ResourceQty],
    ) -> Result<Vec<StockItem>, StoreError> {
        let mut wanted: BTreeMap<ResourceId, u64> = BTreeMap::new();
        for item in items {
            let qty = wanted.entry(item.resource_id).or_default();
            *qty = qty.saturating_add(item.qty);
        }
        for (&resource, &needed) in &wanted {
            let available = self.stock(company_id, resource).qty;
            if available < needed {
                return Err(StoreError::InsufficientStock {
                    company: company_id,
                    resource,
                    needed,
                    available,
                });
            }
        }
        let inventory = self.inventories.entry(company_id).or_default();
        let mut taken = Vec::with_capacity(wanted.len());
        for (resource, qty) in wanted {
            if qty == 0 {
                continue;
            }
            let stock = inventory.entry(resource).or_default();
            stock.qty -= qty;
            taken.push(StockItem {
                resource_id: resource,
                qty,
                unit_cost: stock.unit_cost,
            });
        }
        Ok(taken)
    }

    /// Adds `items` to a company's inventory, blending unit costs.
    pub fn increment_stock(&mut self, company_id: CompanyId, items: &[StockItem]) {
        let inventory = self.inventories.entry(company_id).or_default();
        for item in items.iter().filter(|item| item.qty > 0) {
            let stock = inventory.entry(item.resource_id).or_default();
            stock.unit_cost =
                sim_econ::weighted_unit_cost(stock.qty, stock.unit_cost, item.qty, item.unit_cost);
            stock.qty = stock.qty.saturating_add(item.qty);
        }
    }

    /// The run holding a building's production gate: the latest run that was
    /// not cancelled, while the building is still marked busy.
    pub fn gated_production(&self, building_id: BuildingId) -> Option<&Production> {
        self.buildings.get(&building_id)?.busy_until?;
        self.productions
            .values()
            .rev()
            .find(|p| p.building_id == building_id && p.cancelled_at.is_none())
    }

    pub fn buildings_of(&self, company_id: CompanyId) -> impl Iterator<Item = &Building> + '_ {
        self.buildings
            .values()
            .filter(move |b| b.company_id == company_id)
    }

    pub fn search_of(&self, company_id: CompanyId) -> Option<&Search> {
        self.searches.values().find(|s| s.company_id == company_id)
    }

    pub fn offer_for(&self, staff_id: StaffId) -> Option<&Offer> {
        self.offers.values().find(|o| o.staff_id == staff_id)
    }
}

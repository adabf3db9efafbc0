//! Staff searches and hiring offers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use persistence::{Classification, EconomyState, Repository, StoreError};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rust_decimal::Decimal;
use sim_core::{
    validate_amount, Clock, CompanyId, EconomyConfig, Offer, OfferId, Search, SearchId,
    SearchKind, Staff, StaffId, TaskKey,
};
use std::sync::Arc;
use tracing::info;

use crate::facade::Scheduled;
use crate::gate::ensure_due;
use crate::ServiceError;

const FIRST_NAMES: &[&str] = &[
    "Ada", "Alan", "Barbara", "Dennis", "Edsger", "Frances", "Grace", "Ken", "Margaret", "Niklaus",
];
const LAST_NAMES: &[&str] = &[
    "Allen", "Backus", "Hamilton", "Hopper", "Kernighan", "Liskov", "Lovelace", "Ritchie",
    "Turing", "Wirth",
];

/// Recruiting operations. A company runs at most one search at a time; the
/// search record exists until its completion is settled. An offer exists
/// until it expires into a hire or is withdrawn.
#[async_trait]
pub trait Recruiting: Send + Sync {
    /// Pays for and starts a search of the given kind.
    async fn start_search(
        &self,
        company: CompanyId,
        kind: SearchKind,
    ) -> Result<Search, ServiceError>;

    /// Offers `salary` to a candidate found by the company's search.
    async fn make_offer(
        &self,
        company: CompanyId,
        staff: StaffId,
        salary: Decimal,
    ) -> Result<Offer, ServiceError>;

    /// Takes back an offer before it expires.
    async fn withdraw_offer(
        &self,
        company: CompanyId,
        offer: OfferId,
    ) -> Result<Offer, ServiceError>;

    /// Settlement: ends a search, returning the candidate it found. The
    /// search is deleted whatever the outcome. Refused with
    /// [`ServiceError::NotDue`] before the search finishes.
    async fn complete_search(&self, search: SearchId) -> Result<Option<Staff>, ServiceError>;

    /// Settlement: an unanswered offer turns into a hire at the offered
    /// salary. Refused with [`ServiceError::NotDue`] before it expires.
    async fn expire_offer(&self, offer: OfferId) -> Result<Option<Staff>, ServiceError>;
}

pub struct RecruitingService<R> {
    repo: Arc<R>,
    clock: Arc<dyn Clock>,
    config: Arc<EconomyConfig>,
    rng: Mutex<ChaCha8Rng>,
}

impl<R: Repository> RecruitingService<R> {
    pub fn new(repo: Arc<R>, clock: Arc<dyn Clock>, config: Arc<EconomyConfig>) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.rng_seed);
        Self {
            repo,
            clock,
            config,
            rng: Mutex::new(rng),
        }
    }

    fn graduate(&self, company: CompanyId) -> Staff {
        let mut rng = self.rng.lock();
        let first = FIRST_NAMES.choose(&mut *rng).copied().unwrap_or("Alex");
        let last = LAST_NAMES.choose(&mut *rng).copied().unwrap_or("Smith");
        let skill: u8 = rng.gen_range(1..=40);
        Staff {
            id: StaffId(0),
            name: format!("{first} {last}"),
            skill,
            salary: Decimal::new(30_000, 0) + Decimal::from(skill) * Decimal::new(500, 0),
            employer: None,
            candidate_of: Some(company),
            poacher: None,
        }
    }

    /// Picks someone working for another company and not already courted.
    fn poach(&self, state: &EconomyState, company: CompanyId) -> Option<StaffId> {
        let pool: Vec<StaffId> = state
            .staff
            .values()
            .filter(|s| s.employer.is_some_and(|e| e != company) && s.poacher.is_none())
            .map(|s| s.id)
            .collect();
        pool.choose(&mut *self.rng.lock()).copied()
    }
}

#[async_trait]
impl<R: Repository> Recruiting for RecruitingService<R> {
    async fn start_search(
        &self,
        company: CompanyId,
        kind: SearchKind,
    ) -> Result<Search, ServiceError> {
        let now = self.clock.now();
        let (duration, cost) = self.config.search(kind);
        let search = self.repo.transact(|state| {
            if state.search_of(company).is_some() {
                return Err(ServiceError::SearchInProgress(company));
            }
            state.debit(
                company,
                cost,
                Classification::Recruiting,
                format!("{kind:?} staff search"),
            )?;
            let search = Search {
                id: SearchId(state.allocate_id()),
                company_id: company,
                kind,
                started_at: now,
                finishes_at: now + duration,
            };
            state.searches.insert(search.id, search.clone());
            Ok(search)
        })?;
        info!(company = %company, search = %search.id, ?kind, "staff search started");
        Ok(search)
    }

    async fn make_offer(
        &self,
        company: CompanyId,
        staff: StaffId,
        salary: Decimal,
    ) -> Result<Offer, ServiceError> {
        validate_amount(salary)?;
        let now = self.clock.now();
        let expiry = self.config.offer_expiry();
        let offer = self.repo.transact(|state| {
            let person = state.staff_member(staff)?;
            if person.candidate_of != Some(company) && person.poacher != Some(company) {
                return Err(ServiceError::NotACandidate { company, staff });
            }
            if let Some(pending) = state.offer_for(staff) {
                return Err(ServiceError::Busy {
                    what: format!("staff member {staff}"),
                    until: pending.expires_at,
                });
            }
            let offer = Offer {
                id: OfferId(state.allocate_id()),
                company_id: company,
                staff_id: staff,
                salary,
                created_at: now,
                expires_at: now + expiry,
            };
            state.offers.insert(offer.id, offer.clone());
            Ok(offer)
        })?;
        info!(company = %company, staff = %staff, %salary, "offer made");
        Ok(offer)
    }

    async fn withdraw_offer(
        &self,
        company: CompanyId,
        offer: OfferId,
    ) -> Result<Offer, ServiceError> {
        let withdrawn = self.repo.transact(|state| {
            if state.offer(offer)?.company_id != company {
                return Err(StoreError::not_found("offer", offer).into());
            }
            state
                .offers
                .remove(&offer)
                .ok_or_else(|| ServiceError::from(StoreError::not_found("offer", offer)))
        })?;
        info!(company = %company, offer = %offer, "offer withdrawn");
        Ok(withdrawn)
    }

    async fn complete_search(&self, search: SearchId) -> Result<Option<Staff>, ServiceError> {
        let now = self.clock.now();
        let found = self.repo.transact(|state| {
            let Some(due) = state.searches.get(&search).map(|s| s.finishes_at) else {
                return Ok::<_, ServiceError>(None);
            };
            ensure_due(|| format!("search {search}"), due, now)?;
            let done = state.search(search)?.clone();
            state.searches.remove(&search);
            let company = done.company_id;
            let candidate = match done.kind {
                SearchKind::Graduate => {
                    let id = state.add_staff(self.graduate(company));
                    Some(id)
                }
                SearchKind::Experienced => {
                    let target = self.poach(state, company);
                    if let Some(id) = target {
                        state.staff_member_mut(id)?.poacher = Some(company);
                    }
                    target
                }
            };
            match candidate {
                Some(id) => Ok(Some(state.staff_member(id)?.clone())),
                None => Ok(None),
            }
        })?;
        match &found {
            Some(staff) => {
                info!(search = %search, staff = %staff.id, skill = staff.skill, "candidate found")
            }
            None => info!(search = %search, "search found nobody"),
        }
        Ok(found)
    }

    async fn expire_offer(&self, offer: OfferId) -> Result<Option<Staff>, ServiceError> {
        let now = self.clock.now();
        let hired = self.repo.transact(|state| {
            let Some(due) = state.offers.get(&offer).map(|o| o.expires_at) else {
                return Ok::<_, ServiceError>(None);
            };
            ensure_due(|| format!("offer {offer}"), due, now)?;
            let expired = state.offer(offer)?.clone();
            state.offers.remove(&offer);
            let Some(person) = state.staff.get_mut(&expired.staff_id) else {
                return Ok(None);
            };
            person.employer = Some(expired.company_id);
            person.salary = expired.salary;
            person.candidate_of = None;
            person.poacher = None;
            Ok(Some(person.clone()))
        })?;
        if let Some(staff) = &hired {
            info!(offer = %offer, staff = %staff.id, employer = ?staff.employer, "offer turned into a hire");
        }
        Ok(hired)
    }
}

#[async_trait]
impl<S: Recruiting + 'static> Recruiting for Scheduled<S> {
    async fn start_search(
        &self,
        company: CompanyId,
        kind: SearchKind,
    ) -> Result<Search, ServiceError> {
        let search = self.inner.start_search(company, kind).await?;
        self.arm_search(search.id, search.finishes_at);
        Ok(search)
    }

    async fn make_offer(
        &self,
        company: CompanyId,
        staff: StaffId,
        salary: Decimal,
    ) -> Result<Offer, ServiceError> {
        let offer = self.inner.make_offer(company, staff, salary).await?;
        self.arm_offer(offer.id, offer.expires_at);
        Ok(offer)
    }

    async fn withdraw_offer(
        &self,
        company: CompanyId,
        offer: OfferId,
    ) -> Result<Offer, ServiceError> {
        let withdrawn = self.inner.withdraw_offer(company, offer).await?;
        self.disarm(TaskKey::Offer(offer)).await;
        Ok(withdrawn)
    }

    async fn complete_search(&self, search: SearchId) -> Result<Option<Staff>, ServiceError> {
        let found = self.inner.complete_search(search).await?;
        self.disarm(TaskKey::Search(search)).await;
        Ok(found)
    }

    async fn expire_offer(&self, offer: OfferId) -> Result<Option<Staff>, ServiceError> {
        let hired = self.inner.expire_offer(offer).await?;
        self.disarm(TaskKey::Offer(offer)).await;
        Ok(hired)
    }
}

impl<S: Recruiting + 'static> Scheduled<S> {
    pub(crate) fn arm_search(&self, search: SearchId, at: DateTime<Utc>) {
        let inner = Arc::clone(&self.inner);
        self.arm(TaskKey::Search(search), at, move || {
            let inner = Arc::clone(&inner);
            async move { inner.complete_search(search).await.map(|_| ()) }
        });
    }

    pub(crate) fn arm_offer(&self, offer: OfferId, at: DateTime<Utc>) {
        let inner = Arc::clone(&self.inner);
        self.arm(TaskKey::Offer(offer), at, move || {
            let inner = Arc::clone(&inner);
            async move { inner.expire_offer(offer).await.map(|_| ()) }
        });
    }
}

use chrono::{DateTime, TimeZone, Utc};
use persistence::{Classification, EconomyState, FaultyStore, InMemoryStore, Repository, StoreError};
use rust_decimal::Decimal;
use sim_core::{
    Building, BuildingId, BuildingKind, BuildingKindId, CompanyId, EconomyConfig, Product,
    ResourceId, ResourceQty, SearchKind, Staff, StaffId, TaskKey,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::{
    Bonds, Buildings, Economy, InterestOutcome, Loans, Productions, Recruiting,
    RecordingNotifier, RuntimeClock, ServiceError,
};

const ORE: ResourceId = ResourceId(1);
const STEEL: ResourceId = ResourceId(2);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

fn usd(n: i64) -> Decimal {
    Decimal::new(n, 0)
}

struct World<R> {
    economy: Economy<R>,
    notifier: Arc<RecordingNotifier>,
    acme: CompanyId,
    rival: CompanyId,
    mine: BuildingKindId,
    smelter: BuildingKindId,
}

impl<R: Repository> World<R> {
    fn cash(&self, company: CompanyId) -> Decimal {
        self.economy
            .repo()
            .read(|s| s.company(company).map(|c| c.available_cash))
            .unwrap()
    }

    fn terrains(&self, company: CompanyId) -> u32 {
        self.economy
            .repo()
            .read(|s| s.company(company).map(|c| c.available_terrains))
            .unwrap()
    }

    fn building(&self, id: BuildingId) -> Option<Building> {
        self.economy.repo().read(|s| s.buildings.get(&id).cloned())
    }

    fn stock(&self, company: CompanyId, resource: ResourceId) -> u64 {
        self.economy.repo().read(|s| s.stock(company, resource).qty)
    }

    fn interest_payments(&self) -> usize {
        self.economy.repo().read(|s| {
            s.journal
                .iter()
                .filter(|m| m.classification == Classification::LoanInterest && m.amount < Decimal::ZERO)
                .count()
        })
    }

    fn is_scheduled(&self, key: TaskKey) -> bool {
        self.economy.scheduler().is_scheduled(&key)
    }

    /// Builds a mine and waits for it to be finished.
    async fn ready_mine(&self) -> BuildingId {
        let mine = self.economy.buildings.construct(self.acme, self.mine).await.unwrap();
        sleep(minutes(31)).await;
        mine.id
    }
}

fn seed() -> (EconomyState, CompanyId, CompanyId, BuildingKindId, BuildingKindId) {
    let mut state = EconomyState::default();
    let acme = state.add_company("Acme", usd(1_000_000), 3);
    let rival = state.add_company("Rival", usd(1_000_000), 1);
    let mine = state.add_building_kind(BuildingKind {
        id: BuildingKindId(0),
        name: "Mine".to_string(),
        construction_cost: usd(50_000),
        construction_minutes: 30,
        products: vec![Product {
            resource_id: ORE,
            qty_per_hour: 1000,
            unit_cost: Decimal::new(5, 1),
            inputs: vec![],
        }],
    });
    let smelter = state.add_building_kind(BuildingKind {
        id: BuildingKindId(0),
        name: "Smelter".to_string(),
        construction_cost: usd(80_000),
        construction_minutes: 60,
        products: vec![Product {
            resource_id: STEEL,
            qty_per_hour: 100,
            unit_cost: usd(2),
            inputs: vec![ResourceQty {
                resource_id: ORE,
                qty: 3,
            }],
        }],
    });
    (state, acme, rival, mine, smelter)
}

fn world_on<R: Repository>(wrap: impl FnOnce(InMemoryStore) -> R) -> World<R> {
    let (state, acme, rival, mine, smelter) = seed();
    let notifier = Arc::new(RecordingNotifier::default());
    let economy = Economy::new(
        Arc::new(wrap(InMemoryStore::new(state))),
        Arc::new(RuntimeClock::new(t0())),
        EconomyConfig::default(),
        notifier.clone(),
    );
    World {
        economy,
        notifier,
        acme,
        rival,
        mine,
        smelter,
    }
}

fn world() -> World<InMemoryStore> {
    world_on(|store| store)
}

#[tokio::test(start_paused = true)]
async fn construction_completes_and_clears_gate() {
    let w = world();
    let b = w.economy.buildings.construct(w.acme, w.mine).await.unwrap();
    assert_eq!(b.completes_at, Some(t0() + chrono::Duration::minutes(30)));
    assert!(w.is_scheduled(TaskKey::Construction(b.id)));
    assert_eq!(w.cash(w.acme), usd(950_000));
    assert_eq!(w.terrains(w.acme), 2);

    let err = w
        .economy
        .production
        .start_production(w.acme, b.id, ORE, 10)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::UnderConstruction(id) if id == b.id));

    sleep(minutes(31)).await;
    assert_eq!(w.building(b.id).unwrap().completes_at, None);
    assert!(!w.is_scheduled(TaskKey::Construction(b.id)));
    assert!(w.economy.audit().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn demolish_during_construction_stops_the_timer() {
    let w = world();
    let b = w.economy.buildings.construct(w.acme, w.mine).await.unwrap();
    sleep(minutes(10)).await;

    w.economy.buildings.demolish(w.acme, b.id).await.unwrap();
    assert!(!w.is_scheduled(TaskKey::Construction(b.id)));
    assert_eq!(w.terrains(w.acme), 3);

    sleep(minutes(60)).await;
    assert!(w.building(b.id).is_none());
    assert!(w.economy.audit().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn upgrade_is_gated_like_construction() {
    let w = world();
    let b = w.ready_mine().await;
    let up = w.economy.buildings.upgrade(w.acme, b).await.unwrap();
    assert_eq!(up.level, 2);
    assert!(up.completes_at.is_some());
    assert_eq!(w.cash(w.acme), usd(900_000));

    let err = w.economy.buildings.upgrade(w.acme, b).await.unwrap_err();
    assert!(matches!(err, ServiceError::UnderConstruction(_)));

    sleep(minutes(31)).await;
    assert_eq!(w.building(b).unwrap().completes_at, None);
    assert!(w.economy.audit().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn other_companies_cannot_touch_a_building() {
    let w = world();
    let b = w.ready_mine().await;
    let err = w.economy.buildings.demolish(w.rival, b).await.unwrap_err();
    assert!(matches!(err, ServiceError::Store(StoreError::NotFound { .. })));
    assert!(w.building(b).is_some());
}

#[tokio::test(start_paused = true)]
async fn hour_of_production_yields_its_rate() {
    let w = world();
    let b = w.ready_mine().await;
    let run = w
        .economy
        .production
        .start_production(w.acme, b, ORE, 5_000)
        .await
        .unwrap();
    assert!(w.building(b).unwrap().busy_until.is_some());

    sleep(minutes(60)).await;
    let first = w.economy.production.collect_production(w.acme, run.id).await.unwrap();
    assert_eq!(first.collected, 1_000);
    let again = w.economy.production.collect_production(w.acme, run.id).await.unwrap();
    assert_eq!(again.collected, 0);

    assert_eq!(w.stock(w.acme, ORE), 1_000);
    assert!(w.building(b).unwrap().busy_until.is_some());
    assert!(w.is_scheduled(TaskKey::Production(run.id)));
    let err = w
        .economy
        .buildings
        .demolish(w.acme, b)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Busy { .. }));
}

#[tokio::test(start_paused = true)]
async fn finished_run_credits_remainder_and_frees_building() {
    let w = world();
    let b = w.ready_mine().await;
    let run = w
        .economy
        .production
        .start_production(w.acme, b, ORE, 500)
        .await
        .unwrap();
    assert_eq!(w.cash(w.acme), usd(950_000) - usd(250));

    sleep(minutes(10)).await;
    let part = w.economy.production.collect_production(w.acme, run.id).await.unwrap();
    assert_eq!(part.collected, 166);

    sleep(minutes(25)).await;
    assert_eq!(w.stock(w.acme, ORE), 500);
    assert_eq!(w.building(b).unwrap().busy_until, None);
    assert!(!w.is_scheduled(TaskKey::Production(run.id)));
    assert!(w.economy.audit().is_consistent());

    w.economy
        .production
        .start_production(w.acme, b, ORE, 100)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_stops_accruing() {
    let w = world();
    let b = w.ready_mine().await;
    let run = w
        .economy
        .production
        .start_production(w.acme, b, ORE, 5_000)
        .await
        .unwrap();

    sleep(minutes(90)).await;
    let cancelled = w.economy.production.cancel_production(w.acme, run.id).await.unwrap();
    assert_eq!(cancelled.collected, 1_500);
    assert!(cancelled.production.cancelled_at.is_some());
    assert_eq!(w.building(b).unwrap().busy_until, None);
    assert!(!w.is_scheduled(TaskKey::Production(run.id)));

    sleep(minutes(600)).await;
    assert_eq!(w.stock(w.acme, ORE), 1_500);
    let err = w.economy.production.collect_production(w.acme, run.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::ProductionClosed(_)));
    let err = w.economy.production.cancel_production(w.acme, run.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::ProductionClosed(_)));
    assert!(w.economy.audit().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn early_settlement_calls_are_refused() {
    let w = world();
    let mine = w.ready_mine().await;
    let run = w
        .economy
        .production
        .start_production(w.acme, mine, ORE, 5_000)
        .await
        .unwrap();
    let smelter = w.economy.buildings.construct(w.acme, w.smelter).await.unwrap();
    sleep(minutes(1)).await;

    let err = w.economy.production.finish_production(run.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotDue { .. }));
    assert_eq!(w.stock(w.acme, ORE), 0);
    assert!(w.building(mine).unwrap().busy_until.is_some());
    assert!(w.is_scheduled(TaskKey::Production(run.id)));

    let err = w
        .economy
        .buildings
        .complete_construction(smelter.id)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotDue { .. }));
    assert!(w.building(smelter.id).unwrap().is_under_construction());
    assert!(w.is_scheduled(TaskKey::Construction(smelter.id)));

    sleep(minutes(5 * 60)).await;
    assert_eq!(w.stock(w.acme, ORE), 5_000);
    assert_eq!(w.building(mine).unwrap().busy_until, None);
    assert!(!w.building(smelter.id).unwrap().is_under_construction());
    assert!(w.economy.audit().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn inputs_are_consumed_and_costed() {
    let w = world();
    let mine = w.ready_mine().await;
    let smelter = w.economy.buildings.construct(w.acme, w.smelter).await.unwrap();
    sleep(minutes(61)).await;

    let err = w
        .economy
        .production
        .start_production(w.acme, smelter.id, STEEL, 100)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Store(StoreError::InsufficientStock { .. })
    ));

    let ore = w
        .economy
        .production
        .start_production(w.acme, mine, ORE, 300)
        .await
        .unwrap();
    sleep(minutes(20)).await;
    assert_eq!(w.economy.production.inner().finish_production(ore.id).await.unwrap(), None);
    assert_eq!(w.stock(w.acme, ORE), 300);

    let steel = w
        .economy
        .production
        .start_production(w.acme, smelter.id, STEEL, 100)
        .await
        .unwrap();
    // 2 USD cash plus 3 ore at 0.5 each
    assert_eq!(steel.unit_cost, Decimal::new(35, 1));
    assert_eq!(w.stock(w.acme, ORE), 0);

    let err = w
        .economy
        .production
        .start_production(w.acme, mine, STEEL, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotProducible { .. }));
}

#[tokio::test(start_paused = true)]
async fn fourth_missed_payment_forces_principal_payment() {
    let w = world();
    let b = w.ready_mine().await;
    let loan = w.economy.loans.take_loan(w.acme, usd(100_000)).await.unwrap();
    let key = TaskKey::LoanInterest(loan.id);
    assert!(w.is_scheduled(key));

    w.economy
        .repo()
        .transact(|s| {
            s.loan_mut(loan.id)?.delayed_payments = 3;
            s.company_mut(w.acme)?.available_cash = Decimal::ZERO;
            Ok::<_, StoreError>(())
        })
        .unwrap();

    sleep(minutes(24 * 60 + 1)).await;
    let settled = w.economy.repo().read(|s| s.loan(loan.id).cloned()).unwrap();
    assert_eq!(settled.principal_paid, settled.principal);
    assert_eq!(settled.next_payment_at, None);
    assert_eq!(settled.delayed_payments, 4);
    assert!(!w.is_scheduled(key));
    // one building worth 150k covers the 100k principal
    assert!(w.building(b).is_none());
    assert_eq!(w.terrains(w.acme), 2);
    assert!(w.notifier.sent_to(w.acme).iter().any(|m| m.contains("defaulted")));

    sleep(minutes(5 * 24 * 60)).await;
    assert!(!w.is_scheduled(key));
    assert!(w.economy.audit().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn paid_interest_resets_the_counter() {
    let w = world();
    let loan = w.economy.loans.take_loan(w.acme, usd(100_000)).await.unwrap();
    w.economy
        .repo()
        .transact(|s| {
            s.loan_mut(loan.id)?.delayed_payments = 3;
            Ok::<_, StoreError>(())
        })
        .unwrap();

    sleep(minutes(24 * 60 + 1)).await;
    let paid = w.economy.repo().read(|s| s.loan(loan.id).cloned()).unwrap();
    assert_eq!(paid.delayed_payments, 0);
    assert!(paid.next_payment_at.unwrap() > t0() + chrono::Duration::days(1));
    assert!(w.is_scheduled(TaskKey::LoanInterest(loan.id)));
    assert_eq!(w.cash(w.acme), usd(1_100_000) - usd(5_000));
}

#[tokio::test(start_paused = true)]
async fn missed_payments_escalate_one_cycle_at_a_time() {
    let w = world();
    let loan = w.economy.loans.take_loan(w.acme, usd(100_000)).await.unwrap();
    w.economy
        .repo()
        .transact(|s| {
            s.company_mut(w.acme)?.available_cash = Decimal::ZERO;
            Ok::<_, StoreError>(())
        })
        .unwrap();

    sleep(minutes(24 * 60 + 1)).await;
    let missed = w.economy.repo().read(|s| s.loan(loan.id).cloned()).unwrap();
    assert_eq!(missed.delayed_payments, 1);
    assert!(w.is_scheduled(TaskKey::LoanInterest(loan.id)));

    sleep(minutes(3 * 24 * 60)).await;
    let settled = w.economy.repo().read(|s| s.loan(loan.id).cloned()).unwrap();
    assert_eq!(settled.principal_paid, settled.principal);
    assert!(!w.is_scheduled(TaskKey::LoanInterest(loan.id)));
    // no buildings: one free terrain covers the principal
    assert_eq!(w.terrains(w.acme), 2);
    let sent = w.notifier.sent_to(w.acme);
    assert_eq!(sent.iter().filter(|m| m.contains("missed")).count(), 3);
    assert_eq!(sent.iter().filter(|m| m.contains("defaulted")).count(), 1);
}

#[tokio::test(start_paused = true)]
async fn full_repayment_ends_the_cycle() {
    let w = world();
    let loan = w.economy.loans.take_loan(w.acme, usd(10_000)).await.unwrap();
    let err = w
        .economy
        .loans
        .repay_loan(w.acme, loan.id, usd(10_001))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ExceedsOutstanding { .. }));

    let part = w.economy.loans.repay_loan(w.acme, loan.id, usd(4_000)).await.unwrap();
    assert_eq!(part.outstanding(), usd(6_000));
    assert!(w.is_scheduled(TaskKey::LoanInterest(loan.id)));

    let done = w.economy.loans.repay_loan(w.acme, loan.id, usd(6_000)).await.unwrap();
    assert_eq!(done.next_payment_at, None);
    assert!(!w.is_scheduled(TaskKey::LoanInterest(loan.id)));
    assert_eq!(w.cash(w.acme), usd(1_000_000));

    let err = w.economy.loans.take_loan(w.acme, usd(2_000_000)).await.unwrap_err();
    assert!(matches!(err, ServiceError::LoanLimit { .. }));
}

#[tokio::test(start_paused = true)]
async fn interest_is_charged_once_per_period() {
    let w = world();
    let loan = w.economy.loans.take_loan(w.acme, usd(100_000)).await.unwrap();
    let key = TaskKey::LoanInterest(loan.id);
    sleep(minutes(1)).await;

    let err = w.economy.loans.pay_loan_interest(loan.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotDue { .. }));
    assert_eq!(w.interest_payments(), 0);
    assert_eq!(w.cash(w.acme), usd(1_100_000));

    // Overdue while the timer still waits for the original due time.
    w.economy
        .repo()
        .transact(|s| {
            s.loan_mut(loan.id)?.next_payment_at = Some(t0());
            Ok::<_, StoreError>(())
        })
        .unwrap();
    let outcome = w.economy.loans.pay_loan_interest(loan.id).await.unwrap();
    let next = match outcome {
        InterestOutcome::Paid { next_payment_at, .. } => next_payment_at,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert_eq!(next, t0() + chrono::Duration::minutes(24 * 60 + 1));
    assert!(w.is_scheduled(key));

    // The old timer fires at t0 + 1 day, finds the payment not due and waits.
    sleep(Duration::from_secs(24 * 3600 - 30)).await;
    assert_eq!(w.interest_payments(), 1);
    assert_eq!(w.cash(w.acme), usd(1_095_000));
    assert!(w.is_scheduled(key));

    sleep(minutes(1)).await;
    assert_eq!(w.interest_payments(), 2);
    assert_eq!(w.cash(w.acme), usd(1_090_000));
    assert!(w.economy.audit().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn direct_default_releases_the_seized_settlements() {
    let w = world();
    let mine = w.ready_mine().await;
    let run = w
        .economy
        .production
        .start_production(w.acme, mine, ORE, 30_000)
        .await
        .unwrap();
    let loan = w.economy.loans.take_loan(w.acme, usd(100_000)).await.unwrap();
    w.economy
        .repo()
        .transact(|s| {
            let current = s.loan_mut(loan.id)?;
            current.delayed_payments = 3;
            current.next_payment_at = Some(t0());
            s.company_mut(w.acme)?.available_cash = Decimal::ZERO;
            Ok::<_, StoreError>(())
        })
        .unwrap();

    let outcome = w.economy.loans.pay_loan_interest(loan.id).await.unwrap();
    let InterestOutcome::Liquidated { released, .. } = outcome else {
        panic!("expected liquidation, got {outcome:?}");
    };
    assert_eq!(released, vec![TaskKey::Production(run.id)]);
    assert!(w.building(mine).is_none());
    assert!(!w.is_scheduled(TaskKey::Production(run.id)));
    assert!(!w.is_scheduled(TaskKey::LoanInterest(loan.id)));
    assert!(w.economy.audit().is_consistent());

    sleep(minutes(31 * 60)).await;
    assert_eq!(w.stock(w.acme, ORE), 0);
}

#[tokio::test(start_paused = true)]
async fn timed_default_stops_the_running_production() {
    let w = world();
    let mine = w.ready_mine().await;
    let run = w
        .economy
        .production
        .start_production(w.acme, mine, ORE, 30_000)
        .await
        .unwrap();
    let loan = w.economy.loans.take_loan(w.acme, usd(100_000)).await.unwrap();
    w.economy
        .repo()
        .transact(|s| {
            s.loan_mut(loan.id)?.delayed_payments = 3;
            s.company_mut(w.acme)?.available_cash = Decimal::ZERO;
            Ok::<_, StoreError>(())
        })
        .unwrap();
    assert!(w.is_scheduled(TaskKey::Production(run.id)));

    sleep(minutes(24 * 60 + 1)).await;
    assert!(w.building(mine).is_none());
    assert!(!w.is_scheduled(TaskKey::Production(run.id)));
    assert!(!w.is_scheduled(TaskKey::LoanInterest(loan.id)));
    let cancelled = w
        .economy
        .repo()
        .read(|s| s.production(run.id).map(|p| p.cancelled_at))
        .unwrap();
    assert!(cancelled.is_some());
    assert!(w.economy.audit().is_consistent());

    sleep(minutes(10 * 60)).await;
    assert_eq!(w.stock(w.acme, ORE), 0);
}

#[tokio::test(start_paused = true)]
async fn buy_back_moves_exactly_the_amount() {
    let w = world();
    let bond = w
        .economy
        .bonds
        .issue_bond(w.rival, usd(200_000), Decimal::new(2, 2))
        .await
        .unwrap();
    let purchase = w.economy.bonds.buy_bond(w.acme, bond.id, usd(100_000)).await.unwrap();
    assert!(purchase.opened_cycle);
    let key = TaskKey::BondInterest(bond.id, w.acme);
    assert!(w.is_scheduled(key));
    assert_eq!(w.cash(w.acme), usd(900_000));
    assert_eq!(w.cash(w.rival), usd(1_100_000));

    let position = w
        .economy
        .bonds
        .buy_back(w.rival, bond.id, w.acme, usd(40_000))
        .await
        .unwrap();
    assert_eq!(position.principal, usd(60_000));
    assert_eq!(w.cash(w.acme), usd(940_000));
    assert_eq!(w.cash(w.rival), usd(1_060_000));
    assert!(w.is_scheduled(key));

    let err = w
        .economy
        .bonds
        .buy_back(w.rival, bond.id, w.acme, usd(60_001))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::ExceedsOutstanding { .. }));

    let closed = w
        .economy
        .bonds
        .buy_back(w.rival, bond.id, w.acme, usd(60_000))
        .await
        .unwrap();
    assert_eq!(closed.outstanding(), Decimal::ZERO);
    assert_eq!(closed.next_payment_at, None);
    assert!(!w.is_scheduled(key));
    assert!(w.economy.audit().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn bond_interest_reaches_the_creditor() {
    let w = world();
    let bond = w
        .economy
        .bonds
        .issue_bond(w.rival, usd(200_000), Decimal::new(2, 2))
        .await
        .unwrap();
    w.economy.bonds.buy_bond(w.acme, bond.id, usd(100_000)).await.unwrap();
    let again = w.economy.bonds.buy_bond(w.acme, bond.id, usd(50_000)).await.unwrap();
    assert!(!again.opened_cycle);
    assert_eq!(again.creditor.principal, usd(150_000));

    sleep(minutes(24 * 60 + 1)).await;
    assert_eq!(w.cash(w.acme), usd(850_000) + usd(3_000));
    assert_eq!(w.cash(w.rival), usd(1_150_000) - usd(3_000));
    assert!(w.is_scheduled(TaskKey::BondInterest(bond.id, w.acme)));

    let err = w.economy.bonds.buy_bond(w.rival, bond.id, usd(1)).await.unwrap_err();
    assert!(matches!(err, ServiceError::OwnBond(_)));
    let err = w.economy.bonds.buy_bond(w.acme, bond.id, usd(50_001)).await.unwrap_err();
    assert!(matches!(err, ServiceError::BondExhausted { .. }));
}

#[tokio::test(start_paused = true)]
async fn defaulted_bond_pays_the_creditor_from_liquidation() {
    let w = world();
    let bond = w
        .economy
        .bonds
        .issue_bond(w.rival, usd(200_000), Decimal::new(2, 2))
        .await
        .unwrap();
    w.economy.bonds.buy_bond(w.acme, bond.id, usd(50_000)).await.unwrap();
    let key = TaskKey::BondInterest(bond.id, w.acme);
    let err = w.economy.bonds.pay_bond_interest(bond.id, w.acme).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotDue { .. }));

    w.economy
        .repo()
        .transact(|s| {
            s.company_mut(w.rival)?.available_cash = Decimal::ZERO;
            let position = s.creditor_mut(bond.id, w.acme)?;
            position.delayed_payments = 3;
            position.next_payment_at = Some(t0());
            Ok::<_, StoreError>(())
        })
        .unwrap();

    let outcome = w.economy.bonds.pay_bond_interest(bond.id, w.acme).await.unwrap();
    assert!(matches!(outcome, InterestOutcome::Liquidated { .. }));
    assert_eq!(w.cash(w.acme), usd(1_000_000));
    assert_eq!(w.terrains(w.rival), 0);
    assert!(!w.is_scheduled(key));
    assert!(w.economy.audit().is_consistent());

    sleep(minutes(24 * 60 + 1)).await;
    assert_eq!(w.cash(w.acme), usd(1_000_000));
}

#[tokio::test(start_paused = true)]
async fn graduate_search_then_offer_turns_into_hire() {
    let w = world();
    let search = w
        .economy
        .recruiting
        .start_search(w.acme, SearchKind::Graduate)
        .await
        .unwrap();
    let err = w
        .economy
        .recruiting
        .start_search(w.acme, SearchKind::Experienced)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SearchInProgress(_)));
    assert_eq!(w.cash(w.acme), usd(999_000));

    sleep(minutes(61)).await;
    assert!(!w.is_scheduled(TaskKey::Search(search.id)));
    let candidate = w
        .economy
        .repo()
        .read(|s| s.staff.values().find(|p| p.candidate_of == Some(w.acme)).cloned())
        .unwrap();
    assert!(w.economy.repo().read(|s| s.searches.is_empty()));

    let err = w
        .economy
        .recruiting
        .make_offer(w.rival, candidate.id, usd(40_000))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotACandidate { .. }));

    let offer = w
        .economy
        .recruiting
        .make_offer(w.acme, candidate.id, usd(40_000))
        .await
        .unwrap();
    assert!(w.is_scheduled(TaskKey::Offer(offer.id)));

    sleep(minutes(24 * 60 + 1)).await;
    let hired = w.economy.repo().read(|s| s.staff_member(candidate.id).cloned()).unwrap();
    assert_eq!(hired.employer, Some(w.acme));
    assert_eq!(hired.salary, usd(40_000));
    assert_eq!(hired.candidate_of, None);
    assert!(w.economy.repo().read(|s| s.offers.is_empty()));
    assert!(w.economy.audit().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn experienced_search_poaches_and_offer_can_be_withdrawn() {
    let w = world();
    let veteran = w
        .economy
        .repo()
        .transact(|s| {
            Ok::<_, StoreError>(s.add_staff(Staff {
                id: StaffId(0),
                name: "Grace Hopper".to_string(),
                skill: 90,
                salary: usd(120_000),
                employer: Some(w.rival),
                candidate_of: None,
                poacher: None,
            }))
        })
        .unwrap();

    w.economy
        .recruiting
        .start_search(w.acme, SearchKind::Experienced)
        .await
        .unwrap();
    sleep(minutes(181)).await;
    let courted = w.economy.repo().read(|s| s.staff_member(veteran).cloned()).unwrap();
    assert_eq!(courted.poacher, Some(w.acme));

    let offer = w
        .economy
        .recruiting
        .make_offer(w.acme, veteran, usd(150_000))
        .await
        .unwrap();
    w.economy.recruiting.withdraw_offer(w.acme, offer.id).await.unwrap();
    assert!(!w.is_scheduled(TaskKey::Offer(offer.id)));

    sleep(minutes(2 * 24 * 60)).await;
    let stayed = w.economy.repo().read(|s| s.staff_member(veteran).cloned()).unwrap();
    assert_eq!(stayed.employer, Some(w.rival));
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_once() {
    let w = world_on(FaultyStore::new);
    let b = w.economy.buildings.construct(w.acme, w.mine).await.unwrap();
    w.economy.repo().fail_next(1);

    sleep(minutes(31)).await;
    assert_eq!(w.economy.repo().failures_left(), 0);
    assert_eq!(w.building(b.id).unwrap().completes_at, None);
    assert!(w.economy.audit().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn second_failure_leaves_the_gate_stuck_until_resumed() {
    let w = world_on(FaultyStore::new);
    let b = w.economy.buildings.construct(w.acme, w.mine).await.unwrap();
    w.economy.repo().fail_next(2);

    sleep(minutes(31)).await;
    let key = TaskKey::Construction(b.id);
    assert!(w.building(b.id).unwrap().completes_at.is_some());
    assert!(!w.is_scheduled(key));
    let audit = w.economy.audit();
    assert_eq!(audit.unscheduled, vec![key]);
    assert!(audit.orphaned.is_empty());

    // still refused: the building looks under construction forever
    let err = w.economy.buildings.upgrade(w.acme, b.id).await.unwrap_err();
    assert!(matches!(err, ServiceError::UnderConstruction(_)));

    assert_eq!(w.economy.resume(), 1);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(w.building(b.id).unwrap().completes_at, None);
    assert!(w.economy.audit().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn resume_registers_settlements_of_a_saved_state() {
    let (mut state, acme, _, mine, _) = seed();
    let id = BuildingId(state.allocate_id());
    state.buildings.insert(
        id,
        Building {
            id,
            company_id: acme,
            kind_id: mine,
            level: 1,
            completes_at: Some(t0() + chrono::Duration::minutes(10)),
            busy_until: None,
        },
    );
    let economy = Economy::new(
        Arc::new(InMemoryStore::new(state)),
        Arc::new(RuntimeClock::new(t0())),
        EconomyConfig::default(),
        Arc::new(RecordingNotifier::default()),
    );
    assert!(!economy.audit().is_consistent());
    assert_eq!(economy.resume(), 1);
    assert_eq!(economy.resume(), 0);

    sleep(minutes(11)).await;
    let done = economy.repo().read(|s| s.buildings.get(&id).cloned()).unwrap();
    assert_eq!(done.completes_at, None);
    assert!(economy.audit().is_consistent());
}

#[tokio::test(start_paused = true)]
async fn shutdown_deregisters_everything() {
    let w = world();
    w.economy.buildings.construct(w.acme, w.mine).await.unwrap();
    w.economy.loans.take_loan(w.acme, usd(1_000)).await.unwrap();
    w.economy
        .recruiting
        .start_search(w.acme, SearchKind::Graduate)
        .await
        .unwrap();
    assert_eq!(w.economy.scheduler().len(), 3);
    assert_eq!(w.economy.shutdown().await, 3);
    assert!(w.economy.scheduler().is_empty());
    assert_eq!(w.economy.audit().unscheduled.len(), 3);
}

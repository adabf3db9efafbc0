#![deny(warnings)]

//! Headless CLI: seeds a small economy, drives a few gated operations on
//! simulated time and reports the resulting state.

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use persistence::{EconomyState, InMemoryStore};
use rust_decimal::Decimal;
use sim_core::{
    validate_building_kind, validate_company, BuildingKind, BuildingKindId, CompanyId, EconomyConfig,
    Product, ResourceId, ResourceQty, SearchKind, Staff, StaffId,
};
use sim_runtime::{
    Bonds, Buildings, Economy, Loans, Productions, Recruiting, RuntimeClock, TracingNotifier,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

const ORE: ResourceId = ResourceId(1);
const STEEL: ResourceId = ResourceId(2);

struct Args {
    config: Option<String>,
    days: u32,
    json: bool,
}

fn parse_args() -> Args {
    let mut args = Args {
        config: None,
        days: 7,
        json: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => args.config = it.next(),
            "--days" => {
                if let Some(days) = it.next().and_then(|s| s.parse().ok()) {
                    args.days = days;
                }
            }
            "--json" => args.json = true,
            _ => {}
        }
    }
    args
}

struct Seeded {
    state: EconomyState,
    acme: CompanyId,
    rival: CompanyId,
    mine: BuildingKindId,
    smelter: BuildingKindId,
}

fn seed_world() -> Result<Seeded> {
    let mut state = EconomyState::default();
    let acme = state.add_company("Acme Metals", Decimal::new(400_000, 0), 3);
    let rival = state.add_company("Rival Forge", Decimal::new(1_000_000, 0), 2);
    let mine = BuildingKind {
        id: BuildingKindId(0),
        name: "Iron mine".to_string(),
        construction_cost: Decimal::new(50_000, 0),
        construction_minutes: 30,
        products: vec![Product {
            resource_id: ORE,
            qty_per_hour: 1_000,
            unit_cost: Decimal::new(5, 1),
            inputs: vec![],
        }],
    };
    let smelter = BuildingKind {
        id: BuildingKindId(0),
        name: "Smelter".to_string(),
        construction_cost: Decimal::new(80_000, 0),
        construction_minutes: 60,
        products: vec![Product {
            resource_id: STEEL,
            qty_per_hour: 100,
            unit_cost: Decimal::new(2, 0),
            inputs: vec![ResourceQty {
                resource_id: ORE,
                qty: 3,
            }],
        }],
    };
    for kind in [&mine, &smelter] {
        validate_building_kind(kind).with_context(|| format!("building kind {}", kind.name))?;
    }
    let mine = state.add_building_kind(mine);
    let smelter = state.add_building_kind(smelter);
    state.add_staff(Staff {
        id: StaffId(0),
        name: "Margaret Hamilton".to_string(),
        skill: 85,
        salary: Decimal::new(110_000, 0),
        employer: Some(rival),
        candidate_of: None,
        poacher: None,
    });
    for company in state.companies.values() {
        validate_company(company).with_context(|| format!("company {}", company.name))?;
    }
    Ok(Seeded {
        state,
        acme,
        rival,
        mine,
        smelter,
    })
}

async fn run(config: EconomyConfig, days: u32) -> Result<Arc<InMemoryStore>> {
    let Seeded {
        state,
        acme,
        rival,
        mine,
        smelter,
    } = seed_world()?;

    let store = Arc::new(InMemoryStore::new(state));
    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 8, 0, 0)
        .single()
        .context("invalid start date")?;
    let economy = Economy::new(
        Arc::clone(&store),
        Arc::new(RuntimeClock::new(start)),
        config,
        Arc::new(TracingNotifier),
    );

    let mine = economy.buildings.construct(acme, mine).await?;
    let smelter = economy.buildings.construct(acme, smelter).await?;
    economy.loans.take_loan(acme, Decimal::new(200_000, 0)).await?;
    let bond = economy
        .bonds
        .issue_bond(rival, Decimal::new(300_000, 0), Decimal::new(1, 2))
        .await?;
    economy
        .bonds
        .buy_bond(acme, bond.id, Decimal::new(100_000, 0))
        .await?;
    economy
        .recruiting
        .start_search(acme, SearchKind::Experienced)
        .await?;

    tokio::time::sleep(Duration::from_secs(61 * 60)).await;
    economy
        .production
        .start_production(acme, mine.id, ORE, 3_000)
        .await?;
    tokio::time::sleep(Duration::from_secs(3 * 60 * 60 + 60)).await;
    let steel = economy
        .production
        .start_production(acme, smelter.id, STEEL, 500)
        .await?;
    tokio::time::sleep(Duration::from_secs(2 * 60 * 60)).await;
    let partial = economy
        .production
        .collect_production(acme, steel.id)
        .await?;
    info!(collected = partial.collected, "steel collected early");
    economy
        .bonds
        .buy_back(rival, bond.id, acme, Decimal::new(25_000, 0))
        .await?;

    tokio::time::sleep(Duration::from_secs(u64::from(days) * 24 * 60 * 60)).await;

    let audit = economy.audit();
    info!(
        pending = economy.scheduler().len(),
        consistent = audit.is_consistent(),
        "simulation finished"
    );
    economy.shutdown().await;
    Ok(store)
}

fn main() -> Result<()> {
    // Logging setup
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::INFO)
        .init();

    let args = parse_args();
    info!(config = ?args.config, days = args.days, git = env!("GIT_SHA"), "starting CLI");

    let config = match &args.config {
        Some(path) => EconomyConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => EconomyConfig::default(),
    };

    // Simulated time: the runtime jumps straight to the next due timer.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()?;
    let store = runtime.block_on(run(config, args.days))?;

    if args.json {
        println!("{}", store.to_json()?);
        return Ok(());
    }
    let state = store.snapshot();
    for company in state.companies.values() {
        let buildings = state.buildings_of(company.id).count();
        println!(
            "{} | cash: ${} | terrains: {} | buildings: {} | ore: {} | steel: {}",
            company.name,
            company.available_cash.round_dp(2),
            company.available_terrains,
            buildings,
            state.stock(company.id, ORE).qty,
            state.stock(company.id, STEEL).qty,
        );
    }
    for loan in state.loans.values() {
        println!(
            "loan {} | outstanding: ${} | missed: {}",
            loan.id,
            loan.outstanding(),
            loan.delayed_payments
        );
    }
    println!("journal entries: {}", state.journal.len());
    Ok(())
}

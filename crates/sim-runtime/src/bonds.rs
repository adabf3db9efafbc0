//! Bonds: issued by one company, bought by others, each creditor position
//! running its own interest cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use persistence::{Classification, Repository, StoreError};
use rust_decimal::Decimal;
use sim_core::{
    validate_amount, validate_rate, Bond, BondId, Clock, CompanyId, Creditor, EconomyConfig,
    TaskKey,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::debt::{liquidate, run_cycle, Cycle, DebtTerms, InterestOutcome};
use crate::facade::Scheduled;
use crate::gate::ensure_due;
use crate::notify::Notifier;
use crate::ServiceError;

/// Result of buying into a bond.
#[derive(Clone, Debug, PartialEq)]
pub struct BondPurchase {
    pub creditor: Creditor,
    /// True when the purchase started the position's interest cycle.
    pub opened_cycle: bool,
}

/// Bond operations. A creditor position with principal outstanding keeps
/// `next_payment_at` set while its interest cycle runs.
#[async_trait]
pub trait Bonds: Send + Sync {
    /// Offers `amount` of new debt to the market at `rate` per period.
    async fn issue_bond(
        &self,
        company: CompanyId,
        amount: Decimal,
        rate: Decimal,
    ) -> Result<Bond, ServiceError>;

    /// Buys `amount` of an issued bond, paying the issuer.
    async fn buy_bond(
        &self,
        buyer: CompanyId,
        bond: BondId,
        amount: Decimal,
    ) -> Result<BondPurchase, ServiceError>;

    /// The issuer pays `amount` to a creditor and that creditor's principal
    /// shrinks by the same amount. Buying back everything ends its cycle.
    async fn buy_back(
        &self,
        issuer: CompanyId,
        bond: BondId,
        creditor: CompanyId,
        amount: Decimal,
    ) -> Result<Creditor, ServiceError>;

    /// Settlement: one interest cycle of a creditor position, refused with
    /// [`ServiceError::NotDue`] before the payment is due.
    async fn pay_bond_interest(
        &self,
        bond: BondId,
        creditor: CompanyId,
    ) -> Result<InterestOutcome, ServiceError>;
}

pub struct BondService<R> {
    repo: Arc<R>,
    clock: Arc<dyn Clock>,
    config: Arc<EconomyConfig>,
    notifier: Arc<dyn Notifier>,
}

impl<R: Repository> BondService<R> {
    pub fn new(
        repo: Arc<R>,
        clock: Arc<dyn Clock>,
        config: Arc<EconomyConfig>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            repo,
            clock,
            config,
            notifier,
        }
    }
}

#[async_trait]
impl<R: Repository> Bonds for BondService<R> {
    async fn issue_bond(
        &self,
        company: CompanyId,
        amount: Decimal,
        rate: Decimal,
    ) -> Result<Bond, ServiceError> {
        validate_amount(amount)?;
        validate_rate(rate)?;
        let bond = self.repo.transact(|state| {
            state.company(company)?;
            let bond = Bond {
                id: BondId(state.allocate_id()),
                company_id: company,
                interest_rate: rate,
                emitted: amount,
                sold: Decimal::ZERO,
            };
            state.bonds.insert(bond.id, bond.clone());
            Ok::<_, ServiceError>(bond)
        })?;
        info!(company = %company, bond = %bond.id, %amount, %rate, "bond issued");
        Ok(bond)
    }

    async fn buy_bond(
        &self,
        buyer: CompanyId,
        bond: BondId,
        amount: Decimal,
    ) -> Result<BondPurchase, ServiceError> {
        validate_amount(amount)?;
        let next = self.clock.now() + self.config.interest_period();
        let purchase = self.repo.transact(|state| {
            let issued = state.bond(bond)?.clone();
            if issued.company_id == buyer {
                return Err(ServiceError::OwnBond(buyer));
            }
            if amount > issued.available() {
                return Err(ServiceError::BondExhausted {
                    bond,
                    available: issued.available(),
                });
            }
            let description = format!("bond {bond}");
            state.debit(buyer, amount, Classification::Bond, description.clone())?;
            state.credit(issued.company_id, amount, Classification::Bond, description)?;
            state.bond_mut(bond)?.sold += amount;

            let position = state
                .creditors
                .entry(bond)
                .or_default()
                .entry(buyer)
                .or_insert_with(|| Creditor {
                    bond_id: bond,
                    company_id: buyer,
                    principal: Decimal::ZERO,
                    principal_paid: Decimal::ZERO,
                    interest_rate: issued.interest_rate,
                    delayed_payments: 0,
                    next_payment_at: None,
                });
            position.principal += amount;
            let opened_cycle = position.next_payment_at.is_none();
            if opened_cycle {
                position.next_payment_at = Some(next);
                position.delayed_payments = 0;
            }
            Ok(BondPurchase {
                creditor: position.clone(),
                opened_cycle,
            })
        })?;
        info!(buyer = %buyer, bond = %bond, %amount, "bond bought");
        Ok(purchase)
    }

    async fn buy_back(
        &self,
        issuer: CompanyId,
        bond: BondId,
        creditor: CompanyId,
        amount: Decimal,
    ) -> Result<Creditor, ServiceError> {
        validate_amount(amount)?;
        let position = self.repo.transact(|state| {
            if state.bond(bond)?.company_id != issuer {
                return Err(StoreError::not_found("bond", bond).into());
            }
            let outstanding = state.creditor(bond, creditor)?.outstanding();
            if amount > outstanding {
                return Err(ServiceError::ExceedsOutstanding {
                    amount,
                    outstanding,
                });
            }
            let description = format!("buy-back of bond {bond}");
            state.debit(issuer, amount, Classification::Bond, description.clone())?;
            state.credit(creditor, amount, Classification::Bond, description)?;
            let position = state.creditor_mut(bond, creditor)?;
            position.principal -= amount;
            if position.outstanding() <= Decimal::ZERO {
                position.next_payment_at = None;
                position.delayed_payments = 0;
            }
            Ok(position.clone())
        })?;
        info!(issuer = %issuer, bond = %bond, creditor = %creditor, %amount, "bond bought back");
        Ok(position)
    }

    async fn pay_bond_interest(
        &self,
        bond: BondId,
        creditor: CompanyId,
    ) -> Result<InterestOutcome, ServiceError> {
        let now = self.clock.now();
        let next = now + self.config.interest_period();
        let max_delayed = self.config.max_delayed_payments;
        let terrain_price = self.config.terrain_price;
        let (issuer, outcome) = self.repo.transact(|state| {
            let issuer = state.bond(bond)?.company_id;
            let position = state.creditor(bond, creditor)?;
            let due = match position.next_payment_at {
                Some(due) if position.outstanding() > Decimal::ZERO => due,
                _ => return Ok::<_, ServiceError>((issuer, InterestOutcome::Closed)),
            };
            ensure_due(
                || format!("interest on bond {bond} to company {creditor}"),
                due,
                now,
            )?;
            let terms = DebtTerms {
                payer: issuer,
                outstanding: position.outstanding(),
                rate: position.interest_rate,
                delayed_payments: position.delayed_payments,
            };
            let cycle = run_cycle(
                state,
                &terms,
                Classification::BondInterest,
                format!("interest on bond {bond} to company {creditor}"),
                max_delayed,
            )?;
            let outcome = match cycle {
                Cycle::Paid(amount) => {
                    state.credit(
                        creditor,
                        amount,
                        Classification::BondInterest,
                        format!("interest on bond {bond}"),
                    )?;
                    let position = state.creditor_mut(bond, creditor)?;
                    position.delayed_payments = 0;
                    position.next_payment_at = Some(next);
                    InterestOutcome::Paid {
                        amount,
                        next_payment_at: next,
                    }
                }
                Cycle::Missed(delayed_payments) => {
                    let position = state.creditor_mut(bond, creditor)?;
                    position.delayed_payments = delayed_payments;
                    position.next_payment_at = Some(next);
                    InterestOutcome::Missed {
                        delayed_payments,
                        next_payment_at: next,
                    }
                }
                Cycle::Default(delayed_payments) => {
                    let (plan, released) =
                        liquidate(state, issuer, terms.outstanding, terrain_price, now)?;
                    let recovered = plan.value.min(terms.outstanding);
                    state.credit(
                        creditor,
                        recovered,
                        Classification::Bond,
                        format!("forced principal payment of bond {bond}"),
                    )?;
                    let position = state.creditor_mut(bond, creditor)?;
                    position.delayed_payments = delayed_payments;
                    position.principal_paid = position.principal;
                    position.next_payment_at = None;
                    InterestOutcome::Liquidated { plan, released }
                }
            };
            Ok((issuer, outcome))
        })?;
        match &outcome {
            InterestOutcome::Paid { amount, .. } => {
                info!(bond = %bond, creditor = %creditor, %amount, "bond interest paid");
            }
            InterestOutcome::Missed {
                delayed_payments, ..
            } => {
                warn!(bond = %bond, creditor = %creditor, delayed_payments, "bond interest missed");
                self.notifier.notify(
                    issuer,
                    &format!(
                        "missed interest payment {delayed_payments} of {max_delayed} on bond {bond}"
                    ),
                );
            }
            InterestOutcome::Liquidated { plan, .. } => {
                warn!(bond = %bond, creditor = %creditor, value = %plan.value, "bond defaulted; assets seized");
                self.notifier.notify(
                    issuer,
                    &format!(
                        "bond {bond} defaulted: {} buildings and {} terrains seized",
                        plan.buildings.len(),
                        plan.terrains_lost()
                    ),
                );
            }
            InterestOutcome::Closed => {}
        }
        Ok(outcome)
    }
}

#[async_trait]
impl<S: Bonds + 'static> Bonds for Scheduled<S> {
    async fn issue_bond(
        &self,
        company: CompanyId,
        amount: Decimal,
        rate: Decimal,
    ) -> Result<Bond, ServiceError> {
        self.inner.issue_bond(company, amount, rate).await
    }

    async fn buy_bond(
        &self,
        buyer: CompanyId,
        bond: BondId,
        amount: Decimal,
    ) -> Result<BondPurchase, ServiceError> {
        let purchase = self.inner.buy_bond(buyer, bond, amount).await?;
        if purchase.opened_cycle {
            if let Some(at) = purchase.creditor.next_payment_at {
                self.arm_bond_interest(bond, buyer, at);
            }
        }
        Ok(purchase)
    }

    async fn buy_back(
        &self,
        issuer: CompanyId,
        bond: BondId,
        creditor: CompanyId,
        amount: Decimal,
    ) -> Result<Creditor, ServiceError> {
        let position = self.inner.buy_back(issuer, bond, creditor, amount).await?;
        if position.next_payment_at.is_none() {
            self.disarm(TaskKey::BondInterest(bond, creditor)).await;
        }
        Ok(position)
    }

    async fn pay_bond_interest(
        &self,
        bond: BondId,
        creditor: CompanyId,
    ) -> Result<InterestOutcome, ServiceError> {
        let outcome = self.inner.pay_bond_interest(bond, creditor).await?;
        let key = TaskKey::BondInterest(bond, creditor);
        self.reconcile_interest(key, &outcome, |at| {
            self.arm_bond_interest(bond, creditor, at)
        })
        .await;
        Ok(outcome)
    }
}

impl<S: Bonds + 'static> Scheduled<S> {
    pub(crate) fn arm_bond_interest(&self, bond: BondId, creditor: CompanyId, at: DateTime<Utc>) {
        let inner = Arc::clone(&self.inner);
        self.arm_interest(TaskKey::BondInterest(bond, creditor), at, move || {
            let inner = Arc::clone(&inner);
            async move { inner.pay_bond_interest(bond, creditor).await }
        });
    }
}

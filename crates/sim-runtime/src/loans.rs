//! Bank loans and their interest cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use persistence::{Classification, Repository, StoreError};
use rust_decimal::Decimal;
use sim_core::{validate_amount, Clock, CompanyId, EconomyConfig, Loan, LoanId, TaskKey};
use std::sync::Arc;
use tracing::{info, warn};

use crate::debt::{liquidate, run_cycle, Cycle, DebtTerms, InterestOutcome};
use crate::facade::Scheduled;
use crate::gate::ensure_due;
use crate::notify::Notifier;
use crate::ServiceError;

/// Loan operations. A loan with principal outstanding keeps
/// `next_payment_at` set while its interest cycle runs.
#[async_trait]
pub trait Loans: Send + Sync {
    /// Borrows `amount` from the bank at the configured rate.
    async fn take_loan(&self, company: CompanyId, amount: Decimal) -> Result<Loan, ServiceError>;

    /// Pays back part of the principal. Paying back all of it ends the
    /// interest cycle.
    async fn repay_loan(
        &self,
        company: CompanyId,
        loan: LoanId,
        amount: Decimal,
    ) -> Result<Loan, ServiceError>;

    /// Settlement: one interest cycle of `loan`, refused with
    /// [`ServiceError::NotDue`] before the payment is due.
    async fn pay_loan_interest(&self, loan: LoanId) -> Result<InterestOutcome, ServiceError>;
}

pub struct LoanService<R> {
    repo: Arc<R>,
    clock: Arc<dyn Clock>,
    config: Arc<EconomyConfig>,
    notifier: Arc<dyn Notifier>,
}

impl<R: Repository> LoanService<R> {
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
impl<R: Repository> Loans for LoanService<R> {
    async fn take_loan(&self, company: CompanyId, amount: Decimal) -> Result<Loan, ServiceError> {
        validate_amount(amount)?;
        if amount > self.config.max_loan {
            return Err(ServiceError::LoanLimit {
                amount,
                limit: self.config.max_loan,
            });
        }
        let now = self.clock.now();
        let period = self.config.interest_period();
        let rate = self.config.loan_interest_rate;
        let loan = self.repo.transact(|state| {
            let loan = Loan {
                id: LoanId(state.allocate_id()),
                company_id: company,
                principal: amount,
                principal_paid: Decimal::ZERO,
                interest_rate: rate,
                delayed_payments: 0,
                next_payment_at: Some(now + period),
            };
            state.credit(
                company,
                amount,
                Classification::Loan,
                format!("loan {}", loan.id),
            )?;
            state.loans.insert(loan.id, loan.clone());
            Ok::<_, ServiceError>(loan)
        })?;
        info!(company = %company, loan = %loan.id, %amount, "loan granted");
        Ok(loan)
    }

    async fn repay_loan(
        &self,
        company: CompanyId,
        loan: LoanId,
        amount: Decimal,
    ) -> Result<Loan, ServiceError> {
        validate_amount(amount)?;
        let loan = self.repo.transact(|state| {
            let current = state.loan(loan)?;
            if current.company_id != company {
                return Err(StoreError::not_found("loan", loan).into());
            }
            let outstanding = current.outstanding();
            if amount > outstanding {
                return Err(ServiceError::ExceedsOutstanding {
                    amount,
                    outstanding,
                });
            }
            state.debit(
                company,
                amount,
                Classification::Loan,
                format!("repayment of loan {loan}"),
            )?;
            let current = state.loan_mut(loan)?;
            current.principal_paid += amount;
            if current.outstanding() <= Decimal::ZERO {
                current.next_payment_at = None;
                current.delayed_payments = 0;
            }
            Ok(current.clone())
        })?;
        info!(company = %company, loan = %loan.id, %amount, outstanding = %loan.outstanding(), "loan repaid");
        Ok(loan)
    }

    async fn pay_loan_interest(&self, loan: LoanId) -> Result<InterestOutcome, ServiceError> {
        let now = self.clock.now();
        let next = now + self.config.interest_period();
        let max_delayed = self.config.max_delayed_payments;
        let terrain_price = self.config.terrain_price;
        let (payer, outcome) = self.repo.transact(|state| {
            let current = state.loan(loan)?;
            let payer = current.company_id;
            let due = match current.next_payment_at {
                Some(due) if current.outstanding() > Decimal::ZERO => due,
                _ => return Ok::<_, ServiceError>((payer, InterestOutcome::Closed)),
            };
            ensure_due(|| format!("interest on loan {loan}"), due, now)?;
            let terms = DebtTerms {
                payer,
                outstanding: current.outstanding(),
                rate: current.interest_rate,
                delayed_payments: current.delayed_payments,
            };
            let cycle = run_cycle(
                state,
                &terms,
                Classification::LoanInterest,
                format!("interest on loan {loan}"),
                max_delayed,
            )?;
            let outcome = match cycle {
                Cycle::Paid(amount) => {
                    let current = state.loan_mut(loan)?;
                    current.delayed_payments = 0;
                    current.next_payment_at = Some(next);
                    InterestOutcome::Paid {
                        amount,
                        next_payment_at: next,
                    }
                }
                Cycle::Missed(delayed_payments) => {
                    let current = state.loan_mut(loan)?;
                    current.delayed_payments = delayed_payments;
                    current.next_payment_at = Some(next);
                    InterestOutcome::Missed {
                        delayed_payments,
                        next_payment_at: next,
                    }
                }
                Cycle::Default(delayed_payments) => {
                    let (plan, released) =
                        liquidate(state, payer, terms.outstanding, terrain_price, now)?;
                    let current = state.loan_mut(loan)?;
                    current.delayed_payments = delayed_payments;
                    current.principal_paid = current.principal;
                    current.next_payment_at = None;
                    InterestOutcome::Liquidated { plan, released }
                }
            };
            Ok((payer, outcome))
        })?;
        match &outcome {
            InterestOutcome::Paid { amount, .. } => {
                info!(loan = %loan, %amount, "loan interest paid");
            }
            InterestOutcome::Missed {
                delayed_payments, ..
            } => {
                warn!(loan = %loan, delayed_payments, "loan interest missed");
                self.notifier.notify(
                    payer,
                    &format!(
                        "missed interest payment {delayed_payments} of {max_delayed} on loan {loan}"
                    ),
                );
            }
            InterestOutcome::Liquidated { plan, .. } => {
                warn!(loan = %loan, value = %plan.value, "loan defaulted; assets seized");
                self.notifier.notify(
                    payer,
                    &format!(
                        "loan {loan} defaulted: {} buildings and {} terrains seized",
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
impl<S: Loans + 'static> Loans for Scheduled<S> {
    async fn take_loan(&self, company: CompanyId, amount: Decimal) -> Result<Loan, ServiceError> {
        let loan = self.inner.take_loan(company, amount).await?;
        if let Some(at) = loan.next_payment_at {
            self.arm_loan_interest(loan.id, at);
        }
        Ok(loan)
    }

    async fn repay_loan(
        &self,
        company: CompanyId,
        loan: LoanId,
        amount: Decimal,
    ) -> Result<Loan, ServiceError> {
        let loan = self.inner.repay_loan(company, loan, amount).await?;
        if loan.next_payment_at.is_none() {
            self.disarm(TaskKey::LoanInterest(loan.id)).await;
        }
        Ok(loan)
    }

    async fn pay_loan_interest(&self, loan: LoanId) -> Result<InterestOutcome, ServiceError> {
        let outcome = self.inner.pay_loan_interest(loan).await?;
        self.reconcile_interest(TaskKey::LoanInterest(loan), &outcome, |at| {
            self.arm_loan_interest(loan, at)
        })
        .await;
        Ok(outcome)
    }
}

impl<S: Loans + 'static> Scheduled<S> {
    pub(crate) fn arm_loan_interest(&self, loan: LoanId, at: DateTime<Utc>) {
        let inner = Arc::clone(&self.inner);
        self.arm_interest(TaskKey::LoanInterest(loan), at, move || {
            let inner = Arc::clone(&inner);
            async move { inner.pay_loan_interest(loan).await }
        });
    }
}

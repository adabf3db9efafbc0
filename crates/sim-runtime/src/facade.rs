//! Scheduling facades: a domain service wrapped so that every operation
//! opening a gate registers its settlement and every operation closing one
//! deregisters it.
//!
//! `Scheduled<S>` implements the same domain trait as `S`, so callers do not
//! know whether scheduling is attached. The settlement callbacks it registers
//! call back into `S`, bounded by the configured settlement timeout. A
//! settlement that finds its gate not yet due is re-armed for the gate time.
//! Settlements called directly on the facade leave the registry as the timer
//! would have.

use chrono::{DateTime, Utc};
use sim_core::{delay_until, Clock, TaskKey};
use sim_scheduler::{Scheduler, Settled};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::debt::InterestOutcome;
use crate::ServiceError;

/// A domain service `S` with its settlements attached to a registry.
pub struct Scheduled<S> {
    pub(crate) inner: Arc<S>,
    scheduler: Scheduler<TaskKey>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl<S> Scheduled<S> {
    pub fn new(
        inner: Arc<S>,
        scheduler: Scheduler<TaskKey>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner,
            scheduler,
            clock,
            timeout,
        }
    }

    /// The undecorated service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Registers `settle` for `key`, due at `at`.
    pub(crate) fn arm<F, Fut>(&self, key: TaskKey, at: DateTime<Utc>, settle: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        let timeout = self.timeout;
        let clock = Arc::clone(&self.clock);
        let delay = delay_until(self.clock.now(), at);
        self.scheduler.schedule(key, delay, move || {
            let settlement = settle();
            let clock = Arc::clone(&clock);
            async move {
                match run_bounded(timeout, settlement).await? {
                    Attempt::Settled(()) => Ok(Settled::Done),
                    Attempt::Early(due) => Ok(Settled::Again(delay_until(clock.now(), due))),
                }
            }
        });
    }

    /// Registers a periodic interest cycle for `key`, first due at `at`.
    ///
    /// Each paid or missed payment re-arms the key for the next due date.
    /// A liquidation deregisters the settlements of the seized buildings
    /// before the cycle ends.
    pub(crate) fn arm_interest<F, Fut>(&self, key: TaskKey, at: DateTime<Utc>, pay: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<InterestOutcome, ServiceError>> + Send + 'static,
    {
        let timeout = self.timeout;
        let clock = Arc::clone(&self.clock);
        let scheduler = self.scheduler.clone();
        let delay = delay_until(self.clock.now(), at);
        self.scheduler.schedule(key, delay, move || {
            let payment = pay();
            let clock = Arc::clone(&clock);
            let scheduler = scheduler.clone();
            async move {
                let outcome = match run_bounded(timeout, payment).await? {
                    Attempt::Settled(outcome) => outcome,
                    Attempt::Early(due) => {
                        return Ok(Settled::Again(delay_until(clock.now(), due)))
                    }
                };
                if let Some(next) = outcome.next_payment_at() {
                    return Ok(Settled::Again(delay_until(clock.now(), next)));
                }
                release_seized(&scheduler, &outcome).await;
                Ok(Settled::Done)
            }
        });
    }

    /// Deregisters the settlement of a gate the service just cleared.
    pub(crate) async fn disarm(&self, key: TaskKey) {
        if self.scheduler.cancel(&key).await {
            debug!(%key, "settlement deregistered");
        }
    }

    /// Brings the registry in line with an interest cycle settled by a
    /// direct call. A running cycle keeps its registration, re-armed through
    /// `rearm` if it has none. A finished one loses it, together with the
    /// registrations of any buildings it seized.
    pub(crate) async fn reconcile_interest(
        &self,
        key: TaskKey,
        outcome: &InterestOutcome,
        rearm: impl FnOnce(DateTime<Utc>),
    ) {
        match outcome.next_payment_at() {
            Some(next) => {
                if !self.scheduler.is_scheduled(&key) {
                    rearm(next);
                }
            }
            None => {
                release_seized(&self.scheduler, outcome).await;
                self.disarm(key).await;
            }
        }
    }
}

/// Deregisters the settlements of buildings taken by a liquidation.
async fn release_seized(scheduler: &Scheduler<TaskKey>, outcome: &InterestOutcome) {
    if let InterestOutcome::Liquidated { released, .. } = outcome {
        for key in released {
            if scheduler.cancel(key).await {
                debug!(%key, "settlement of seized building deregistered");
            }
        }
    }
}

/// What one bounded settlement attempt came to.
#[derive(Debug, PartialEq)]
pub(crate) enum Attempt<T> {
    Settled(T),
    /// The gate is not due yet; it is due at the given time.
    Early(DateTime<Utc>),
}

/// Runs one settlement, failing it when it outlives `timeout`.
pub(crate) async fn run_bounded<T, Fut>(
    timeout: Duration,
    settlement: Fut,
) -> anyhow::Result<Attempt<T>>
where
    Fut: Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(timeout, settlement).await {
        Ok(Ok(value)) => Ok(Attempt::Settled(value)),
        Ok(Err(ServiceError::NotDue { due, .. })) => Ok(Attempt::Early(due)),
        Ok(Err(err)) => {
            debug!(transient = err.is_transient(), %err, "settlement failed");
            Err(err.into())
        }
        Err(_) => anyhow::bail!("settlement timed out after {timeout:?}"),
    }
}

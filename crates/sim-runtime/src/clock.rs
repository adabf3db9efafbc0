//! Clock following the tokio timer wheel.

use chrono::{DateTime, Utc};
use sim_core::Clock;
use tokio::time::Instant;

/// Wall clock derived from tokio's [`Instant`], so entity timestamps and
/// registry timers agree, including under a paused test runtime.
#[derive(Clone, Copy, Debug)]
pub struct RuntimeClock {
    base: DateTime<Utc>,
    origin: Instant,
}

impl RuntimeClock {
    /// Clock reading `base` right now and advancing with the runtime.
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            origin: Instant::now(),
        }
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.base + elapsed
    }
}

//! Ride update events and the runner that enforces membership on them.
//!
//! Every successful ride mutation yields a [`RideUpdate`]. A
//! [`TriggerRunner`] reads those from a channel and invokes the
//! [`MembershipEnforcer`] once per update, re-invoking it when the
//! repository reports a transient failure. Different updates are enforced
//! concurrently; nothing orders two updates of the same ride.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::enforcer::{Enforcement, MembershipEnforcer};
use crate::error::Result;
use crate::repository::RideRepository;
use crate::ride::{Ride, RideId};

/// The state of one ride before and after an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RideUpdate {
    /// State before the update.
    pub before: Ride,
    /// State after the update.
    pub after: Ride,
}

impl RideUpdate {
    /// Pair up the two states of an update.
    #[must_use]
    pub fn new(before: Ride, after: Ride) -> Self {
        Self { before, after }
    }

    /// The updated ride.
    #[must_use]
    pub fn ride_id(&self) -> &RideId {
        &self.after.id
    }
}

/// Counters reported once the update channel closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TriggerStats {
    /// Updates received.
    pub invocations: u64,
    /// Passengers removed by the enforcer.
    pub corrections: u64,
    /// Updates whose enforcement ultimately failed.
    pub failures: u64,
}

/// Retry settings for enforcer invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total invocations per update, at least 1.
    pub max_attempts: u32,
    /// Pause between invocations.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(200),
        }
    }
}

/// Invokes the membership enforcer for every ride update it receives.
#[derive(Debug, Clone)]
pub struct TriggerRunner<R> {
    enforcer: MembershipEnforcer<R>,
    retry: RetryPolicy,
}

impl<R> TriggerRunner<R>
where
    R: RideRepository + Clone + 'static,
{
    /// Create a runner around an enforcer.
    #[must_use]
    pub fn new(enforcer: MembershipEnforcer<R>, retry: RetryPolicy) -> Self {
        Self { enforcer, retry }
    }

    /// Enforce one update, re-invoking on transient failure.
    ///
    /// # Errors
    ///
    /// Returns the last error once it is not transient or the attempts
    /// are used up.
    pub async fn invoke(&self, update: &RideUpdate) -> Result<Enforcement> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.enforcer.enforce(&update.before, &update.after).await {
                Ok(enforcement) => return Ok(enforcement),
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    warn!(
                        ride = %update.ride_id(),
                        attempt,
                        max_attempts,
                        error = %err,
                        "membership enforcement failed, retrying"
                    );
                    tokio::time::sleep(self.retry.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Consume updates until every sender is dropped.
    ///
    /// Each update is enforced in its own task. Failures are logged and
    /// counted, never returned, so one bad update does not stop the rest.
    pub async fn run(self, mut updates: mpsc::Receiver<RideUpdate>) -> TriggerStats {
        let mut stats = TriggerStats::default();
        let mut tasks = JoinSet::new();

        while let Some(update) = updates.recv().await {
            stats.invocations += 1;
            let runner = self.clone();
            tasks.spawn(async move {
                let outcome = runner.invoke(&update).await;
                (update, outcome)
            });

            while let Some(joined) = tasks.try_join_next() {
                record(&mut stats, joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            record(&mut stats, joined);
        }

        debug!(?stats, "trigger runner stopped");
        stats
    }
}

fn record(
    stats: &mut TriggerStats,
    joined: std::result::Result<(RideUpdate, Result<Enforcement>), tokio::task::JoinError>,
) {
    match joined {
        Ok((_, Ok(enforcement))) => {
            stats.corrections += enforcement.removed.len() as u64;
        }
        Ok((update, Err(err))) => {
            stats.failures += 1;
            error!(ride = %update.ride_id(), error = %err, "membership enforcement gave up");
        }
        Err(err) => {
            stats.failures += 1;
            error!(error = %err, "membership enforcement task panicked");
        }
    }
}

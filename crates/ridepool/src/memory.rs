//! In-memory ride repository.
//!
//! Holds rides in a map behind a mutex and records how often it was queried
//! and written, so tests can assert on side effects as well as end state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::repository::RideRepository;
use crate::ride::{Ride, RideId, UserId};

/// A [`RideRepository`] backed by a map of rides.
#[derive(Debug, Default)]
pub struct InMemoryRides {
    rides: Mutex<BTreeMap<RideId, Ride>>,
    queries: AtomicUsize,
    writes: AtomicUsize,
    write_attempts: AtomicUsize,
    failures_pending: AtomicUsize,
    failing_write: AtomicUsize,
}

impl InMemoryRides {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository holding the given rides.
    #[must_use]
    pub fn with_rides(rides: impl IntoIterator<Item = Ride>) -> Self {
        Self {
            rides: Mutex::new(
                rides
                    .into_iter()
                    .map(|ride| (ride.id.clone(), ride))
                    .collect(),
            ),
            ..Self::default()
        }
    }

    /// Insert or replace a ride.
    ///
    /// # Errors
    ///
    /// Returns an error if the ride map is poisoned.
    pub fn put(&self, ride: Ride) -> Result<()> {
        self.lock()?.insert(ride.id.clone(), ride);
        Ok(())
    }

    /// Get a copy of a ride.
    #[must_use]
    pub fn get(&self, id: &RideId) -> Option<Ride> {
        self.lock().ok().and_then(|rides| rides.get(id).cloned())
    }

    /// Passenger list of a ride, empty if the ride is unknown.
    #[must_use]
    pub fn passengers(&self, id: &RideId) -> Vec<UserId> {
        self.get(id).map(|ride| ride.passengers).unwrap_or_default()
    }

    /// Number of membership queries served so far.
    #[must_use]
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Number of passenger removals applied so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `count` repository calls fail with a backend error.
    pub fn fail_next(&self, count: usize) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Make the `nth` passenger removal from now on fail with a backend
    /// error, counting from 1. Only that one attempt fails.
    pub fn fail_write(&self, nth: usize) {
        let attempts = self.write_attempts.load(Ordering::SeqCst);
        self.failing_write.store(attempts + nth, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<RideId, Ride>>> {
        self.rides
            .lock()
            .map_err(|_| Error::internal("in-memory ride map poisoned"))
    }

    fn take_failure(&self) -> Result<()> {
        let took = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(Error::backend("injected failure"))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl RideRepository for InMemoryRides {
    async fn find_upcoming_rides_containing(&self, user: &UserId) -> Result<Vec<RideId>> {
        self.take_failure()?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        let rides = self.lock()?;
        Ok(rides
            .values()
            .filter(|ride| ride.is_upcoming() && ride.has_passenger(user))
            .map(|ride| ride.id.clone())
            .collect())
    }

    async fn remove_passenger(&self, ride: &RideId, user: &UserId) -> Result<()> {
        self.take_failure()?;
        let attempt = self.write_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.failing_write.load(Ordering::SeqCst) {
            return Err(Error::backend("injected write failure"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut rides = self.lock()?;
        if let Some(ride) = rides.get_mut(ride) {
            ride.passengers.retain(|p| p != user);
        }
        Ok(())
    }
}

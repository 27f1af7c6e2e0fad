//! Single-active-ride enforcement.
//!
//! A user may be a passenger on at most one upcoming ride. Joins are not
//! blocked up front; instead every ride update is run through
//! [`MembershipEnforcer::enforce`], which finds passengers the update added
//! who already sit on another upcoming ride and takes them off the ride
//! that was just updated. The ride they joined first is left alone.
//!
//! The check and the correction are separate backend calls, so two
//! concurrent joins by the same user to different rides can both survive.
//! The invariant converges; it is not serialized.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use crate::repository::RideRepository;
use crate::ride::{Ride, RideId, UserId};

/// What one enforcement pass observed and corrected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enforcement {
    /// The ride whose update was enforced.
    pub ride_id: RideId,
    /// Whether the passenger membership changed at all.
    pub membership_changed: bool,
    /// Passengers present after the update but not before.
    pub added: Vec<UserId>,
    /// Added passengers that were taken off the ride again.
    pub removed: Vec<UserId>,
}

impl Enforcement {
    fn unchanged(ride_id: RideId) -> Self {
        Self {
            ride_id,
            membership_changed: false,
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Check whether any passenger was removed.
    #[must_use]
    pub fn corrected(&self) -> bool {
        !self.removed.is_empty()
    }

    /// Apply the corrections to the after-state of the update.
    #[must_use]
    pub fn apply(&self, after: &Ride) -> Ride {
        let mut ride = after.clone();
        ride.passengers.retain(|p| !self.removed.contains(p));
        ride
    }
}

/// Compare two passenger lists as multisets.
///
/// Reordering is not a membership change; adding a duplicate entry is.
#[must_use]
pub fn membership_changed(before: &[UserId], after: &[UserId]) -> bool {
    if before.len() != after.len() {
        return true;
    }
    let mut before: Vec<&UserId> = before.iter().collect();
    let mut after: Vec<&UserId> = after.iter().collect();
    before.sort_unstable();
    after.sort_unstable();
    before != after
}

/// Passengers in `after` that are absent from `before`.
///
/// Each user appears once, in order of first appearance in `after`.
#[must_use]
pub fn added_passengers(before: &[UserId], after: &[UserId]) -> Vec<UserId> {
    let previous: HashSet<&UserId> = before.iter().collect();
    let mut seen = HashSet::new();
    after
        .iter()
        .filter(|user| !previous.contains(user) && seen.insert(*user))
        .cloned()
        .collect()
}

/// Keeps every user on at most one upcoming ride.
#[derive(Debug, Clone)]
pub struct MembershipEnforcer<R> {
    repository: R,
}

impl<R: RideRepository> MembershipEnforcer<R> {
    /// Create an enforcer over a repository.
    #[must_use]
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    /// Borrow the underlying repository.
    #[must_use]
    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Enforce the single-active-ride rule for one ride update.
    ///
    /// `before` and `after` are the states of the same ride around the
    /// update. When the passenger membership is unchanged nothing is
    /// queried or written. Otherwise each added passenger is checked with
    /// its own query, and removed from `after.id` when the query finds more
    /// than one upcoming ride containing them.
    ///
    /// Running the same pair again converges to the same passenger list:
    /// the second pass sees the user on a single upcoming ride and leaves
    /// them be, or removes an already-absent user, which changes nothing.
    ///
    /// # Errors
    ///
    /// Returns the first query or write error. Corrections already applied
    /// for earlier users in the batch stay applied.
    pub async fn enforce(&self, before: &Ride, after: &Ride) -> Result<Enforcement> {
        if !membership_changed(&before.passengers, &after.passengers) {
            debug!(ride = %after.id, "passenger membership unchanged");
            return Ok(Enforcement::unchanged(after.id.clone()));
        }

        let added = added_passengers(&before.passengers, &after.passengers);
        let mut removed = Vec::new();

        for user in &added {
            let upcoming = self
                .repository
                .find_upcoming_rides_containing(user)
                .await?;

            if upcoming.len() > 1 {
                self.repository.remove_passenger(&after.id, user).await?;
                info!(
                    user = %user,
                    ride = %after.id,
                    upcoming = upcoming.len(),
                    "removed passenger already on another upcoming ride"
                );
                removed.push(user.clone());
            }
        }

        Ok(Enforcement {
            ride_id: after.id.clone(),
            membership_changed: true,
            added,
            removed,
        })
    }
}

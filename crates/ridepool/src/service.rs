//! Ride operations that publish update events.
//!
//! [`RideService`] is the write path used by the CLI: it forwards each
//! operation to [`Storage`] and, when a trigger channel is attached, sends
//! the resulting [`RideUpdate`] so the membership enforcer sees it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::JoinPolicy;
use crate::error::Result;
use crate::ride::{NewRide, Ride, RideId, RideStatus, User, UserId};
use crate::storage::Storage;
use crate::trigger::RideUpdate;

/// Application operations over a shared [`Storage`].
#[derive(Debug, Clone)]
pub struct RideService {
    storage: Arc<Storage>,
    join_policy: JoinPolicy,
    updates: Option<mpsc::Sender<RideUpdate>>,
}

impl RideService {
    /// Create a service that publishes no updates.
    #[must_use]
    pub fn new(storage: Arc<Storage>, join_policy: JoinPolicy) -> Self {
        Self {
            storage,
            join_policy,
            updates: None,
        }
    }

    /// Publish every ride update to `sender`.
    #[must_use]
    pub fn with_updates(mut self, sender: mpsc::Sender<RideUpdate>) -> Self {
        self.updates = Some(sender);
        self
    }

    /// The underlying storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Register a user.
    ///
    /// # Errors
    ///
    /// See [`Storage::add_user`].
    pub fn register(&self, user: &User) -> Result<()> {
        self.storage.add_user(user)
    }

    /// Change a user's display name or hostel.
    ///
    /// # Errors
    ///
    /// See [`Storage::update_user`].
    pub fn update_profile(
        &self,
        user: &UserId,
        display_name: Option<&str>,
        hostel: Option<&str>,
    ) -> Result<User> {
        self.storage.update_user(user, display_name, hostel)
    }

    /// Post a ride.
    ///
    /// # Errors
    ///
    /// See [`Storage::create_ride`].
    pub fn post_ride(&self, new_ride: &NewRide) -> Result<Ride> {
        self.storage.create_ride(new_ride)
    }

    /// Join a ride under the configured policy.
    ///
    /// # Errors
    ///
    /// See [`Storage::join_ride`].
    pub async fn join(&self, ride: &RideId, user: &UserId) -> Result<Ride> {
        let update = self.storage.join_ride(ride, user, self.join_policy)?;
        Ok(self.publish(update).await)
    }

    /// Leave a ride.
    ///
    /// # Errors
    ///
    /// See [`Storage::leave_ride`].
    pub async fn leave(&self, ride: &RideId, user: &UserId) -> Result<Ride> {
        let update = self.storage.leave_ride(ride, user)?;
        Ok(self.publish(update).await)
    }

    /// Mark a ride completed or cancelled.
    ///
    /// # Errors
    ///
    /// See [`Storage::set_status`].
    pub async fn set_status(&self, ride: &RideId, status: RideStatus) -> Result<Ride> {
        let update = self.storage.set_status(ride, status)?;
        Ok(self.publish(update).await)
    }

    /// Rides the user could join.
    ///
    /// # Errors
    ///
    /// See [`Storage::joinable_rides`].
    pub fn browse(&self, user: &UserId) -> Result<Vec<Ride>> {
        self.storage.joinable_rides(user)
    }

    /// The user's ride history.
    ///
    /// # Errors
    ///
    /// See [`Storage::history`].
    pub fn history(&self, user: &UserId, status: Option<RideStatus>) -> Result<Vec<Ride>> {
        self.storage.history(user, status)
    }

    /// All of the user's upcoming rides, soonest first.
    ///
    /// # Errors
    ///
    /// See [`Storage::upcoming_rides`].
    pub fn upcoming(&self, user: &UserId) -> Result<Vec<Ride>> {
        self.storage.upcoming_rides(user)
    }

    /// The user's next upcoming ride.
    ///
    /// # Errors
    ///
    /// See [`Storage::next_ride`].
    pub fn next_ride(&self, user: &UserId, now: DateTime<Utc>) -> Result<Option<Ride>> {
        self.storage.next_ride(user, now)
    }

    /// Send the update to the trigger channel and hand back the new state.
    async fn publish(&self, update: RideUpdate) -> Ride {
        let after = update.after.clone();
        if let Some(sender) = &self.updates {
            if sender.send(update).await.is_err() {
                warn!(ride = %after.id, "trigger channel closed, update not enforced");
            }
        }
        after
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::enforcer::MembershipEnforcer;
    use crate::ride::UserRole;
    use crate::trigger::{RetryPolicy, TriggerRunner};

    fn seeded_service() -> RideService {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let service = RideService::new(storage, JoinPolicy::Revert);
        service
            .register(&User::new("dan", "Dan", UserRole::Driver))
            .unwrap();
        service
            .register(&User::new("eve", "Eve", UserRole::Driver))
            .unwrap();
        service
            .register(&User::new("bob", "Bob", UserRole::Student))
            .unwrap();
        service
    }

    fn post(service: &RideService, driver: &str) -> Ride {
        service
            .post_ride(&NewRide {
                driver_id: UserId::from(driver),
                pickup: "Dorms".to_string(),
                destination: "Station".to_string(),
                departure_time: Utc::now() + Duration::hours(2),
                seats: 3,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_second_upcoming_join_is_reverted_end_to_end() {
        let service = seeded_service();
        let first = post(&service, "dan");
        let second = post(&service, "eve");

        let bob = UserId::from("bob");
        service.join(&first.id, &bob).await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let runner = TriggerRunner::new(
            MembershipEnforcer::new(Arc::clone(service.storage())),
            RetryPolicy::default(),
        );
        let handle = tokio::spawn(runner.run(rx));
        let service = service.with_updates(tx);

        let joined = service.join(&second.id, &bob).await.unwrap();
        assert!(joined.has_passenger(&bob));
        drop(service);

        let stats = handle.await.unwrap();
        assert_eq!(stats.invocations, 1);
        assert_eq!(stats.corrections, 1);
    }

    #[tokio::test]
    async fn test_corrected_state_is_persisted() {
        let service = seeded_service();
        let first = post(&service, "dan");
        let second = post(&service, "eve");
        let storage = Arc::clone(service.storage());
        let bob = UserId::from("bob");
        service.join(&first.id, &bob).await.unwrap();

        let (tx, rx) = mpsc::channel(16);
        let runner = TriggerRunner::new(
            MembershipEnforcer::new(Arc::clone(&storage)),
            RetryPolicy::default(),
        );
        let handle = tokio::spawn(runner.run(rx));
        let service = service.with_updates(tx);

        service.join(&second.id, &bob).await.unwrap();
        drop(service);
        handle.await.unwrap();

        assert!(storage.get_ride(&first.id).unwrap().unwrap().has_passenger(&bob));
        assert!(!storage.get_ride(&second.id).unwrap().unwrap().has_passenger(&bob));
        assert!(storage.membership_violations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_updates_are_published_but_change_nothing() {
        let service = seeded_service();
        let ride = post(&service, "dan");
        let (tx, mut rx) = mpsc::channel(4);
        let service = service.with_updates(tx);

        let updated = service.set_status(&ride.id, RideStatus::Completed).await.unwrap();
        assert_eq!(updated.status, RideStatus::Completed);

        let update = rx.recv().await.unwrap();
        assert_eq!(update.before.status, RideStatus::Upcoming);
        assert_eq!(update.after.status, RideStatus::Completed);
    }

    #[tokio::test]
    async fn test_closed_channel_does_not_fail_operation() {
        let service = seeded_service();
        let ride = post(&service, "dan");
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let service = service.with_updates(tx);

        let joined = service.join(&ride.id, &UserId::from("bob")).await.unwrap();
        assert_eq!(joined.passengers, vec![UserId::from("bob")]);
    }

    #[tokio::test]
    async fn test_leave_publishes_update() {
        let service = seeded_service();
        let ride = post(&service, "dan");
        let bob = UserId::from("bob");
        service.join(&ride.id, &bob).await.unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let service = service.with_updates(tx);
        let left = service.leave(&ride.id, &bob).await.unwrap();

        assert!(left.passengers.is_empty());
        let update = rx.recv().await.unwrap();
        assert_eq!(update.before.passengers, vec![bob]);
    }

    #[tokio::test]
    async fn test_upcoming_lists_driver_rides_soonest_first() {
        let service = seeded_service();
        let later = post(&service, "dan");
        let sooner = service
            .post_ride(&NewRide {
                driver_id: UserId::from("dan"),
                pickup: "Library".to_string(),
                destination: "Airport".to_string(),
                departure_time: Utc::now() + Duration::minutes(30),
                seats: 2,
            })
            .unwrap();

        let rides = service.upcoming(&UserId::from("dan")).unwrap();

        let ids: Vec<_> = rides.into_iter().map(|ride| ride.id).collect();
        assert_eq!(ids, vec![sooner.id, later.id]);
    }

    #[test]
    fn test_update_profile_sets_student_hostel() {
        let service = seeded_service();

        let user = service
            .update_profile(&UserId::from("bob"), None, Some("Block C"))
            .unwrap();

        assert_eq!(user.hostel.as_deref(), Some("Block C"));
        assert_eq!(user.display_name, "Bob");
    }
}

//! The backend seam the membership enforcer is written against.

use crate::error::Result;
use crate::ride::{RideId, UserId};

/// Queries and writes the enforcer needs from a ride backend.
///
/// Implementors wrap a concrete store (`SQLite`, an in-memory fake, a
/// hosted document database). Both operations may fail with a transient
/// error; callers propagate it rather than recover.
#[async_trait::async_trait]
pub trait RideRepository: Send + Sync {
    /// Find every upcoming ride whose passenger list contains `user`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    async fn find_upcoming_rides_containing(&self, user: &UserId) -> Result<Vec<RideId>>;

    /// Remove `user` from the passenger list of `ride`.
    ///
    /// Must be an atomic set-remove: every occurrence goes, and removing a
    /// user who is not a passenger succeeds without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects or cannot apply the write.
    async fn remove_passenger(&self, ride: &RideId, user: &UserId) -> Result<()>;
}

#[async_trait::async_trait]
impl<R: RideRepository + ?Sized> RideRepository for std::sync::Arc<R> {
    async fn find_upcoming_rides_containing(&self, user: &UserId) -> Result<Vec<RideId>> {
        (**self).find_upcoming_rides_containing(user).await
    }

    async fn remove_passenger(&self, ride: &RideId, user: &UserId) -> Result<()> {
        (**self).remove_passenger(ride, user).await
    }
}

//! Error types for ridepool.
//!
//! This module defines all error types used throughout the ridepool crate,
//! providing detailed context for debugging and user-friendly error messages.

use std::path::PathBuf;
use thiserror::Error;

use crate::ride::{RideId, RideStatus, UserId, UserRole};

/// The main error type for ridepool operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Ride Errors ===
    /// No ride exists with the given identifier.
    #[error("ride not found: {ride_id}")]
    RideNotFound {
        /// The missing ride.
        ride_id: RideId,
    },

    /// No user exists with the given identifier.
    #[error("user not found: {user_id}")]
    UserNotFound {
        /// The missing user.
        user_id: UserId,
    },

    /// Every seat on the ride is taken.
    #[error("ride {ride_id} is full ({seats} seats)")]
    RideFull {
        /// The full ride.
        ride_id: RideId,
        /// Seat count of the ride.
        seats: u32,
    },

    /// The ride no longer accepts passengers.
    #[error("ride {ride_id} is {status}, not upcoming")]
    RideNotUpcoming {
        /// The ride that was targeted.
        ride_id: RideId,
        /// Its current status.
        status: RideStatus,
    },

    /// The requested status change is not allowed.
    #[error("cannot move ride from {from} to {to}")]
    InvalidStatusTransition {
        /// Current status.
        from: RideStatus,
        /// Requested status.
        to: RideStatus,
    },

    /// The user is already a passenger on another upcoming ride.
    #[error("user {user_id} is already a passenger on upcoming ride {ride_id}")]
    AlreadyInUpcomingRide {
        /// The user attempting to join.
        user_id: UserId,
        /// The upcoming ride they already belong to.
        ride_id: RideId,
    },

    /// The user does not have the role the operation requires.
    #[error("user {user_id} must be a {expected} for this operation")]
    RoleMismatch {
        /// The user attempting the operation.
        user_id: UserId,
        /// The role the operation requires.
        expected: UserRole,
    },

    /// An argument failed validation.
    #[error("invalid {field}: {message}")]
    InvalidInput {
        /// Name of the offending field.
        field: &'static str,
        /// Description of the problem.
        message: String,
    },

    // === Backend Errors ===
    /// The ride backend is temporarily unavailable.
    #[error("backend unavailable: {0}")]
    Backend(String),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for ridepool operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new backend error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create an input validation error.
    #[must_use]
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Check if retrying the failed operation may succeed.
    ///
    /// Backend outages and a busy or locked database are transient; every
    /// other error would fail the same way again.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend(_) => true,
            Self::DatabaseQuery(err) => matches!(
                err.sqlite_error_code(),
                Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }

    /// Check if this error means a ride or user does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RideNotFound { .. } | Self::UserNotFound { .. })
    }
}

//! Core ride and user types for ridepool.
//!
//! This module defines the records stored by the ride backend and shared by
//! the membership enforcer, the storage layer and the CLI.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Identifier of a ride record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RideId(String);

impl RideId {
    /// Create a ride identifier from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random ride identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RideId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RideId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a registered user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user identifier from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a ride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    /// Not yet departed and open for joining.
    #[default]
    Upcoming,
    /// The ride took place.
    Completed,
    /// The driver called the ride off.
    Cancelled,
    /// A status value this version does not recognise.
    #[serde(other)]
    Unknown,
}

impl RideStatus {
    /// Parse a stored status string. Unrecognised values map to `Unknown`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "upcoming" => Self::Upcoming,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }

    /// Check whether a driver may move a ride from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Upcoming, Self::Completed | Self::Cancelled)
        )
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upcoming => write!(f, "upcoming"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// The role a user signed up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    /// Posts rides.
    Driver,
    /// Joins rides as a passenger.
    Student,
}

impl UserRole {
    /// Parse a stored role string.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "driver" => Some(Self::Driver),
            "student" => Some(Self::Student),
            _ => None,
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Driver => write!(f, "driver"),
            Self::Student => write!(f, "student"),
        }
    }
}

/// A registered member of the ride pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Unique identifier.
    pub id: UserId,
    /// Name shown to other users.
    pub display_name: String,
    /// Driver or student.
    pub role: UserRole,
    /// Where a student lives; drivers have none.
    #[serde(default)]
    pub hostel: Option<String>,
    /// When the user registered.
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Create a user registered now.
    #[must_use]
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>, role: UserRole) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
            hostel: None,
            created_at: Utc::now(),
        }
    }

    /// Set the hostel.
    #[must_use]
    pub fn with_hostel(mut self, hostel: impl Into<String>) -> Self {
        self.hostel = Some(hostel.into());
        self
    }
}

/// A single pooled trip.
///
/// Only `id`, `passengers` and `status` matter to membership enforcement;
/// the remaining fields are carried through untouched. Every field except
/// `id` has a default so that partial update payloads still decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ride {
    /// Unique identifier.
    pub id: RideId,
    /// The driver who posted the ride.
    #[serde(default)]
    pub driver_id: Option<UserId>,
    /// Where passengers are picked up.
    #[serde(default)]
    pub pickup: String,
    /// Where the ride ends.
    #[serde(default)]
    pub destination: String,
    /// Scheduled departure.
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub departure_time: Option<DateTime<Utc>>,
    /// Number of passenger seats offered.
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub seats: u32,
    /// Passengers in join order.
    #[serde(default, deserialize_with = "lenient_passengers")]
    pub passengers: Vec<UserId>,
    /// Lifecycle state.
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: RideStatus,
    /// When the ride was posted.
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Ride {
    /// Create an upcoming ride with no passengers and no metadata.
    #[must_use]
    pub fn new(id: impl Into<RideId>) -> Self {
        Self {
            id: id.into(),
            driver_id: None,
            pickup: String::new(),
            destination: String::new(),
            departure_time: None,
            seats: 0,
            passengers: Vec::new(),
            status: RideStatus::Upcoming,
            created_at: None,
        }
    }

    /// Replace the passenger list.
    #[must_use]
    pub fn with_passengers<I, U>(mut self, passengers: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<UserId>,
    {
        self.passengers = passengers.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the status.
    #[must_use]
    pub fn with_status(mut self, status: RideStatus) -> Self {
        self.status = status;
        self
    }

    /// Check whether the user is a passenger.
    #[must_use]
    pub fn has_passenger(&self, user: &UserId) -> bool {
        self.passengers.contains(user)
    }

    /// Number of seats still free.
    #[must_use]
    pub fn seats_left(&self) -> u32 {
        let taken = u32::try_from(self.passengers.len()).unwrap_or(u32::MAX);
        self.seats.saturating_sub(taken)
    }

    /// Check whether every seat is taken.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.seats_left() == 0
    }

    /// Check whether the ride is upcoming.
    #[must_use]
    pub fn is_upcoming(&self) -> bool {
        self.status == RideStatus::Upcoming
    }
}

/// The details a driver supplies when posting a ride.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRide {
    /// The posting driver.
    pub driver_id: UserId,
    /// Pickup location.
    pub pickup: String,
    /// Destination.
    pub destination: String,
    /// Scheduled departure.
    pub departure_time: DateTime<Utc>,
    /// Number of passenger seats offered.
    pub seats: u32,
}

/// Decode a passenger list, treating anything malformed as empty.
///
/// A missing, `null` or non-array value yields an empty list. Inside an
/// array, entries that are not strings are dropped.
fn lenient_passengers<'de, D>(deserializer: D) -> Result<Vec<UserId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let passengers = match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(id) => Some(UserId::from(id)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    Ok(passengers)
}

/// Decode a metadata field, falling back to its default when malformed.
fn lenient_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Decode a status; anything that is not a string is `Unknown`.
fn lenient_status<'de, D>(deserializer: D) -> Result<RideStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(status) => RideStatus::parse(&status),
        _ => RideStatus::Unknown,
    })
}

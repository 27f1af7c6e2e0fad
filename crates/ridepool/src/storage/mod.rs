//! Storage layer for ridepool.
//!
//! This module provides `SQLite`-based persistent storage for users, rides
//! and passenger memberships, and implements [`RideRepository`] so the
//! membership enforcer can run directly against it.

pub mod migrations;
pub mod schema;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::JoinPolicy;
use crate::error::{Error, Result};
use crate::repository::RideRepository;
use crate::ride::{NewRide, Ride, RideId, RideStatus, User, UserId, UserRole};
use crate::trigger::RideUpdate;

const RIDE_COLUMNS: &str =
    "id, driver_id, pickup, destination, departure_time, seats, status, created_at";

/// Storage engine for users and rides.
///
/// The connection sits behind a mutex so one `Storage` can be shared
/// between tasks through an `Arc`. No lock is held across an `.await`;
/// the async repository calls run on the blocking thread pool.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Arc<Mutex<Connection>>,
}

/// A user found on more than one upcoming ride.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipViolation {
    /// The user.
    pub user_id: UserId,
    /// Every upcoming ride listing the user, ordered by id.
    pub rides: Vec<RideId>,
}

/// Statistics about the storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageStats {
    /// Number of registered users.
    pub users: i64,
    /// Number of rides per status.
    pub rides_by_status: BTreeMap<String, i64>,
    /// Number of passenger memberships across all rides.
    pub memberships: i64,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    /// Initializes the schema if this is a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        lock(&self.conn)
    }

    /// Run `op` against the connection on the blocking thread pool.
    async fn with_blocking_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || op(&*lock(&conn)?))
            .await
            .map_err(|err| Error::internal(format!("storage task failed: {err}")))?
    }

    // === Users ===

    /// Register a user.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is blank, already registered, or the
    /// database operation fails.
    pub fn add_user(&self, user: &User) -> Result<()> {
        if user.id.as_str().trim().is_empty() {
            return Err(Error::invalid_input("user id", "must not be empty"));
        }

        let hostel = normalize_hostel(user.role, user.hostel.as_deref())?;

        let conn = self.conn()?;
        if load_user(&conn, &user.id)?.is_some() {
            return Err(Error::invalid_input(
                "user id",
                format!("{} is already registered", user.id),
            ));
        }

        conn.execute(
            "INSERT INTO users (id, display_name, role, hostel, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id.as_str(),
                user.display_name,
                user.role.to_string(),
                hostel,
                format_time(user.created_at),
            ],
        )?;
        debug!(user = %user.id, role = %user.role, "registered user");
        Ok(())
    }

    /// Get a user by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        let conn = self.conn()?;
        load_user(&conn, id)
    }

    /// Change a user's display name and hostel.
    ///
    /// `None` leaves a field as it is. An empty hostel clears it.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is unknown, the name is blank, a driver
    /// is given a hostel, or the database operation fails.
    pub fn update_user(
        &self,
        id: &UserId,
        display_name: Option<&str>,
        hostel: Option<&str>,
    ) -> Result<User> {
        if display_name.is_some_and(|name| name.trim().is_empty()) {
            return Err(Error::invalid_input("display name", "must not be empty"));
        }

        let conn = self.conn()?;
        let mut user = load_user(&conn, id)?.ok_or_else(|| Error::UserNotFound {
            user_id: id.clone(),
        })?;
        if let Some(name) = display_name {
            user.display_name = name.trim().to_string();
        }
        if let Some(hostel) = hostel {
            user.hostel = normalize_hostel(user.role, Some(hostel))?;
        }

        conn.execute(
            "UPDATE users SET display_name = ?1, hostel = ?2 WHERE id = ?3",
            params![user.display_name, user.hostel, id.as_str()],
        )?;
        info!(user = %id, "updated profile");
        Ok(user)
    }

    // === Rides ===

    /// Post a new upcoming ride with no passengers.
    ///
    /// # Errors
    ///
    /// Returns an error if the driver is not a registered driver, the ride
    /// details are invalid, or the database operation fails.
    pub fn create_ride(&self, new_ride: &NewRide) -> Result<Ride> {
        if new_ride.seats == 0 {
            return Err(Error::invalid_input("seats", "must be at least 1"));
        }
        if new_ride.pickup.trim().is_empty() {
            return Err(Error::invalid_input("pickup", "must not be empty"));
        }
        if new_ride.destination.trim().is_empty() {
            return Err(Error::invalid_input("destination", "must not be empty"));
        }

        let conn = self.conn()?;
        require_role(&conn, &new_ride.driver_id, UserRole::Driver)?;

        let ride = Ride {
            id: RideId::generate(),
            driver_id: Some(new_ride.driver_id.clone()),
            pickup: new_ride.pickup.clone(),
            destination: new_ride.destination.clone(),
            departure_time: Some(new_ride.departure_time),
            seats: new_ride.seats,
            passengers: Vec::new(),
            status: RideStatus::Upcoming,
            created_at: Some(Utc::now()),
        };

        conn.execute(
            r"
            INSERT INTO rides (id, driver_id, pickup, destination, departure_time, seats, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                ride.id.as_str(),
                new_ride.driver_id.as_str(),
                ride.pickup,
                ride.destination,
                ride.departure_time.map(format_time),
                ride.seats,
                ride.status.to_string(),
                ride.created_at.map(format_time),
            ],
        )?;

        let ride = require_ride(&conn, &ride.id)?;
        info!(ride = %ride.id, driver = %new_ride.driver_id, seats = ride.seats, "created ride");
        Ok(ride)
    }

    /// Get a ride by id, passengers in join order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get_ride(&self, id: &RideId) -> Result<Option<Ride>> {
        let conn = self.conn()?;
        load_ride(&conn, id)
    }

    /// Add a student to a ride's passenger list.
    ///
    /// Joining a ride the user is already on changes nothing. Under
    /// [`JoinPolicy::Reject`] a user already on another upcoming ride is
    /// turned away inside the same transaction; under
    /// [`JoinPolicy::Revert`] the join lands and is left for the enforcer.
    ///
    /// # Errors
    ///
    /// Returns an error if the ride or user is unknown, the user is not a
    /// student, the ride is not upcoming or is full, the policy rejects the
    /// join, or the database operation fails.
    pub fn join_ride(
        &self,
        ride_id: &RideId,
        user_id: &UserId,
        policy: JoinPolicy,
    ) -> Result<RideUpdate> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let before = require_ride(&tx, ride_id)?;
        require_role(&tx, user_id, UserRole::Student)?;

        if !before.is_upcoming() {
            return Err(Error::RideNotUpcoming {
                ride_id: ride_id.clone(),
                status: before.status,
            });
        }
        if before.has_passenger(user_id) {
            debug!(ride = %ride_id, user = %user_id, "user already a passenger");
            tx.commit()?;
            return Ok(RideUpdate::new(before.clone(), before));
        }
        if before.is_full() {
            return Err(Error::RideFull {
                ride_id: ride_id.clone(),
                seats: before.seats,
            });
        }
        if policy == JoinPolicy::Reject {
            if let Some(other) = upcoming_rides_containing(&tx, user_id)?.into_iter().next() {
                return Err(Error::AlreadyInUpcomingRide {
                    user_id: user_id.clone(),
                    ride_id: other,
                });
            }
        }

        tx.execute(
            r"
            INSERT INTO ride_passengers (ride_id, user_id, position)
            VALUES (?1, ?2, (SELECT COALESCE(MAX(position) + 1, 0) FROM ride_passengers WHERE ride_id = ?1))
            ",
            params![ride_id.as_str(), user_id.as_str()],
        )?;
        let after = require_ride(&tx, ride_id)?;
        tx.commit()?;

        info!(ride = %ride_id, user = %user_id, "passenger joined ride");
        Ok(RideUpdate::new(before, after))
    }

    /// Remove a user from a ride's passenger list.
    ///
    /// # Errors
    ///
    /// Returns an error if the ride is unknown or the database operation fails.
    pub fn leave_ride(&self, ride_id: &RideId, user_id: &UserId) -> Result<RideUpdate> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let before = require_ride(&tx, ride_id)?;
        delete_passenger(&tx, ride_id, user_id)?;
        let after = require_ride(&tx, ride_id)?;
        tx.commit()?;

        if before.has_passenger(user_id) {
            info!(ride = %ride_id, user = %user_id, "passenger left ride");
        }
        Ok(RideUpdate::new(before, after))
    }

    /// Move an upcoming ride to `completed` or `cancelled`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ride is unknown, the transition is not
    /// allowed, or the database operation fails.
    pub fn set_status(&self, ride_id: &RideId, status: RideStatus) -> Result<RideUpdate> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let before = require_ride(&tx, ride_id)?;
        if !before.status.can_transition_to(status) {
            return Err(Error::InvalidStatusTransition {
                from: before.status,
                to: status,
            });
        }

        tx.execute(
            "UPDATE rides SET status = ?1 WHERE id = ?2",
            params![status.to_string(), ride_id.as_str()],
        )?;
        let after = require_ride(&tx, ride_id)?;
        tx.commit()?;

        info!(ride = %ride_id, from = %before.status, to = %status, "ride status changed");
        Ok(RideUpdate::new(before, after))
    }

    /// Upcoming rides with a free seat that the user could join.
    ///
    /// Excludes rides the user is already on or drives; soonest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn joinable_rides(&self, user_id: &UserId) -> Result<Vec<Ride>> {
        let conn = self.conn()?;
        load_rides(
            &conn,
            r"
            SELECT id FROM rides
            WHERE status = 'upcoming'
              AND (driver_id IS NULL OR driver_id != ?1)
              AND id NOT IN (SELECT ride_id FROM ride_passengers WHERE user_id = ?1)
              AND seats > (SELECT COUNT(*) FROM ride_passengers p WHERE p.ride_id = rides.id)
            ORDER BY departure_time ASC, id ASC
            ",
            params![user_id.as_str()],
        )
    }

    /// The user's rides, newest departure first.
    ///
    /// Drivers see the rides they posted, students the rides they are a
    /// passenger on. An optional status narrows the list.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is unknown or the database operation fails.
    pub fn history(&self, user_id: &UserId, status: Option<RideStatus>) -> Result<Vec<Ride>> {
        let conn = self.conn()?;
        let user = load_user(&conn, user_id)?.ok_or_else(|| Error::UserNotFound {
            user_id: user_id.clone(),
        })?;
        let status = status.map(|s| s.to_string());

        let sql = match user.role {
            UserRole::Driver => {
                r"
                SELECT id FROM rides
                WHERE driver_id = ?1 AND (?2 IS NULL OR status = ?2)
                ORDER BY departure_time DESC, id ASC
                "
            }
            UserRole::Student => {
                r"
                SELECT id FROM rides
                WHERE id IN (SELECT ride_id FROM ride_passengers WHERE user_id = ?1)
                  AND (?2 IS NULL OR status = ?2)
                ORDER BY departure_time DESC, id ASC
                "
            }
        };
        load_rides(&conn, sql, params![user_id.as_str(), status])
    }

    /// Every upcoming ride the user drives or rides on, soonest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is unknown or the database operation fails.
    pub fn upcoming_rides(&self, user_id: &UserId) -> Result<Vec<Ride>> {
        let conn = self.conn()?;
        let user = load_user(&conn, user_id)?.ok_or_else(|| Error::UserNotFound {
            user_id: user_id.clone(),
        })?;

        let sql = format!(
            r"
            SELECT id FROM rides
            WHERE {} AND status = 'upcoming'
            ORDER BY departure_time ASC, id ASC
            ",
            membership_clause(user.role)
        );
        load_rides(&conn, &sql, params![user_id.as_str()])
    }

    /// The user's earliest upcoming ride departing after `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the user is unknown or the database operation fails.
    pub fn next_ride(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<Option<Ride>> {
        let conn = self.conn()?;
        let user = load_user(&conn, user_id)?.ok_or_else(|| Error::UserNotFound {
            user_id: user_id.clone(),
        })?;

        let membership = membership_clause(user.role);
        let sql = format!(
            r"
            SELECT id FROM rides
            WHERE {membership} AND status = 'upcoming' AND departure_time > ?2
            ORDER BY departure_time ASC, id ASC LIMIT 1
            "
        );
        let rides = load_rides(&conn, &sql, params![user_id.as_str(), format_time(now)])?;
        Ok(rides.into_iter().next())
    }

    /// Users currently listed on more than one upcoming ride.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn membership_violations(&self) -> Result<Vec<MembershipViolation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r"
            SELECT p.user_id, p.ride_id
            FROM ride_passengers p JOIN rides r ON r.id = p.ride_id
            WHERE r.status = 'upcoming'
            ORDER BY p.user_id, p.ride_id
            ",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut by_user: BTreeMap<String, Vec<RideId>> = BTreeMap::new();
        for (user, ride) in rows {
            by_user.entry(user).or_default().push(RideId::from(ride));
        }

        Ok(by_user
            .into_iter()
            .filter(|(_, rides)| rides.len() > 1)
            .map(|(user, rides)| MembershipViolation {
                user_id: UserId::from(user),
                rides,
            })
            .collect())
    }

    /// Get database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let conn = self.conn()?;
        let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        let memberships: i64 =
            conn.query_row("SELECT COUNT(*) FROM ride_passengers", [], |row| row.get(0))?;

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM rides GROUP BY status")?;
        let rides_by_status = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            users,
            rides_by_status,
            memberships,
            db_size_bytes,
        })
    }

}

#[async_trait::async_trait]
impl RideRepository for Storage {
    async fn find_upcoming_rides_containing(&self, user: &UserId) -> Result<Vec<RideId>> {
        let user = user.clone();
        self.with_blocking_conn(move |conn| upcoming_rides_containing(conn, &user))
            .await
    }

    async fn remove_passenger(&self, ride: &RideId, user: &UserId) -> Result<()> {
        let (ride, user) = (ride.clone(), user.clone());
        self.with_blocking_conn(move |conn| delete_passenger(conn, &ride, &user))
            .await
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| Error::internal("database connection mutex poisoned"))
}

/// SQL condition selecting the rides a user takes part in, user id as `?1`.
fn membership_clause(role: UserRole) -> &'static str {
    match role {
        UserRole::Driver => "driver_id = ?1",
        UserRole::Student => "id IN (SELECT ride_id FROM ride_passengers WHERE user_id = ?1)",
    }
}

/// Trim a hostel, treating blank as none. Only students may have one.
fn normalize_hostel(role: UserRole, hostel: Option<&str>) -> Result<Option<String>> {
    let hostel = hostel.map(str::trim).filter(|h| !h.is_empty());
    match (role, hostel) {
        (UserRole::Driver, Some(_)) => Err(Error::invalid_input(
            "hostel",
            "only students have a hostel",
        )),
        (_, hostel) => Ok(hostel.map(str::to_string)),
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn upcoming_rides_containing(conn: &Connection, user: &UserId) -> Result<Vec<RideId>> {
    let mut stmt = conn.prepare(
        r"
        SELECT r.id FROM rides r JOIN ride_passengers p ON p.ride_id = r.id
        WHERE p.user_id = ?1 AND r.status = 'upcoming'
        ORDER BY r.id
        ",
    )?;
    let ids = stmt
        .query_map([user.as_str()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids.into_iter().map(RideId::from).collect())
}

fn delete_passenger(conn: &Connection, ride: &RideId, user: &UserId) -> Result<()> {
    conn.execute(
        "DELETE FROM ride_passengers WHERE ride_id = ?1 AND user_id = ?2",
        params![ride.as_str(), user.as_str()],
    )?;
    Ok(())
}

fn load_user(conn: &Connection, id: &UserId) -> Result<Option<User>> {
    let row = conn
        .query_row(
            "SELECT id, display_name, role, hostel, created_at FROM users WHERE id = ?1",
            [id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((id, display_name, role, hostel, created_at)) = row else {
        return Ok(None);
    };
    let role = UserRole::parse(&role).ok_or_else(|| {
        Error::internal(format!("user {id} has unrecognised role {role:?}"))
    })?;

    Ok(Some(User {
        id: UserId::from(id),
        display_name,
        role,
        hostel,
        created_at: parse_time(created_at).unwrap_or_else(Utc::now),
    }))
}

fn require_role(conn: &Connection, id: &UserId, role: UserRole) -> Result<User> {
    let user = load_user(conn, id)?.ok_or_else(|| Error::UserNotFound {
        user_id: id.clone(),
    })?;
    if user.role != role {
        return Err(Error::RoleMismatch {
            user_id: id.clone(),
            expected: role,
        });
    }
    Ok(user)
}

fn load_ride(conn: &Connection, id: &RideId) -> Result<Option<Ride>> {
    let ride = conn
        .query_row(
            &format!("SELECT {RIDE_COLUMNS} FROM rides WHERE id = ?1"),
            [id.as_str()],
            row_to_ride,
        )
        .optional()?;

    let Some(mut ride) = ride else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT user_id FROM ride_passengers WHERE ride_id = ?1 ORDER BY position ASC",
    )?;
    ride.passengers = stmt
        .query_map([id.as_str()], |row| row.get::<_, String>(0))?
        .map(|user| user.map(UserId::from))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(ride))
}

fn require_ride(conn: &Connection, id: &RideId) -> Result<Ride> {
    load_ride(conn, id)?.ok_or_else(|| Error::RideNotFound { ride_id: id.clone() })
}

fn load_rides(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Ride>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    ids.into_iter()
        .filter_map(|id| load_ride(conn, &RideId::from(id)).transpose())
        .collect()
}

fn row_to_ride(row: &rusqlite::Row) -> rusqlite::Result<Ride> {
    let id: String = row.get(0)?;
    let driver_id: Option<String> = row.get(1)?;
    let pickup: String = row.get(2)?;
    let destination: String = row.get(3)?;
    let departure_time: Option<String> = row.get(4)?;
    let seats: i64 = row.get(5)?;
    let status_str: String = row.get(6)?;
    let created_at: Option<String> = row.get(7)?;

    let status = RideStatus::parse(&status_str);
    if status == RideStatus::Unknown {
        warn!("Unknown ride status: {}, ride {} treated as not upcoming", status_str, id);
    }

    Ok(Ride {
        id: RideId::from(id),
        driver_id: driver_id.map(UserId::from),
        pickup,
        destination,
        departure_time: parse_time(departure_time),
        seats: u32::try_from(seats).unwrap_or(0),
        passengers: Vec::new(),
        status,
        created_at: parse_time(created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn create_test_storage() -> Storage {
        let storage = Storage::open_in_memory().expect("failed to create test storage");
        storage
            .add_user(&User::new("dan", "Dan", UserRole::Driver))
            .unwrap();
        storage
            .add_user(&User::new("eve", "Eve", UserRole::Driver))
            .unwrap();
        for student in ["alice", "bob", "carol"] {
            storage
                .add_user(&User::new(student, student, UserRole::Student))
                .unwrap();
        }
        storage
    }

    fn post_ride(storage: &Storage, driver: &str, seats: u32, hours_from_now: i64) -> Ride {
        storage
            .create_ride(&NewRide {
                driver_id: UserId::from(driver),
                pickup: "Library".to_string(),
                destination: "Airport".to_string(),
                departure_time: Utc::now() + Duration::hours(hours_from_now),
                seats,
            })
            .unwrap()
    }

    fn uid(id: &str) -> UserId {
        UserId::from(id)
    }

    #[test]
    fn test_open_in_memory() {
        assert!(Storage::open_in_memory().is_ok());
    }

    #[test]
    fn test_add_and_get_user() {
        let storage = create_test_storage();
        let user = storage.get_user(&uid("alice")).unwrap().unwrap();
        assert_eq!(user.role, UserRole::Student);
        assert!(storage.get_user(&uid("nobody")).unwrap().is_none());
    }

    #[test]
    fn test_add_duplicate_user_rejected() {
        let storage = create_test_storage();
        let err = storage
            .add_user(&User::new("alice", "Alice again", UserRole::Student))
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_add_blank_user_rejected() {
        let storage = create_test_storage();
        assert!(storage
            .add_user(&User::new("  ", "Blank", UserRole::Student))
            .is_err());
    }

    #[test]
    fn test_student_hostel_is_stored() {
        let storage = create_test_storage();
        storage
            .add_user(&User::new("dora", "Dora", UserRole::Student).with_hostel("  TUK Men "))
            .unwrap();

        let user = storage.get_user(&uid("dora")).unwrap().unwrap();
        assert_eq!(user.hostel.as_deref(), Some("TUK Men"));
        assert!(storage.get_user(&uid("alice")).unwrap().unwrap().hostel.is_none());
    }

    #[test]
    fn test_driver_hostel_rejected() {
        let storage = create_test_storage();
        let err = storage
            .add_user(&User::new("fred", "Fred", UserRole::Driver).with_hostel("TUK Men"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput { field: "hostel", .. }));
    }

    #[test]
    fn test_update_user_profile() {
        let storage = create_test_storage();

        let user = storage
            .update_user(&uid("alice"), Some("Alice B"), Some("TUK Women"))
            .unwrap();
        assert_eq!(user.display_name, "Alice B");
        assert_eq!(user.hostel.as_deref(), Some("TUK Women"));

        let user = storage.update_user(&uid("alice"), None, Some("")).unwrap();
        assert_eq!(user.display_name, "Alice B");
        assert!(user.hostel.is_none());

        let stored = storage.get_user(&uid("alice")).unwrap().unwrap();
        assert_eq!(stored.display_name, "Alice B");
        assert!(stored.hostel.is_none());
    }

    #[test]
    fn test_update_user_rejects_bad_input() {
        let storage = create_test_storage();

        assert!(storage
            .update_user(&uid("ghost"), Some("Ghost"), None)
            .unwrap_err()
            .is_not_found());
        assert!(matches!(
            storage.update_user(&uid("bob"), Some("  "), None).unwrap_err(),
            Error::InvalidInput { .. }
        ));
        assert!(matches!(
            storage.update_user(&uid("dan"), None, Some("TUK Men")).unwrap_err(),
            Error::InvalidInput { field: "hostel", .. }
        ));
        assert_eq!(
            storage.get_user(&uid("bob")).unwrap().unwrap().display_name,
            "bob"
        );
    }

    #[test]
    fn test_create_ride() {
        let storage = create_test_storage();
        let ride = post_ride(&storage, "dan", 3, 2);

        assert!(ride.is_upcoming());
        assert!(ride.passengers.is_empty());

        let stored = storage.get_ride(&ride.id).unwrap().unwrap();
        assert_eq!(stored, ride);
    }

    #[test]
    fn test_create_ride_requires_driver() {
        let storage = create_test_storage();
        let err = storage
            .create_ride(&NewRide {
                driver_id: uid("alice"),
                pickup: "A".to_string(),
                destination: "B".to_string(),
                departure_time: Utc::now(),
                seats: 2,
            })
            .unwrap_err();
        assert!(matches!(err, Error::RoleMismatch { .. }));
    }

    #[test]
    fn test_create_ride_validates_input() {
        let storage = create_test_storage();
        let mut new_ride = NewRide {
            driver_id: uid("dan"),
            pickup: "A".to_string(),
            destination: "B".to_string(),
            departure_time: Utc::now(),
            seats: 0,
        };
        assert!(matches!(
            storage.create_ride(&new_ride).unwrap_err(),
            Error::InvalidInput { field: "seats", .. }
        ));

        new_ride.seats = 1;
        new_ride.pickup = String::new();
        assert!(matches!(
            storage.create_ride(&new_ride).unwrap_err(),
            Error::InvalidInput { field: "pickup", .. }
        ));
    }

    #[test]
    fn test_create_ride_unknown_driver() {
        let storage = create_test_storage();
        let err = storage
            .create_ride(&NewRide {
                driver_id: uid("ghost"),
                pickup: "A".to_string(),
                destination: "B".to_string(),
                departure_time: Utc::now(),
                seats: 2,
            })
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_join_ride_appends_in_order() {
        let storage = create_test_storage();
        let ride = post_ride(&storage, "dan", 3, 2);

        let update = storage
            .join_ride(&ride.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap();
        assert!(update.before.passengers.is_empty());
        assert_eq!(update.after.passengers, vec![uid("bob")]);

        storage
            .join_ride(&ride.id, &uid("alice"), JoinPolicy::Revert)
            .unwrap();
        let stored = storage.get_ride(&ride.id).unwrap().unwrap();
        assert_eq!(stored.passengers, vec![uid("bob"), uid("alice")]);
    }

    #[test]
    fn test_join_twice_is_noop() {
        let storage = create_test_storage();
        let ride = post_ride(&storage, "dan", 3, 2);

        storage
            .join_ride(&ride.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap();
        let update = storage
            .join_ride(&ride.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap();
        assert_eq!(update.before, update.after);
        assert_eq!(update.after.passengers, vec![uid("bob")]);
    }

    #[test]
    fn test_join_full_ride_rejected() {
        let storage = create_test_storage();
        let ride = post_ride(&storage, "dan", 1, 2);

        storage
            .join_ride(&ride.id, &uid("alice"), JoinPolicy::Revert)
            .unwrap();
        let err = storage
            .join_ride(&ride.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap_err();
        assert!(matches!(err, Error::RideFull { seats: 1, .. }));
    }

    #[test]
    fn test_join_requires_student() {
        let storage = create_test_storage();
        let ride = post_ride(&storage, "dan", 2, 2);

        let err = storage
            .join_ride(&ride.id, &uid("eve"), JoinPolicy::Revert)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RoleMismatch {
                expected: UserRole::Student,
                ..
            }
        ));
    }

    #[test]
    fn test_join_unknown_ride() {
        let storage = create_test_storage();
        let err = storage
            .join_ride(&RideId::from("missing"), &uid("bob"), JoinPolicy::Revert)
            .unwrap_err();
        assert!(matches!(err, Error::RideNotFound { .. }));
    }

    #[test]
    fn test_join_cancelled_ride_rejected() {
        let storage = create_test_storage();
        let ride = post_ride(&storage, "dan", 2, 2);
        storage.set_status(&ride.id, RideStatus::Cancelled).unwrap();

        let err = storage
            .join_ride(&ride.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RideNotUpcoming {
                status: RideStatus::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn test_revert_policy_lets_second_join_land() {
        let storage = create_test_storage();
        let first = post_ride(&storage, "dan", 2, 2);
        let second = post_ride(&storage, "eve", 2, 3);

        storage
            .join_ride(&first.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap();
        storage
            .join_ride(&second.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap();

        let violations = storage.membership_violations().unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].user_id, uid("bob"));
        assert_eq!(violations[0].rides.len(), 2);
    }

    #[test]
    fn test_reject_policy_refuses_second_upcoming_ride() {
        let storage = create_test_storage();
        let first = post_ride(&storage, "dan", 2, 2);
        let second = post_ride(&storage, "eve", 2, 3);

        storage
            .join_ride(&first.id, &uid("bob"), JoinPolicy::Reject)
            .unwrap();
        let err = storage
            .join_ride(&second.id, &uid("bob"), JoinPolicy::Reject)
            .unwrap_err();

        match err {
            Error::AlreadyInUpcomingRide { ride_id, .. } => assert_eq!(ride_id, first.id),
            other => panic!("unexpected error: {other}"),
        }
        assert!(storage.membership_violations().unwrap().is_empty());
    }

    #[test]
    fn test_reject_policy_ignores_finished_rides() {
        let storage = create_test_storage();
        let first = post_ride(&storage, "dan", 2, 2);
        let second = post_ride(&storage, "eve", 2, 3);

        storage
            .join_ride(&first.id, &uid("bob"), JoinPolicy::Reject)
            .unwrap();
        storage.set_status(&first.id, RideStatus::Completed).unwrap();

        assert!(storage
            .join_ride(&second.id, &uid("bob"), JoinPolicy::Reject)
            .is_ok());
    }

    #[test]
    fn test_leave_ride() {
        let storage = create_test_storage();
        let ride = post_ride(&storage, "dan", 3, 2);
        storage
            .join_ride(&ride.id, &uid("alice"), JoinPolicy::Revert)
            .unwrap();
        storage
            .join_ride(&ride.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap();

        let update = storage.leave_ride(&ride.id, &uid("alice")).unwrap();
        assert_eq!(update.before.passengers, vec![uid("alice"), uid("bob")]);
        assert_eq!(update.after.passengers, vec![uid("bob")]);

        let update = storage.leave_ride(&ride.id, &uid("alice")).unwrap();
        assert_eq!(update.before, update.after);
    }

    #[test]
    fn test_set_status_transitions() {
        let storage = create_test_storage();
        let ride = post_ride(&storage, "dan", 3, 2);

        let update = storage.set_status(&ride.id, RideStatus::Completed).unwrap();
        assert_eq!(update.before.status, RideStatus::Upcoming);
        assert_eq!(update.after.status, RideStatus::Completed);

        let err = storage
            .set_status(&ride.id, RideStatus::Cancelled)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStatusTransition { .. }));
    }

    #[test]
    fn test_joinable_rides() {
        let storage = create_test_storage();
        let later = post_ride(&storage, "dan", 2, 5);
        let sooner = post_ride(&storage, "eve", 2, 1);
        let full = post_ride(&storage, "eve", 1, 3);
        let cancelled = post_ride(&storage, "dan", 2, 4);

        storage
            .join_ride(&full.id, &uid("carol"), JoinPolicy::Revert)
            .unwrap();
        storage.set_status(&cancelled.id, RideStatus::Cancelled).unwrap();
        storage
            .join_ride(&later.id, &uid("alice"), JoinPolicy::Revert)
            .unwrap();

        let for_bob: Vec<RideId> = storage
            .joinable_rides(&uid("bob"))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(for_bob, vec![sooner.id.clone(), later.id.clone()]);

        let for_alice: Vec<RideId> = storage
            .joinable_rides(&uid("alice"))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(for_alice, vec![sooner.id]);
    }

    #[test]
    fn test_history_by_role_and_status() {
        let storage = create_test_storage();
        let done = post_ride(&storage, "dan", 2, 1);
        let open = post_ride(&storage, "dan", 2, 3);
        let other = post_ride(&storage, "eve", 2, 2);

        storage
            .join_ride(&done.id, &uid("alice"), JoinPolicy::Revert)
            .unwrap();
        storage
            .join_ride(&other.id, &uid("alice"), JoinPolicy::Revert)
            .unwrap();
        storage.set_status(&done.id, RideStatus::Completed).unwrap();

        let driver: Vec<RideId> = storage
            .history(&uid("dan"), None)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(driver, vec![open.id, done.id.clone()]);

        let student = storage.history(&uid("alice"), None).unwrap();
        assert_eq!(student.len(), 2);

        let completed = storage
            .history(&uid("alice"), Some(RideStatus::Completed))
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].id, done.id);

        assert!(storage.history(&uid("ghost"), None).is_err());
    }

    #[test]
    fn test_next_ride() {
        let storage = create_test_storage();
        let _past = post_ride(&storage, "dan", 2, -3);
        let soon = post_ride(&storage, "dan", 2, 1);
        let _later = post_ride(&storage, "dan", 2, 6);

        let next = storage.next_ride(&uid("dan"), Utc::now()).unwrap().unwrap();
        assert_eq!(next.id, soon.id);

        assert!(storage.next_ride(&uid("bob"), Utc::now()).unwrap().is_none());

        storage
            .join_ride(&soon.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap();
        let next = storage.next_ride(&uid("bob"), Utc::now()).unwrap().unwrap();
        assert_eq!(next.id, soon.id);
    }

    #[test]
    fn test_upcoming_rides_soonest_first() {
        let storage = create_test_storage();
        let later = post_ride(&storage, "dan", 2, 6);
        let sooner = post_ride(&storage, "dan", 2, 1);
        let done = post_ride(&storage, "dan", 2, 3);
        storage.set_status(&done.id, RideStatus::Completed).unwrap();

        let driver: Vec<RideId> = storage
            .upcoming_rides(&uid("dan"))
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(driver, vec![sooner.id.clone(), later.id.clone()]);

        storage
            .join_ride(&later.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap();
        let student = storage.upcoming_rides(&uid("bob")).unwrap();
        assert_eq!(student.len(), 1);
        assert_eq!(student[0].id, later.id);

        assert!(storage.upcoming_rides(&uid("carol")).unwrap().is_empty());
        assert!(storage.upcoming_rides(&uid("ghost")).is_err());
    }

    #[tokio::test]
    async fn test_repository_queries_only_upcoming() {
        let storage = create_test_storage();
        let first = post_ride(&storage, "dan", 2, 2);
        let second = post_ride(&storage, "eve", 2, 3);

        storage
            .join_ride(&first.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap();
        storage
            .join_ride(&second.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap();
        assert_eq!(
            storage
                .find_upcoming_rides_containing(&uid("bob"))
                .await
                .unwrap()
                .len(),
            2
        );

        storage.set_status(&first.id, RideStatus::Cancelled).unwrap();
        assert_eq!(
            storage
                .find_upcoming_rides_containing(&uid("bob"))
                .await
                .unwrap(),
            vec![second.id]
        );
    }

    #[tokio::test]
    async fn test_repository_remove_passenger_is_idempotent() {
        let storage = create_test_storage();
        let ride = post_ride(&storage, "dan", 2, 2);
        storage
            .join_ride(&ride.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap();

        storage.remove_passenger(&ride.id, &uid("bob")).await.unwrap();
        storage.remove_passenger(&ride.id, &uid("bob")).await.unwrap();

        assert!(storage.get_ride(&ride.id).unwrap().unwrap().passengers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repository_calls_run_concurrently() {
        let storage = Arc::new(create_test_storage());
        let ride = post_ride(&storage, "dan", 3, 2);
        for student in ["alice", "bob", "carol"] {
            storage
                .join_ride(&ride.id, &uid(student), JoinPolicy::Revert)
                .unwrap();
        }

        let mut tasks = tokio::task::JoinSet::new();
        for student in ["alice", "bob", "carol"] {
            let storage = Arc::clone(&storage);
            tasks.spawn(async move {
                storage
                    .find_upcoming_rides_containing(&uid(student))
                    .await
                    .unwrap()
            });
        }
        while let Some(found) = tasks.join_next().await {
            assert_eq!(found.unwrap(), vec![ride.id.clone()]);
        }
    }

    #[test]
    fn test_stats() {
        let storage = create_test_storage();
        let ride = post_ride(&storage, "dan", 2, 2);
        let cancelled = post_ride(&storage, "dan", 2, 2);
        storage
            .join_ride(&ride.id, &uid("bob"), JoinPolicy::Revert)
            .unwrap();
        storage.set_status(&cancelled.id, RideStatus::Cancelled).unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.users, 5);
        assert_eq!(stats.memberships, 1);
        assert_eq!(stats.rides_by_status.get("upcoming"), Some(&1));
        assert_eq!(stats.rides_by_status.get("cancelled"), Some(&1));
        assert_eq!(stats.db_size_bytes, 0);
    }

    #[test]
    fn test_open_file_based() {
        let temp_dir = std::env::temp_dir();
        let db_path = temp_dir.join(format!("ridepool_test_{}.db", std::process::id()));

        let storage = Storage::open(&db_path).unwrap();
        storage
            .add_user(&User::new("dan", "Dan", UserRole::Driver))
            .unwrap();
        assert_eq!(storage.path(), db_path);
        assert_eq!(storage.stats().unwrap().users, 1);

        drop(storage);
        let reopened = Storage::open(&db_path).unwrap();
        assert!(reopened.get_user(&uid("dan")).unwrap().is_some());

        drop(reopened);
        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let temp_dir = std::env::temp_dir();
        let nested_path = temp_dir.join(format!(
            "ridepool_test_{}/nested/rides.db",
            std::process::id()
        ));

        if let Some(parent) = nested_path.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }

        let storage = Storage::open(&nested_path).unwrap();
        assert!(nested_path.exists());

        drop(storage);
        if let Some(parent) = nested_path.parent().and_then(Path::parent) {
            let _ = std::fs::remove_dir_all(parent);
        }
    }
}

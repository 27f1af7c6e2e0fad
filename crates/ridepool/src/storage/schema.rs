//! `SQLite` schema definitions for ridepool.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the users table.
pub const CREATE_USERS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    role TEXT NOT NULL,
    created_at TEXT NOT NULL
)
";

/// Migration 2: students record the hostel they live in.
pub const ADD_USER_HOSTEL_COLUMN: &str = r"
ALTER TABLE users ADD COLUMN hostel TEXT
";

/// SQL statement to create the rides table.
pub const CREATE_RIDES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS rides (
    id TEXT PRIMARY KEY,
    driver_id TEXT,
    pickup TEXT NOT NULL,
    destination TEXT NOT NULL,
    departure_time TEXT,
    seats INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT
)
";

/// SQL statement to create the passenger membership table.
///
/// One row per (ride, user); `position` keeps join order.
pub const CREATE_RIDE_PASSENGERS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS ride_passengers (
    ride_id TEXT NOT NULL REFERENCES rides(id),
    user_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (ride_id, user_id)
)
";

/// SQL statement to create an index on ride status for upcoming-ride queries.
pub const CREATE_STATUS_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_rides_status ON rides(status)
";

/// SQL statement to create an index on `driver_id` for driver history.
pub const CREATE_DRIVER_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_rides_driver ON rides(driver_id)
";

/// SQL statement to create an index on passenger `user_id` for membership queries.
pub const CREATE_PASSENGER_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_ride_passengers_user ON ride_passengers(user_id)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_USERS_TABLE,
    CREATE_RIDES_TABLE,
    CREATE_RIDE_PASSENGERS_TABLE,
    CREATE_STATUS_INDEX,
    CREATE_DRIVER_INDEX,
    CREATE_PASSENGER_INDEX,
    CREATE_METADATA_TABLE,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_not_empty() {
        assert!(!SCHEMA_STATEMENTS.is_empty());
        for stmt in SCHEMA_STATEMENTS {
            assert!(!stmt.is_empty());
        }
    }

    #[test]
    fn test_passenger_table_is_keyed_by_ride_and_user() {
        assert!(CREATE_RIDE_PASSENGERS_TABLE.contains("PRIMARY KEY (ride_id, user_id)"));
        assert!(CREATE_RIDE_PASSENGERS_TABLE.contains("position INTEGER NOT NULL"));
    }

    #[test]
    fn test_rides_table_contains_required_columns() {
        assert!(CREATE_RIDES_TABLE.contains("id TEXT PRIMARY KEY"));
        assert!(CREATE_RIDES_TABLE.contains("seats INTEGER NOT NULL"));
        assert!(CREATE_RIDES_TABLE.contains("status TEXT NOT NULL"));
    }
}

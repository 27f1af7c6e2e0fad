//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, Utc};
use clap::{Args, Subcommand, ValueEnum};

use crate::ride::{RideStatus, UserRole};

/// User management commands.
#[derive(Debug, Subcommand)]
pub enum UserCommand {
    /// Register a user
    Add {
        /// Unique user id
        id: String,

        /// Display name
        #[arg(short, long)]
        name: String,

        /// Whether the user posts or joins rides
        #[arg(short, long, value_enum)]
        role: RoleArg,

        /// Hostel the student lives in
        #[arg(long)]
        hostel: Option<String>,
    },

    /// Edit a user's profile
    Update {
        /// User id
        id: String,

        /// New display name
        #[arg(short, long)]
        name: Option<String>,

        /// New hostel; an empty value clears it
        #[arg(long)]
        hostel: Option<String>,
    },

    /// Show a registered user
    Show {
        /// User id
        id: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },
}

/// Ride commands.
#[derive(Debug, Subcommand)]
pub enum RideCommand {
    /// Post a new ride as a driver
    Create(CreateRideCommand),

    /// Show a ride
    Show {
        /// Ride id
        ride: String,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Join a ride as a passenger
    Join {
        /// Ride id
        ride: String,

        /// Joining user id
        user: String,
    },

    /// Leave a ride
    Leave {
        /// Ride id
        ride: String,

        /// Leaving user id
        user: String,
    },

    /// Mark a ride as completed
    Complete {
        /// Ride id
        ride: String,
    },

    /// Cancel a ride
    Cancel {
        /// Ride id
        ride: String,
    },
}

/// Arguments for posting a ride.
#[derive(Debug, Args)]
pub struct CreateRideCommand {
    /// Driver user id
    #[arg(short, long)]
    pub driver: String,

    /// Pickup location
    #[arg(short, long)]
    pub pickup: String,

    /// Destination
    #[arg(short = 't', long)]
    pub destination: String,

    /// Departure time (RFC 3339, or "YYYY-MM-DD HH:MM" in UTC)
    #[arg(long, value_parser = parse_departure)]
    pub departure: DateTime<Utc>,

    /// Number of passenger seats
    #[arg(short, long)]
    pub seats: u32,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Browse command arguments.
#[derive(Debug, Args)]
pub struct BrowseCommand {
    /// User looking for a ride
    pub user: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// History command arguments.
#[derive(Debug, Args)]
pub struct HistoryCommand {
    /// User whose rides to list
    pub user: String,

    /// Only rides with this status
    #[arg(short, long, value_enum)]
    pub status: Option<StatusArg>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Upcoming-rides command arguments.
#[derive(Debug, Args)]
pub struct UpcomingCommand {
    /// User whose upcoming rides to list
    pub user: String,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Next-ride command arguments.
#[derive(Debug, Args)]
pub struct NextCommand {
    /// User whose next ride to show
    pub user: String,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Replay one ride update through the membership enforcer.
#[derive(Debug, Args)]
pub struct EnforceCommand {
    /// JSON file with the ride before the update
    #[arg(long, value_name = "FILE")]
    pub before: PathBuf,

    /// JSON file with the ride after the update
    #[arg(long, value_name = "FILE")]
    pub after: PathBuf,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Audit command arguments.
#[derive(Debug, Args)]
pub struct AuditCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// User role argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RoleArg {
    /// Posts rides
    Driver,
    /// Joins rides
    Student,
}

impl From<RoleArg> for UserRole {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Driver => Self::Driver,
            RoleArg::Student => Self::Student,
        }
    }
}

/// Ride status filter argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    /// Not yet departed
    Upcoming,
    /// Took place
    Completed,
    /// Called off
    Cancelled,
}

impl From<StatusArg> for RideStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Upcoming => Self::Upcoming,
            StatusArg::Completed => Self::Completed,
            StatusArg::Cancelled => Self::Cancelled,
        }
    }
}

/// Output format for ride listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Aligned table
    #[default]
    Table,
    /// JSON array
    Json,
}

/// Parse a departure time given on the command line.
///
/// # Errors
///
/// Returns a message if the value is neither RFC 3339 nor `YYYY-MM-DD HH:MM`.
pub fn parse_departure(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Ok(time.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M")
        .map(|naive| naive.and_utc())
        .map_err(|_| {
            format!("invalid departure time {value:?}, expected RFC 3339 or \"YYYY-MM-DD HH:MM\"")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_departure_rfc3339() {
        let time = parse_departure("2026-10-20T08:30:00+02:00").unwrap();
        assert_eq!(time, Utc.with_ymd_and_hms(2026, 10, 20, 6, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_departure_short_form() {
        let time = parse_departure("2026-10-20 08:30").unwrap();
        assert_eq!(time, Utc.with_ymd_and_hms(2026, 10, 20, 8, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_departure_invalid() {
        let err = parse_departure("tomorrow").unwrap_err();
        assert!(err.contains("tomorrow"));
    }

    #[test]
    fn test_role_arg_conversion() {
        assert_eq!(UserRole::from(RoleArg::Driver), UserRole::Driver);
        assert_eq!(UserRole::from(RoleArg::Student), UserRole::Student);
    }

    #[test]
    fn test_status_arg_conversion() {
        assert_eq!(RideStatus::from(StatusArg::Cancelled), RideStatus::Cancelled);
    }
}

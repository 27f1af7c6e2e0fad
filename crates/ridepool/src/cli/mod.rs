//! Command-line interface for ridepool.
//!
//! This module provides the CLI structure for the `ridepool` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    parse_departure, AuditCommand, BrowseCommand, ConfigCommand, CreateRideCommand,
    EnforceCommand, HistoryCommand, NextCommand, OutputFormat, RideCommand, RoleArg, StatusArg,
    StatusCommand, UpcomingCommand, UserCommand,
};

/// ridepool - Campus ride pooling
///
/// Drivers post rides, students join them, and every passenger is kept on
/// at most one upcoming ride.
#[derive(Debug, Parser)]
#[command(name = "ridepool")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register and inspect users
    #[command(subcommand)]
    User(UserCommand),

    /// Post, join, leave and close rides
    #[command(subcommand)]
    Ride(RideCommand),

    /// List rides a user can join
    Browse(BrowseCommand),

    /// List a user's rides
    History(HistoryCommand),

    /// List a user's upcoming rides, soonest first
    Upcoming(UpcomingCommand),

    /// Show a user's next upcoming ride
    Next(NextCommand),

    /// Run membership enforcement for one recorded ride update
    Enforce(EnforceCommand),

    /// Report users on more than one upcoming ride
    Audit(AuditCommand),

    /// Show database status
    Status(StatusCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}

//! `ridepool` - Campus ride pooling with single-active-ride enforcement
//!
//! Drivers post rides, students join them, and after every ride update a
//! membership enforcer takes newly added passengers back off the ride if
//! they already sit on another upcoming ride.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod cli;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod logging;
pub mod memory;
pub mod repository;
pub mod ride;
pub mod service;
pub mod storage;
pub mod trigger;

pub use config::{Config, JoinPolicy};
pub use enforcer::{Enforcement, MembershipEnforcer};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use memory::InMemoryRides;
pub use repository::RideRepository;
pub use ride::{NewRide, Ride, RideId, RideStatus, User, UserId, UserRole};
pub use service::RideService;
pub use storage::{MembershipViolation, Storage, StorageStats};
pub use trigger::{RetryPolicy, RideUpdate, TriggerRunner, TriggerStats};

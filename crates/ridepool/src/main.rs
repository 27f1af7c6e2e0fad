//! `ridepool` - CLI for the campus ride pool
//!
//! Every command that changes a ride runs with a trigger runner attached,
//! so membership enforcement has finished before the command exits.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use ridepool::cli::{
    Cli, Command, ConfigCommand, CreateRideCommand, EnforceCommand, OutputFormat, RideCommand,
    UserCommand,
};
use ridepool::{
    init_logging, Config, Error, MembershipEnforcer, NewRide, RetryPolicy, Ride, RideId,
    RideService, RideStatus, RideUpdate, Storage, TriggerRunner, User, UserId,
};

/// Capacity of the ride update channel.
const UPDATE_BUFFER: usize = 64;

/// A join whose outcome is only known once enforcement has run.
#[derive(Debug)]
struct PendingJoin {
    ride: RideId,
    user: UserId,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Load configuration
    let config = Config::load_from(cli.config.clone())?;

    match cli.command {
        Command::Config(config_cmd) => handle_config(&config, config_cmd),
        Command::Enforce(enforce_cmd) => handle_enforce(&config, &enforce_cmd).await,
        command => run_with_trigger(&config, command).await,
    }
}

fn retry_policy(config: &Config) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.enforcer.max_attempts,
        delay: config.retry_delay(),
    }
}

/// Run a storage command with the membership trigger attached.
async fn run_with_trigger(config: &Config, command: Command) -> anyhow::Result<()> {
    let storage = Arc::new(Storage::open(config.database_path())?);

    let (tx, rx) = mpsc::channel(UPDATE_BUFFER);
    let runner = TriggerRunner::new(
        MembershipEnforcer::new(Arc::clone(&storage)),
        retry_policy(config),
    );
    let trigger = tokio::spawn(runner.run(rx));

    let service =
        RideService::new(Arc::clone(&storage), config.enforcer.join_policy).with_updates(tx);
    let outcome = dispatch(&service, command).await;
    drop(service);

    let stats = trigger.await.context("trigger runner task failed")?;
    if stats.invocations > 0 {
        info!(
            invocations = stats.invocations,
            corrections = stats.corrections,
            failures = stats.failures,
            "membership enforcement finished"
        );
    }

    if let Some(pending) = outcome? {
        report_join(&storage, &pending)?;
    }
    Ok(())
}

async fn dispatch(
    service: &RideService,
    command: Command,
) -> anyhow::Result<Option<PendingJoin>> {
    match command {
        Command::User(user_cmd) => handle_user(service, user_cmd).map(|()| None),
        Command::Ride(ride_cmd) => handle_ride(service, ride_cmd).await,
        Command::Browse(browse_cmd) => {
            let rides = service.browse(&UserId::from(browse_cmd.user))?;
            print_rides(&rides, browse_cmd.format)?;
            Ok(None)
        }
        Command::History(history_cmd) => {
            let rides = service.history(
                &UserId::from(history_cmd.user),
                history_cmd.status.map(RideStatus::from),
            )?;
            print_rides(&rides, history_cmd.format)?;
            Ok(None)
        }
        Command::Upcoming(upcoming_cmd) => {
            let rides = service.upcoming(&UserId::from(upcoming_cmd.user))?;
            print_rides(&rides, upcoming_cmd.format)?;
            Ok(None)
        }
        Command::Next(next_cmd) => {
            let ride = service.next_ride(&UserId::from(next_cmd.user), Utc::now())?;
            if next_cmd.json {
                println!("{}", serde_json::to_string_pretty(&ride)?);
            } else {
                match ride {
                    Some(ride) => print_ride(&ride),
                    None => println!("No upcoming rides."),
                }
            }
            Ok(None)
        }
        Command::Audit(audit_cmd) => {
            handle_audit(service.storage(), audit_cmd.json)?;
            Ok(None)
        }
        Command::Status(status_cmd) => {
            handle_status(service.storage(), status_cmd.json)?;
            Ok(None)
        }
        Command::Config(_) | Command::Enforce(_) => Ok(None),
    }
}

fn handle_user(service: &RideService, cmd: UserCommand) -> anyhow::Result<()> {
    match cmd {
        UserCommand::Add {
            id,
            name,
            role,
            hostel,
        } => {
            let mut user = User::new(id, name, role.into());
            user.hostel = hostel;
            service.register(&user)?;
            println!("Registered {} {} ({})", user.role, user.id, user.display_name);
        }
        UserCommand::Update { id, name, hostel } => {
            let user =
                service.update_profile(&UserId::from(id), name.as_deref(), hostel.as_deref())?;
            println!(
                "Updated {} ({}, hostel: {})",
                user.id,
                user.display_name,
                user.hostel.as_deref().unwrap_or("-")
            );
        }
        UserCommand::Show { id, json } => {
            let user_id = UserId::from(id);
            let user = service
                .storage()
                .get_user(&user_id)?
                .ok_or(Error::UserNotFound { user_id })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&user)?);
            } else {
                println!("User:       {}", user.id);
                println!("Name:       {}", user.display_name);
                println!("Role:       {}", user.role);
                if let Some(hostel) = &user.hostel {
                    println!("Hostel:     {hostel}");
                }
                println!("Registered: {}", user.created_at.format("%Y-%m-%d %H:%M"));
            }
        }
    }
    Ok(())
}

async fn handle_ride(
    service: &RideService,
    cmd: RideCommand,
) -> anyhow::Result<Option<PendingJoin>> {
    match cmd {
        RideCommand::Create(create) => {
            let json = create.json;
            let ride = service.post_ride(&new_ride(create))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ride)?);
            } else {
                println!("Posted ride {}", ride.id);
            }
        }
        RideCommand::Show { ride, json } => {
            let ride_id = RideId::from(ride);
            let ride = service
                .storage()
                .get_ride(&ride_id)?
                .ok_or(Error::RideNotFound { ride_id })?;
            if json {
                println!("{}", serde_json::to_string_pretty(&ride)?);
            } else {
                print_ride(&ride);
            }
        }
        RideCommand::Join { ride, user } => {
            let pending = PendingJoin {
                ride: RideId::from(ride),
                user: UserId::from(user),
            };
            service.join(&pending.ride, &pending.user).await?;
            return Ok(Some(pending));
        }
        RideCommand::Leave { ride, user } => {
            let ride = service
                .leave(&RideId::from(ride), &UserId::from(user.as_str()))
                .await?;
            println!("{user} left ride {}", ride.id);
        }
        RideCommand::Complete { ride } => {
            let ride = service
                .set_status(&RideId::from(ride), RideStatus::Completed)
                .await?;
            println!("Ride {} is {}", ride.id, ride.status);
        }
        RideCommand::Cancel { ride } => {
            let ride = service
                .set_status(&RideId::from(ride), RideStatus::Cancelled)
                .await?;
            println!("Ride {} is {}", ride.id, ride.status);
        }
    }
    Ok(None)
}

fn new_ride(create: CreateRideCommand) -> NewRide {
    NewRide {
        driver_id: UserId::from(create.driver),
        pickup: create.pickup,
        destination: create.destination,
        departure_time: create.departure,
        seats: create.seats,
    }
}

/// Tell the user whether a join survived enforcement.
fn report_join(storage: &Storage, pending: &PendingJoin) -> anyhow::Result<()> {
    let ride = storage
        .get_ride(&pending.ride)?
        .ok_or_else(|| Error::RideNotFound {
            ride_id: pending.ride.clone(),
        })?;
    if ride.has_passenger(&pending.user) {
        println!(
            "{} joined ride {} ({} seats left)",
            pending.user,
            ride.id,
            ride.seats_left()
        );
    } else {
        println!(
            "{} is already on another upcoming ride and was removed from ride {}",
            pending.user, ride.id
        );
    }
    Ok(())
}

async fn handle_enforce(config: &Config, cmd: &EnforceCommand) -> anyhow::Result<()> {
    let update = RideUpdate::new(read_ride(&cmd.before)?, read_ride(&cmd.after)?);
    if update.before.id != update.after.id {
        anyhow::bail!(
            "before and after describe different rides ({} vs {})",
            update.before.id,
            update.after.id
        );
    }

    let storage = Arc::new(Storage::open(config.database_path())?);
    let runner = TriggerRunner::new(MembershipEnforcer::new(storage), retry_policy(config));
    let enforcement = runner.invoke(&update).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&enforcement)?);
    } else if !enforcement.membership_changed {
        println!("Passenger membership unchanged.");
    } else if enforcement.corrected() {
        for user in &enforcement.removed {
            println!("Removed {user} from ride {}", enforcement.ride_id);
        }
    } else {
        println!(
            "No conflicts among {} added passenger(s).",
            enforcement.added.len()
        );
    }
    Ok(())
}

fn read_ride(path: &Path) -> anyhow::Result<Ride> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("failed to parse ride in {}", path.display()))
}

fn handle_audit(storage: &Storage, json: bool) -> anyhow::Result<()> {
    let violations = storage.membership_violations()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&violations)?);
    } else if violations.is_empty() {
        println!("Every passenger is on at most one upcoming ride.");
    } else {
        for violation in &violations {
            let rides: Vec<&str> = violation.rides.iter().map(RideId::as_str).collect();
            println!("{}: {}", violation.user_id, rides.join(", "));
        }
    }
    Ok(())
}

fn handle_status(storage: &Storage, json: bool) -> anyhow::Result<()> {
    let stats = storage.stats()?;
    if json {
        let status = serde_json::json!({
            "database_path": storage.path(),
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("ridepool status");
        println!("---------------");
        println!("Database:      {}", storage.path().display());
        println!("Size:          {} bytes", stats.db_size_bytes);
        println!("Users:         {}", stats.users);
        println!("Memberships:   {}", stats.memberships);
        for (status, count) in &stats.rides_by_status {
            println!("Rides {status:<9} {count}");
        }
    }
    Ok(())
}

fn print_rides(rides: &[Ride], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rides)?),
        OutputFormat::Table => {
            if rides.is_empty() {
                println!("No rides.");
                return Ok(());
            }
            println!(
                "{:<32}  {:<16}  {:<10}  {:>5}  ROUTE",
                "ID", "DEPARTURE", "STATUS", "SEATS"
            );
            for ride in rides {
                let seats = format!("{}/{}", ride.passengers.len(), ride.seats);
                println!(
                    "{:<32}  {:<16}  {:<10}  {:>5}  {} -> {}",
                    ride.id.as_str(),
                    departure(ride),
                    ride.status.to_string(),
                    seats,
                    ride.pickup,
                    ride.destination
                );
            }
        }
    }
    Ok(())
}

fn print_ride(ride: &Ride) {
    println!("Ride:        {}", ride.id);
    if let Some(driver) = &ride.driver_id {
        println!("Driver:      {driver}");
    }
    println!("Route:       {} -> {}", ride.pickup, ride.destination);
    println!("Departure:   {}", departure(ride));
    println!("Status:      {}", ride.status);
    println!(
        "Seats:       {} of {} taken",
        ride.passengers.len(),
        ride.seats
    );
    for passenger in &ride.passengers {
        println!("  - {passenger}");
    }
}

fn departure(ride: &Ride) -> String {
    ride.departure_time.map_or_else(
        || "-".to_string(),
        |time| time.format("%Y-%m-%d %H:%M").to_string(),
    )
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Database path:      {}", config.database_path().display());
                println!();
                println!("[Enforcer]");
                println!("  Join policy:        {}", config.enforcer.join_policy);
                println!("  Max attempts:       {}", config.enforcer.max_attempts);
                println!("  Retry delay (ms):   {}", config.enforcer.retry_delay_ms);
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => {
            let path = file.unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            match Config::load_from(Some(path)) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => println!("Configuration error: {e}"),
            }
        }
    }
    Ok(())
}

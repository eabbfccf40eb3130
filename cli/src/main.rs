// hrlink: desktop heart rate monitor
//
// Cross-platform (macOS, Linux, Windows) command-line front end for the
// hrlink core session, backed by btleplug.

mod config;
mod radio;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use colored::*;
use hrlink_core::{HeartRateSession, PeripheralRecord, SessionConfig, SessionUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "hrlink")]
#[command(about = "hrlink: BLE heart rate monitor", long_about = None)]
#[command(version)]
struct Cli {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby Bluetooth peripherals
    Scan {
        /// Scan deadline in seconds (defaults to the configured value)
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Connect to a heart rate strap and print its readings
    Monitor {
        /// Peripheral id or advertised name (defaults to `default_device`)
        device: Option<String>,
        /// Connect attempts before giving up
        #[arg(short, long)]
        retries: Option<u32>,
    },
    /// Show adapter and session status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Scan { timeout } => cmd_scan(timeout).await,
        Commands::Monitor { device, retries } => cmd_monitor(device, retries).await,
        Commands::Status { json } => cmd_status(json).await,
        Commands::Config { action } => cmd_config(action).await,
    }
}

async fn open_session(settings: SessionConfig) -> Result<HeartRateSession> {
    let radio = radio::BtleplugRadio::first_adapter()
        .await
        .context("Failed to open Bluetooth adapter")?;
    let session = HeartRateSession::new(settings, Arc::new(radio), None)
        .context("Invalid session settings")?;
    session.start().await;

    if !session.is_initialized() {
        println!(
            "{} Bluetooth adapter is {}",
            "!".yellow(),
            session.adapter_state().to_string().bright_red()
        );
    }
    Ok(session)
}

fn print_peripheral(record: &PeripheralRecord) {
    println!(
        "  {:<40} {:<24} {}",
        record.id.as_str().bright_cyan(),
        record.display_name.as_deref().unwrap_or("(unnamed)"),
        format!("{} dBm", record.signal_strength).dimmed()
    );
}

fn matches_device(record: &PeripheralRecord, wanted: &str) -> bool {
    record.id.as_str().eq_ignore_ascii_case(wanted)
        || record
            .display_name
            .as_deref()
            .map(|name| name.eq_ignore_ascii_case(wanted))
            .unwrap_or(false)
}

async fn cmd_scan(timeout: Option<u64>) -> Result<()> {
    let config = config::Config::load()?;
    let mut settings = config.session.clone();
    if let Some(secs) = timeout {
        settings = settings.with_scan_timeout(secs)?;
    }

    let session = open_session(settings.clone()).await?;
    let mut updates = session.updates();

    println!(
        "{} (up to {}s, Ctrl-C to stop)",
        "Scanning...".bold(),
        settings.scan_timeout_secs
    );
    println!();

    session.scan_for_peripherals().await;
    if !session.is_scanning() {
        session.dispose().await;
        anyhow::bail!("Scan did not start (run with --verbose for details)");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(SessionUpdate::PeripheralDiscovered(record)) => print_peripheral(&record),
                Ok(SessionUpdate::ScanStopped) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Missed {} session updates", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    let found = session.discovered_peripherals().len();
    session.dispose().await;

    println!();
    println!("{} {} peripheral(s) found", "✓".green(), found);
    Ok(())
}

/// Scan until a peripheral matching `wanted` shows up
async fn find_device(
    session: &HeartRateSession,
    updates: &mut broadcast::Receiver<SessionUpdate>,
    wanted: &str,
) -> Result<Option<PeripheralRecord>> {
    session.scan_for_peripherals().await;
    if !session.is_scanning() {
        anyhow::bail!("Scan did not start (run with --verbose for details)");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(None),
            update = updates.recv() => match update {
                Ok(SessionUpdate::PeripheralDiscovered(record)) if matches_device(&record, wanted) => {
                    return Ok(Some(record));
                }
                Ok(SessionUpdate::ScanStopped) | Err(broadcast::error::RecvError::Closed) => {
                    return Ok(None);
                }
                _ => {}
            }
        }
    }
}

async fn cmd_monitor(device: Option<String>, retries: Option<u32>) -> Result<()> {
    let config = config::Config::load()?;
    let wanted = device
        .or_else(|| config.default_device.clone())
        .context("No device given and no default_device configured")?;
    let attempts = retries.unwrap_or(config.connect_retries).max(1);

    let session = open_session(config.session.clone()).await?;
    let mut updates = session.updates();

    println!("{} {}", "Looking for".bold(), wanted.bright_cyan());
    let Some(record) = find_device(&session, &mut updates, &wanted).await? else {
        session.dispose().await;
        anyhow::bail!("Device {} not found", wanted);
    };

    // Retry lives here, not in the core
    for attempt in 1..=attempts {
        session.connect_to_device(&record).await;
        if session.connected_peripheral().is_some() {
            break;
        }
        println!(
            "{} Connect attempt {}/{} failed",
            "✗".red(),
            attempt,
            attempts
        );
        if attempt < attempts {
            tokio::time::sleep(RETRY_DELAY).await;
        }
    }

    if session.connected_peripheral().is_none() {
        session.dispose().await;
        anyhow::bail!("Could not connect to {}", record.label());
    }

    println!("{} Connected to {}", "✓".green(), record.label().bright_cyan());
    println!("{}", "Streaming heart rate (Ctrl-C to stop)".dimmed());
    println!();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(SessionUpdate::Reading(reading)) => {
                    let stamp = Local::now().format("%H:%M:%S");
                    if reading.is_valid() {
                        println!("  {}  {}", stamp.to_string().dimmed(), reading.to_string().bright_red().bold());
                    } else {
                        println!("  {}  {}", stamp.to_string().dimmed(), reading.to_string().dimmed());
                    }
                }
                Ok(SessionUpdate::Disconnected(id)) => {
                    println!();
                    println!("{} Connection to {} lost", "✗".red(), id);
                    break;
                }
                Ok(SessionUpdate::AdapterChanged(state)) if !state.is_powered_on() => {
                    println!();
                    println!("{} Bluetooth adapter is {}", "✗".red(), state);
                    break;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {} readings", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    session.dispose().await;
    Ok(())
}

async fn cmd_status(json: bool) -> Result<()> {
    let config = config::Config::load()?;
    let session = open_session(config.session.clone()).await?;

    if json {
        println!("{}", session.snapshot_json()?);
    } else {
        println!("{}", "hrlink Status".bold());
        println!();
        println!("Adapter:     {}", session.adapter_state().to_string().bright_cyan());
        println!("Ready:       {}", session.is_initialized());
        println!("Permissions: {}", config.session.capability_tier);
        println!("Encoding:    {}", config.session.transport_encoding);
        println!(
            "Config:      {}",
            config::Config::config_file()?.display().to_string().dimmed()
        );
    }

    session.dispose().await;
    Ok(())
}

async fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            if let Some(value) = config.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            } else {
                anyhow::bail!("Unknown config key: {}", key);
            }
        }

        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();

            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

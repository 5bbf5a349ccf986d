//! EVSim Fleet - CLI for the charging station fleet simulator
//!
//! Loads a fleet configuration, materializes the stations and runs them
//! against the configured central system until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Run the fleet described by a configuration file
//! evsim-fleet --config fleet.json
//!
//! # Override the station count and target a local central system
//! evsim-fleet --config fleet.json --stations 50 \
//!     --url ws://localhost:8180/steve/websocket/CentralSystemService
//!
//! # Spread the fleet over two central systems
//! evsim-fleet --config fleet.json --url ws://cs-a:8180/ocpp --url ws://cs-b:8180/ocpp
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use evsim_core::{FleetConfig, Station, Statistics};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// OCPP 1.6J charging station fleet simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fleet configuration file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Override the number of stations to run
    #[arg(short, long)]
    stations: Option<u32>,

    /// Override the supervision URL(s) (can be repeated)
    #[arg(short, long)]
    url: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging; RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    let mut config = FleetConfig::from_file(&args.config)?;
    if let Some(stations) = args.stations {
        config = config.with_station_count(stations);
    }
    if !args.url.is_empty() {
        config = config.with_supervision_urls(args.url.clone());
    }
    config.validate()?;

    let urls = config.supervision_url.all().join(", ");

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            EVSim - OCPP 1.6J Charging Station Fleet          ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Stations:    {:<47} ║", config.station_count);
    println!("║  Supervision: {:<47} ║", truncate(&urls, 47));
    println!("║  Template:    {:<47} ║", config.station_template.base_name);
    println!("║  Generator:   {:<47} ║", on_off(config.station_template.automatic_transaction_generator.enable));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let stats = Arc::new(Statistics::new());
    let _display = config
        .statistics_display_interval()
        .map(|period| stats.clone().start_display_loop(period));

    let mut stations = Vec::with_capacity(config.station_count as usize);
    for index in 1..=config.station_count {
        let station = Station::new(index, &config, stats.clone()).await;
        info!("[{}] Station materialized", station.name());
        stations.push(tokio::spawn(station.run()));
    }

    info!("Fleet of {} stations running", stations.len());

    for station in stations {
        let _ = station.await;
    }

    Ok(())
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "enabled"
    } else {
        "disabled"
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}

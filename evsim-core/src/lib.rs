//! # EVSim Core
//!
//! Core engine of an OCPP 1.6J charging station fleet simulator.
//!
//! Each simulated station keeps a WebSocket session to a central system
//! (CSMS), registers with a BootNotification, maintains a heartbeat, reports
//! connector status, runs transactions with periodic meter values and
//! answers the server-initiated commands a real charge point would. A fleet
//! is any number of stations materialized from one template.
//!
//! ## Architecture
//!
//! ```text
//! CSMS (Central System)
//!       ▲ WebSocket JSON-RPC (ocpp1.6)
//!       │
//! ┌─────┴────────────────────────────────┐
//! │ Station                              │
//! │  ┌──────────┐   ┌─────────────────┐  │
//! │  │ Session  │◄─►│ Connectors      │  │
//! │  │  framing │   │  transactions   │  │
//! │  │  pending │   │  meter values   │  │
//! │  │  queue   │   └─────────────────┘  │
//! │  └──────────┘   ┌─────────────────┐  │
//! │        ▲        │ Transaction     │  │
//! │        └────────┤ generator (ATG) │  │
//! │                 └─────────────────┘  │
//! └──────────────────────────────────────┘
//!       × station count, from one template
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use evsim_core::{FleetConfig, Station, Statistics};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FleetConfig::from_file("fleet.json")?;
//!     config.validate()?;
//!
//!     let stats = Arc::new(Statistics::new());
//!     let station = Station::new(1, &config, stats).await;
//!     station.run().await;
//!     Ok(())
//! }
//! ```

pub mod atg;
pub mod authorization;
pub mod config;
pub mod connectors;
pub mod ocpp;
pub mod session;
pub mod station;
pub mod stats;

#[cfg(test)]
mod testing;

pub use atg::Atg;
pub use authorization::AuthorizationList;
pub use config::{AtgConfig, ConfigError, FleetConfig, StationInfo, StationTemplate};
pub use connectors::{Connector, Transaction};
pub use ocpp::{Action, Call, CallError, CallResult, OcppError, OcppMessage};
pub use session::{Session, SessionState};
pub use station::Station;
pub use stats::{NullSink, Statistics, StatisticsSink};

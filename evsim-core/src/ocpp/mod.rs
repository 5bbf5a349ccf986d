//! OCPP 1.6J protocol layer
//!
//! This module provides the wire-level pieces of the simulator:
//! - `types`: OCPP 1.6 payload types and enumerations
//! - `messages`: JSON framing (CALL, CALLRESULT, CALLERROR)
//! - `pending`: correlation table for in-flight requests
//! - `queue`: outbound frame buffer for disconnected periods

pub mod messages;
pub mod pending;
pub mod queue;
pub mod types;

pub use messages::*;
pub use pending::{PendingEntry, PendingTable};
pub use queue::OutboundQueue;
pub use types::*;

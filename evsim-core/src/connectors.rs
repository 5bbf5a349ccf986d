//! Connector and transaction state
//!
//! A station owns a map from connector id to [`Connector`]. Connector 0
//! denotes the station itself and never charges. State here is mutated only
//! by the session engine (response handlers and transaction operations);
//! the transaction generator reads it through session operations.
//!
//! Invariant: a connector holds a transaction if and only if its status is
//! Charging, sampled at rest. The brief window between a StartTransaction
//! request and its response is the allowed exception.

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::ocpp::types::{ChargePointStatus, SampledValue};

/// A server-acknowledged charging session bound to one connector
#[derive(Debug, Clone)]
pub struct Transaction {
    /// Transaction id assigned by the central system
    pub id: i32,
    pub connector_id: u32,
    pub id_tag: Option<String>,
    pub started_at: DateTime<Utc>,
    pub meter_start: i32,
}

/// One addressable charging socket on a station
#[derive(Debug)]
pub struct Connector {
    pub status: ChargePointStatus,
    pub transaction: Option<Transaction>,
    /// Periodic meter emission task, running while a transaction is active
    pub meter_task: Option<JoinHandle<()>>,
    /// Template-provided status reported at boot instead of Available
    pub boot_status: Option<ChargePointStatus>,
    /// Sample templates cloned into every MeterValues emission
    pub meter_templates: Vec<SampledValue>,
}

impl Connector {
    pub fn new(boot_status: Option<ChargePointStatus>, meter_templates: Vec<SampledValue>) -> Self {
        Self {
            status: ChargePointStatus::Available,
            transaction: None,
            meter_task: None,
            boot_status,
            meter_templates,
        }
    }

    pub fn is_charging(&self) -> bool {
        self.transaction.is_some()
    }

    /// Install an accepted transaction. Status and transaction move together
    /// so the charging invariant holds at rest.
    pub fn begin_transaction(&mut self, transaction: Transaction) {
        self.status = ChargePointStatus::Charging;
        self.transaction = Some(transaction);
    }

    /// Clear the transaction, abort its meter task and revert to Available.
    /// Returns the finished transaction, if one was active.
    pub fn end_transaction(&mut self) -> Option<Transaction> {
        if let Some(task) = self.meter_task.take() {
            task.abort();
        }
        self.status = ChargePointStatus::Available;
        self.transaction.take()
    }

    /// Status to report in the startup broadcast: an active transaction
    /// reports Charging; otherwise the template boot status when present,
    /// else whatever the connector currently is.
    pub fn reported_status(&self) -> ChargePointStatus {
        if self.transaction.is_some() {
            ChargePointStatus::Charging
        } else {
            self.boot_status.unwrap_or(self.status)
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        if let Some(task) = self.meter_task.take() {
            task.abort();
        }
    }
}

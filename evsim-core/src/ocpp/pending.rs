//! Pending-request correlation table
//!
//! Maps the message id of every in-flight CALL to the oneshot responder its
//! caller is awaiting. The entry also carries the original request payload,
//! because response handling needs it (a StartTransaction response only
//! names the transaction; the connector comes from the request).
//!
//! All resolution paths go through [`PendingTable::take`]: a CALLRESULT, a
//! CALLERROR and a local timeout race for the entry, exactly one of them
//! gets it, and with it the only sender that can complete the caller. A
//! `take` for an id that is not present is a correlation failure the caller
//! logs and drops.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use super::messages::{Action, OcppError};

/// A request awaiting its outcome
pub struct PendingEntry {
    pub action: Action,
    pub request: Value,
    pub responder: oneshot::Sender<Result<Value, OcppError>>,
}

/// Correlation table keyed by message id
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<String, PendingEntry>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register an in-flight request and hand back the receiver its caller
    /// awaits. Message ids are fresh UUIDs, so at most one entry exists per
    /// id at any time.
    pub fn register(
        &mut self,
        message_id: impl Into<String>,
        action: Action,
        request: Value,
    ) -> oneshot::Receiver<Result<Value, OcppError>> {
        let (responder, rx) = oneshot::channel();
        self.entries.insert(
            message_id.into(),
            PendingEntry {
                action,
                request,
                responder,
            },
        );
        rx
    }

    /// Remove and return the entry for a message id.
    ///
    /// Whoever takes the entry owns the single right to complete its
    /// responder; everyone else observes `None`.
    pub fn take(&mut self, message_id: &str) -> Option<PendingEntry> {
        self.entries.remove(message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_take_returns_registered_entry() {
        let mut table = PendingTable::new();
        let _rx = table.register("id-1", Action::Heartbeat, json!({}));

        let entry = table.take("id-1").expect("entry should be present");
        assert_eq!(entry.action, Action::Heartbeat);
        assert!(table.is_empty());
    }

    #[test]
    fn test_take_is_exclusive() {
        let mut table = PendingTable::new();
        let _rx = table.register("id-1", Action::StartTransaction, json!({"connectorId": 1}));

        assert!(table.take("id-1").is_some());
        assert!(table.take("id-1").is_none());
    }

    #[test]
    fn test_unknown_id_returns_none() {
        let mut table = PendingTable::new();
        assert!(table.take("never-registered").is_none());
    }

    #[test]
    fn test_entry_keeps_request_payload() {
        let mut table = PendingTable::new();
        let request = json!({"connectorId": 2, "idTag": "TAG-7"});
        let _rx = table.register("id-2", Action::StartTransaction, request.clone());

        let entry = table.take("id-2").unwrap();
        assert_eq!(entry.request, request);
    }

    #[tokio::test]
    async fn test_responder_resolves_receiver() {
        let mut table = PendingTable::new();
        let rx = table.register("id-3", Action::Heartbeat, json!({}));

        let entry = table.take("id-3").unwrap();
        entry
            .responder
            .send(Ok(json!({"currentTime": "2026-01-20T12:00:00Z"})))
            .unwrap();

        let outcome = rx.await.unwrap().unwrap();
        assert_eq!(outcome["currentTime"], "2026-01-20T12:00:00Z");
    }

    #[tokio::test]
    async fn test_dropped_entry_closes_receiver() {
        // A taken entry whose responder is dropped (e.g. the winning timeout
        // path discards it) leaves the receiver with a recv error, which the
        // session maps to a closed-connection outcome.
        let mut table = PendingTable::new();
        let rx = table.register("id-4", Action::Heartbeat, json!({}));

        drop(table.take("id-4").unwrap());
        assert!(rx.await.is_err());
    }
}

//! Station session engine
//!
//! One [`Session`] drives one simulated station against the central system:
//! the WebSocket lifecycle with its fixed-delay reconnect loop, frame
//! dispatch, request/response correlation, the outbound queue, connector
//! state and the handlers for server-initiated commands. A `Session` is a
//! cheap-clone handle; clones share the same station state, so the
//! connection loop, meter tasks and the transaction generator all hold one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::header::{self, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{debug, info, warn};

use crate::atg::Atg;
use crate::authorization::AuthorizationList;
use crate::config::StationInfo;
use crate::connectors::{Connector, Transaction};
use crate::ocpp::messages::{
    Action, Call, CallError, CallResult, ErrorCode, OcppError, OcppMessage,
};
use crate::ocpp::pending::PendingTable;
use crate::ocpp::queue::OutboundQueue;
use crate::ocpp::types::{
    AuthorizationStatus, BootNotificationRequest, BootNotificationResponse,
    ChangeConfigurationRequest, ChangeConfigurationResponse, ChargePointErrorCode,
    ChargePointStatus, ConfigurationStatus, GetConfigurationRequest, GetConfigurationResponse,
    HeartbeatRequest, HeartbeatResponse, KeyValue, MeterValue, MeterValuesRequest,
    RegistrationStatus, RemoteStartStopStatus, RemoteStartTransactionRequest,
    RemoteStartTransactionResponse, RemoteStopTransactionRequest, RemoteStopTransactionResponse,
    SampledValue, StartTransactionRequest, StartTransactionResponse, StatusNotificationRequest,
    StopTransactionRequest, StopTransactionResponse,
};
use crate::stats::StatisticsSink;

/// OCPP 1.6 WebSocket subprotocol
const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Delay before the post-registration status broadcast and before a remotely
/// requested StartTransaction goes out
const COMMAND_DELAY: Duration = Duration::from_millis(500);

/// Configuration key gating remote start authorization
const AUTHORIZE_REMOTE_TX_KEY: &str = "AuthorizeRemoteTxRequests";

/// Connection state of a station session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No socket; a reconnect is pending
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Socket open, station not registered yet
    Open,
    /// BootNotification accepted; the station is operational
    Accepted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Heartbeat schedule, learned from the BootNotification response
struct HeartbeatState {
    interval: Duration,
    last_sent: Instant,
}

/// Writer-side state: the live writer channel if the socket is up, and the
/// frames buffered while it is not. One lock covers both so a frame can
/// never slip past a flush in progress.
struct Outbound {
    sender: Option<mpsc::UnboundedSender<String>>,
    queue: OutboundQueue,
}

/// Handle to one station session
#[derive(Clone)]
pub struct Session {
    info: Arc<StationInfo>,
    state: Arc<RwLock<SessionState>>,
    /// Set once the first BootNotification is accepted, never cleared; a
    /// reconnect after this resumes without a new BootNotification
    registered: Arc<AtomicBool>,
    heartbeat: Arc<RwLock<HeartbeatState>>,
    pending: Arc<RwLock<PendingTable>>,
    outbound: Arc<RwLock<Outbound>>,
    connectors: Arc<RwLock<HashMap<u32, Connector>>>,
    configuration: Arc<RwLock<Vec<KeyValue>>>,
    authorized_tags: AuthorizationList,
    stats: Arc<dyn StatisticsSink>,
    atg: Arc<RwLock<Option<Atg>>>,
}

impl Session {
    pub fn new(
        info: StationInfo,
        authorized_tags: AuthorizationList,
        stats: Arc<dyn StatisticsSink>,
    ) -> Self {
        let mut connectors = HashMap::new();
        if info.use_connector_zero {
            connectors.insert(0, build_connector(&info, 0));
        }
        for id in 1..=info.connector_count {
            connectors.insert(id, build_connector(&info, id));
        }

        let configuration = info.configuration_keys.clone();

        Self {
            info: Arc::new(info),
            state: Arc::new(RwLock::new(SessionState::Disconnected)),
            registered: Arc::new(AtomicBool::new(false)),
            heartbeat: Arc::new(RwLock::new(HeartbeatState {
                interval: Duration::ZERO,
                last_sent: Instant::now(),
            })),
            pending: Arc::new(RwLock::new(PendingTable::new())),
            outbound: Arc::new(RwLock::new(Outbound {
                sender: None,
                queue: OutboundQueue::new(),
            })),
            connectors: Arc::new(RwLock::new(connectors)),
            configuration: Arc::new(RwLock::new(configuration)),
            authorized_tags,
            stats,
            atg: Arc::new(RwLock::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn info(&self) -> &StationInfo {
        &self.info
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Whether the first BootNotification has ever been accepted.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Wire the transaction generator in; it starts on first registration.
    pub async fn attach_atg(&self, atg: Atg) {
        *self.atg.write().await = Some(atg);
    }

    pub async fn is_connector_charging(&self, connector_id: u32) -> bool {
        self.connectors
            .read()
            .await
            .get(&connector_id)
            .map(Connector::is_charging)
            .unwrap_or(false)
    }

    pub async fn transaction_id_on(&self, connector_id: u32) -> Option<i32> {
        self.connectors
            .read()
            .await
            .get(&connector_id)
            .and_then(|c| c.transaction.as_ref())
            .map(|t| t.id)
    }

    /// Charging connector ids, ascending. Connector 0 never charges and is
    /// excluded.
    pub async fn connector_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .connectors
            .read()
            .await
            .keys()
            .copied()
            .filter(|id| *id != 0)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub async fn active_transaction_ids(&self) -> Vec<i32> {
        self.connectors
            .read()
            .await
            .values()
            .filter_map(|c| c.transaction.as_ref())
            .map(|t| t.id)
            .collect()
    }

    /// Random tag from the authorization list, for generated transactions.
    pub async fn random_authorized_tag(&self) -> Option<String> {
        self.authorized_tags.random_tag().await
    }

    pub async fn configuration_value(&self, key: &str) -> Option<String> {
        self.configuration
            .read()
            .await
            .iter()
            .find(|kv| kv.key == key)
            .and_then(|kv| kv.value.clone())
    }

    pub async fn buffered_frames(&self) -> usize {
        self.outbound.read().await.queue.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    /// Drive the station forever: connect, run the connection to completion,
    /// retry after the fixed reconnect delay. Connection failures are never
    /// fatal; this future only ends when its task is dropped.
    pub async fn run(&self) {
        loop {
            self.set_state(SessionState::Connecting).await;
            info!("[{}] Connecting to {}", self.info.name, self.info.supervision_url);

            match self.connect_and_run().await {
                Ok(()) => info!("[{}] Connection closed", self.info.name),
                Err(e) => warn!("[{}] Connection failed: {}", self.info.name, e),
            }

            self.set_state(SessionState::Disconnected).await;
            info!("[{}] Reconnecting in {:?}", self.info.name, self.info.reconnect_delay);
            tokio::time::sleep(self.info.reconnect_delay).await;
        }
    }

    /// One connection: handshake, flush the queue, boot or resume, then
    /// pump frames until the socket goes away.
    async fn connect_and_run(&self) -> Result<(), OcppError> {
        let url = station_url(&self.info.supervision_url, &self.info.name);
        let mut request = url.as_str().into_client_request().map_err(|_| {
            warn!("[{}] Invalid supervision URL: {}", self.info.name, url);
            OcppError::ConnectionClosed
        })?;
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| {
                debug!("[{}] WebSocket handshake failed: {}", self.info.name, e);
                OcppError::ConnectionClosed
            })?;

        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
            warn!(
                "[{}] Server did not accept the {} subprotocol, got {:?}",
                self.info.name, OCPP_SUBPROTOCOL, accepted_protocol
            );
        }

        info!("[{}] WebSocket connected to {}", self.info.name, url);
        self.set_state(SessionState::Open).await;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<String>();

        let writer_name = self.info.name.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = send_rx.recv().await {
                debug!("[{}] Sending: {}", writer_name, frame);
                if let Err(e) = ws_tx.send(Message::Text(frame)).await {
                    warn!("[{}] WebSocket send failed: {}", writer_name, e);
                    break;
                }
            }
        });

        // Frames buffered while down go out first, in order, before the
        // writer channel is reachable for anything new.
        {
            let mut outbound = self.outbound.write().await;
            let buffered = outbound.queue.flush();
            if !buffered.is_empty() {
                info!("[{}] Flushing {} buffered frames", self.info.name, buffered.len());
            }
            for frame in buffered {
                let _ = send_tx.send(frame);
            }
            outbound.sender = Some(send_tx);
        }

        if self.is_registered() {
            // A restart after acceptance: no new BootNotification, resume
            // the operational sequence directly.
            info!("[{}] Resuming registered session", self.info.name);
            self.set_state(SessionState::Accepted).await;
            let session = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(COMMAND_DELAY).await;
                session.broadcast_status().await;
            });
        } else {
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.boot_notification().await {
                    warn!("[{}] BootNotification failed: {}", session.info.name, e);
                }
            });
        }

        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                inbound = ws_rx.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        debug!("[{}] Received: {}", self.info.name, text);
                        self.dispatch(&text).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("[{}] WebSocket closed by server", self.info.name);
                        break;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // Pong is handled by tungstenite
                        debug!("[{}] Received ping", self.info.name);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("[{}] WebSocket error: {}", self.info.name, e);
                        break;
                    }
                    None => {
                        info!("[{}] WebSocket stream ended", self.info.name);
                        break;
                    }
                },
                _ = tick.tick() => {
                    if self.heartbeat_due().await {
                        let session = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = session.heartbeat().await {
                                warn!("[{}] Heartbeat failed: {}", session.info.name, e);
                            }
                        });
                    }
                }
            }
        }

        self.outbound.write().await.sender = None;
        writer.abort();
        Ok(())
    }

    async fn set_state(&self, state: SessionState) {
        let mut current = self.state.write().await;
        if *current != state {
            debug!("[{}] Session {} -> {}", self.info.name, *current, state);
            *current = state;
        }
    }

    /// One-second granularity check driven by the connection loop. Marks
    /// the send time when due, so the next tick cannot double-fire while a
    /// heartbeat is in flight.
    async fn heartbeat_due(&self) -> bool {
        if !self.is_registered() {
            return false;
        }
        let mut heartbeat = self.heartbeat.write().await;
        if heartbeat.interval > Duration::ZERO && heartbeat.last_sent.elapsed() >= heartbeat.interval {
            heartbeat.last_sent = Instant::now();
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Hand a frame to the live writer, or buffer it for the next connect.
    /// Returns whether the frame went out on a live socket.
    async fn send_or_enqueue(&self, frame: String) -> bool {
        let mut outbound = self.outbound.write().await;
        let frame = match outbound.sender.as_ref() {
            Some(tx) => match tx.send(frame) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(frame)) => {
                    outbound.sender = None;
                    frame
                }
            },
            None => frame,
        };
        outbound.queue.enqueue(frame);
        debug!(
            "[{}] Link down, frame buffered ({} queued)",
            self.info.name,
            outbound.queue.len()
        );
        false
    }

    /// Send a Call and await its outcome.
    ///
    /// On a live socket the wait is bounded by the request timeout. A frame
    /// buffered while disconnected waits with no deadline, so a late
    /// response after a reconnect still correlates. Exactly one of success,
    /// remote error or timeout resolves the caller.
    pub async fn call(&self, action: Action, payload: impl Serialize) -> Result<Value, OcppError> {
        let call = Call::new(action, payload)?;
        let frame = call.to_frame()?;
        let mut rx = self
            .pending
            .write()
            .await
            .register(call.message_id.clone(), action, call.payload);
        self.stats.count_request(&action.to_string());

        let transmitted = self.send_or_enqueue(frame).await;

        if transmitted {
            match tokio::time::timeout(self.info.request_timeout, &mut rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(OcppError::ConnectionClosed),
                Err(_) => {
                    // Deadline hit; whoever takes the entry resolves it.
                    if self.pending.write().await.take(&call.message_id).is_some() {
                        warn!(
                            "[{}] {} request {} timed out",
                            self.info.name, action, call.message_id
                        );
                        Err(OcppError::Timeout)
                    } else {
                        // A response won the race; the receiver holds it.
                        match rx.await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(OcppError::ConnectionClosed),
                        }
                    }
                }
            }
        } else {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(OcppError::ConnectionClosed),
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    async fn dispatch(&self, text: &str) {
        let message = match OcppMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] Dropping unparseable frame: {}", self.info.name, e);
                return;
            }
        };

        match message {
            OcppMessage::Call(call) => self.handle_call(call).await,
            OcppMessage::CallResult(result) => self.handle_call_result(result).await,
            OcppMessage::CallError(error) => self.handle_call_error(error).await,
        }
    }

    /// Server-initiated request: run the matching command handler and send
    /// the reply. Handler failures answer with a CallError, never close the
    /// session.
    async fn handle_call(&self, call: Call) {
        self.stats.count_request(&call.action);

        let action = match call.action.parse::<Action>() {
            Ok(action) => action,
            Err(_) => {
                warn!("[{}] Unsupported action {}", self.info.name, call.action);
                self.reply_error(CallError::new(
                    call.message_id,
                    ErrorCode::NotImplemented,
                    format!("{} is not implemented", call.action),
                ))
                .await;
                return;
            }
        };

        let outcome = match action {
            Action::GetConfiguration => self.handle_get_configuration(&call.payload).await,
            Action::ChangeConfiguration => self.handle_change_configuration(&call.payload).await,
            Action::RemoteStartTransaction => self.handle_remote_start(&call.payload).await,
            Action::RemoteStopTransaction => self.handle_remote_stop(&call.payload).await,
            other => Err(OcppError::NotImplemented(other.to_string())),
        };

        match outcome {
            Ok(payload) => match CallResult::new(&call.message_id, payload) {
                Ok(result) => self.reply(result).await,
                Err(e) => {
                    warn!("[{}] Cannot build {} reply: {}", self.info.name, action, e);
                }
            },
            Err(OcppError::NotImplemented(what)) => {
                self.reply_error(CallError::new(
                    call.message_id,
                    ErrorCode::NotImplemented,
                    format!("{} is not implemented", what),
                ))
                .await;
            }
            Err(e) => {
                warn!("[{}] {} handler failed: {}", self.info.name, action, e);
                self.reply_error(CallError::new(
                    call.message_id,
                    ErrorCode::InternalError,
                    e.to_string(),
                ))
                .await;
            }
        }
    }

    async fn handle_call_result(&self, result: CallResult) {
        let entry = match self.pending.write().await.take(&result.message_id) {
            Some(entry) => entry,
            None => {
                warn!(
                    "[{}] {}",
                    self.info.name,
                    OcppError::UnknownMessageId(result.message_id)
                );
                return;
            }
        };

        self.stats.count_response(&entry.action.to_string());

        // Local state is updated before the caller's future resolves, so a
        // caller awaiting the response observes the effect.
        self.on_call_result(entry.action, &entry.request, &result.payload).await;

        let _ = entry.responder.send(Ok(result.payload));
    }

    async fn handle_call_error(&self, error: CallError) {
        let entry = match self.pending.write().await.take(&error.message_id) {
            Some(entry) => entry,
            None => {
                warn!(
                    "[{}] {}",
                    self.info.name,
                    OcppError::UnknownMessageId(error.message_id)
                );
                return;
            }
        };

        warn!(
            "[{}] {} rejected by central system: {:?} {}",
            self.info.name, entry.action, error.error_code, error.error_description
        );
        let _ = entry.responder.send(Err(OcppError::RemoteError {
            code: error.error_code,
            description: error.error_description,
            details: error.error_details,
        }));
    }

    async fn reply(&self, result: CallResult) {
        match result.to_frame() {
            Ok(frame) => {
                self.send_or_enqueue(frame).await;
            }
            Err(e) => warn!("[{}] Cannot serialize reply: {}", self.info.name, e),
        }
    }

    async fn reply_error(&self, error: CallError) {
        match error.to_frame() {
            Ok(frame) => {
                self.send_or_enqueue(frame).await;
            }
            Err(e) => warn!("[{}] Cannot serialize error reply: {}", self.info.name, e),
        }
    }

    // ------------------------------------------------------------------
    // Command handlers (server-initiated calls)
    // ------------------------------------------------------------------

    /// Full snapshot of the configuration keys. A key filter in the request
    /// is noted and ignored; the central systems the simulator talks to
    /// cope with a superset.
    async fn handle_get_configuration(&self, payload: &Value) -> Result<Value, OcppError> {
        if let Ok(request) = serde_json::from_value::<GetConfigurationRequest>(payload.clone()) {
            if let Some(keys) = request.key.filter(|keys| !keys.is_empty()) {
                debug!("[{}] GetConfiguration filter {:?} ignored", self.info.name, keys);
            }
        }
        let configuration = self.configuration.read().await;
        Ok(serde_json::to_value(GetConfigurationResponse {
            configuration_key: configuration.clone(),
            unknown_key: None,
        })?)
    }

    async fn handle_change_configuration(&self, payload: &Value) -> Result<Value, OcppError> {
        let request: ChangeConfigurationRequest = serde_json::from_value(payload.clone())?;
        let mut configuration = self.configuration.write().await;
        let status = match configuration.iter_mut().find(|kv| kv.key == request.key) {
            Some(entry) if entry.readonly => ConfigurationStatus::Rejected,
            Some(entry) => {
                info!(
                    "[{}] Configuration {} changed to {}",
                    self.info.name, request.key, request.value
                );
                entry.value = Some(request.value);
                ConfigurationStatus::Accepted
            }
            None => ConfigurationStatus::Rejected,
        };
        Ok(serde_json::to_value(ChangeConfigurationResponse { status })?)
    }

    /// Accept or reject a remote start; on acceptance the StartTransaction
    /// goes out after a short delay, decoupled from this reply.
    async fn handle_remote_start(&self, payload: &Value) -> Result<Value, OcppError> {
        let request: RemoteStartTransactionRequest = serde_json::from_value(payload.clone())?;
        let connector_id = request.connector_id.unwrap_or(1);

        let status = if self.remote_start_authorized(&request.id_tag).await {
            info!(
                "[{}] Remote start accepted on connector {} for tag {}",
                self.info.name, connector_id, request.id_tag
            );
            let session = self.clone();
            let id_tag = request.id_tag;
            tokio::spawn(async move {
                tokio::time::sleep(COMMAND_DELAY).await;
                if let Err(e) = session.start_transaction(connector_id, Some(id_tag)).await {
                    warn!(
                        "[{}] Remotely requested StartTransaction failed: {}",
                        session.info.name, e
                    );
                }
            });
            RemoteStartStopStatus::Accepted
        } else {
            warn!(
                "[{}] Remote start rejected, tag {} not authorized",
                self.info.name, request.id_tag
            );
            RemoteStartStopStatus::Rejected
        };

        Ok(serde_json::to_value(RemoteStartTransactionResponse { status })?)
    }

    /// Authorization applies only when a tag list is loaded and the
    /// AuthorizeRemoteTxRequests key is true; otherwise every tag passes.
    async fn remote_start_authorized(&self, id_tag: &str) -> bool {
        if self.authorized_tags.is_empty().await {
            return true;
        }
        if !self.authorize_remote_tx_requests().await {
            return true;
        }
        self.authorized_tags.contains(id_tag).await
    }

    async fn authorize_remote_tx_requests(&self) -> bool {
        self.configuration
            .read()
            .await
            .iter()
            .find(|kv| kv.key == AUTHORIZE_REMOTE_TX_KEY)
            .and_then(|kv| kv.value.as_deref())
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// Always Accepted; a transaction id nothing is charging under is a
    /// silent no-op.
    async fn handle_remote_stop(&self, payload: &Value) -> Result<Value, OcppError> {
        let request: RemoteStopTransactionRequest = serde_json::from_value(payload.clone())?;
        let transaction_id = request.transaction_id;

        let active = self
            .connectors
            .read()
            .await
            .values()
            .any(|c| c.transaction.as_ref().map_or(false, |t| t.id == transaction_id));

        if active {
            info!("[{}] Remote stop for transaction {}", self.info.name, transaction_id);
            let session = self.clone();
            tokio::spawn(async move {
                if let Err(e) = session.stop_transaction(transaction_id).await {
                    warn!(
                        "[{}] Remotely requested StopTransaction failed: {}",
                        session.info.name, e
                    );
                }
            });
        } else {
            debug!(
                "[{}] Remote stop for unknown transaction {}",
                self.info.name, transaction_id
            );
        }

        Ok(serde_json::to_value(RemoteStopTransactionResponse {
            status: RemoteStartStopStatus::Accepted,
        })?)
    }

    // ------------------------------------------------------------------
    // Response-side handlers, keyed by the action of the original request
    // ------------------------------------------------------------------

    async fn on_call_result(&self, action: Action, request: &Value, response: &Value) {
        match action {
            Action::BootNotification => self.on_boot_response(response).await,
            Action::StartTransaction => self.on_start_transaction_response(request, response).await,
            Action::StopTransaction => self.on_stop_transaction_response(request).await,
            _ => {}
        }
    }

    async fn on_boot_response(&self, response: &Value) {
        let response: BootNotificationResponse = match serde_json::from_value(response.clone()) {
            Ok(response) => response,
            Err(e) => {
                warn!("[{}] Malformed BootNotification response: {}", self.info.name, e);
                return;
            }
        };

        match response.status {
            RegistrationStatus::Accepted => {
                info!(
                    "[{}] Registered with central system, heartbeat every {}s",
                    self.info.name, response.interval
                );
                self.registered.store(true, Ordering::SeqCst);
                self.set_state(SessionState::Accepted).await;
                {
                    let mut heartbeat = self.heartbeat.write().await;
                    heartbeat.interval = Duration::from_secs(u64::from(response.interval));
                    heartbeat.last_sent = Instant::now();
                }

                let session = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(COMMAND_DELAY).await;
                    session.broadcast_status().await;
                });

                if self.info.atg.enable {
                    if let Some(atg) = self.atg.read().await.clone() {
                        atg.ensure_started();
                    }
                }
            }
            status => {
                // BootNotification is sent again on the next connect; no
                // heartbeat and no broadcast until a boot is accepted.
                warn!("[{}] Registration {:?}", self.info.name, status);
            }
        }
    }

    async fn on_start_transaction_response(&self, request: &Value, response: &Value) {
        let request: StartTransactionRequest = match serde_json::from_value(request.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!("[{}] Malformed StartTransaction request payload: {}", self.info.name, e);
                return;
            }
        };
        let response: StartTransactionResponse = match serde_json::from_value(response.clone()) {
            Ok(response) => response,
            Err(e) => {
                warn!("[{}] Malformed StartTransaction response: {}", self.info.name, e);
                return;
            }
        };

        let connector_id = request.connector_id;
        if response.id_tag_info.status == AuthorizationStatus::Accepted {
            info!(
                "[{}] Transaction {} started on connector {}",
                self.info.name, response.transaction_id, connector_id
            );
            {
                let mut connectors = self.connectors.write().await;
                let Some(connector) = connectors.get_mut(&connector_id) else {
                    warn!(
                        "[{}] StartTransaction accepted for unknown connector {}",
                        self.info.name, connector_id
                    );
                    return;
                };
                connector.begin_transaction(Transaction {
                    id: response.transaction_id,
                    connector_id,
                    id_tag: (!request.id_tag.is_empty()).then(|| request.id_tag.clone()),
                    started_at: request.timestamp,
                    meter_start: request.meter_start,
                });
                connector.meter_task = Some(self.spawn_meter_task(connector_id));
            }
            self.spawn_status_notification(connector_id, ChargePointStatus::Charging);
        } else {
            warn!(
                "[{}] StartTransaction on connector {} not authorized: {:?}",
                self.info.name, connector_id, response.id_tag_info.status
            );
            self.spawn_status_notification(connector_id, ChargePointStatus::Available);
        }
    }

    async fn on_stop_transaction_response(&self, request: &Value) {
        let request: StopTransactionRequest = match serde_json::from_value(request.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!("[{}] Malformed StopTransaction request payload: {}", self.info.name, e);
                return;
            }
        };

        let connector_id = {
            let mut connectors = self.connectors.write().await;
            let found = connectors
                .iter()
                .find(|(_, c)| {
                    c.transaction
                        .as_ref()
                        .map_or(false, |t| t.id == request.transaction_id)
                })
                .map(|(id, _)| *id);
            if let Some(id) = found {
                if let Some(connector) = connectors.get_mut(&id) {
                    connector.end_transaction();
                }
            }
            found
        };

        match connector_id {
            Some(connector_id) => {
                info!(
                    "[{}] Transaction {} stopped on connector {}",
                    self.info.name, request.transaction_id, connector_id
                );
                self.spawn_status_notification(connector_id, ChargePointStatus::Available);
            }
            None => debug!(
                "[{}] StopTransaction response for unknown transaction {}",
                self.info.name, request.transaction_id
            ),
        }
    }

    /// Sends issued from dispatch context go through a task so the receive
    /// loop is never parked behind its own response.
    fn spawn_status_notification(&self, connector_id: u32, status: ChargePointStatus) {
        let session = self.clone();
        tokio::spawn(async move {
            if let Err(e) = session.status_notification(connector_id, status).await {
                warn!(
                    "[{}] StatusNotification for connector {} failed: {}",
                    session.info.name, connector_id, e
                );
            }
        });
    }

    // ------------------------------------------------------------------
    // Client-initiated operations
    // ------------------------------------------------------------------

    pub async fn boot_notification(&self) -> Result<BootNotificationResponse, OcppError> {
        let request = BootNotificationRequest {
            charge_point_vendor: self.info.vendor.clone(),
            charge_point_model: self.info.model.clone(),
            charge_point_serial_number: Some(self.info.name.clone()),
            firmware_version: self.info.firmware_version.clone(),
        };
        let payload = self.call(Action::BootNotification, &request).await?;
        Ok(serde_json::from_value(payload)?)
    }

    pub async fn heartbeat(&self) -> Result<HeartbeatResponse, OcppError> {
        let payload = self.call(Action::Heartbeat, &HeartbeatRequest {}).await?;
        Ok(serde_json::from_value(payload)?)
    }

    pub async fn status_notification(
        &self,
        connector_id: u32,
        status: ChargePointStatus,
    ) -> Result<(), OcppError> {
        {
            let mut connectors = self.connectors.write().await;
            if let Some(connector) = connectors.get_mut(&connector_id) {
                connector.status = status;
            }
        }
        let request = StatusNotificationRequest {
            connector_id,
            error_code: ChargePointErrorCode::NoError,
            status,
        };
        self.call(Action::StatusNotification, &request).await?;
        Ok(())
    }

    /// StatusNotification for every connector, ascending by id: Charging
    /// under an active transaction, else the template boot status, else the
    /// current status.
    pub async fn broadcast_status(&self) {
        let statuses: Vec<(u32, ChargePointStatus)> = {
            let connectors = self.connectors.read().await;
            let mut statuses: Vec<_> = connectors
                .iter()
                .map(|(id, c)| (*id, c.reported_status()))
                .collect();
            statuses.sort_by_key(|(id, _)| *id);
            statuses
        };
        for (connector_id, status) in statuses {
            if let Err(e) = self.status_notification(connector_id, status).await {
                warn!(
                    "[{}] StatusNotification for connector {} failed: {}",
                    self.info.name, connector_id, e
                );
            }
        }
    }

    /// StartTransaction with meter start 0 and the current time. The
    /// response handler installs the transaction before this returns.
    pub async fn start_transaction(
        &self,
        connector_id: u32,
        id_tag: Option<String>,
    ) -> Result<StartTransactionResponse, OcppError> {
        let action = Action::StartTransaction;
        let request = StartTransactionRequest {
            connector_id,
            id_tag: id_tag.unwrap_or_default(),
            meter_start: 0,
            timestamp: Utc::now(),
        };
        let started = Instant::now();
        let payload = self.call(action, &request).await?;
        self.stats.record_duration(&action.to_string(), started.elapsed());
        Ok(serde_json::from_value(payload)?)
    }

    /// StopTransaction with meter stop 0 and the current time. The response
    /// handler releases the connector before this returns.
    pub async fn stop_transaction(
        &self,
        transaction_id: i32,
    ) -> Result<StopTransactionResponse, OcppError> {
        let action = Action::StopTransaction;
        let request = StopTransactionRequest {
            transaction_id,
            meter_stop: 0,
            timestamp: Utc::now(),
        };
        let started = Instant::now();
        let payload = self.call(action, &request).await?;
        self.stats.record_duration(&action.to_string(), started.elapsed());
        Ok(serde_json::from_value(payload)?)
    }

    // ------------------------------------------------------------------
    // Meter emission
    // ------------------------------------------------------------------

    /// Emission ticks while the transaction lives; each emission runs in its
    /// own task so a buffered frame during an outage never stalls the
    /// cadence. The handle is aborted when the transaction ends.
    fn spawn_meter_task(&self, connector_id: u32) -> JoinHandle<()> {
        let session = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(session.info.meter_value_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The immediate first tick; samples start one interval in.
            tick.tick().await;
            loop {
                tick.tick().await;
                let emitter = session.clone();
                tokio::spawn(async move {
                    if let Err(e) = emitter.send_meter_values(connector_id).await {
                        warn!(
                            "[{}] MeterValues for connector {} failed: {}",
                            emitter.info.name, connector_id, e
                        );
                    }
                });
            }
        })
    }

    async fn send_meter_values(&self, connector_id: u32) -> Result<(), OcppError> {
        let templates = {
            let connectors = self.connectors.read().await;
            match connectors.get(&connector_id) {
                Some(connector) if connector.is_charging() => connector.meter_templates.clone(),
                _ => return Ok(()),
            }
        };
        if templates.is_empty() {
            return Ok(());
        }

        let interval_secs = self.info.meter_value_interval.as_secs().max(1);
        let sampled_value = templates
            .into_iter()
            .map(|mut template| {
                template.value = self.sample_value(&template, interval_secs, connector_id);
                template
            })
            .collect();

        let action = Action::MeterValues;
        let request = MeterValuesRequest {
            connector_id,
            meter_value: vec![MeterValue {
                timestamp: Utc::now(),
                sampled_value,
            }],
        };
        let started = Instant::now();
        self.call(action, &request).await?;
        self.stats.record_duration(&action.to_string(), started.elapsed());
        Ok(())
    }

    /// SoC samples are percentages; anything else is energy proportional to
    /// the station's maximum power, scaled by the sampling interval. A
    /// template may carry a fixed value; it passes through with its bounds
    /// checked, and an out-of-bound value is logged but still sent.
    fn sample_value(&self, template: &SampledValue, interval_secs: u64, connector_id: u32) -> String {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let is_soc = template.measurand.as_deref() == Some("SoC");
        let max_power = u64::from(self.info.max_power_w).max(500);
        let limit = if is_soc { 100 } else { max_power * 3600 / interval_secs };

        let value = if !template.value.is_empty() {
            template.value.parse::<u64>().ok()
        } else if is_soc {
            Some(rng.gen_range(1..=100))
        } else {
            Some(rng.gen_range(500..=max_power) * 3600 / interval_secs)
        };

        match value {
            Some(value) => {
                if value > limit {
                    warn!(
                        "[{}] Connector {}: meter value {} exceeds limit {} for {}",
                        self.info.name,
                        connector_id,
                        value,
                        limit,
                        template.measurand.as_deref().unwrap_or("Energy")
                    );
                }
                value.to_string()
            }
            // Non-numeric fixed values pass through untouched.
            None => template.value.clone(),
        }
    }
}

fn build_connector(info: &StationInfo, connector_id: u32) -> Connector {
    let template = info.connector_template(connector_id);
    let boot_status = template.boot_status.as_deref().and_then(|s| match s.parse() {
        Ok(status) => Some(status),
        Err(e) => {
            warn!("[{}] Connector {}: {}, boot status ignored", info.name, connector_id, e);
            None
        }
    });
    Connector::new(boot_status, template.meter_values.clone())
}

/// Station endpoint: the supervision URL with the station name appended.
fn station_url(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

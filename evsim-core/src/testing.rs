//! In-process central system for exercising stations over real sockets.
//!
//! Binds a WebSocket server on an ephemeral port, answers station calls with
//! a small scripted ruleset and records everything it sees. Tests steer it
//! through atomics (boot/start acceptance, heartbeat interval), inject
//! server-initiated calls, silence actions to force timeouts, and drop the
//! connection to exercise the reconnect path.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    handshake::server::{Request as HandshakeRequest, Response as HandshakeResponse},
    http::header::SEC_WEBSOCKET_PROTOCOL,
    Message,
};

use crate::ocpp::messages::{Call, CallResult, OcppMessage};

pub(crate) struct Csms {
    pub url: String,
    script: Arc<Script>,
    commands: mpsc::UnboundedSender<CsmsCommand>,
}

enum CsmsCommand {
    Send(String),
    Close,
}

struct Script {
    calls: Mutex<Vec<Call>>,
    replies: Mutex<Vec<OcppMessage>>,
    accept_boot: AtomicBool,
    accept_starts: AtomicBool,
    heartbeat_interval: AtomicU32,
    next_transaction_id: AtomicI32,
    silent: Mutex<Vec<String>>,
}

impl Csms {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let script = Arc::new(Script {
            calls: Mutex::new(Vec::new()),
            replies: Mutex::new(Vec::new()),
            accept_boot: AtomicBool::new(true),
            accept_starts: AtomicBool::new(true),
            heartbeat_interval: AtomicU32::new(3600),
            next_transaction_id: AtomicI32::new(77),
            silent: Mutex::new(Vec::new()),
        });
        let (commands, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(server_loop(listener, command_rx, script.clone()));

        Self {
            url,
            script,
            commands,
        }
    }

    /// Push a server-initiated Call to the station.
    pub fn send_call(&self, message_id: &str, action: &str, payload: serde_json::Value) {
        let frame = Call {
            message_id: message_id.to_string(),
            action: action.to_string(),
            payload,
        }
        .to_frame()
        .unwrap();
        let _ = self.commands.send(CsmsCommand::Send(frame));
    }

    /// Push a raw frame to the station.
    pub fn send_frame(&self, frame: String) {
        let _ = self.commands.send(CsmsCommand::Send(frame));
    }

    /// Close the current connection; the listener keeps accepting.
    pub fn close_connection(&self) {
        let _ = self.commands.send(CsmsCommand::Close);
    }

    /// Stop answering an action, so station requests for it time out.
    pub fn silence(&self, action: &str) {
        self.script.silent.lock().push(action.to_string());
    }

    pub fn set_accept_boot(&self, accept: bool) {
        self.script.accept_boot.store(accept, Ordering::SeqCst);
    }

    pub fn set_accept_starts(&self, accept: bool) {
        self.script.accept_starts.store(accept, Ordering::SeqCst);
    }

    pub fn set_heartbeat_interval(&self, secs: u32) {
        self.script.heartbeat_interval.store(secs, Ordering::SeqCst);
    }

    pub fn total_calls(&self) -> usize {
        self.script.calls.lock().len()
    }

    pub fn call_count(&self, action: &str) -> usize {
        self.script
            .calls
            .lock()
            .iter()
            .filter(|c| c.action == action)
            .count()
    }

    pub fn calls_of(&self, action: &str) -> Vec<Call> {
        self.script
            .calls
            .lock()
            .iter()
            .filter(|c| c.action == action)
            .cloned()
            .collect()
    }

    /// Calls received at or after a recorded position, for before/after
    /// reconnect assertions.
    pub fn calls_from(&self, index: usize) -> Vec<Call> {
        self.script.calls.lock().iter().skip(index).cloned().collect()
    }

    pub fn reply_for(&self, message_id: &str) -> Option<OcppMessage> {
        self.script
            .replies
            .lock()
            .iter()
            .find(|m| m.message_id() == message_id)
            .cloned()
    }
}

async fn server_loop(
    listener: TcpListener,
    mut commands: mpsc::UnboundedReceiver<CsmsCommand>,
    script: Arc<Script>,
) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let ws = match tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &HandshakeRequest, mut response: HandshakeResponse| {
                // Echo the offered subprotocol; a tungstenite 0.24 client
                // fails the handshake when its offer goes unanswered.
                if let Some(protocol) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                    response
                        .headers_mut()
                        .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
                }
                Ok(response)
            },
        )
        .await
        {
            Ok(ws) => ws,
            Err(_) => continue,
        };
        let (mut tx, mut rx) = ws.split();

        'conn: loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(CsmsCommand::Send(frame)) => {
                        let _ = tx.send(Message::Text(frame)).await;
                    }
                    Some(CsmsCommand::Close) => {
                        let _ = tx.send(Message::Close(None)).await;
                        break 'conn;
                    }
                    None => return,
                },
                frame = rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match OcppMessage::parse(&text) {
                            Ok(OcppMessage::Call(call)) => {
                                script.calls.lock().push(call.clone());
                                if let Some(reply) = script.respond(&call) {
                                    let _ = tx.send(Message::Text(reply)).await;
                                }
                            }
                            Ok(other) => script.replies.lock().push(other),
                            Err(_) => {}
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break 'conn,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break 'conn,
                },
            }
        }
    }
}

impl Script {
    fn respond(&self, call: &Call) -> Option<String> {
        if self.silent.lock().iter().any(|a| a == &call.action) {
            return None;
        }

        let payload = match call.action.as_str() {
            "BootNotification" => {
                let status = if self.accept_boot.load(Ordering::SeqCst) {
                    "Accepted"
                } else {
                    "Rejected"
                };
                json!({
                    "currentTime": Utc::now(),
                    "interval": self.heartbeat_interval.load(Ordering::SeqCst),
                    "status": status,
                })
            }
            "Heartbeat" => json!({ "currentTime": Utc::now() }),
            "StartTransaction" => {
                if self.accept_starts.load(Ordering::SeqCst) {
                    json!({
                        "idTagInfo": { "status": "Accepted" },
                        "transactionId": self.next_transaction_id.fetch_add(1, Ordering::SeqCst),
                    })
                } else {
                    json!({ "idTagInfo": { "status": "Invalid" }, "transactionId": 0 })
                }
            }
            "StopTransaction" => json!({ "idTagInfo": { "status": "Accepted" } }),
            _ => json!({}),
        };
        Some(CallResult::new(&call.message_id, payload).unwrap().to_frame().unwrap())
    }
}

/// Poll a condition every 25 ms for up to six seconds.
pub(crate) async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..240 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// [`wait_until`] for conditions that need an await.
pub(crate) async fn wait_until_async<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..240 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

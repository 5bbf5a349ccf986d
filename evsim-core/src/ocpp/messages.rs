//! OCPP 1.6J message framing
//!
//! OCPP-J carries RPC over WebSocket text frames with three fixed-arity
//! array shapes:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP-J error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormationViolation,
    GenericError,
    InternalError,
    NotImplemented,
    NotSupported,
    OccurenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    SecurityError,
    TypeConstraintViolation,
}

/// OCPP 1.6 action names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // CP -> CSMS
    BootNotification,
    Heartbeat,
    StatusNotification,
    StartTransaction,
    StopTransaction,
    MeterValues,

    // CSMS -> CP
    GetConfiguration,
    ChangeConfiguration,
    RemoteStartTransaction,
    RemoteStopTransaction,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "StatusNotification" => Ok(Action::StatusNotification),
            "StartTransaction" => Ok(Action::StartTransaction),
            "StopTransaction" => Ok(Action::StopTransaction),
            "MeterValues" => Ok(Action::MeterValues),
            "GetConfiguration" => Ok(Action::GetConfiguration),
            "ChangeConfiguration" => Ok(Action::ChangeConfiguration),
            "RemoteStartTransaction" => Ok(Action::RemoteStartTransaction),
            "RemoteStopTransaction" => Ok(Action::RemoteStopTransaction),
            _ => Err(OcppError::UnknownAction(s.to_string())),
        }
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid message frame: {0}")]
    InvalidFrame(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("response for unknown message {0}")]
    UnknownMessageId(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("error from central system: {code:?} - {description}")]
    RemoteError {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("timeout waiting for response")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,
}

/// OCPP CALL message (request)
///
/// The action is kept as the raw wire string so a CALL for an action we do
/// not support still parses and can be answered with a NotImplemented
/// CALLERROR carrying the original message id.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_frame(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            &self.action,
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_frame(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_frame(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            format!("{:?}", self.error_code),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from a WebSocket text frame
    pub fn parse(text: &str) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_str(text)?;

        if array.is_empty() {
            return Err(OcppError::InvalidFrame("empty array".to_string()));
        }

        let msg_type = array[0]
            .as_i64()
            .ok_or_else(|| OcppError::InvalidFrame("message type must be a number".to_string()))?;

        match msg_type {
            2 => {
                // CALL: [2, messageId, action, payload]
                if array.len() != 4 {
                    return Err(OcppError::InvalidFrame(format!(
                        "CALL must have 4 elements, got {}",
                        array.len()
                    )));
                }

                let message_id = parse_id(&array[1])?;
                let action = array[2]
                    .as_str()
                    .ok_or_else(|| OcppError::InvalidFrame("action must be a string".to_string()))?
                    .to_string();
                let payload = array[3].clone();

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload,
                }))
            }
            3 => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() != 3 {
                    return Err(OcppError::InvalidFrame(format!(
                        "CALLRESULT must have 3 elements, got {}",
                        array.len()
                    )));
                }

                let message_id = parse_id(&array[1])?;
                let payload = array[2].clone();

                Ok(OcppMessage::CallResult(CallResult {
                    message_id,
                    payload,
                }))
            }
            4 => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                if array.len() != 5 {
                    return Err(OcppError::InvalidFrame(format!(
                        "CALLERROR must have 5 elements, got {}",
                        array.len()
                    )));
                }

                let message_id = parse_id(&array[1])?;
                let error_code_str = array[2].as_str().ok_or_else(|| {
                    OcppError::InvalidFrame("error code must be a string".to_string())
                })?;
                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);
                let error_description = array[3].as_str().unwrap_or("").to_string();
                let error_details = array[4].clone();

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details,
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    /// Serialize to the wire text form
    pub fn to_frame(&self) -> Result<String, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_frame(),
            OcppMessage::CallResult(r) => r.to_frame(),
            OcppMessage::CallError(e) => e.to_frame(),
        }
    }
}

fn parse_id(value: &Value) -> Result<String, OcppError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| OcppError::InvalidFrame("message id must be a string".to_string()))
}

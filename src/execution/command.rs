//! Wire types for the line-delimited JSON protocol
//!
//! One `Command` object per inbound line, one `Response` object per outbound
//! line. Envelope fields are stable; `payload` and `data` are free-form JSON
//! that the dispatcher and handlers interpret.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::constants::{
    reserved, LEGACY_PROTOCOL_VERSION, PROTOCOL_VERSION, SERVICE_ERROR_PREFIX, UNKNOWN_COMMAND_ID,
};
use crate::execution::admission::AdmissionRejection;

/// Untyped command payload as it arrives on the wire
pub type Payload = Map<String, Value>;

/// Seconds since the Unix epoch, as carried in `timestamp`
pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn legacy_protocol_version() -> String {
    LEGACY_PROTOCOL_VERSION.to_string()
}

/// `null` and a missing payload both mean "no arguments"
fn deserialize_payload<'de, D>(deserializer: D) -> Result<Payload, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Payload>::deserialize(deserializer)?.unwrap_or_default())
}

/// Inbound command
///
/// `id` is chosen by the client for correlation. `sequence` is assigned by
/// the server when the command is queued; anything the client sends there
/// is overwritten.
///
/// # Examples
///
/// ```rust
/// use host_bridge::execution::command::{Command, CommandKind};
///
/// let command = Command::from_json(r#"{"type":"ping","id":"c-1"}"#).unwrap();
/// assert_eq!(command.kind(), CommandKind::Ping);
/// assert!(command.payload.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub command_type: String,

    #[serde(default)]
    pub id: String,

    #[serde(default, deserialize_with = "deserialize_payload")]
    pub payload: Payload,

    #[serde(default)]
    pub sequence: u64,

    #[serde(default = "now_timestamp")]
    pub timestamp: f64,

    #[serde(default = "legacy_protocol_version", alias = "protocolVersion")]
    pub protocol_version: String,
}

impl Command {
    pub fn new(command_type: impl Into<String>, id: impl Into<String>, payload: Payload) -> Self {
        Self {
            command_type: command_type.into(),
            id: id.into(),
            payload,
            sequence: 0,
            timestamp: now_timestamp(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Parse one wire line
    pub fn from_json(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line.trim()).map_err(|e| {
            ProtocolError::InvalidJson {
                reason: e.to_string(),
            }
        })?;

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let command: Command =
            serde_json::from_value(value).map_err(|e| ProtocolError::InvalidCommand {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        if command.command_type.trim().is_empty() {
            return Err(ProtocolError::InvalidCommand {
                id,
                reason: "command type must not be empty".to_string(),
            });
        }

        Ok(command)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> CommandKind {
        CommandKind::from_type(&self.command_type)
    }

    /// Critical commands bypass admission and the queue
    pub fn is_critical(&self) -> bool {
        self.kind().is_critical()
    }
}

/// Reserved command types answered inline versus domain commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Ping,
    Heartbeat,
    HealthQuery,
    Domain,
}

impl CommandKind {
    pub fn from_type(command_type: &str) -> Self {
        match command_type {
            reserved::PING => CommandKind::Ping,
            reserved::HEARTBEAT => CommandKind::Heartbeat,
            reserved::GET_HEALTH => CommandKind::HealthQuery,
            _ => CommandKind::Domain,
        }
    }

    pub fn is_critical(&self) -> bool {
        !matches!(self, CommandKind::Domain)
    }
}

/// Wire message that could not be turned into a `Command`
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {reason}")]
    InvalidJson { reason: String },

    #[error("Invalid command: {reason}")]
    InvalidCommand { id: Option<String>, reason: String },
}

impl ProtocolError {
    /// Id to answer with; "unknown" when none could be recovered
    pub fn command_id(&self) -> &str {
        match self {
            ProtocolError::InvalidCommand { id: Some(id), .. } => id,
            _ => UNKNOWN_COMMAND_ID,
        }
    }
}

/// Outbound response; always echoes the command's `id` and `sequence`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub sequence: u64,
    #[serde(default = "now_timestamp")]
    pub timestamp: f64,
    #[serde(default = "legacy_protocol_version", alias = "protocolVersion")]
    pub protocol_version: String,
}

impl Response {
    fn build(
        id: impl Into<String>,
        sequence: u64,
        success: bool,
        data: Value,
        error: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            success,
            data,
            error,
            sequence,
            timestamp: now_timestamp(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn ok(command: &Command, data: Value) -> Self {
        Self::build(&command.id, command.sequence, true, data, None)
    }

    /// Request was understood but refused by its handler
    pub fn user_error(command: &Command, message: impl fmt::Display) -> Self {
        Self::build(
            &command.id,
            command.sequence,
            false,
            Value::Null,
            Some(message.to_string()),
        )
    }

    /// The service itself failed; carries the service error prefix
    pub fn service_error(command: &Command, message: impl fmt::Display) -> Self {
        Self::build(
            &command.id,
            command.sequence,
            false,
            Value::Null,
            Some(format!("{SERVICE_ERROR_PREFIX}: {message}")),
        )
    }

    /// Admission refused the command before it reached the queue
    pub fn rejected(id: &str, sequence: u64, rejection: &AdmissionRejection) -> Self {
        Self::build(
            id,
            sequence,
            false,
            rejection.to_data(),
            Some(rejection.to_string()),
        )
    }

    /// Answer to a line that could not be parsed
    pub fn malformed(error: &ProtocolError) -> Self {
        Self::build(
            error.command_id(),
            0,
            false,
            Value::Null,
            Some(error.to_string()),
        )
    }

    /// Sent when the connection stops waiting for a queued command
    pub fn timed_out(command: &Command, waited: Duration) -> Self {
        Self::build(
            &command.id,
            command.sequence,
            false,
            json!({ "type": "timeout", "waited": waited.as_secs_f64() }),
            Some(format!(
                "{SERVICE_ERROR_PREFIX}: command timed out after {:.1}s waiting for the host",
                waited.as_secs_f64()
            )),
        )
    }

    pub fn is_service_error(&self) -> bool {
        self.error
            .as_deref()
            .is_some_and(|e| e.starts_with(SERVICE_ERROR_PREFIX))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Opaque per-connection identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_command() {
        let command = Command::from_json(r#"{"type":"create_node","id":"a1"}"#).unwrap();
        assert_eq!(command.command_type, "create_node");
        assert_eq!(command.id, "a1");
        assert!(command.payload.is_empty());
        assert_eq!(command.sequence, 0);
        assert_eq!(command.protocol_version, LEGACY_PROTOCOL_VERSION);
        assert_eq!(command.kind(), CommandKind::Domain);
        assert!(command.timestamp > 0.0);
    }

    #[test]
    fn test_parse_accepts_camel_case_version_and_null_payload() {
        let command = Command::from_json(
            r#"{"type":"ping","id":"p","payload":null,"protocolVersion":"2.0.0"}"#,
        )
        .unwrap();
        assert_eq!(command.protocol_version, "2.0.0");
        assert!(command.payload.is_empty());
        assert!(command.is_critical());
    }

    #[test]
    fn test_invalid_json_answers_unknown() {
        let err = Command::from_json("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson { .. }));
        assert_eq!(err.command_id(), UNKNOWN_COMMAND_ID);

        let response = Response::malformed(&err);
        assert_eq!(response.id, "unknown");
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("Invalid JSON"));
    }

    #[test]
    fn test_invalid_command_keeps_best_effort_id() {
        let err = Command::from_json(r#"{"id":"x-9","payload":{}}"#).unwrap_err();
        assert_eq!(err.command_id(), "x-9");

        let err = Command::from_json(r#"{"type":"","id":"x-10"}"#).unwrap_err();
        assert_eq!(err.command_id(), "x-10");

        let err = Command::from_json(r#"{"type":"echo","id":"x-11","payload":[1,2]}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCommand { .. }));
    }

    #[test]
    fn test_reserved_kinds() {
        assert_eq!(CommandKind::from_type("ping"), CommandKind::Ping);
        assert_eq!(CommandKind::from_type("heartbeat"), CommandKind::Heartbeat);
        assert_eq!(CommandKind::from_type("get_health"), CommandKind::HealthQuery);
        assert_eq!(CommandKind::from_type("get_parm"), CommandKind::Domain);
    }

    #[test]
    fn test_response_echoes_id_and_sequence() {
        let mut command = Command::new("echo", "c-7", Payload::new());
        command.sequence = 42;

        let ok = Response::ok(&command, json!({"echo": true}));
        assert_eq!((ok.id.as_str(), ok.sequence, ok.success), ("c-7", 42, true));

        let user = Response::user_error(&command, "node not found");
        assert!(!user.is_service_error());

        let service = Response::service_error(&command, "host crashed");
        assert_eq!(service.error.as_deref(), Some("Service error: host crashed"));
        assert!(service.is_service_error());

        let timeout = Response::timed_out(&command, Duration::from_secs(60));
        assert_eq!(timeout.sequence, 42);
        assert!(timeout.is_service_error());
        assert_eq!(timeout.data["type"], "timeout");
    }

    #[test]
    fn test_response_wire_shape() {
        let command = Command::new("echo", "c-1", Payload::new());
        let line = Response::ok(&command, json!(1)).to_json().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        for key in ["id", "success", "data", "error", "sequence", "timestamp", "protocol_version"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(value["protocol_version"], PROTOCOL_VERSION);
    }
}

//! Wire protocol spoken between signage players and the server.
//!
//! Players send JSON arrays whose first element is a string tag, e.g.
//! `["status", {settings}, {status}, priority]`. The server answers with
//! JSON objects tagged by a `type` field.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_PORT: u16 = 3000;
pub const WELCOME_MESSAGE: &str = "Welcome to the signage WebSocket server";

pub const TAG_STATUS: &str = "status";
pub const TAG_SECRET_ACK: &str = "secret_ack";
pub const TAG_SHELL_ACK: &str = "shell_ack";
pub const TAG_SNAPSHOT: &str = "snapshot";
pub const TAG_UPLOAD: &str = "upload";

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn timestamp_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis();
    (millis.min(u64::MAX as u128)) as u64
}

/// JSON truthiness as player firmware understands it
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Size of an opaque payload carried by acks and uploads
pub fn payload_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        Value::Array(items) => items.len(),
        Value::Object(fields) => fields.len(),
        _ => 0,
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("frame is not a tagged array")]
    NotTaggedArray,
    #[error("unknown message type: {0}")]
    UnknownTag(String),
    #[error("invalid `{field}` in {tag} frame")]
    InvalidField {
        tag: &'static str,
        field: &'static str,
    },
}

/// Messages sent by a player device
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerMessage {
    Status {
        settings: Map<String, Value>,
        status: Map<String, Value>,
        priority: bool,
    },
    SecretAck {
        ok: bool,
    },
    ShellAck {
        response: Value,
    },
    Snapshot {
        response: Value,
    },
    Upload {
        player_id: String,
        filename: String,
        data: Option<Value>,
    },
}

impl PlayerMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            PlayerMessage::Status { .. } => TAG_STATUS,
            PlayerMessage::SecretAck { .. } => TAG_SECRET_ACK,
            PlayerMessage::ShellAck { .. } => TAG_SHELL_ACK,
            PlayerMessage::Snapshot { .. } => TAG_SNAPSHOT,
            PlayerMessage::Upload { .. } => TAG_UPLOAD,
        }
    }

    /// Parses one text frame received from a player
    ///
    /// Trailing elements a tag does not use are ignored. Missing optional
    /// elements take their empty value, so `["status"]` is a status report
    /// with no fields (which the server later rejects for lacking a serial).
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

        let args = match frame {
            Value::Array(args) => args,
            _ => return Err(ProtocolError::NotTaggedArray),
        };

        let tag = match args.first() {
            Some(Value::String(tag)) => tag.as_str(),
            _ => return Err(ProtocolError::NotTaggedArray),
        };

        let arg = |index: usize| args.get(index).cloned().unwrap_or(Value::Null);

        match tag {
            TAG_STATUS => Ok(PlayerMessage::Status {
                settings: object_arg(arg(1), TAG_STATUS, "settings")?,
                status: object_arg(arg(2), TAG_STATUS, "status")?,
                priority: is_truthy(&arg(3)),
            }),
            TAG_SECRET_ACK => Ok(PlayerMessage::SecretAck {
                ok: is_truthy(&arg(1)),
            }),
            TAG_SHELL_ACK => Ok(PlayerMessage::ShellAck { response: arg(1) }),
            TAG_SNAPSHOT => Ok(PlayerMessage::Snapshot { response: arg(1) }),
            TAG_UPLOAD => {
                let player_id = string_arg(arg(1), TAG_UPLOAD, "playerId")?;
                let filename = string_arg(arg(2), TAG_UPLOAD, "filename")?;
                let data = match arg(3) {
                    Value::Null => None,
                    other => Some(other),
                };
                Ok(PlayerMessage::Upload {
                    player_id,
                    filename,
                    data,
                })
            }
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }

    /// Encodes the message as the tagged array players put on the wire
    pub fn to_frame(&self) -> String {
        let args = match self {
            PlayerMessage::Status {
                settings,
                status,
                priority,
            } => vec![
                Value::Object(settings.clone()),
                Value::Object(status.clone()),
                Value::Bool(*priority),
            ],
            PlayerMessage::SecretAck { ok } => vec![Value::Bool(*ok)],
            PlayerMessage::ShellAck { response } | PlayerMessage::Snapshot { response } => {
                vec![response.clone()]
            }
            PlayerMessage::Upload {
                player_id,
                filename,
                data,
            } => vec![
                Value::String(player_id.clone()),
                Value::String(filename.clone()),
                data.clone().unwrap_or(Value::Null),
            ],
        };

        let mut frame = Vec::with_capacity(args.len() + 1);
        frame.push(Value::String(self.tag().to_string()));
        frame.extend(args);
        Value::Array(frame).to_string()
    }
}

fn object_arg(
    value: Value,
    tag: &'static str,
    field: &'static str,
) -> Result<Map<String, Value>, ProtocolError> {
    match value {
        Value::Null => Ok(Map::new()),
        Value::Object(fields) => Ok(fields),
        _ => Err(ProtocolError::InvalidField { tag, field }),
    }
}

fn string_arg(value: Value, tag: &'static str, field: &'static str) -> Result<String, ProtocolError> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(ProtocolError::InvalidField { tag, field }),
    }
}

/// Messages sent by the server to a player
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome { message: String },
}

impl ServerMessage {
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            message: WELCOME_MESSAGE.to_string(),
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

//! Documents kept by the server and the transient check-in report
//!
//! Player and group documents serialize with the camelCase field names the
//! dashboard and existing player firmware use.

use crate::error::CheckInError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_GROUP_NAME: &str = "default";

/// Keys a device may not set on its own record
const SERVER_OWNED_KEYS: &[&str] = &[
    "_id",
    "group",
    "installation",
    "registered",
    "serverServiceDisabled",
    "isConnected",
    "createdAt",
];

/// Generates a 24 hex digit document identifier
pub fn new_object_id() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Denormalized copy of the owning group's identity
///
/// Not kept in sync with the group itself; a rename leaves the old name here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
}

impl GroupRef {
    /// Reference used when no group named "default" exists
    pub fn fallback() -> Self {
        Self {
            id: None,
            name: DEFAULT_GROUP_NAME.to_string(),
        }
    }
}

impl Default for GroupRef {
    fn default() -> Self {
        Self::fallback()
    }
}

/// A named deployment configuration
///
/// Only the identifier and name are interpreted here; playlists, display
/// settings and the rest travel along untouched in `settings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl GroupRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            settings: Map::new(),
        }
    }

    pub fn reference(&self) -> GroupRef {
        GroupRef {
            id: Some(self.id.clone()),
            name: self.name.clone(),
        }
    }
}

/// One physical signage player, keyed by its hardware serial number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub cpu_serial_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub group: GroupRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default)]
    pub last_upload: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reported: Option<u64>,
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub server_service_disabled: bool,
    #[serde(default)]
    pub created_at: u64,
    /// Everything else the device reports (version, disk space, TV state, ...)
    #[serde(flatten)]
    pub reported: Map<String, Value>,
}

impl PlayerRecord {
    pub fn new(id: impl Into<String>, cpu_serial_number: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cpu_serial_number: cpu_serial_number.into(),
            name: None,
            group: GroupRef::fallback(),
            installation: None,
            ip: None,
            socket: None,
            server_name: None,
            last_upload: 0,
            last_reported: None,
            is_connected: false,
            registered: false,
            server_service_disabled: false,
            created_at: 0,
            reported: Map::new(),
        }
    }
}

/// Where a status report came from, as seen by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub socket_id: String,
    pub peer_ip: String,
    pub server_name: String,
}

/// A single status report from a player, consumed once by the processor
#[derive(Debug, Clone, PartialEq)]
pub struct CheckIn {
    pub serial: String,
    pub name: Option<String>,
    pub last_upload: Option<u64>,
    pub priority: bool,
    /// The device explicitly asks for its configuration
    pub request: bool,
    pub ip: Option<String>,
    pub socket: Option<String>,
    pub server_name: Option<String>,
    pub last_reported: Option<u64>,
    pub reported: Map<String, Value>,
}

impl CheckIn {
    /// Builds a check-in from the parts of a `status` frame
    ///
    /// Connection details go in first so anything the device reports about
    /// itself overrides them, then settings, then status.
    pub fn from_status(
        settings: Map<String, Value>,
        status: Map<String, Value>,
        priority: bool,
        connection: &ConnectionInfo,
        now: u64,
    ) -> Result<Self, CheckInError> {
        let mut fields = Map::new();
        fields.insert("lastReported".to_string(), Value::from(now));
        fields.insert("ip".to_string(), Value::from(connection.peer_ip.clone()));
        fields.insert("socket".to_string(), Value::from(connection.socket_id.clone()));
        fields.insert("priority".to_string(), Value::Bool(priority));
        fields.insert(
            "serverName".to_string(),
            Value::from(connection.server_name.clone()),
        );
        fields.insert("newSocketIo".to_string(), Value::Bool(true));
        fields.insert("webSocket".to_string(), Value::Bool(true));
        fields.extend(settings);
        fields.extend(status);

        Self::from_fields(fields)
    }

    /// Extracts the interpreted fields, leaving the rest as reported data
    pub fn from_fields(mut fields: Map<String, Value>) -> Result<Self, CheckInError> {
        let serial = match fields.remove("cpuSerialNumber") {
            Some(Value::String(serial)) if !serial.is_empty() => serial,
            _ => return Err(CheckInError::MissingSerial),
        };

        for key in SERVER_OWNED_KEYS {
            fields.remove(*key);
        }

        let name = fields.remove("name").and_then(string_value);
        let last_upload = fields.remove("lastUpload").and_then(millis_value);
        let priority = fields
            .remove("priority")
            .map(|v| shared::is_truthy(&v))
            .unwrap_or(false);
        let request = fields
            .remove("request")
            .map(|v| shared::is_truthy(&v))
            .unwrap_or(false);
        let ip = fields.remove("ip").and_then(string_value);
        let socket = fields.remove("socket").and_then(string_value);
        let server_name = fields.remove("serverName").and_then(string_value);
        let last_reported = fields.remove("lastReported").and_then(millis_value);

        Ok(Self {
            serial,
            name,
            last_upload,
            priority,
            request,
            ip,
            socket,
            server_name,
            last_reported,
            reported: fields,
        })
    }
}

fn string_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        _ => None,
    }
}

fn millis_value(value: Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn connection() -> ConnectionInfo {
        ConnectionInfo {
            socket_id: "ws_1".to_string(),
            peer_ip: "10.0.0.7".to_string(),
            server_name: "0.0.0.0".to_string(),
        }
    }

    #[test]
    fn test_from_fields_requires_serial() {
        let err = CheckIn::from_fields(fields(json!({"name": "Lobby TV"}))).unwrap_err();
        assert!(matches!(err, CheckInError::MissingSerial));

        let err = CheckIn::from_fields(fields(json!({"cpuSerialNumber": ""}))).unwrap_err();
        assert!(matches!(err, CheckInError::MissingSerial));
    }

    #[test]
    fn test_from_fields_extracts_interpreted_fields() {
        let check_in = CheckIn::from_fields(fields(json!({
            "cpuSerialNumber": "PI-001",
            "name": "Lobby TV",
            "lastUpload": 100,
            "priority": 1,
            "request": true,
            "version": "2.4.1",
        })))
        .unwrap();

        assert_eq!(check_in.serial, "PI-001");
        assert_eq!(check_in.name.as_deref(), Some("Lobby TV"));
        assert_eq!(check_in.last_upload, Some(100));
        assert!(check_in.priority);
        assert!(check_in.request);
        assert_eq!(check_in.reported.len(), 1);
        assert_eq!(check_in.reported["version"], json!("2.4.1"));
    }

    #[test]
    fn test_from_fields_drops_server_owned_keys() {
        let check_in = CheckIn::from_fields(fields(json!({
            "cpuSerialNumber": "PI-001",
            "registered": true,
            "serverServiceDisabled": false,
            "group": {"name": "hacked"},
            "_id": "abc",
        })))
        .unwrap();

        assert!(check_in.reported.is_empty());
    }

    #[test]
    fn test_last_upload_accepts_numeric_strings() {
        let check_in = CheckIn::from_fields(fields(json!({
            "cpuSerialNumber": "PI-001",
            "lastUpload": "1700000000000",
        })))
        .unwrap();
        assert_eq!(check_in.last_upload, Some(1_700_000_000_000));

        let check_in = CheckIn::from_fields(fields(json!({
            "cpuSerialNumber": "PI-001",
            "lastUpload": null,
        })))
        .unwrap();
        assert_eq!(check_in.last_upload, None);
    }

    #[test]
    fn test_from_status_layers_device_fields_over_connection() {
        let settings = fields(json!({"cpuSerialNumber": "PI-001", "ip": "192.168.1.20"}));
        let status = fields(json!({"name": "Lobby TV", "tvStatus": true}));

        let check_in = CheckIn::from_status(settings, status, true, &connection(), 42).unwrap();

        assert_eq!(check_in.ip.as_deref(), Some("192.168.1.20"));
        assert_eq!(check_in.socket.as_deref(), Some("ws_1"));
        assert_eq!(check_in.server_name.as_deref(), Some("0.0.0.0"));
        assert_eq!(check_in.last_reported, Some(42));
        assert!(check_in.priority);
        assert_eq!(check_in.reported["newSocketIo"], json!(true));
        assert_eq!(check_in.reported["webSocket"], json!(true));
        assert_eq!(check_in.reported["tvStatus"], json!(true));
    }

    #[test]
    fn test_player_record_document_shape() {
        let mut player = PlayerRecord::new("65a1", "PI-001");
        player.name = Some("Lobby TV".to_string());
        player.reported.insert("version".to_string(), json!("2.4.1"));

        let doc = serde_json::to_value(&player).unwrap();
        assert_eq!(doc["_id"], json!("65a1"));
        assert_eq!(doc["cpuSerialNumber"], json!("PI-001"));
        assert_eq!(doc["group"], json!({"name": "default"}));
        assert_eq!(doc["version"], json!("2.4.1"));
        assert!(doc.get("socket").is_none());

        let back: PlayerRecord = serde_json::from_value(doc).unwrap();
        assert_eq!(back, player);
    }

    #[test]
    fn test_object_ids_are_hex() {
        let id = new_object_id();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_object_id());
    }
}

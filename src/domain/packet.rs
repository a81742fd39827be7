//! Wire envelope and packet bodies.
//!
//! Everything on the wire is a newline-delimited JSON envelope
//! `{"id": …, "type": "kdeconnect.…", "body": {…}}`. The body is nested
//! JSON whose schema is decided by `type`; typed views of the well-known
//! bodies live alongside the envelope.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DaemonError, Result};

pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";
pub const PACKET_TYPE_PING: &str = "kdeconnect.ping";
pub const PACKET_TYPE_SFTP: &str = "kdeconnect.sftp";
pub const PACKET_TYPE_SFTP_REQUEST: &str = "kdeconnect.sftp.request";

/// Protocol version this daemon advertises.
pub const PROTOCOL_VERSION: u32 = 8;

/// Wire envelope.
///
/// `id` is conventionally milliseconds since the epoch and is used only for
/// correlation in logs, never for ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "type")]
    pub packet_type: String,
    pub body: Map<String, Value>,
}

impl Packet {
    /// Build an envelope around an already-serialized body object.
    pub fn new(packet_type: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            id: chrono::Utc::now().timestamp_millis(),
            packet_type: packet_type.into(),
            body,
        }
    }

    /// Build an envelope from any serializable body.
    ///
    /// Fails with a protocol error if `body` does not serialize to a JSON
    /// object, since the wire format requires one.
    pub fn from_body<B: Serialize>(packet_type: impl Into<String>, body: &B) -> Result<Self> {
        let value = serde_json::to_value(body)
            .map_err(|e| DaemonError::protocol(format!("body does not serialize: {e}")))?;
        match value {
            Value::Object(map) => Ok(Self::new(packet_type, map)),
            other => Err(DaemonError::protocol(format!(
                "packet body must be a JSON object, got {other}"
            ))),
        }
    }

    /// Serialize the envelope followed by the framing newline.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut data = serde_json::to_vec(self)
            .map_err(|e| DaemonError::framing(format!("packet does not serialize: {e}")))?;
        data.push(b'\n');
        Ok(data)
    }

    /// Parse one envelope out of a single framed line.
    ///
    /// Unparseable JSON is a framing error; well-formed JSON that is missing
    /// `type` (or whose `body` is not an object) is a protocol error.
    pub fn decode(line: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(line)
            .map_err(|e| DaemonError::framing(format!("invalid packet json: {e}")))?;
        let Value::Object(mut fields) = value else {
            return Err(DaemonError::framing("packet is not a JSON object".to_string()));
        };

        let packet_type = match fields.remove("type") {
            Some(Value::String(s)) => s,
            Some(_) => {
                return Err(DaemonError::protocol(
                    "packet type is not a string".to_string(),
                ))
            }
            None => return Err(DaemonError::protocol("packet has no type".to_string())),
        };
        let body = match fields.remove("body") {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(DaemonError::protocol(
                    "packet body is not an object".to_string(),
                ))
            }
            None => return Err(DaemonError::protocol("packet has no body".to_string())),
        };
        let id = fields
            .remove("id")
            .and_then(|v| v.as_i64())
            .unwrap_or_default();

        Ok(Self {
            id,
            packet_type,
            body,
        })
    }

    /// Deserialize the body into a typed view.
    pub fn body_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .map_err(|e| DaemonError::protocol(format!("bad {} body: {e}", self.packet_type)))
    }
}

/// Self-description every peer broadcasts and exchanges during the link
/// handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityBody {
    pub device_id: String,
    pub device_name: String,
    pub device_type: String,
    pub protocol_version: u32,
    pub tcp_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bluetooth_address: Option<String>,
    #[serde(default)]
    pub incoming_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub outgoing_capabilities: BTreeSet<String>,
}

impl IdentityBody {
    /// Wrap this identity in its wire envelope.
    pub fn to_packet(&self) -> Result<Packet> {
        Packet::from_body(PACKET_TYPE_IDENTITY, self)
    }
}

/// Body of `kdeconnect.pair`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PairBody {
    pub pair: bool,
    /// Seconds since the epoch; feeds the verification-key derivation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Body of `kdeconnect.ping`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of `kdeconnect.sftp` (inbound offer) and `kdeconnect.sftp.request`
/// (outbound browse trigger).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpBody {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub start_browsing: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub multi_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path_names: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

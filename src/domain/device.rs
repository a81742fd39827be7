//! Peer records tracked by the engine.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::packet::IdentityBody;

/// A peer seen on the network. Transient: rebuilt from broadcasts after every
/// restart, never persisted.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub identity: IdentityBody,
    /// Source address of the most recent announcement.
    pub last_addr: SocketAddr,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredDevice {
    pub fn new(identity: IdentityBody, last_addr: SocketAddr) -> Self {
        Self {
            identity,
            last_addr,
            last_seen: Utc::now(),
        }
    }
}

/// A peer we completed pairing with. Persisted so the device stays usable
/// while offline; the address fields track roaming across re-discoveries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedDeviceInfo {
    pub identity: IdentityBody,
    #[serde(rename = "lastIP", default, skip_serializing_if = "String::is_empty")]
    pub last_ip: String,
    #[serde(rename = "lastPort", default)]
    pub last_port: u16,
    /// SHA-256 of the peer's leaf certificate, pinned at pair time. Absent
    /// only in records migrated from before pinning was recorded.
    #[serde(
        rename = "certSha256",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cert_sha256: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn identity(id: &str) -> IdentityBody {
        IdentityBody {
            device_id: id.to_string(),
            device_name: "phone".to_string(),
            device_type: "phone".to_string(),
            protocol_version: 8,
            tcp_port: 1716,
            bluetooth_address: None,
            incoming_capabilities: BTreeSet::new(),
            outgoing_capabilities: BTreeSet::new(),
        }
    }

    #[test]
    fn paired_device_round_trips_with_wire_field_names() {
        let info = PairedDeviceInfo {
            identity: identity("dev-1"),
            last_ip: "10.0.0.2".to_string(),
            last_port: 1716,
            cert_sha256: Some("ab".repeat(32)),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"lastIP\":\"10.0.0.2\""));
        assert!(json.contains("\"lastPort\":1716"));

        let restored: PairedDeviceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.identity.device_id, "dev-1");
        assert_eq!(restored.cert_sha256, info.cert_sha256);
    }

    #[test]
    fn paired_device_tolerates_missing_address_fields() {
        let json = format!(
            r#"{{"identity":{}}}"#,
            serde_json::to_string(&identity("dev-2")).unwrap()
        );
        let restored: PairedDeviceInfo = serde_json::from_str(&json).unwrap();
        assert!(restored.last_ip.is_empty());
        assert_eq!(restored.last_port, 0);
        assert!(restored.cert_sha256.is_none());
    }
}

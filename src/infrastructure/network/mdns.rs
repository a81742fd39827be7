//! mDNS presence: registers the daemon under `_kdeconnect._udp.local.` for
//! peers that browse instead of listening for UDP broadcasts.

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::{info, warn};

use crate::domain::IdentityBody;
use crate::error::{DaemonError, Result};

pub const SERVICE_TYPE: &str = "_kdeconnect._udp.local.";

/// Keeps the registration alive; dropping or shutting it down withdraws the
/// service.
pub struct MdnsResponder {
    daemon: ServiceDaemon,
    fullname: String,
}

impl MdnsResponder {
    /// Register this identity. The instance name is the device id and the
    /// TXT records mirror the identity fields peers need before connecting.
    pub fn register(identity: &IdentityBody) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| DaemonError::transport(format!("mdns daemon: {e}")))?;

        let host = format!("{}.local.", identity.device_id);
        let protocol = identity.protocol_version.to_string();
        let properties = [
            ("id", identity.device_id.as_str()),
            ("name", identity.device_name.as_str()),
            ("type", identity.device_type.as_str()),
            ("protocol", protocol.as_str()),
        ];

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &identity.device_id,
            &host,
            "",
            identity.tcp_port,
            &properties[..],
        )
        .map_err(|e| DaemonError::transport(format!("mdns service info: {e}")))?
        .enable_addr_auto();

        let fullname = service.get_fullname().to_string();
        daemon
            .register(service)
            .map_err(|e| DaemonError::transport(format!("mdns register: {e}")))?;
        info!(instance = %fullname, port = identity.tcp_port, "mdns service registered");

        Ok(Self { daemon, fullname })
    }

    /// Withdraw the registration and stop the responder.
    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!(error = %e, "mdns unregister failed");
        }
        let _ = self.daemon.shutdown();
    }
}

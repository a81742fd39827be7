//! UDP discovery: periodic identity broadcasts and the announcement
//! listener.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::domain::{IdentityBody, Packet, PACKET_TYPE_IDENTITY};
use crate::error::Result;
use crate::utils::net_utils::broadcast_targets;

/// UDP port identity announcements are sent to and received on.
pub const UDP_PORT: u16 = 1716;

/// Interval between announcement rounds.
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(5);

/// Largest announcement datagram we accept.
const MAX_DATAGRAM: usize = 2048;

/// Announce our identity every five seconds to the directed broadcast
/// address of each usable interface plus the global broadcast address.
/// Individual send failures are logged and skipped; the loop never aborts.
pub async fn run_broadcast_loop<F>(identity_fn: F) -> Result<()>
where
    F: Fn() -> IdentityBody + Send,
{
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.set_broadcast(true)?;

    let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
    loop {
        ticker.tick().await;

        let identity = identity_fn();
        let data = match identity.to_packet().and_then(|p| p.encode()) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "identity announcement does not encode");
                continue;
            }
        };

        for target in broadcast_targets() {
            if let Err(e) = socket.send_to(&data, (target, UDP_PORT)).await {
                debug!(%target, error = %e, "announcement send skipped");
            }
        }
        trace!(device_id = %identity.device_id, "announced identity");
    }
}

/// Bind the announcement listener socket on all interfaces.
pub async fn bind_announcement_socket() -> Result<UdpSocket> {
    Ok(UdpSocket::bind(("0.0.0.0", UDP_PORT)).await?)
}

/// Receive identity announcements and forward them with their source
/// address. Our own announcements (matching `local_device_id`) are dropped
/// here so the engine never sees itself as a peer.
pub async fn run_listen_loop(
    socket: UdpSocket,
    local_device_id: String,
    announcements: mpsc::Sender<(IdentityBody, SocketAddr)>,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "udp receive failed");
                continue;
            }
        };

        let Some(identity) = parse_announcement(&buf[..len]) else {
            trace!(%addr, "ignoring malformed announcement");
            continue;
        };
        if identity.device_id == local_device_id {
            continue;
        }

        if announcements.send((identity, addr)).await.is_err() {
            // Engine is gone; nothing left to announce to.
            return Ok(());
        }
    }
}

fn parse_announcement(datagram: &[u8]) -> Option<IdentityBody> {
    let line = datagram.strip_suffix(b"\n").unwrap_or(datagram);
    let packet = Packet::decode(line).ok()?;
    if packet.packet_type != PACKET_TYPE_IDENTITY {
        return None;
    }
    packet.body_as().ok()
}

//! A live, authenticated channel to one device.
//!
//! Owns the secured stream produced by the link handshake. A background
//! reader task feeds decoded packets into the engine's channel and reports
//! the disconnect exactly once when the stream dies; the write path holds an
//! async mutex across the whole `JSON + '\n'` write so framing stays atomic
//! under concurrent senders.

use std::net::IpAddr;
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::framing::PacketReader;
use super::link::{EstablishedLink, SecureStream};
use super::transport::TransportDescriptor;
use crate::domain::{IdentityBody, Packet};
use crate::error::Result;

/// What the reader task reports back to the engine.
pub enum ConnectionEvent {
    Packet {
        connection: Arc<Connection>,
        packet: Packet,
    },
    /// Sent exactly once, after the reader observed EOF or a decode error.
    Disconnected { connection: Arc<Connection> },
}

pub struct Connection {
    device_id: String,
    remote_identity: IdentityBody,
    descriptor: TransportDescriptor,
    peer_cert: CertificateDer<'static>,
    writer: Mutex<WriteHalf<Box<dyn SecureStream>>>,
}

impl Connection {
    /// Wrap an established link. Returns the connection plus the reader to
    /// hand to [`spawn_reader`].
    pub fn from_link(
        link: EstablishedLink,
    ) -> (Arc<Self>, PacketReader<ReadHalf<Box<dyn SecureStream>>>) {
        let connection = Arc::new(Self {
            device_id: link.remote_identity.device_id.clone(),
            remote_identity: link.remote_identity,
            descriptor: link.descriptor,
            peer_cert: link.peer_cert,
            writer: Mutex::new(link.writer),
        });
        (connection, link.reader)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn remote_identity(&self) -> &IdentityBody {
        &self.remote_identity
    }

    pub fn peer_descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    pub fn peer_ip(&self) -> Option<IpAddr> {
        self.descriptor.ip()
    }

    /// Leaf certificate the peer presented during the handshake; compared
    /// against the pinned fingerprint for paired devices.
    pub fn peer_cert(&self) -> &CertificateDer<'static> {
        &self.peer_cert
    }

    /// Serialize and send one packet. The mutex is held for the full write
    /// so interleaved senders cannot tear a frame.
    pub async fn send_packet<B: Serialize>(&self, packet_type: &str, body: &B) -> Result<()> {
        let data = Packet::from_body(packet_type, body)?.encode()?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Best-effort close of the write side; the reader task will observe the
    /// resulting EOF and report the disconnect.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device_id", &self.device_id)
            .field("peer", &self.descriptor.to_string())
            .finish()
    }
}

/// Drive the connection's read side until it dies, forwarding packets and
/// then the single disconnect notification into `events`.
pub fn spawn_reader(
    connection: Arc<Connection>,
    mut reader: PacketReader<ReadHalf<Box<dyn SecureStream>>>,
    events: mpsc::Sender<ConnectionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match reader.read_packet().await {
                Ok(Some(packet)) => {
                    let event = ConnectionEvent::Packet {
                        connection: connection.clone(),
                        packet,
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    debug!(device_id = %connection.device_id(), "connection closed by peer");
                    break;
                }
                Err(err) => {
                    debug!(device_id = %connection.device_id(), error = %err, "connection read failed");
                    break;
                }
            }
        }
        let _ = events
            .send(ConnectionEvent::Disconnected { connection })
            .await;
    })
}

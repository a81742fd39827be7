//! Network plumbing: framing, the transport seam, reverse-TLS links,
//! per-peer connections, UDP/mDNS discovery and the TCP listener.

pub mod connection;
pub mod discovery;
pub mod framing;
pub mod link;
pub mod mdns;
pub mod server;
pub mod tls;
pub mod transport;

pub use connection::{spawn_reader, Connection, ConnectionEvent};
pub use link::{EstablishedLink, LinkLayer, SecureStream, HANDSHAKE_TIMEOUT};
pub use mdns::MdnsResponder;
pub use transport::{
    TcpTransport, TcpTransportProvider, Transport, TransportDescriptor, TransportProvider,
    DIAL_TIMEOUT, RFCOMM_SERVICE_UUID, TCP_PORT_MAX, TCP_PORT_MIN,
};

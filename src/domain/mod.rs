//! Domain models: the wire envelope, its well-known bodies, and the peer
//! records the engine tracks.

pub mod device;
pub mod packet;

pub use device::{DiscoveredDevice, PairedDeviceInfo};
pub use packet::{
    IdentityBody, Packet, PairBody, PingBody, SftpBody, PACKET_TYPE_IDENTITY, PACKET_TYPE_PAIR,
    PACKET_TYPE_PING, PACKET_TYPE_SFTP, PACKET_TYPE_SFTP_REQUEST, PROTOCOL_VERSION,
};

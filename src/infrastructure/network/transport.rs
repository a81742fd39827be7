//! Transport seam: a reliable, ordered, bi-directional byte stream.
//!
//! The link handshake is parameterized over this trait and assumes nothing
//! beyond ordered reliable bytes, so an RFCOMM driver can slot in next to
//! TCP without touching the handshake or the engine. Any per-channel
//! bookkeeping a driver needs lives inside its transport values; there is no
//! module-level registry.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{DaemonError, Result};

/// First and last TCP listen port the protocol allows.
pub const TCP_PORT_MIN: u16 = 1716;
pub const TCP_PORT_MAX: u16 = 1764;

/// SDP service UUID for the Bluetooth RFCOMM transport.
pub const RFCOMM_SERVICE_UUID: &str = "185f3df4-3268-4e3f-9fca-d4d5059915bd";

/// How long a dial may take before it is abandoned.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Opaque tag identifying the far end of a transport, used for logging and
/// for locating connections by remote IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportDescriptor {
    Tcp(SocketAddr),
    Rfcomm { address: String, channel: u8 },
}

impl TransportDescriptor {
    /// The remote IP, when the transport has one.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            TransportDescriptor::Tcp(addr) => Some(addr.ip()),
            TransportDescriptor::Rfcomm { .. } => None,
        }
    }
}

impl std::fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportDescriptor::Tcp(addr) => write!(f, "tcp/{addr}"),
            TransportDescriptor::Rfcomm { address, channel } => {
                write!(f, "rfcomm/{address}#{channel}")
            }
        }
    }
}

/// A reliable byte stream to one peer. Reading and writing come from the
/// tokio I/O traits; `shutdown` is the close operation.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    fn peer_descriptor(&self) -> TransportDescriptor;
}

/// Dialer seam so the engine can open transports without naming a concrete
/// driver.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn dial(&self, ip: IpAddr, port: u16) -> Result<Box<dyn Transport>>;
}

/// Plain TCP transport.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    descriptor: TransportDescriptor,
}

impl TcpTransport {
    /// Dial `ip:port` with the protocol's 5-second bound.
    pub async fn dial(ip: IpAddr, port: u16) -> Result<Self> {
        let addr = SocketAddr::new(ip, port);
        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| DaemonError::transport(format!("dial {addr} timed out")))?
            .map_err(|e| DaemonError::transport(format!("dial {addr}: {e}")))?;
        Ok(Self {
            stream,
            descriptor: TransportDescriptor::Tcp(addr),
        })
    }

    /// Wrap a freshly accepted socket.
    pub fn from_accepted(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            descriptor: TransportDescriptor::Tcp(peer),
        }
    }
}

impl Transport for TcpTransport {
    fn peer_descriptor(&self) -> TransportDescriptor {
        self.descriptor.clone()
    }
}

impl AsyncRead for TcpTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl Transport for Box<dyn Transport> {
    fn peer_descriptor(&self) -> TransportDescriptor {
        self.as_ref().peer_descriptor()
    }
}

/// Default provider: TCP only.
pub struct TcpTransportProvider;

#[async_trait]
impl TransportProvider for TcpTransportProvider {
    async fn dial(&self, ip: IpAddr, port: u16) -> Result<Box<dyn Transport>> {
        Ok(Box::new(TcpTransport::dial(ip, port).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_display_is_stable() {
        let tcp = TransportDescriptor::Tcp("10.0.0.2:1716".parse().unwrap());
        assert_eq!(tcp.to_string(), "tcp/10.0.0.2:1716");
        assert_eq!(tcp.ip().unwrap().to_string(), "10.0.0.2");

        let bt = TransportDescriptor::Rfcomm {
            address: "CC:08:FA:6F:69:FA".to_string(),
            channel: 3,
        };
        assert_eq!(bt.to_string(), "rfcomm/CC:08:FA:6F:69:FA#3");
        assert!(bt.ip().is_none());
    }

    #[tokio::test]
    async fn dial_to_closed_port_is_a_transport_error() {
        // Port 1 on localhost is essentially never listening.
        let err = TcpTransport::dial("127.0.0.1".parse().unwrap(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Transport(_)));
    }

    #[tokio::test]
    async fn dial_reaches_a_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let transport = TcpTransport::dial("127.0.0.1".parse().unwrap(), port)
            .await
            .unwrap();
        match transport.peer_descriptor() {
            TransportDescriptor::Tcp(addr) => assert_eq!(addr.port(), port),
            other => panic!("unexpected descriptor {other}"),
        }
    }
}

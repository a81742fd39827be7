//! Link establishment: the reverse-TLS handshake.
//!
//! The protocol swaps the usual TLS roles: whoever *opened* the transport
//! drives TLS as the **server**, and whoever *accepted* it drives TLS as the
//! **client**. Before the upgrade each side announces itself with one
//! cleartext identity packet; after the upgrade identities are exchanged
//! again inside the tunnel (peers speaking protocol version ≥ 8 re-announce,
//! older peers do not).

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

use super::framing::{write_packet, PacketReader};
use super::tls;
use super::transport::{Transport, TransportDescriptor};
use crate::domain::{IdentityBody, PACKET_TYPE_IDENTITY};
use crate::error::{DaemonError, Result};
use crate::infrastructure::security::Credentials;

/// Bound on the TLS negotiation itself; the transport dial has its own.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// SNI placeholder for transports without an IP (RFCOMM). The accept-any
/// verifier never looks at it.
const FALLBACK_SERVER_NAME: &str = "peer.kdeconnect.invalid";

/// Object-safe alias for the encrypted stream a link yields.
pub trait SecureStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SecureStream for T {}

/// Outcome of a successful handshake in either direction.
pub struct EstablishedLink {
    pub remote_identity: IdentityBody,
    pub peer_cert: CertificateDer<'static>,
    pub descriptor: TransportDescriptor,
    pub reader: PacketReader<ReadHalf<Box<dyn SecureStream>>>,
    pub writer: WriteHalf<Box<dyn SecureStream>>,
}

impl std::fmt::Debug for EstablishedLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EstablishedLink")
            .field("remote_identity", &self.remote_identity)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Holds the TLS material shared by every handshake.
pub struct LinkLayer {
    tls_server: std::sync::Arc<rustls::ServerConfig>,
    tls_client: std::sync::Arc<rustls::ClientConfig>,
}

impl LinkLayer {
    pub fn new(credentials: &Credentials) -> Result<Self> {
        Ok(Self {
            tls_server: tls::server_config(credentials)?,
            tls_client: tls::client_config(credentials)?,
        })
    }

    /// Handshake on a transport we opened: cleartext identity, then TLS in
    /// the **server** role, then identity exchange inside the tunnel.
    pub async fn connect_outbound<T>(
        &self,
        mut transport: T,
        local_identity: &IdentityBody,
    ) -> Result<EstablishedLink>
    where
        T: Transport + 'static,
    {
        let descriptor = transport.peer_descriptor();
        write_packet(&mut transport, &local_identity.to_packet()?).await?;

        let acceptor = TlsAcceptor::from(self.tls_server.clone());
        let stream = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(transport))
            .await
            .map_err(|_| DaemonError::handshake(format!("{descriptor}: tls handshake timed out")))?
            .map_err(|e| DaemonError::handshake(format!("{descriptor}: {e}")))?;
        let peer_cert = peer_certificate(stream.get_ref().1.peer_certificates(), &descriptor)?;

        let boxed: Box<dyn SecureStream> = Box::new(stream);
        let (read_half, mut writer) = tokio::io::split(boxed);

        write_packet(&mut writer, &local_identity.to_packet()?).await?;
        let mut reader = PacketReader::new(read_half);
        let remote_identity = read_identity(&mut reader).await?;
        debug!(peer = %descriptor, device_id = %remote_identity.device_id, "outbound link established");

        Ok(EstablishedLink {
            remote_identity,
            peer_cert,
            descriptor,
            reader,
            writer,
        })
    }

    /// Handshake on a transport we accepted: read the cleartext identity,
    /// then TLS in the **client** role layered over a reader that replays
    /// any bytes buffered past the first newline, then the secured exchange.
    pub async fn accept_inbound<T>(
        &self,
        transport: T,
        local_identity: &IdentityBody,
    ) -> Result<EstablishedLink>
    where
        T: Transport + 'static,
    {
        let descriptor = transport.peer_descriptor();

        let mut clear_reader = PacketReader::new(transport);
        let clear_identity = read_identity(&mut clear_reader).await?;
        let remote_version = clear_identity.protocol_version;
        let (transport, residual) = clear_reader.into_parts();

        let server_name = match descriptor.ip() {
            Some(ip) => ServerName::from(ip),
            None => ServerName::try_from(FALLBACK_SERVER_NAME)
                .expect("fallback server name is a valid dns name"),
        };
        let connector = TlsConnector::from(self.tls_client.clone());
        let replay = ReplayStream::new(residual, transport);
        let stream = timeout(HANDSHAKE_TIMEOUT, connector.connect(server_name, replay))
            .await
            .map_err(|_| DaemonError::handshake(format!("{descriptor}: tls handshake timed out")))?
            .map_err(|e| DaemonError::handshake(format!("{descriptor}: {e}")))?;
        let peer_cert = peer_certificate(stream.get_ref().1.peer_certificates(), &descriptor)?;

        let boxed: Box<dyn SecureStream> = Box::new(stream);
        let (read_half, mut writer) = tokio::io::split(boxed);

        write_packet(&mut writer, &local_identity.to_packet()?).await?;
        let mut reader = PacketReader::new(read_half);
        let remote_identity = if remote_version >= 8 {
            read_identity(&mut reader).await?
        } else {
            clear_identity
        };
        debug!(peer = %descriptor, device_id = %remote_identity.device_id, "inbound link established");

        Ok(EstablishedLink {
            remote_identity,
            peer_cert,
            descriptor,
            reader,
            writer,
        })
    }
}

fn peer_certificate(
    certs: Option<&[CertificateDer<'_>]>,
    descriptor: &TransportDescriptor,
) -> Result<CertificateDer<'static>> {
    certs
        .and_then(|chain| chain.first())
        .map(|cert| cert.clone().into_owned())
        .ok_or_else(|| DaemonError::handshake(format!("{descriptor}: peer presented no certificate")))
}

async fn read_identity<R: AsyncRead + Unpin>(
    reader: &mut PacketReader<R>,
) -> Result<IdentityBody> {
    let packet = reader
        .read_packet()
        .await
        .map_err(|e| DaemonError::identity(e.to_string()))?
        .ok_or_else(|| DaemonError::identity("stream closed before identity packet"))?;
    if packet.packet_type != PACKET_TYPE_IDENTITY {
        return Err(DaemonError::identity(format!(
            "expected identity packet, got {}",
            packet.packet_type
        )));
    }
    let identity: IdentityBody = packet
        .body_as()
        .map_err(|e| DaemonError::identity(e.to_string()))?;
    if identity.device_id.is_empty() {
        return Err(DaemonError::identity("identity carries no device id"));
    }
    Ok(identity)
}

/// Serves buffered bytes before falling through to the wrapped stream.
/// Needed on the inbound path: the cleartext identity read may have pulled
/// the first TLS record bytes into its buffer already.
struct ReplayStream<S> {
    residual: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> ReplayStream<S> {
    fn new(residual: Vec<u8>, inner: S) -> Self {
        Self {
            residual,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReplayStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.residual.len() {
            let remaining = &self.residual[self.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            self.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReplayStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

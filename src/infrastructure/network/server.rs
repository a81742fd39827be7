//! TCP listener: port selection in the protocol range and the accept loop
//! that runs the inbound handshake.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::link::{EstablishedLink, LinkLayer};
use super::transport::{TcpTransport, TCP_PORT_MAX, TCP_PORT_MIN};
use crate::domain::IdentityBody;
use crate::error::{DaemonError, Result};

/// Probe for a free port in the protocol range without holding it. Used at
/// first run to choose the port advertised in the identity.
pub fn probe_free_port() -> Result<u16> {
    for port in TCP_PORT_MIN..=TCP_PORT_MAX {
        if let Ok(listener) = std::net::TcpListener::bind(("0.0.0.0", port)) {
            drop(listener);
            return Ok(port);
        }
    }
    Err(DaemonError::transport(format!(
        "no free tcp port in {TCP_PORT_MIN}-{TCP_PORT_MAX}"
    )))
}

/// Bind the listener, preferring the previously advertised port but falling
/// back to the first free one in the range. Returns the listener and the
/// port actually bound, which the identity must be updated to match.
pub async fn bind_listener(preferred: u16) -> Result<(TcpListener, u16)> {
    let mut candidates = Vec::with_capacity((TCP_PORT_MAX - TCP_PORT_MIN + 2) as usize);
    if (TCP_PORT_MIN..=TCP_PORT_MAX).contains(&preferred) {
        candidates.push(preferred);
    }
    candidates.extend((TCP_PORT_MIN..=TCP_PORT_MAX).filter(|p| *p != preferred));

    for port in candidates {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => debug!(port, error = %e, "listen port unavailable"),
        }
    }
    Err(DaemonError::transport(format!(
        "no free tcp port in {TCP_PORT_MIN}-{TCP_PORT_MAX}"
    )))
}

/// Accept transports forever. Each accepted socket gets its own handshake
/// task; successfully established links are handed to the engine through
/// `links`. Accept errors are logged and retried after a short pause.
pub fn spawn_accept_loop<F>(
    listener: TcpListener,
    link_layer: Arc<LinkLayer>,
    identity_fn: F,
    links: mpsc::Sender<EstablishedLink>,
) -> JoinHandle<()>
where
    F: Fn() -> IdentityBody + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let identity_fn = Arc::new(identity_fn);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let link_layer = link_layer.clone();
                    let identity_fn = identity_fn.clone();
                    let links = links.clone();
                    tokio::spawn(async move {
                        let transport = TcpTransport::from_accepted(stream, peer);
                        let local_identity = identity_fn();
                        match link_layer.accept_inbound(transport, &local_identity).await {
                            Ok(link) => {
                                let _ = links.send(link).await;
                            }
                            Err(e) => {
                                debug!(%peer, error = %e, "inbound handshake failed");
                            }
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_falls_back_when_preferred_port_is_taken() {
        let (first, first_port) = bind_listener(TCP_PORT_MIN).await.unwrap();
        let (_second, second_port) = bind_listener(first_port).await.unwrap();
        assert_ne!(first_port, second_port);
        assert!((TCP_PORT_MIN..=TCP_PORT_MAX).contains(&second_port));
        drop(first);
    }

    #[test]
    fn probe_returns_port_in_range() {
        let port = probe_free_port().unwrap();
        assert!((TCP_PORT_MIN..=TCP_PORT_MAX).contains(&port));
    }
}

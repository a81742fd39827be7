//! Unified error type for the daemon.
//!
//! Every failure the core can surface maps onto one of these variants, so
//! callers (and the UI layer behind the event bus) can match on the kind
//! without parsing message strings.

use thiserror::Error;

/// Daemon-wide error type.
///
/// Per-connection errors terminate that connection only; the engine itself
/// keeps running. Discovery errors are logged and skipped at the call site
/// and normally never reach this type.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Dial, accept, read or write failure on a transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// TLS negotiation failure on either side of a link.
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Bytes that do not form a valid newline-delimited JSON packet.
    #[error("framing error: {0}")]
    Framing(String),

    /// A well-framed packet that is semantically wrong.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Missing or conflicting identity fields.
    #[error("identity error: {0}")]
    Identity(String),

    /// Pairing failures: not paired, pinned certificate mismatch.
    #[error("pair error: {0}")]
    Pair(String),

    /// A bounded wait elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Failure to load or store persistent state.
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl DaemonError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::Handshake(msg.into())
    }

    pub fn framing(msg: impl Into<String>) -> Self {
        Self::Framing(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity(msg.into())
    }

    pub fn pair(msg: impl Into<String>) -> Self {
        Self::Pair(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }
}

impl From<std::io::Error> for DaemonError {
    fn from(err: std::io::Error) -> Self {
        DaemonError::Transport(err.to_string())
    }
}

impl From<rustls::Error> for DaemonError {
    fn from(err: rustls::Error) -> Self {
        DaemonError::Handshake(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for DaemonError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DaemonError::Timeout("operation timed out".to_string())
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, DaemonError>;

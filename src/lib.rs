//! Peer implementation of the KDE Connect device-link protocol.
//!
//! The daemon announces itself over UDP broadcast and mDNS, accepts and
//! opens TCP links that upgrade to TLS with inverted roles (the TCP
//! initiator is the TLS server), negotiates persistent pairings pinned to
//! peer certificates, and exposes a packet bus for application plugins.

pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod utils;

pub use crate::core::{Engine, Event, EventBus, EventKind, SftpEndpoint};
pub use crate::error::{DaemonError, Result};

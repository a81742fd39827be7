//! Engine and event bus: the daemon's central state.

pub mod engine;
pub mod event_bus;

pub use engine::{Engine, SftpEndpoint};
pub use event_bus::{Event, EventBus, EventKind, ListenerId, Subscription};

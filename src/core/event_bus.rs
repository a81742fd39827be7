//! In-process event fan-out.
//!
//! The engine publishes tagged events; the UI (or any other collaborator)
//! subscribes per event kind. Listeners run on their own tokio task so a slow
//! subscriber can never stall the emitter, which also means delivery order
//! across listeners is unspecified.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};

use crate::domain::{DiscoveredDevice, IdentityBody, Packet};

/// Everything the core reports to the outside world.
#[derive(Debug, Clone)]
pub enum Event {
    DeviceDiscovered(DiscoveredDevice),
    /// A remote peer asked to pair; the verification key is what both users
    /// must compare out-of-band before accepting.
    PairRequest {
        remote_ip: IpAddr,
        identity: IdentityBody,
        verification_key: String,
    },
    /// A device entered or left the paired set.
    PairingChanged(String),
    /// A filesystem offer arrived from the named device.
    SftpOffer(String),
    /// Any packet type the core does not consume itself; plugin territory.
    Packet { device_id: String, packet: Packet },
}

/// Discriminant used for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DeviceDiscovered,
    PairRequest,
    PairingChanged,
    SftpOffer,
    Packet,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::DeviceDiscovered(_) => EventKind::DeviceDiscovered,
            Event::PairRequest { .. } => EventKind::PairRequest,
            Event::PairingChanged(_) => EventKind::PairingChanged,
            Event::SftpOffer(_) => EventKind::SftpOffer,
            Event::Packet { .. } => EventKind::Packet,
        }
    }
}

/// Token identifying one subscription, usable to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

type Listener = Arc<dyn Fn(Event) + Send + Sync>;

struct BusInner {
    listeners: RwLock<HashMap<EventKind, Vec<(ListenerId, Listener)>>>,
    next_listener_id: Mutex<usize>,
}

/// Cheaply cloneable handle to the shared listener registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(HashMap::new()),
                next_listener_id: Mutex::new(0),
            }),
        }
    }

    /// Subscribe to one event kind. The returned id is the only reliable way
    /// to remove the listener again.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let id = {
            let mut guard = self
                .inner
                .next_listener_id
                .lock()
                .expect("listener id counter poisoned");
            let id = ListenerId(*guard);
            *guard += 1;
            id
        };

        let mut listeners = self
            .inner
            .listeners
            .write()
            .expect("listener registry poisoned");
        listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener by token. Returns whether anything was removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .expect("listener registry poisoned");
        let mut found = false;
        for registered in listeners.values_mut() {
            let before = registered.len();
            registered.retain(|(listener_id, _)| *listener_id != id);
            found |= registered.len() < before;
        }
        found
    }

    /// Deliver an event to every listener of its kind, each on its own task.
    /// The registry lock is released before any listener runs.
    pub fn emit(&self, event: Event) {
        let targets: Vec<Listener> = {
            let listeners = self
                .inner
                .listeners
                .read()
                .expect("listener registry poisoned");
            listeners
                .get(&event.kind())
                .map(|registered| registered.iter().map(|(_, l)| l.clone()).collect())
                .unwrap_or_default()
        };

        for listener in targets {
            let event = event.clone();
            tokio::spawn(async move {
                listener(event);
            });
        }
    }

    /// Subscribe and keep the subscription alive for the guard's lifetime;
    /// used for internal one-shot waits (discovery, sftp offers).
    pub fn subscribe_guarded<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        Subscription {
            bus: self.clone(),
            id: self.on(kind, listener),
        }
    }
}

/// RAII subscription: dropping it unsubscribes.
pub struct Subscription {
    bus: EventBus,
    id: ListenerId,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.off(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pairing_changed(device_id: &str) -> Event {
        Event::PairingChanged(device_id.to_string())
    }

    async fn settle() {
        // Listeners run on spawned tasks; give them a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn emit_reaches_matching_listeners_only() {
        let bus = EventBus::new();
        let pairing_hits = Arc::new(AtomicUsize::new(0));
        let sftp_hits = Arc::new(AtomicUsize::new(0));

        let hits = pairing_hits.clone();
        bus.on(EventKind::PairingChanged, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let hits = sftp_hits.clone();
        bus.on(EventKind::SftpOffer, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(pairing_changed("dev-1"));
        settle().await;

        assert_eq!(pairing_hits.load(Ordering::SeqCst), 1);
        assert_eq!(sftp_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn off_removes_exactly_the_given_listener() {
        let bus = EventBus::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let hits = first.clone();
        let first_id = bus.on(EventKind::PairingChanged, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let hits = second.clone();
        bus.on(EventKind::PairingChanged, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.off(first_id));
        assert!(!bus.off(first_id));

        bus.emit(pairing_changed("dev-1"));
        settle().await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_listener_does_not_stall_emit() {
        let bus = EventBus::new();
        bus.on(EventKind::PairingChanged, |_| {
            std::thread::sleep(Duration::from_secs(2));
        });

        let started = std::time::Instant::now();
        bus.emit(pairing_changed("dev-1"));
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        {
            let hits = hits.clone();
            let _guard = bus.subscribe_guarded(EventKind::PairingChanged, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
            bus.emit(pairing_changed("dev-1"));
            settle().await;
        }

        bus.emit(pairing_changed("dev-1"));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

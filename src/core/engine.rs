//! The engine: central registry of discovered, paired and connected peers,
//! the pairing state machine, and packet dispatch.
//!
//! All peer maps live behind one readers-writer lock that is held only for
//! map access, never across I/O. Connections report packets and their single
//! disconnect through an mpsc channel consumed by one dispatch loop, which
//! keeps per-connection delivery ordered.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::event_bus::{Event, EventBus, EventKind};
use crate::config::Settings;
use crate::domain::packet::PROTOCOL_VERSION;
use crate::domain::{
    DiscoveredDevice, IdentityBody, Packet, PairBody, PairedDeviceInfo, PingBody, SftpBody,
    PACKET_TYPE_PAIR, PACKET_TYPE_PING, PACKET_TYPE_SFTP, PACKET_TYPE_SFTP_REQUEST,
};
use crate::error::{DaemonError, Result};
use crate::infrastructure::network::{
    discovery, server, spawn_reader, Connection, ConnectionEvent, EstablishedLink, LinkLayer,
    MdnsResponder, TcpTransportProvider, TransportProvider,
};
use crate::infrastructure::security::{
    cert_fingerprint, generate_device_id, spki_from_cert_der, verification_key, Credentials,
};
use crate::infrastructure::storage::ConfigStore;

/// How long a send to a paired-but-undiscovered peer waits for the peer to
/// show up before giving up.
const PAIRED_DISCOVERY_WAIT: Duration = Duration::from_secs(5);

/// How long a browse request waits for the remote's filesystem offer.
const SFTP_OFFER_WAIT: Duration = Duration::from_secs(10);

fn default_capabilities() -> std::collections::BTreeSet<String> {
    [
        "kdeconnect.ping",
        "kdeconnect.identity",
        "kdeconnect.pair",
        "kdeconnect.sftp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// SSH endpoint surfaced to the file-browser consumer after a successful
/// browse request. The core never dials it.
#[derive(Debug, Clone)]
pub struct SftpEndpoint {
    pub host: IpAddr,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub path: String,
    pub multi_paths: Vec<String>,
    pub path_names: Vec<String>,
}

struct EngineMaps {
    discovered: HashMap<String, DiscoveredDevice>,
    paired: HashMap<String, PairedDeviceInfo>,
    active: HashMap<String, Arc<Connection>>,
    pending_pairing: HashSet<String>,
    /// Paired devices whose live certificate contradicted the pin; treated
    /// as unpaired until the pin matches again or the user re-pairs.
    distrusted: HashSet<String>,
    sftp_offers: HashMap<String, SftpBody>,
}

struct EngineState {
    identity: Arc<RwLock<IdentityBody>>,
    credentials: Credentials,
    link: Arc<LinkLayer>,
    provider: Arc<dyn TransportProvider>,
    events: EventBus,
    store: ConfigStore,
    maps: RwLock<EngineMaps>,
    conn_events: mpsc::Sender<ConnectionEvent>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    mdns: StdMutex<Option<MdnsResponder>>,
}

/// Cheaply cloneable handle to the daemon core.
#[derive(Clone)]
pub struct Engine {
    state: Arc<EngineState>,
}

impl Engine {
    /// Load persisted identity and credentials, or mint a fresh installation
    /// when either is missing. Must be called inside a tokio runtime (the
    /// dispatch loop is spawned here).
    pub fn load_or_create(settings: Settings, store: ConfigStore) -> Result<Engine> {
        let loaded = match store.load_config() {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable config");
                None
            }
        };
        let credentials_loaded = match store.load_credentials() {
            Ok(creds) => creds,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable credentials");
                None
            }
        };

        let (identity, paired, credentials) = match (loaded, credentials_loaded) {
            (Some(config), Some(credentials)) => {
                let mut identity = config.identity;
                if identity.device_name != settings.device_name {
                    identity.device_name = settings.device_name.clone();
                    if let Err(e) = store.save_config(&identity, &config.paired_devices) {
                        warn!(error = %e, "config persist failed");
                    }
                }
                (identity, config.paired_devices, credentials)
            }
            _ => {
                let device_id = generate_device_id();
                let credentials = Credentials::generate(&device_id)?;
                let identity = IdentityBody {
                    device_id,
                    device_name: settings.device_name.clone(),
                    device_type: settings.device_type.clone(),
                    protocol_version: PROTOCOL_VERSION,
                    tcp_port: server::probe_free_port()?,
                    bluetooth_address: None,
                    incoming_capabilities: default_capabilities(),
                    outgoing_capabilities: default_capabilities(),
                };
                store.save_credentials(&credentials)?;
                if let Err(e) = store.save_config(&identity, &HashMap::new()) {
                    warn!(error = %e, "config persist failed");
                }
                info!(device_id = %identity.device_id, "created new installation identity");
                (identity, HashMap::new(), credentials)
            }
        };

        let link = Arc::new(LinkLayer::new(&credentials)?);
        let (conn_events, conn_events_rx) = mpsc::channel(64);

        let state = Arc::new(EngineState {
            identity: Arc::new(RwLock::new(identity)),
            credentials,
            link,
            provider: Arc::new(TcpTransportProvider),
            events: EventBus::new(),
            store,
            maps: RwLock::new(EngineMaps {
                discovered: HashMap::new(),
                paired,
                active: HashMap::new(),
                pending_pairing: HashSet::new(),
                distrusted: HashSet::new(),
                sftp_offers: HashMap::new(),
            }),
            conn_events,
            tasks: StdMutex::new(Vec::new()),
            mdns: StdMutex::new(None),
        });

        let dispatch = tokio::spawn(EngineState::run_dispatch_loop(
            Arc::downgrade(&state),
            conn_events_rx,
        ));
        state.tasks.lock().expect("task list poisoned").push(dispatch);

        Ok(Engine { state })
    }

    /// Event surface for the UI and plugins.
    pub fn events(&self) -> &EventBus {
        &self.state.events
    }

    pub fn identity(&self) -> IdentityBody {
        self.state.identity.read().expect("identity poisoned").clone()
    }

    /// Bring up the listener, discovery and mDNS presence.
    pub async fn start(&self) -> Result<()> {
        let state = &self.state;

        // The listener decides the advertised port, so it comes first.
        let preferred = state.identity.read().expect("identity poisoned").tcp_port;
        let (listener, port) = server::bind_listener(preferred).await?;
        if port != preferred {
            state
                .identity
                .write()
                .expect("identity poisoned")
                .tcp_port = port;
            state.persist();
        }

        let mut tasks = Vec::new();

        // Inbound links: handshake results flow from the accept loop into
        // the engine through this channel.
        let (links_tx, mut links_rx) = mpsc::channel::<EstablishedLink>(16);
        let weak = Arc::downgrade(state);
        tasks.push(tokio::spawn(async move {
            while let Some(established) = links_rx.recv().await {
                let Some(state) = weak.upgrade() else { return };
                state.handle_inbound_link(established);
            }
        }));
        let identity = state.identity.clone();
        tasks.push(server::spawn_accept_loop(
            listener,
            state.link.clone(),
            move || identity.read().expect("identity poisoned").clone(),
            links_tx,
        ));

        // UDP announcements in.
        match discovery::bind_announcement_socket().await {
            Ok(socket) => {
                let (announce_tx, mut announce_rx) =
                    mpsc::channel::<(IdentityBody, SocketAddr)>(64);
                let local_id = state.identity.read().expect("identity poisoned").device_id.clone();
                tasks.push(tokio::spawn(async move {
                    let _ = discovery::run_listen_loop(socket, local_id, announce_tx).await;
                }));
                let weak = Arc::downgrade(state);
                tasks.push(tokio::spawn(async move {
                    while let Some((identity, addr)) = announce_rx.recv().await {
                        let Some(state) = weak.upgrade() else { return };
                        state.handle_discovery(identity, addr);
                    }
                }));
            }
            Err(e) => {
                warn!(error = %e, "announcement listener unavailable, discovery is send-only");
            }
        }

        // UDP announcements out.
        let identity = state.identity.clone();
        tasks.push(tokio::spawn(async move {
            let _ = discovery::run_broadcast_loop(move || {
                identity.read().expect("identity poisoned").clone()
            })
            .await;
        }));

        // mDNS presence for peers that browse instead of listening.
        let snapshot = state.identity.read().expect("identity poisoned").clone();
        match MdnsResponder::register(&snapshot) {
            Ok(responder) => {
                *state.mdns.lock().expect("mdns slot poisoned") = Some(responder);
            }
            Err(e) => warn!(error = %e, "mdns registration failed"),
        }

        state
            .tasks
            .lock()
            .expect("task list poisoned")
            .extend(tasks);
        info!(
            device_id = %snapshot.device_id,
            port,
            "engine started"
        );
        Ok(())
    }

    /// Stop background work and close every connection.
    pub async fn shutdown(&self) {
        if let Some(responder) = self.state.mdns.lock().expect("mdns slot poisoned").take() {
            responder.shutdown();
        }
        for task in self
            .state
            .tasks
            .lock()
            .expect("task list poisoned")
            .drain(..)
        {
            task.abort();
        }
        let connections: Vec<Arc<Connection>> = {
            let mut maps = self.state.maps.write().expect("engine maps poisoned");
            maps.active.drain().map(|(_, conn)| conn).collect()
        };
        for connection in connections {
            connection.close().await;
        }
        info!("engine stopped");
    }

    /// Record an announcement from the network (or a synthesized one).
    pub fn handle_discovery(&self, identity: IdentityBody, addr: SocketAddr) {
        self.state.handle_discovery(identity, addr);
    }

    /// Register a device the user typed in by hand, making it addressable
    /// exactly like a discovered one.
    pub fn add_device_manual(&self, identity: IdentityBody, ip: IpAddr, port: u16) {
        let device = DiscoveredDevice::new(identity, SocketAddr::new(ip, port));
        {
            let mut maps = self.state.maps.write().expect("engine maps poisoned");
            maps.discovered
                .insert(device.identity.device_id.clone(), device.clone());
        }
        self.state.events.emit(Event::DeviceDiscovered(device));
    }

    /// Send a packet, building a connection on demand when none is active.
    pub async fn send_packet<B: Serialize>(
        &self,
        device_id: &str,
        packet_type: &str,
        body: &B,
    ) -> Result<()> {
        let connection = self.state.get_or_connect(device_id).await?;
        connection.send_packet(packet_type, body).await
    }

    pub async fn send_ping(&self, device_id: &str, message: Option<String>) -> Result<()> {
        self.send_packet(device_id, PACKET_TYPE_PING, &PingBody { message })
            .await
    }

    /// Start pairing with a device: flag it as pending and send the request.
    /// The pairing completes when the peer answers `pair=true`.
    pub async fn pair(&self, device_id: &str) -> Result<()> {
        {
            let mut maps = self.state.maps.write().expect("engine maps poisoned");
            maps.pending_pairing.insert(device_id.to_string());
        }
        let body = PairBody {
            pair: true,
            timestamp: Some(Utc::now().timestamp()),
        };
        match self.send_packet(device_id, PACKET_TYPE_PAIR, &body).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut maps = self.state.maps.write().expect("engine maps poisoned");
                maps.pending_pairing.remove(device_id);
                Err(e)
            }
        }
    }

    /// Forget a pairing. A no-op for devices that were never paired. The
    /// notification to the peer is best-effort.
    pub async fn unpair(&self, device_id: &str) -> Result<()> {
        let removed = {
            let mut maps = self.state.maps.write().expect("engine maps poisoned");
            maps.pending_pairing.remove(device_id);
            maps.distrusted.remove(device_id);
            maps.paired.remove(device_id).is_some()
        };
        if !removed {
            return Ok(());
        }
        self.state.persist();
        self.state
            .events
            .emit(Event::PairingChanged(device_id.to_string()));

        let body = PairBody {
            pair: false,
            timestamp: Some(Utc::now().timestamp()),
        };
        if let Err(e) = self.send_packet(device_id, PACKET_TYPE_PAIR, &body).await {
            debug!(device_id, error = %e, "could not deliver unpair notification");
        }
        Ok(())
    }

    /// Accept the pair request received from `remote_ip`: confirm to the
    /// peer and pin its certificate.
    pub async fn accept_pair(&self, remote_ip: IpAddr) -> Result<()> {
        let connection = {
            let maps = self.state.maps.read().expect("engine maps poisoned");
            maps.active
                .values()
                .find(|conn| conn.peer_ip() == Some(remote_ip))
                .cloned()
        }
        .ok_or_else(|| DaemonError::pair(format!("no active connection from {remote_ip}")))?;

        connection
            .send_packet(
                PACKET_TYPE_PAIR,
                &PairBody {
                    pair: true,
                    timestamp: Some(Utc::now().timestamp()),
                },
            )
            .await?;
        self.state.mark_as_paired(&connection);
        Ok(())
    }

    pub fn get_paired(&self) -> Vec<PairedDeviceInfo> {
        let maps = self.state.maps.read().expect("engine maps poisoned");
        maps.paired.values().cloned().collect()
    }

    /// Paired *and* currently trusted: a live certificate that contradicted
    /// the pin downgrades the device for the session.
    pub fn is_paired(&self, device_id: &str) -> bool {
        let maps = self.state.maps.read().expect("engine maps poisoned");
        maps.paired.contains_key(device_id) && !maps.distrusted.contains(device_id)
    }

    pub fn is_discovered(&self, device_id: &str) -> bool {
        let maps = self.state.maps.read().expect("engine maps poisoned");
        maps.discovered.contains_key(device_id)
    }

    /// Hand over the stored filesystem offer, if any. Offers are single-use:
    /// the handover removes it, and the next browse needs a fresh offer.
    pub fn get_sftp_offer(&self, device_id: &str) -> Option<SftpBody> {
        let mut maps = self.state.maps.write().expect("engine maps poisoned");
        maps.sftp_offers.remove(device_id)
    }

    /// Ask the device to start browsing and wait for its SSH endpoint.
    pub async fn request_sftp(&self, device_id: &str) -> Result<SftpEndpoint> {
        let host = self.resolve_sftp_host(device_id).await?;

        // Subscribe before checking the cache so an offer racing in between
        // is not lost.
        let (offer_tx, mut offer_rx) = mpsc::channel::<()>(1);
        let wanted = device_id.to_string();
        let _subscription = self
            .state
            .events
            .subscribe_guarded(EventKind::SftpOffer, move |event| {
                if let Event::SftpOffer(id) = event {
                    if id == wanted {
                        let _ = offer_tx.try_send(());
                    }
                }
            });

        if let Some(offer) = self.get_sftp_offer(device_id) {
            return endpoint_from_offer(host, offer);
        }

        self.send_packet(
            device_id,
            PACKET_TYPE_SFTP_REQUEST,
            &SftpBody {
                start_browsing: true,
                ..SftpBody::default()
            },
        )
        .await?;

        let _ = timeout(SFTP_OFFER_WAIT, offer_rx.recv())
            .await
            .map_err(|_| DaemonError::timeout("no sftp offer arrived"))?;
        let offer = self
            .get_sftp_offer(device_id)
            .ok_or_else(|| DaemonError::protocol("sftp offer vanished before handover"))?;
        endpoint_from_offer(host, offer)
    }

    async fn resolve_sftp_host(&self, device_id: &str) -> Result<IpAddr> {
        if let Some(host) = self.state.known_address(device_id) {
            return Ok(host);
        }
        if !self.is_paired(device_id) {
            return Err(DaemonError::pair(format!(
                "device {device_id} is neither discovered nor paired"
            )));
        }

        // Paired but silent: give discovery a moment to find it.
        let (found_tx, mut found_rx) = mpsc::channel::<IpAddr>(1);
        let wanted = device_id.to_string();
        let _subscription =
            self.state
                .events
                .subscribe_guarded(EventKind::DeviceDiscovered, move |event| {
                    if let Event::DeviceDiscovered(device) = event {
                        if device.identity.device_id == wanted {
                            let _ = found_tx.try_send(device.last_addr.ip());
                        }
                    }
                });
        if let Some(host) = self.state.known_address(device_id) {
            return Ok(host);
        }
        timeout(PAIRED_DISCOVERY_WAIT, found_rx.recv())
            .await
            .map_err(|_| DaemonError::timeout(format!("device {device_id} was not discovered")))?
            .ok_or_else(|| DaemonError::timeout(format!("device {device_id} was not discovered")))
    }
}

impl EngineState {
    async fn run_dispatch_loop(
        state: Weak<EngineState>,
        mut events: mpsc::Receiver<ConnectionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(state) = state.upgrade() else { return };
            match event {
                ConnectionEvent::Packet { connection, packet } => {
                    state.handle_packet(connection, packet);
                }
                ConnectionEvent::Disconnected { connection } => {
                    state.remove_connection(&connection);
                }
            }
        }
    }

    fn handle_discovery(&self, identity: IdentityBody, addr: SocketAddr) {
        let device = DiscoveredDevice::new(identity, addr);
        let roamed = {
            let mut maps = self.maps.write().expect("engine maps poisoned");
            let roamed = match maps.paired.get_mut(&device.identity.device_id) {
                Some(record) => roaming_update(record, &device.identity, addr),
                None => false,
            };
            maps.discovered
                .insert(device.identity.device_id.clone(), device.clone());
            roamed
        };
        if roamed {
            self.persist();
        }
        self.events.emit(Event::DeviceDiscovered(device));
    }

    /// Register a connection produced by the inbound accept path, then
    /// synthesize a discovery record so callers can address the peer even
    /// without a UDP or mDNS sighting.
    fn handle_inbound_link(&self, link: EstablishedLink) {
        let connection = self.adopt_link(link);
        if let Some(ip) = connection.peer_ip() {
            let addr = SocketAddr::new(ip, connection.remote_identity().tcp_port);
            self.handle_discovery(connection.remote_identity().clone(), addr);
        }
    }

    /// Wrap an established link in a connection, enforce the pin, register
    /// it (replacing any older connection for the device) and start its
    /// reader.
    fn adopt_link(&self, link: EstablishedLink) -> Arc<Connection> {
        let (connection, reader) = Connection::from_link(link);
        let device_id = connection.device_id().to_string();
        let fingerprint = cert_fingerprint(connection.peer_cert().as_ref());

        let mut newly_distrusted = false;
        let mut pin_backfilled = false;
        {
            let mut maps = self.maps.write().expect("engine maps poisoned");
            if let Some(record) = maps.paired.get_mut(&device_id) {
                match &record.cert_sha256 {
                    Some(pinned) if *pinned != fingerprint => {
                        newly_distrusted = maps.distrusted.insert(device_id.clone());
                    }
                    Some(_) => {
                        maps.distrusted.remove(&device_id);
                    }
                    None => {
                        // Record migrated from before pinning existed; adopt
                        // the live certificate as the pin.
                        record.cert_sha256 = Some(fingerprint.clone());
                        pin_backfilled = true;
                    }
                }
            }
            maps.active.insert(device_id.clone(), connection.clone());
        }

        if pin_backfilled {
            self.persist();
        }
        if newly_distrusted {
            warn!(
                device_id = %device_id,
                fingerprint = %fingerprint,
                "certificate differs from pinned fingerprint, treating device as unpaired"
            );
            self.events.emit(Event::PairingChanged(device_id.clone()));
        }

        debug!(device_id = %device_id, peer = %connection.peer_descriptor(), "connection registered");
        spawn_reader(connection.clone(), reader, self.conn_events.clone());
        connection
    }

    /// Remove the connection, but only if it is still the registered one;
    /// a replaced connection's late disconnect must not evict its successor.
    fn remove_connection(&self, connection: &Arc<Connection>) {
        let mut maps = self.maps.write().expect("engine maps poisoned");
        if let Some(current) = maps.active.get(connection.device_id()) {
            if Arc::ptr_eq(current, connection) {
                maps.active.remove(connection.device_id());
                debug!(device_id = %connection.device_id(), "connection removed");
            }
        }
    }

    fn handle_packet(&self, connection: Arc<Connection>, packet: Packet) {
        debug!(
            device_id = %connection.device_id(),
            packet_type = %packet.packet_type,
            "packet received"
        );
        match packet.packet_type.as_str() {
            PACKET_TYPE_PAIR => self.handle_pair_packet(connection, &packet),
            PACKET_TYPE_PING => {
                tokio::spawn(async move {
                    if let Err(e) = connection
                        .send_packet(PACKET_TYPE_PING, &PingBody::default())
                        .await
                    {
                        debug!(error = %e, "ping reply failed");
                    }
                });
            }
            PACKET_TYPE_SFTP => {
                let Ok(body) = packet.body_as::<SftpBody>() else {
                    debug!("discarding malformed sftp body");
                    return;
                };
                if body.port == 0 {
                    return;
                }
                let device_id = connection.device_id().to_string();
                {
                    let mut maps = self.maps.write().expect("engine maps poisoned");
                    maps.sftp_offers.insert(device_id.clone(), body);
                }
                self.events.emit(Event::SftpOffer(device_id));
            }
            _ => {
                self.events.emit(Event::Packet {
                    device_id: connection.device_id().to_string(),
                    packet,
                });
            }
        }
    }

    fn handle_pair_packet(&self, connection: Arc<Connection>, packet: &Packet) {
        let Ok(body) = packet.body_as::<PairBody>() else {
            debug!("discarding malformed pair body");
            return;
        };
        let device_id = connection.device_id().to_string();

        if !body.pair {
            debug!(device_id = %device_id, "peer requested unpair");
            self.unpair_local(&device_id);
            return;
        }

        let was_pending = {
            let mut maps = self.maps.write().expect("engine maps poisoned");
            maps.pending_pairing.remove(&device_id)
        };
        if was_pending {
            // We initiated; the peer's affirmative completes the pairing
            // without any dialog.
            self.mark_as_paired(&connection);
            return;
        }

        let trusted = {
            let maps = self.maps.read().expect("engine maps poisoned");
            maps.paired.contains_key(&device_id) && !maps.distrusted.contains(&device_id)
        };
        if trusted {
            // Already paired and the certificate checks out; just confirm.
            tokio::spawn(async move {
                let body = PairBody {
                    pair: true,
                    timestamp: Some(Utc::now().timestamp()),
                };
                if let Err(e) = connection.send_packet(PACKET_TYPE_PAIR, &body).await {
                    debug!(error = %e, "pair re-acknowledgement failed");
                }
            });
            return;
        }

        // Remote-initiated: surface the request and the verification key.
        let verification = match spki_from_cert_der(connection.peer_cert().as_ref()) {
            Ok(remote_spki) => verification_key(
                self.credentials.spki(),
                &remote_spki,
                body.timestamp.unwrap_or_default(),
            ),
            Err(e) => {
                warn!(error = %e, "cannot derive verification key");
                String::new()
            }
        };
        self.ensure_discovered(&connection);
        let Some(remote_ip) = connection.peer_ip() else {
            warn!(device_id = %device_id, "pair request over transport without an address");
            return;
        };
        self.events.emit(Event::PairRequest {
            remote_ip,
            identity: connection.remote_identity().clone(),
            verification_key: verification,
        });
    }

    /// Record the pairing for the connection's device: identity snapshot,
    /// last known address, and the certificate pin.
    fn mark_as_paired(&self, connection: &Arc<Connection>) {
        let device_id = connection.device_id().to_string();
        let fingerprint = cert_fingerprint(connection.peer_cert().as_ref());
        {
            let mut maps = self.maps.write().expect("engine maps poisoned");
            let record = match maps.discovered.get(&device_id) {
                Some(device) => PairedDeviceInfo {
                    identity: device.identity.clone(),
                    last_ip: device.last_addr.ip().to_string(),
                    last_port: device.identity.tcp_port,
                    cert_sha256: Some(fingerprint),
                },
                None => PairedDeviceInfo {
                    identity: connection.remote_identity().clone(),
                    last_ip: connection
                        .peer_ip()
                        .map(|ip| ip.to_string())
                        .unwrap_or_default(),
                    last_port: connection.remote_identity().tcp_port,
                    cert_sha256: Some(fingerprint),
                },
            };
            maps.distrusted.remove(&device_id);
            maps.paired.insert(device_id.clone(), record);
        }
        self.persist();
        info!(device_id = %device_id, "device paired");
        self.events.emit(Event::PairingChanged(device_id));
    }

    /// Drop the pairing without notifying the peer (used when the peer is
    /// the one unpairing). No-op when not paired.
    fn unpair_local(&self, device_id: &str) {
        let removed = {
            let mut maps = self.maps.write().expect("engine maps poisoned");
            maps.pending_pairing.remove(device_id);
            maps.distrusted.remove(device_id);
            maps.paired.remove(device_id).is_some()
        };
        if !removed {
            return;
        }
        self.persist();
        self.events
            .emit(Event::PairingChanged(device_id.to_string()));
    }

    /// Make sure the connection's peer exists in the discovered map, so a
    /// subsequent accept can address it.
    fn ensure_discovered(&self, connection: &Arc<Connection>) {
        let known = {
            let maps = self.maps.read().expect("engine maps poisoned");
            maps.discovered.contains_key(connection.device_id())
        };
        if known {
            return;
        }
        if let Some(ip) = connection.peer_ip() {
            let addr = SocketAddr::new(ip, connection.remote_identity().tcp_port);
            self.handle_discovery(connection.remote_identity().clone(), addr);
        }
    }

    async fn get_or_connect(&self, device_id: &str) -> Result<Arc<Connection>> {
        if let Some(connection) = {
            let maps = self.maps.read().expect("engine maps poisoned");
            maps.active.get(device_id).cloned()
        } {
            return Ok(connection);
        }

        let (ip, port) = {
            let maps = self.maps.read().expect("engine maps poisoned");
            if let Some(device) = maps.discovered.get(device_id) {
                (device.last_addr.ip(), device.identity.tcp_port)
            } else if let Some(record) = maps.paired.get(device_id) {
                let ip: IpAddr = record.last_ip.parse().map_err(|_| {
                    DaemonError::transport(format!("device {device_id} has no known address"))
                })?;
                if record.last_port == 0 {
                    return Err(DaemonError::transport(format!(
                        "device {device_id} has no known port"
                    )));
                }
                (ip, record.last_port)
            } else {
                return Err(DaemonError::transport(format!(
                    "device {device_id} is neither discovered nor paired"
                )));
            }
        };

        let transport = self.provider.dial(ip, port).await?;
        let local_identity = self.identity.read().expect("identity poisoned").clone();
        let link = self.link.connect_outbound(transport, &local_identity).await?;
        Ok(self.adopt_link(link))
    }

    fn known_address(&self, device_id: &str) -> Option<IpAddr> {
        let maps = self.maps.read().expect("engine maps poisoned");
        if let Some(device) = maps.discovered.get(device_id) {
            return Some(device.last_addr.ip());
        }
        maps.paired
            .get(device_id)
            .and_then(|record| record.last_ip.parse().ok())
    }

    /// Write identity + paired map to disk. Failures are logged, never
    /// raised: losing a roaming update is preferable to killing dispatch.
    fn persist(&self) {
        let identity = self.identity.read().expect("identity poisoned").clone();
        let paired = {
            let maps = self.maps.read().expect("engine maps poisoned");
            maps.paired.clone()
        };
        if let Err(e) = self.store.save_config(&identity, &paired) {
            warn!(error = %e, "config persist failed");
        }
    }
}

fn endpoint_from_offer(host: IpAddr, offer: SftpBody) -> Result<SftpEndpoint> {
    if !offer.error_message.is_empty() {
        return Err(DaemonError::protocol(format!(
            "remote error: {}",
            offer.error_message
        )));
    }
    if offer.port == 0 {
        return Err(DaemonError::protocol("sftp offer carries no port"));
    }
    Ok(SftpEndpoint {
        host,
        port: offer.port,
        user: offer.user,
        password: offer.password,
        path: offer.path,
        multi_paths: offer.multi_paths,
        path_names: offer.path_names,
    })
}

/// Fold a fresh announcement into a paired record. Returns whether the
/// record changed and therefore must be persisted.
fn roaming_update(
    record: &mut PairedDeviceInfo,
    identity: &IdentityBody,
    addr: SocketAddr,
) -> bool {
    let new_ip = addr.ip().to_string();
    if record.last_ip == new_ip
        && record.last_port == identity.tcp_port
        && record.identity.device_name == identity.device_name
    {
        return false;
    }
    record.last_ip = new_ip;
    record.last_port = identity.tcp_port;
    record.identity = identity.clone();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::framing::{write_packet, PacketReader};
    use crate::infrastructure::network::link::SecureStream;
    use crate::infrastructure::network::TransportDescriptor;
    use std::sync::OnceLock;
    use tempfile::TempDir;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    fn local_credentials() -> &'static Credentials {
        static CREDS: OnceLock<Credentials> = OnceLock::new();
        CREDS.get_or_init(|| Credentials::generate("fyne-test-local").expect("local credentials"))
    }

    fn remote_credentials() -> &'static Credentials {
        static CREDS: OnceLock<Credentials> = OnceLock::new();
        CREDS.get_or_init(|| Credentials::generate("fyne-test-remote").expect("remote credentials"))
    }

    fn identity(device_id: &str, name: &str) -> IdentityBody {
        IdentityBody {
            device_id: device_id.to_string(),
            device_name: name.to_string(),
            device_type: "desktop".to_string(),
            protocol_version: PROTOCOL_VERSION,
            tcp_port: 1716,
            bluetooth_address: None,
            incoming_capabilities: default_capabilities(),
            outgoing_capabilities: default_capabilities(),
        }
    }

    fn test_engine() -> (Engine, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        store.save_credentials(local_credentials()).unwrap();
        store
            .save_config(&identity("fyne-test-local", "local box"), &HashMap::new())
            .unwrap();

        let settings = Settings {
            device_name: "local box".to_string(),
            device_type: "desktop".to_string(),
        };
        let engine = Engine::load_or_create(settings, ConfigStore::new(dir.path())).unwrap();
        (engine, dir)
    }

    /// The far side of a fabricated link: write packets at the engine, read
    /// what it sends back.
    struct FarEnd {
        reader: PacketReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FarEnd {
        async fn send(&mut self, packet: &Packet) {
            write_packet(&mut self.writer, packet).await.unwrap();
        }

        async fn recv(&mut self) -> Packet {
            timeout(Duration::from_secs(2), self.reader.read_packet())
                .await
                .expect("timed out waiting for engine packet")
                .unwrap()
                .expect("engine closed the stream")
        }
    }

    /// Build a fake established link for `remote` as if the handshake had
    /// already happened, and register it with the engine.
    fn attach_fake_link(engine: &Engine, remote: &IdentityBody, addr: &str) -> (Arc<Connection>, FarEnd) {
        let (near, far) = tokio::io::duplex(16 * 1024);
        let boxed: Box<dyn SecureStream> = Box::new(near);
        let (read_half, writer) = tokio::io::split(boxed);

        let link = EstablishedLink {
            remote_identity: remote.clone(),
            peer_cert: remote_credentials().cert_der(),
            descriptor: TransportDescriptor::Tcp(addr.parse().unwrap()),
            reader: PacketReader::new(read_half),
            writer,
        };
        let connection = engine.state.adopt_link(link);

        let (far_read, far_write) = tokio::io::split(far);
        (
            connection,
            FarEnd {
                reader: PacketReader::new(far_read),
                writer: far_write,
            },
        )
    }

    fn pair_packet(pair: bool, timestamp: i64) -> Packet {
        Packet::from_body(
            PACKET_TYPE_PAIR,
            &PairBody {
                pair,
                timestamp: Some(timestamp),
            },
        )
        .unwrap()
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !predicate() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Collect events of one kind into a shared list.
    fn record_events(engine: &Engine, kind: EventKind) -> Arc<StdMutex<Vec<Event>>> {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = log.clone();
        engine.events().on(kind, move |event| {
            sink.lock().unwrap().push(event);
        });
        log
    }

    #[tokio::test]
    async fn locally_initiated_pair_completes_on_affirmative_reply() {
        let (engine, dir) = test_engine();
        let remote = identity("fyne-test-remote", "phone");
        let (_conn, mut far) = attach_fake_link(&engine, &remote, "10.0.0.2:1716");

        let pair_requests = record_events(&engine, EventKind::PairRequest);
        let pairing_changes = record_events(&engine, EventKind::PairingChanged);

        engine.pair("fyne-test-remote").await.unwrap();
        let sent = far.recv().await;
        assert_eq!(sent.packet_type, PACKET_TYPE_PAIR);
        let body: PairBody = sent.body_as().unwrap();
        assert!(body.pair);
        assert!(body.timestamp.is_some());
        {
            let maps = engine.state.maps.read().unwrap();
            assert!(maps.pending_pairing.contains("fyne-test-remote"));
        }

        far.send(&pair_packet(true, 1_700_000_000)).await;
        wait_until("pairing to complete", || engine.is_paired("fyne-test-remote")).await;

        {
            let maps = engine.state.maps.read().unwrap();
            assert!(!maps.pending_pairing.contains("fyne-test-remote"));
        }
        wait_until("pairing_changed event", || {
            !pairing_changes.lock().unwrap().is_empty()
        })
        .await;
        assert!(pair_requests.lock().unwrap().is_empty());

        // Pairing is persisted, including the pinned fingerprint.
        let stored = ConfigStore::new(dir.path()).load_config().unwrap().unwrap();
        let record = &stored.paired_devices["fyne-test-remote"];
        assert_eq!(record.last_ip, "10.0.0.2");
        assert_eq!(
            record.cert_sha256.as_deref().unwrap(),
            remote_credentials().fingerprint()
        );
    }

    #[tokio::test]
    async fn remotely_initiated_pair_surfaces_request_and_accept_confirms() {
        let (engine, _dir) = test_engine();
        let remote = identity("fyne-test-remote", "phone");
        let (_conn, mut far) = attach_fake_link(&engine, &remote, "10.0.0.2:1716");

        let pair_requests = record_events(&engine, EventKind::PairRequest);

        far.send(&pair_packet(true, 1_700_000_000)).await;
        wait_until("pair_request event", || {
            !pair_requests.lock().unwrap().is_empty()
        })
        .await;
        assert!(!engine.is_paired("fyne-test-remote"));

        let (remote_ip, key) = match &pair_requests.lock().unwrap()[0] {
            Event::PairRequest {
                remote_ip,
                verification_key,
                identity,
            } => {
                assert_eq!(identity.device_id, "fyne-test-remote");
                (*remote_ip, verification_key.clone())
            }
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(remote_ip.to_string(), "10.0.0.2");
        assert_eq!(key.len(), 8);
        // Symmetric derivation: the remote would compute the same code.
        assert_eq!(
            key,
            verification_key(
                remote_credentials().spki(),
                local_credentials().spki(),
                1_700_000_000
            )
        );

        engine.accept_pair(remote_ip).await.unwrap();
        let confirmation = far.recv().await;
        assert_eq!(confirmation.packet_type, PACKET_TYPE_PAIR);
        assert!(confirmation.body_as::<PairBody>().unwrap().pair);
        assert!(engine.is_paired("fyne-test-remote"));
    }

    #[tokio::test]
    async fn unpair_of_unknown_device_is_a_quiet_no_op() {
        let (engine, _dir) = test_engine();
        let pairing_changes = record_events(&engine, EventKind::PairingChanged);

        engine.unpair("never-seen").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pairing_changes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn remote_unpair_drops_the_pairing() {
        let (engine, _dir) = test_engine();
        let remote = identity("fyne-test-remote", "phone");
        let (conn, mut far) = attach_fake_link(&engine, &remote, "10.0.0.2:1716");
        engine.state.mark_as_paired(&conn);
        assert!(engine.is_paired("fyne-test-remote"));

        far.send(
            &Packet::from_body(
                PACKET_TYPE_PAIR,
                &PairBody {
                    pair: false,
                    timestamp: None,
                },
            )
            .unwrap(),
        )
        .await;
        wait_until("pairing to be dropped", || {
            !engine.is_paired("fyne-test-remote")
        })
        .await;
        assert!(engine.get_paired().is_empty());
    }

    #[tokio::test]
    async fn ping_is_answered_with_ping() {
        let (engine, _dir) = test_engine();
        let remote = identity("fyne-test-remote", "phone");
        let (_conn, mut far) = attach_fake_link(&engine, &remote, "10.0.0.2:1716");

        far.send(&Packet::from_body(PACKET_TYPE_PING, &PingBody::default()).unwrap())
            .await;
        let reply = far.recv().await;
        assert_eq!(reply.packet_type, PACKET_TYPE_PING);
    }

    #[tokio::test]
    async fn unknown_packet_types_are_forwarded_to_plugins() {
        let (engine, _dir) = test_engine();
        let remote = identity("fyne-test-remote", "phone");
        let (_conn, mut far) = attach_fake_link(&engine, &remote, "10.0.0.2:1716");
        let packets = record_events(&engine, EventKind::Packet);

        let mut body = serde_json::Map::new();
        body.insert("batteryLevel".to_string(), serde_json::json!(93));
        far.send(&Packet::new("kdeconnect.battery", body)).await;

        wait_until("forwarded packet", || !packets.lock().unwrap().is_empty()).await;
        let guard = packets.lock().unwrap();
        match &guard[0] {
            Event::Packet { device_id, packet } => {
                assert_eq!(device_id, "fyne-test-remote");
                assert_eq!(packet.packet_type, "kdeconnect.battery");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn sftp_offer_is_stored_once_and_handed_over_once() {
        let (engine, _dir) = test_engine();
        let remote = identity("fyne-test-remote", "phone");
        let (_conn, mut far) = attach_fake_link(&engine, &remote, "10.0.0.2:1716");
        let offers = record_events(&engine, EventKind::SftpOffer);

        let offer = SftpBody {
            ip: "10.0.0.2".to_string(),
            port: 1739,
            user: "kdeconnect".to_string(),
            password: "s3cret".to_string(),
            path: "/storage".to_string(),
            ..SftpBody::default()
        };
        far.send(&Packet::from_body(PACKET_TYPE_SFTP, &offer).unwrap())
            .await;

        wait_until("sftp offer event", || !offers.lock().unwrap().is_empty()).await;
        let handed = engine.get_sftp_offer("fyne-test-remote").unwrap();
        assert_eq!(handed.port, 1739);
        // Single-use: a second handover requires a fresh offer.
        assert!(engine.get_sftp_offer("fyne-test-remote").is_none());
    }

    #[tokio::test]
    async fn offer_without_port_is_ignored() {
        let (engine, _dir) = test_engine();
        let remote = identity("fyne-test-remote", "phone");
        let (_conn, mut far) = attach_fake_link(&engine, &remote, "10.0.0.2:1716");

        far.send(
            &Packet::from_body(
                PACKET_TYPE_SFTP,
                &SftpBody {
                    error_message: "sharing disabled".to_string(),
                    ..SftpBody::default()
                },
            )
            .unwrap(),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(engine.get_sftp_offer("fyne-test-remote").is_none());
    }

    #[tokio::test]
    async fn duplicate_discovery_tracks_roaming_and_persists_once_per_change() {
        let (engine, dir) = test_engine();
        let remote = identity("fyne-test-remote", "phone");
        let (conn, _far) = attach_fake_link(&engine, &remote, "10.0.0.2:1716");
        engine.state.mark_as_paired(&conn);

        engine.handle_discovery(remote.clone(), "10.0.0.2:1716".parse().unwrap());
        engine.handle_discovery(remote.clone(), "10.0.0.3:1716".parse().unwrap());

        {
            let maps = engine.state.maps.read().unwrap();
            assert_eq!(
                maps.discovered["fyne-test-remote"].last_addr.ip().to_string(),
                "10.0.0.3"
            );
            assert_eq!(maps.paired["fyne-test-remote"].last_ip, "10.0.0.3");
        }
        let stored = ConfigStore::new(dir.path()).load_config().unwrap().unwrap();
        assert_eq!(stored.paired_devices["fyne-test-remote"].last_ip, "10.0.0.3");
    }

    #[test]
    fn roaming_update_reports_change_exactly_when_something_changed() {
        let identity_b = identity("fyne-test-remote", "phone");
        let mut record = PairedDeviceInfo {
            identity: identity_b.clone(),
            last_ip: "10.0.0.2".to_string(),
            last_port: 1716,
            cert_sha256: None,
        };

        let same: SocketAddr = "10.0.0.2:1716".parse().unwrap();
        assert!(!roaming_update(&mut record, &identity_b, same));

        let moved: SocketAddr = "10.0.0.3:1716".parse().unwrap();
        assert!(roaming_update(&mut record, &identity_b, moved));
        assert_eq!(record.last_ip, "10.0.0.3");
        assert!(!roaming_update(&mut record, &identity_b, moved));

        let mut renamed = identity_b.clone();
        renamed.device_name = "new phone".to_string();
        assert!(roaming_update(&mut record, &renamed, moved));
        assert_eq!(record.identity.device_name, "new phone");
    }

    #[tokio::test]
    async fn newer_connection_replaces_older_and_survives_its_disconnect() {
        let (engine, _dir) = test_engine();
        let remote = identity("fyne-test-remote", "phone");

        let (first, far_first) = attach_fake_link(&engine, &remote, "10.0.0.2:1716");
        let (second, _far_second) = attach_fake_link(&engine, &remote, "10.0.0.2:1717");

        {
            let maps = engine.state.maps.read().unwrap();
            assert!(Arc::ptr_eq(&maps.active["fyne-test-remote"], &second));
        }

        // Kill the replaced connection; its disconnect must not evict the
        // replacement.
        drop(far_first);
        first.close().await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let maps = engine.state.maps.read().unwrap();
        let current = maps.active.get("fyne-test-remote").expect("connection kept");
        assert!(Arc::ptr_eq(current, &second));
    }

    #[tokio::test]
    async fn disconnect_of_current_connection_removes_it() {
        let (engine, _dir) = test_engine();
        let remote = identity("fyne-test-remote", "phone");
        let (conn, far) = attach_fake_link(&engine, &remote, "10.0.0.2:1716");

        drop(far);
        conn.close().await;
        wait_until("connection removal", || {
            engine.state.maps.read().unwrap().active.is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn pinned_mismatch_downgrades_device_and_resurfaces_pair_request() {
        let (engine, _dir) = test_engine();
        let remote = identity("fyne-test-remote", "phone");

        // Paired once with a different certificate than the live one.
        {
            let mut maps = engine.state.maps.write().unwrap();
            maps.paired.insert(
                "fyne-test-remote".to_string(),
                PairedDeviceInfo {
                    identity: remote.clone(),
                    last_ip: "10.0.0.2".to_string(),
                    last_port: 1716,
                    cert_sha256: Some("00".repeat(32)),
                },
            );
        }

        let pair_requests = record_events(&engine, EventKind::PairRequest);
        let (_conn, mut far) = attach_fake_link(&engine, &remote, "10.0.0.2:1716");
        assert!(!engine.is_paired("fyne-test-remote"));

        // The impostor's pair request must go through the dialog, not be
        // auto-acknowledged.
        far.send(&pair_packet(true, 1_700_000_000)).await;
        wait_until("pair_request event", || {
            !pair_requests.lock().unwrap().is_empty()
        })
        .await;
    }

    #[tokio::test]
    async fn matching_pin_keeps_device_trusted_and_reacknowledges_pairing() {
        let (engine, _dir) = test_engine();
        let remote = identity("fyne-test-remote", "phone");
        {
            let mut maps = engine.state.maps.write().unwrap();
            maps.paired.insert(
                "fyne-test-remote".to_string(),
                PairedDeviceInfo {
                    identity: remote.clone(),
                    last_ip: "10.0.0.2".to_string(),
                    last_port: 1716,
                    cert_sha256: Some(remote_credentials().fingerprint()),
                },
            );
        }

        let pair_requests = record_events(&engine, EventKind::PairRequest);
        let (_conn, mut far) = attach_fake_link(&engine, &remote, "10.0.0.2:1716");
        assert!(engine.is_paired("fyne-test-remote"));

        far.send(&pair_packet(true, 1_700_000_000)).await;
        let reply = far.recv().await;
        assert_eq!(reply.packet_type, PACKET_TYPE_PAIR);
        assert!(reply.body_as::<PairBody>().unwrap().pair);
        assert!(pair_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_to_unknown_device_fails_with_transport_error() {
        let (engine, _dir) = test_engine();
        let err = engine
            .send_ping("never-seen", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::Transport(_)));
    }

    #[tokio::test]
    async fn manual_device_entry_is_discoverable() {
        let (engine, _dir) = test_engine();
        let discovered = record_events(&engine, EventKind::DeviceDiscovered);

        engine.add_device_manual(
            identity("fyne-test-remote", "phone"),
            "10.0.0.9".parse().unwrap(),
            1716,
        );
        assert!(engine.is_discovered("fyne-test-remote"));
        wait_until("device_discovered event", || {
            !discovered.lock().unwrap().is_empty()
        })
        .await;
    }
}

//! Dual-role peer orchestration: discovery gating, identity handshake,
//! connection dedup across MAC rotations, score-based eviction, blacklist
//! and zombie supervision.
//!
//! The durable peer key is the 16-byte mesh identity; addresses are
//! transient attributes the OS rotates underneath us. The address-keyed
//! maps (`address→identity`, pending connections, blacklist, reconnect
//! backoff) are short-lived views.
//!
//! [`Orchestrator`] is the clock-injected core; [`MeshRuntime`] drives it
//! with a live [`BleDriver`].

use crate::driver::{BleConnection, BleDriver, DiscoveredPeer, DriverConfig, DriverEvent};
use crate::error::MeshError;
use crate::peer::PeerInterface;
use crate::score::peer_score;
use crate::IDENTITY_LENGTH;
use log::{debug, info, warn};
use rns_contract::time::now_epoch_ms;
use rns_contract::{InterfaceRegistry, TransportInterface};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type MeshIdentity = [u8; IDENTITY_LENGTH];

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub local_identity: MeshIdentity,
    pub max_connections: usize,
    pub handshake_timeout: Duration,
    pub zombie_timeout_ms: u64,
    pub zombie_grace_ms: u64,
    pub zombie_check_interval_ms: u64,
    pub blacklist_base_ms: u64,
    pub blacklist_max_mult: u32,
    pub reconnect_backoff_ms: u64,
    pub sweep_interval_ms: u64,
    pub eviction_margin: f64,
    /// Backoff applied to an address whose handshake lost a dedup race.
    pub duplicate_backoff_ms: u64,
}

impl OrchestratorConfig {
    pub fn new(local_identity: MeshIdentity) -> Self {
        Self {
            local_identity,
            max_connections: 8,
            handshake_timeout: Duration::from_secs(30),
            zombie_timeout_ms: 45_000,
            zombie_grace_ms: 10_000,
            zombie_check_interval_ms: 15_000,
            blacklist_base_ms: 60_000,
            blacklist_max_mult: 8,
            reconnect_backoff_ms: 7_000,
            sweep_interval_ms: 30_000,
            eviction_margin: 0.15,
            duplicate_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyConnected,
    ConnectInFlight,
    Blacklisted,
    ReconnectBackoff,
    AtCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryDecision {
    Connect,
    ConnectAfterEvicting(MeshIdentity),
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Fresh peer, child interface spawned and attached.
    NewPeer,
    /// Same identity again (same address, or MAC rotation): connection
    /// updated in place, no new child interface.
    UpdatedExisting,
    /// A healthy connection to this identity already exists elsewhere; the
    /// new one lost the race.
    RejectedDuplicate,
    /// Our own identity came back at us.
    RejectedSelf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZombieAction {
    /// Ask the peer to go away nicely; teardown follows after the grace
    /// period if it stays.
    RequestDisconnect(MeshIdentity),
    ForceTeardown(MeshIdentity),
}

#[derive(Debug, Clone, Copy)]
struct BlacklistEntry {
    until_ms: u64,
    failures: u32,
}

struct PeerEntry {
    identity: MeshIdentity,
    address: String,
    interface: Arc<PeerInterface>,
}

/// Synchronous orchestration core. All time is injected.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<dyn InterfaceRegistry>,
    notices_tx: mpsc::UnboundedSender<MeshIdentity>,

    discovered: HashMap<String, DiscoveredPeer>,
    peers: HashMap<MeshIdentity, PeerEntry>,
    address_to_identity: HashMap<String, MeshIdentity>,
    pending_connections: HashSet<String>,
    blacklist: HashMap<String, BlacklistEntry>,
    reconnect_backoff: HashMap<String, u64>,
    pending_disconnects: HashMap<MeshIdentity, u64>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<dyn InterfaceRegistry>,
        notices_tx: mpsc::UnboundedSender<MeshIdentity>,
    ) -> Self {
        Self {
            config,
            registry,
            notices_tx,
            discovered: HashMap::new(),
            peers: HashMap::new(),
            address_to_identity: HashMap::new(),
            pending_connections: HashSet::new(),
            blacklist: HashMap::new(),
            reconnect_backoff: HashMap::new(),
            pending_disconnects: HashMap::new(),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_identities(&self) -> Vec<MeshIdentity> {
        self.peers.keys().copied().collect()
    }

    pub fn peer_interface(&self, identity: &MeshIdentity) -> Option<Arc<PeerInterface>> {
        self.peers
            .get(identity)
            .map(|entry| Arc::clone(&entry.interface))
    }

    pub fn identity_at(&self, address: &str) -> Option<MeshIdentity> {
        self.address_to_identity.get(address).copied()
    }

    pub fn is_blacklisted(&self, address: &str, now_ms: u64) -> bool {
        self.blacklist
            .get(address)
            .map(|entry| entry.until_ms > now_ms)
            .unwrap_or(false)
    }

    /// Gate one scan result. On `Connect`/`ConnectAfterEvicting` the caller
    /// owns the connection attempt; the address is marked in flight here.
    pub fn on_discovery(
        &mut self,
        address: &str,
        rssi: i16,
        now_ms: u64,
    ) -> DiscoveryDecision {
        let entry = self
            .discovered
            .entry(address.to_string())
            .or_insert_with(|| DiscoveredPeer::new(address.to_string(), rssi, now_ms));
        entry.rssi = rssi;
        entry.last_seen_ms = now_ms;

        if self
            .address_to_identity
            .get(address)
            .map(|identity| self.peers.contains_key(identity))
            .unwrap_or(false)
        {
            return DiscoveryDecision::Skip(SkipReason::AlreadyConnected);
        }
        if self.pending_connections.contains(address) {
            return DiscoveryDecision::Skip(SkipReason::ConnectInFlight);
        }
        if self.is_blacklisted(address, now_ms) {
            return DiscoveryDecision::Skip(SkipReason::Blacklisted);
        }
        if self
            .reconnect_backoff
            .get(address)
            .map(|until| *until > now_ms)
            .unwrap_or(false)
        {
            return DiscoveryDecision::Skip(SkipReason::ReconnectBackoff);
        }

        if self.peers.len() >= self.config.max_connections {
            let candidate_score = self.score_for_address(address, now_ms);
            let Some((worst_identity, worst_score)) = self.worst_connected_peer(now_ms) else {
                return DiscoveryDecision::Skip(SkipReason::AtCapacity);
            };
            if candidate_score > worst_score + self.config.eviction_margin {
                self.mark_attempt(address);
                return DiscoveryDecision::ConnectAfterEvicting(worst_identity);
            }
            return DiscoveryDecision::Skip(SkipReason::AtCapacity);
        }

        self.mark_attempt(address);
        DiscoveryDecision::Connect
    }

    fn mark_attempt(&mut self, address: &str) {
        self.pending_connections.insert(address.to_string());
        if let Some(entry) = self.discovered.get_mut(address) {
            entry.attempts += 1;
        }
    }

    fn score_for_address(&self, address: &str, now_ms: u64) -> f64 {
        match self.discovered.get(address) {
            Some(entry) => {
                let age_secs = now_ms.saturating_sub(entry.last_seen_ms) as f64 / 1_000.0;
                peer_score(entry.rssi, entry.attempts, entry.successes, age_secs)
            }
            None => peer_score(-100, 0, 0, f64::MAX),
        }
    }

    fn worst_connected_peer(&self, now_ms: u64) -> Option<(MeshIdentity, f64)> {
        self.peers
            .values()
            .map(|entry| {
                (
                    entry.identity,
                    self.score_for_address(&entry.address, now_ms),
                )
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    /// Complete an identity handshake and install (or merge) the peer.
    pub fn register_peer(
        &mut self,
        identity: MeshIdentity,
        connection: Arc<dyn BleConnection>,
        is_central: bool,
        now_ms: u64,
    ) -> Result<HandshakeOutcome, MeshError> {
        let address = connection.address();
        self.pending_connections.remove(&address);

        if identity == self.config.local_identity {
            debug!("rejecting handshake with our own identity at {address}");
            return Ok(HandshakeOutcome::RejectedSelf);
        }

        if let Some(existing) = self.peers.get(&identity) {
            let old_address = existing.address.clone();
            let healthy = now_ms.saturating_sub(existing.interface.last_traffic_ms())
                < self.config.zombie_timeout_ms;

            if old_address != address && healthy {
                // The prior connection wins; hold the new address back so
                // the scan doesn't reconnect it immediately.
                self.reconnect_backoff
                    .insert(address, now_ms + self.config.duplicate_backoff_ms);
                return Ok(HandshakeOutcome::RejectedDuplicate);
            }

            // Same logical peer at the same or a rotated address: refresh
            // the existing child in place, never spawn a second one.
            existing.interface.update_connection(connection, now_ms)?;
            if old_address != address {
                info!(
                    "peer {} rotated {old_address} -> {address}",
                    hex::encode(identity)
                );
                self.address_to_identity.remove(&old_address);
            }
            self.address_to_identity.insert(address.clone(), identity);
            if let Some(peer) = self.peers.get_mut(&identity) {
                peer.address = address.clone();
            }
            self.record_success(&address, identity);
            self.pending_disconnects.remove(&identity);
            return Ok(HandshakeOutcome::UpdatedExisting);
        }

        let interface = PeerInterface::spawn(
            identity,
            connection,
            is_central,
            Arc::clone(&self.registry),
            self.notices_tx.clone(),
            now_ms,
        )?;
        self.registry
            .attach(Arc::clone(&interface) as Arc<dyn TransportInterface>)
            .map_err(|err| MeshError::Driver(err.to_string()))?;

        self.address_to_identity.insert(address.clone(), identity);
        self.peers.insert(
            identity,
            PeerEntry {
                identity,
                address: address.clone(),
                interface,
            },
        );
        self.record_success(&address, identity);
        info!("peer {} attached at {address}", hex::encode(identity));
        Ok(HandshakeOutcome::NewPeer)
    }

    fn record_success(&mut self, address: &str, identity: MeshIdentity) {
        if let Some(entry) = self.discovered.get_mut(address) {
            entry.successes += 1;
            entry.identity = Some(identity);
        }
    }

    /// Exponential blacklist on repeated handshake failure.
    pub fn record_handshake_failure(&mut self, address: &str, now_ms: u64) {
        self.pending_connections.remove(address);
        let entry = self
            .blacklist
            .entry(address.to_string())
            .or_insert(BlacklistEntry {
                until_ms: 0,
                failures: 0,
            });
        entry.failures += 1;
        let mult = entry.failures.min(self.config.blacklist_max_mult) as u64;
        entry.until_ms = now_ms + self.config.blacklist_base_ms * mult;
        warn!(
            "blacklisting {address} for {}s after {} handshake failures",
            self.config.blacklist_base_ms * mult / 1_000,
            entry.failures
        );
    }

    /// A connection dropped. The peer (if any) detaches and the address
    /// sits out the reconnect backoff.
    pub fn record_disconnect(&mut self, address: &str, now_ms: u64) -> Option<Arc<PeerInterface>> {
        self.pending_connections.remove(address);
        self.reconnect_backoff
            .insert(address.to_string(), now_ms + self.config.reconnect_backoff_ms);

        let identity = self.address_to_identity.remove(address)?;
        self.remove_peer(&identity)
    }

    /// Tear down a peer after a keepalive failure.
    pub fn on_keepalive_failure(
        &mut self,
        identity: &MeshIdentity,
        now_ms: u64,
    ) -> Option<Arc<PeerInterface>> {
        let peer = self.remove_peer(identity)?;
        self.reconnect_backoff.insert(
            peer.interface_address(),
            now_ms + self.config.reconnect_backoff_ms,
        );
        Some(peer)
    }

    fn remove_peer(&mut self, identity: &MeshIdentity) -> Option<Arc<PeerInterface>> {
        let entry = self.peers.remove(identity)?;
        self.address_to_identity.remove(&entry.address);
        self.pending_disconnects.remove(identity);
        self.registry.detach(&entry.interface.interface_id());
        info!("peer {} detached", hex::encode(identity));
        Some(entry.interface)
    }

    /// Remove a peer chosen for eviction, returning its interface for the
    /// caller to disconnect.
    pub fn evict_peer(&mut self, identity: &MeshIdentity) -> Option<Arc<PeerInterface>> {
        self.remove_peer(identity)
    }

    /// Find peers whose traffic went quiet: first a graceful disconnect
    /// request, then force-teardown (plus blacklist) after the grace period.
    pub fn zombie_check(&mut self, now_ms: u64) -> Vec<ZombieAction> {
        let mut actions = Vec::new();

        let deadlines: Vec<(MeshIdentity, u64)> = self
            .pending_disconnects
            .iter()
            .map(|(identity, deadline)| (*identity, *deadline))
            .collect();
        for (identity, deadline) in deadlines {
            if now_ms < deadline {
                continue;
            }
            if self.peers.contains_key(&identity) {
                actions.push(ZombieAction::ForceTeardown(identity));
            } else {
                self.pending_disconnects.remove(&identity);
            }
        }

        let stale: Vec<MeshIdentity> = self
            .peers
            .values()
            .filter(|entry| {
                !self.pending_disconnects.contains_key(&entry.identity)
                    && now_ms.saturating_sub(entry.interface.last_traffic_ms())
                        > self.config.zombie_timeout_ms
            })
            .map(|entry| entry.identity)
            .collect();
        for identity in stale {
            self.pending_disconnects
                .insert(identity, now_ms + self.config.zombie_grace_ms);
            actions.push(ZombieAction::RequestDisconnect(identity));
        }

        actions
    }

    /// Execute a force-teardown decided by [`zombie_check`](Self::zombie_check).
    pub fn force_teardown(
        &mut self,
        identity: &MeshIdentity,
        now_ms: u64,
    ) -> Option<Arc<PeerInterface>> {
        let peer = self.remove_peer(identity)?;
        let address = peer.interface_address();
        self.record_handshake_failure(&address, now_ms);
        Some(peer)
    }

    /// Periodic housekeeping: expire blacklist and backoff entries, sweep
    /// per-peer reassembly buffers.
    pub fn sweep(&mut self, now_ms: u64) {
        self.blacklist.retain(|_, entry| entry.until_ms > now_ms);
        self.reconnect_backoff.retain(|_, until| *until > now_ms);
        for entry in self.peers.values() {
            entry.interface.sweep_reassembly(now_ms);
        }
    }

    /// Route one inbound frame to the peer behind `address`.
    pub fn handle_frame(&mut self, address: &str, payload: &[u8], now_ms: u64) {
        let Some(identity) = self.address_to_identity.get(address) else {
            debug!("frame from unknown address {address}");
            return;
        };
        if let Some(entry) = self.peers.get(identity) {
            entry.interface.ingest(payload, now_ms);
        }
    }
}

trait InterfaceAddress {
    fn interface_address(&self) -> String;
}

impl InterfaceAddress for Arc<PeerInterface> {
    fn interface_address(&self) -> String {
        self.connection().address()
    }
}

fn lock(core: &Arc<Mutex<Orchestrator>>) -> MutexGuard<'_, Orchestrator> {
    core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Live mesh runtime: one driver, the orchestration core and its
/// supervision tasks (event pump, periodic sweeps, zombie watcher,
/// peripheral handshake deadlines).
pub struct MeshRuntime<D: BleDriver + 'static> {
    driver: Arc<D>,
    core: Arc<Mutex<Orchestrator>>,
    cancel: CancellationToken,
}

impl<D: BleDriver + 'static> MeshRuntime<D> {
    pub async fn start(
        driver: Arc<D>,
        config: OrchestratorConfig,
        driver_config: DriverConfig,
        registry: Arc<dyn InterfaceRegistry>,
    ) -> Result<Self, MeshError> {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let core = Arc::new(Mutex::new(Orchestrator::new(
            config.clone(),
            registry,
            notices_tx,
        )));
        let (events_tx, events_rx) = mpsc::channel(64);
        driver.start(&driver_config, events_tx).await?;

        let cancel = CancellationToken::new();
        tokio::spawn(event_loop(
            Arc::clone(&driver),
            Arc::clone(&core),
            config.clone(),
            driver_config,
            events_rx,
            cancel.clone(),
        ));
        tokio::spawn(maintenance_loop(
            Arc::clone(&core),
            config,
            notices_rx,
            cancel.clone(),
        ));

        Ok(Self {
            driver,
            core,
            cancel,
        })
    }

    pub fn core(&self) -> Arc<Mutex<Orchestrator>> {
        Arc::clone(&self.core)
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        self.driver.stop().await;
        let peers: Vec<Arc<PeerInterface>> = {
            let mut core = lock(&self.core);
            let identities = core.peer_identities();
            identities
                .iter()
                .filter_map(|identity| core.evict_peer(identity))
                .collect()
        };
        for peer in peers {
            peer.detach().await;
        }
    }
}

struct PendingIncoming {
    connection: Arc<dyn BleConnection>,
    deadline_ms: u64,
}

async fn event_loop<D: BleDriver + 'static>(
    driver: Arc<D>,
    core: Arc<Mutex<Orchestrator>>,
    config: OrchestratorConfig,
    driver_config: DriverConfig,
    mut events: mpsc::Receiver<DriverEvent>,
    cancel: CancellationToken,
) {
    // Peripheral-side handshakes in progress: address-scoped view awaiting
    // the first 16-byte identity write.
    let mut pending_incoming: HashMap<String, PendingIncoming> = HashMap::new();
    let mut expiry_ticker = tokio::time::interval(Duration::from_secs(5));
    expiry_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = expiry_ticker.tick() => {
                expire_pending_incoming(&core, &mut pending_incoming, now_epoch_ms()).await;
                continue;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let now_ms = now_epoch_ms();

        expire_pending_incoming(&core, &mut pending_incoming, now_ms).await;

        match event {
            DriverEvent::PeerDiscovered { address, rssi } => {
                let decision = lock(&core).on_discovery(&address, rssi, now_ms);
                match decision {
                    DiscoveryDecision::Connect => {
                        spawn_outgoing_handshake(
                            Arc::clone(&driver),
                            Arc::clone(&core),
                            config.clone(),
                            driver_config.clone(),
                            address,
                            cancel.clone(),
                        );
                    }
                    DiscoveryDecision::ConnectAfterEvicting(victim) => {
                        let evicted = lock(&core).evict_peer(&victim);
                        if let Some(peer) = evicted {
                            peer.detach().await;
                        }
                        spawn_outgoing_handshake(
                            Arc::clone(&driver),
                            Arc::clone(&core),
                            config.clone(),
                            driver_config.clone(),
                            address,
                            cancel.clone(),
                        );
                    }
                    DiscoveryDecision::Skip(_) => {}
                }
            }
            DriverEvent::IncomingConnection { connection } => {
                let deadline_ms = now_ms + config.handshake_timeout.as_millis() as u64;
                pending_incoming.insert(
                    connection.address(),
                    PendingIncoming {
                        connection,
                        deadline_ms,
                    },
                );
            }
            DriverEvent::InboundFrame { address, payload } => {
                if pending_incoming.contains_key(&address) {
                    // First meaningful frame must be the 16-byte identity;
                    // keepalives and fragments are not a handshake.
                    if payload.len() == IDENTITY_LENGTH {
                        let Some(pending) = pending_incoming.remove(&address) else {
                            continue;
                        };
                        let mut identity = [0u8; IDENTITY_LENGTH];
                        identity.copy_from_slice(&payload);
                        let outcome =
                            lock(&core).register_peer(identity, pending.connection, false, now_ms);
                        log_outcome(&address, outcome);
                    }
                    continue;
                }
                lock(&core).handle_frame(&address, &payload, now_ms);
            }
            DriverEvent::Disconnected { address } => {
                pending_incoming.remove(&address);
                let peer = lock(&core).record_disconnect(&address, now_ms);
                if let Some(peer) = peer {
                    peer.detach().await;
                }
            }
        }
    }
}

async fn expire_pending_incoming(
    core: &Arc<Mutex<Orchestrator>>,
    pending_incoming: &mut HashMap<String, PendingIncoming>,
    now_ms: u64,
) {
    let expired: Vec<String> = pending_incoming
        .iter()
        .filter(|(_, pending)| now_ms >= pending.deadline_ms)
        .map(|(address, _)| address.clone())
        .collect();
    for address in expired {
        let Some(pending) = pending_incoming.remove(&address) else {
            continue;
        };
        // Identity never arrived: blacklist the address. Skip the
        // disconnect when another role already holds a healthy peer at
        // this address; a GATT disconnect is address-scoped and would kill
        // the healthy connection too.
        let healthy_elsewhere = lock(core).identity_at(&address).is_some();
        lock(core).record_handshake_failure(&address, now_ms);
        if !healthy_elsewhere {
            let _ = pending.connection.disconnect().await;
        }
    }
}

fn spawn_outgoing_handshake<D: BleDriver + 'static>(
    driver: Arc<D>,
    core: Arc<Mutex<Orchestrator>>,
    config: OrchestratorConfig,
    driver_config: DriverConfig,
    address: String,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let handshake = tokio::time::timeout(config.handshake_timeout, async {
            let connection = driver.connect(&address).await?;
            // Central role: read the peer's IDENTITY characteristic, then
            // introduce ourselves with a 16-byte write to its RX.
            let identity = connection.read_identity().await?;
            connection.write(&driver_config.local_identity).await?;
            Ok::<_, MeshError>((connection, identity))
        })
        .await;

        if cancel.is_cancelled() {
            return;
        }
        let now_ms = now_epoch_ms();
        match handshake {
            Ok(Ok((connection, identity))) => {
                let outcome =
                    lock(&core).register_peer(identity, Arc::clone(&connection), true, now_ms);
                let lost_race = matches!(
                    &outcome,
                    Ok(HandshakeOutcome::RejectedDuplicate | HandshakeOutcome::RejectedSelf)
                );
                if lost_race {
                    let _ = connection.disconnect().await;
                }
                log_outcome(&address, outcome);
            }
            Ok(Err(err)) => {
                debug!("handshake with {address} failed: {err}");
                lock(&core).record_handshake_failure(&address, now_ms);
            }
            Err(_) => {
                debug!("handshake with {address} timed out");
                lock(&core).record_handshake_failure(&address, now_ms);
            }
        }
    });
}

fn log_outcome(address: &str, outcome: Result<HandshakeOutcome, MeshError>) {
    match outcome {
        Ok(outcome) => debug!("handshake at {address}: {outcome:?}"),
        Err(err) => warn!("registering peer at {address} failed: {err}"),
    }
}

async fn maintenance_loop(
    core: Arc<Mutex<Orchestrator>>,
    config: OrchestratorConfig,
    mut notices: mpsc::UnboundedReceiver<MeshIdentity>,
    cancel: CancellationToken,
) {
    let mut sweep_ticker =
        tokio::time::interval(Duration::from_millis(config.sweep_interval_ms));
    sweep_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut zombie_ticker =
        tokio::time::interval(Duration::from_millis(config.zombie_check_interval_ms));
    zombie_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sweep_ticker.tick() => {
                lock(&core).sweep(now_epoch_ms());
            }
            _ = zombie_ticker.tick() => {
                let now_ms = now_epoch_ms();
                let actions = lock(&core).zombie_check(now_ms);
                for action in actions {
                    match action {
                        ZombieAction::RequestDisconnect(identity) => {
                            let interface = lock(&core).peer_interface(&identity);
                            if let Some(interface) = interface {
                                let _ = interface.connection().disconnect().await;
                            }
                        }
                        ZombieAction::ForceTeardown(identity) => {
                            let peer = lock(&core).force_teardown(&identity, now_ms);
                            if let Some(peer) = peer {
                                peer.detach().await;
                            }
                        }
                    }
                }
            }
            Some(identity) = notices.recv() => {
                let now_ms = now_epoch_ms();
                let peer = lock(&core).on_keepalive_failure(&identity, now_ms);
                if let Some(peer) = peer {
                    peer.detach().await;
                }
            }
        }
    }
}

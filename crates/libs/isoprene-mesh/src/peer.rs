//! Per-peer child interface: fragment I/O, keepalive and RSSI supervision.

use crate::driver::{BleConnection, GattOpQueue, GATT_OP_TIMEOUT};
use crate::error::MeshError;
use crate::fragment::{Fragmenter, Reassembler};
use crate::{IDENTITY_LENGTH, KEEPALIVE};
use log::debug;
use rns_contract::time::now_epoch_ms;
use rns_contract::{InterfaceRegistry, RnsError, TransportInterface};
use std::sync::atomic::{AtomicI16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
pub const RSSI_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Wait before the single keepalive retry.
const KEEPALIVE_RETRY_DELAY: Duration = Duration::from_secs(2);

struct ConnState {
    connection: Arc<dyn BleConnection>,
    fragmenter: Fragmenter,
    reassembler: Reassembler,
}

/// Child interface registered with the substrate transport for one mesh
/// peer. Owns the connection; the orchestrator closes it only during detach.
pub struct PeerInterface {
    identity: [u8; IDENTITY_LENGTH],
    is_central: bool,
    registry: Arc<dyn InterfaceRegistry>,
    state: Mutex<ConnState>,
    ops: GattOpQueue,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    last_traffic_ms: AtomicU64,
    last_keepalive_ms: AtomicU64,
    last_rssi: AtomicI16,
    cancel: CancellationToken,
}

impl PeerInterface {
    /// Build the interface and start its writer, keepalive and (for the
    /// central role) RSSI tasks. Keepalive failures surface on `notices`.
    pub fn spawn(
        identity: [u8; IDENTITY_LENGTH],
        connection: Arc<dyn BleConnection>,
        is_central: bool,
        registry: Arc<dyn InterfaceRegistry>,
        notices: mpsc::UnboundedSender<[u8; IDENTITY_LENGTH]>,
        now_ms: u64,
    ) -> Result<Arc<Self>, MeshError> {
        let fragmenter = Fragmenter::new(connection.mtu())?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let iface = Arc::new(Self {
            identity,
            is_central,
            registry,
            state: Mutex::new(ConnState {
                connection,
                fragmenter,
                reassembler: Reassembler::new(),
            }),
            ops: GattOpQueue::new(32),
            outbound_tx,
            last_traffic_ms: AtomicU64::new(now_ms),
            last_keepalive_ms: AtomicU64::new(now_ms),
            last_rssi: AtomicI16::new(i16::MIN),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Self::writer_loop(Arc::clone(&iface), outbound_rx));
        tokio::spawn(Self::keepalive_loop(Arc::clone(&iface), notices));
        if is_central {
            tokio::spawn(Self::rssi_loop(Arc::clone(&iface)));
        }
        Ok(iface)
    }

    pub fn identity(&self) -> [u8; IDENTITY_LENGTH] {
        self.identity
    }

    pub fn is_central(&self) -> bool {
        self.is_central
    }

    pub fn last_traffic_ms(&self) -> u64 {
        self.last_traffic_ms.load(Ordering::SeqCst)
    }

    pub fn last_keepalive_ms(&self) -> u64 {
        self.last_keepalive_ms.load(Ordering::SeqCst)
    }

    /// Latest polled RSSI; `i16::MIN` until the first poll lands.
    pub fn last_rssi(&self) -> i16 {
        self.last_rssi.load(Ordering::SeqCst)
    }

    pub fn connection(&self) -> Arc<dyn BleConnection> {
        self.with_state(|state| Arc::clone(&state.connection))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ConnState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Swap in a fresh connection after a MAC rotation: the fragmenter and
    /// reassembler are rebuilt for the new MTU and the traffic timer resets.
    pub fn update_connection(
        &self,
        connection: Arc<dyn BleConnection>,
        now_ms: u64,
    ) -> Result<(), MeshError> {
        let fragmenter = Fragmenter::new(connection.mtu())?;
        self.with_state(|state| {
            state.connection = connection;
            state.fragmenter = fragmenter;
            state.reassembler = Reassembler::new();
        });
        self.last_traffic_ms.store(now_ms, Ordering::SeqCst);
        self.last_keepalive_ms.store(now_ms, Ordering::SeqCst);
        Ok(())
    }

    /// Ingest one raw frame from the connection. Keepalives refresh the
    /// supervision timers; fragments feed the reassembler and completed
    /// packets flow into the transport.
    pub fn ingest(&self, frame: &[u8], now_ms: u64) {
        self.last_traffic_ms.store(now_ms, Ordering::SeqCst);
        if frame.len() == 1 && frame[0] == KEEPALIVE[0] {
            self.last_keepalive_ms.store(now_ms, Ordering::SeqCst);
            return;
        }

        let sender = self.interface_id();
        let result = self.with_state(|state| state.reassembler.ingest(&sender, frame, now_ms));
        match result {
            Ok(Some(packet)) => {
                self.registry.inbound_frame(&self.interface_id(), &packet);
            }
            Ok(None) => {}
            Err(err) => {
                debug!("peer {} reassembly error: {err}", hex::encode(self.identity));
            }
        }
    }

    /// Sweep stale partial packets.
    pub fn sweep_reassembly(&self, now_ms: u64) -> usize {
        self.with_state(|state| state.reassembler.sweep(now_ms))
    }

    /// Stop the supervision tasks and close the connection.
    pub async fn detach(&self) {
        self.cancel.cancel();
        let connection = self.connection();
        if let Err(err) = connection.disconnect().await {
            debug!(
                "peer {} disconnect during detach: {err}",
                hex::encode(self.identity)
            );
        }
    }

    async fn writer_loop(iface: Arc<Self>, mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        loop {
            let packet = tokio::select! {
                _ = iface.cancel.cancelled() => break,
                packet = outbound_rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
            };

            let (connection, frames) = {
                let prepared = iface.with_state(|state| {
                    (
                        Arc::clone(&state.connection),
                        state.fragmenter.fragment(&packet),
                    )
                });
                match prepared {
                    (connection, Ok(frames)) => (connection, frames),
                    (_, Err(err)) => {
                        debug!("outbound fragmentation failed: {err}");
                        continue;
                    }
                }
            };

            for frame in frames {
                let connection = Arc::clone(&connection);
                let write = iface
                    .ops
                    .run(async move { connection.write(&frame).await }, GATT_OP_TIMEOUT)
                    .await;
                if let Err(err) = write {
                    debug!("outbound frame write failed: {err}");
                    break;
                }
                iface
                    .last_traffic_ms
                    .store(now_epoch_ms(), Ordering::SeqCst);
            }
        }
    }

    async fn keepalive_loop(iface: Arc<Self>, notices: mpsc::UnboundedSender<[u8; 16]>) {
        let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = iface.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if iface.send_keepalive().await.is_ok() {
                continue;
            }
            // One grace retry, then hand the peer back for teardown.
            tokio::time::sleep(KEEPALIVE_RETRY_DELAY).await;
            if iface.send_keepalive().await.is_err() {
                let _ = notices.send(iface.identity);
                break;
            }
        }
    }

    async fn send_keepalive(&self) -> Result<(), MeshError> {
        let connection = self.connection();
        self.ops
            .run(
                async move { connection.write(&KEEPALIVE).await },
                GATT_OP_TIMEOUT,
            )
            .await
    }

    async fn rssi_loop(iface: Arc<Self>) {
        let mut ticker = tokio::time::interval(RSSI_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = iface.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let connection = iface.connection();
            match connection.read_rssi().await {
                Ok(rssi) => iface.last_rssi.store(rssi, Ordering::SeqCst),
                Err(err) => debug!("rssi poll failed: {err}"),
            }
        }
    }
}

impl TransportInterface for PeerInterface {
    fn interface_id(&self) -> String {
        format!("ble/{}", hex::encode(self.identity))
    }

    fn mtu(&self) -> usize {
        self.with_state(|state| state.fragmenter.mtu())
    }

    fn send_frame(&self, frame: &[u8]) -> Result<(), RnsError> {
        self.outbound_tx
            .send(frame.to_vec())
            .map_err(|_| RnsError::Send("peer interface detached".into()))
    }
}

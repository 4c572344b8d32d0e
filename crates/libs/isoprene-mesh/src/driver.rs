//! Platform abstraction for the BLE stack.
//!
//! The orchestrator is written against [`BleDriver`] / [`BleConnection`] and
//! is exercised in tests with scripted mocks; `native` provides the
//! btleplug-backed central role on desktop targets.
//!
//! GATT layout: one service with three characteristics. IDENTITY is
//! read-only and 16 bytes, peers write inbound frames to RX, and TX
//! notifications carry outbound frames.

use crate::error::MeshError;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

pub const SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";
pub const RX_CHAR_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";
pub const TX_CHAR_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";
pub const IDENTITY_CHAR_UUID: &str = "6e400004-b5a3-f393-e0a9-e50e24dcca9e";

/// Default timeout for a single queued GATT operation.
pub const GATT_OP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub adapter: Option<String>,
    pub local_identity: [u8; 16],
    pub mtu: usize,
    pub connect_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            local_identity: [0u8; 16],
            mtu: 247,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A peer seen during scanning, with connection history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub address: String,
    pub rssi: i16,
    pub last_seen_ms: u64,
    pub identity: Option<[u8; 16]>,
    pub attempts: u32,
    pub successes: u32,
}

impl DiscoveredPeer {
    pub fn new(address: String, rssi: i16, last_seen_ms: u64) -> Self {
        Self {
            address,
            rssi,
            last_seen_ms,
            identity: None,
            attempts: 0,
            successes: 0,
        }
    }
}

/// Events flowing from the platform driver to the orchestrator.
pub enum DriverEvent {
    /// Scan result (new peer or RSSI update).
    PeerDiscovered { address: String, rssi: i16 },
    /// A remote central connected to our peripheral role.
    IncomingConnection { connection: Arc<dyn BleConnection> },
    /// Raw frame written to our RX characteristic or received as a TX
    /// notification.
    InboundFrame { address: String, payload: Vec<u8> },
    Disconnected { address: String },
}

/// One live GATT connection to a peer.
#[async_trait]
pub trait BleConnection: Send + Sync {
    fn address(&self) -> String;

    fn mtu(&self) -> usize;

    /// Write one frame to the peer's RX characteristic (central) or notify
    /// it on TX (peripheral).
    async fn write(&self, payload: &[u8]) -> Result<(), MeshError>;

    /// Read the peer's 16-byte IDENTITY characteristic.
    async fn read_identity(&self) -> Result<[u8; 16], MeshError>;

    async fn read_rssi(&self) -> Result<i16, MeshError>;

    async fn disconnect(&self) -> Result<(), MeshError>;
}

/// Platform BLE stack: simultaneous advertising (peripheral) and scanning
/// (central).
#[async_trait]
pub trait BleDriver: Send + Sync {
    /// Stable driver identifier for metrics/config mapping.
    fn driver_id(&self) -> &'static str;

    /// Start advertising, the GATT server and the long-running filtered
    /// scan. Events flow through `events` until `stop`.
    async fn start(
        &self,
        config: &DriverConfig,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<(), MeshError>;

    /// Initiate an outgoing connection.
    async fn connect(&self, address: &str) -> Result<Arc<dyn BleConnection>, MeshError>;

    async fn stop(&self);
}

type QueuedFuture = Pin<Box<dyn Future<Output = Result<(), MeshError>> + Send>>;

struct QueuedOp {
    op: QueuedFuture,
    timeout: Duration,
    reply: oneshot::Sender<Result<(), MeshError>>,
}

/// FIFO GATT operation queue: one operation in flight at a time, each with
/// its own timeout. Some platform stacks corrupt state when reads and writes
/// overlap.
#[derive(Clone)]
pub struct GattOpQueue {
    tx: mpsc::Sender<QueuedOp>,
}

impl GattOpQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueuedOp>(depth.max(1));
        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let result = match tokio::time::timeout(queued.timeout, queued.op).await {
                    Ok(result) => result,
                    Err(_) => Err(MeshError::OpTimeout(queued.timeout)),
                };
                let _ = queued.reply.send(result);
            }
        });
        Self { tx }
    }

    /// Run `op` behind every previously queued operation.
    pub async fn run<F>(&self, op: F, timeout: Duration) -> Result<(), MeshError>
    where
        F: Future<Output = Result<(), MeshError>> + Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(QueuedOp {
                op: Box::pin(op),
                timeout,
                reply,
            })
            .await
            .map_err(|_| MeshError::QueueClosed)?;
        response.await.map_err(|_| MeshError::QueueClosed)?
    }
}

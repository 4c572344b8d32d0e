#![allow(dead_code)]

use async_trait::async_trait;
use mesh_core::driver::{BleConnection, BleDriver, DriverConfig, DriverEvent};
use mesh_core::MeshError;
use rns_contract::{InterfaceRegistry, RnsError, TransportInterface};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Registry double capturing attach/detach/inbound traffic.
#[derive(Default)]
pub struct MockRegistry {
    pub attached: Mutex<Vec<String>>,
    pub detached: Mutex<Vec<String>>,
    pub inbound: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attached_ids(&self) -> Vec<String> {
        self.attached.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn inbound_packets(&self) -> Vec<(String, Vec<u8>)> {
        self.inbound.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl InterfaceRegistry for MockRegistry {
    fn attach(&self, iface: Arc<dyn TransportInterface>) -> Result<(), RnsError> {
        if let Ok(mut attached) = self.attached.lock() {
            attached.push(iface.interface_id());
        }
        Ok(())
    }

    fn detach(&self, interface_id: &str) {
        if let Ok(mut detached) = self.detached.lock() {
            detached.push(interface_id.to_string());
        }
    }

    fn inbound_frame(&self, interface_id: &str, frame: &[u8]) {
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.push((interface_id.to_string(), frame.to_vec()));
        }
    }
}

/// Connection double with scriptable identity and failure behavior.
pub struct MockConnection {
    pub peer_address: String,
    pub mtu: usize,
    pub identity: [u8; 16],
    pub written: Mutex<Vec<Vec<u8>>>,
    pub fail_writes: AtomicBool,
    pub disconnected: AtomicBool,
    pub rssi: i16,
}

impl MockConnection {
    pub fn new(address: &str, identity: [u8; 16]) -> Arc<Self> {
        Arc::new(Self {
            peer_address: address.to_string(),
            mtu: 185,
            identity,
            written: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            rssi: -60,
        })
    }

    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.written.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BleConnection for MockConnection {
    fn address(&self) -> String {
        self.peer_address.clone()
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn write(&self, payload: &[u8]) -> Result<(), MeshError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MeshError::Disconnected);
        }
        if let Ok(mut written) = self.written.lock() {
            written.push(payload.to_vec());
        }
        Ok(())
    }

    async fn read_identity(&self) -> Result<[u8; 16], MeshError> {
        Ok(self.identity)
    }

    async fn read_rssi(&self) -> Result<i16, MeshError> {
        Ok(self.rssi)
    }

    async fn disconnect(&self) -> Result<(), MeshError> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Driver double: `connect` hands out pre-scripted connections, and the
/// test injects events through the captured sender.
#[derive(Default)]
pub struct MockDriver {
    pub connections: Mutex<HashMap<String, Arc<MockConnection>>>,
    pub events: Mutex<Option<mpsc::Sender<DriverEvent>>>,
    pub stopped: AtomicBool,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script_connection(&self, connection: Arc<MockConnection>) {
        if let Ok(mut connections) = self.connections.lock() {
            connections.insert(connection.peer_address.clone(), connection);
        }
    }

    pub async fn inject(&self, event: DriverEvent) {
        let sender = self
            .events
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .expect("driver started");
        sender.send(event).await.expect("event delivered");
    }
}

#[async_trait]
impl BleDriver for MockDriver {
    fn driver_id(&self) -> &'static str {
        "mock"
    }

    async fn start(
        &self,
        _config: &DriverConfig,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<(), MeshError> {
        if let Ok(mut guard) = self.events.lock() {
            *guard = Some(events);
        }
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn BleConnection>, MeshError> {
        let connection = self
            .connections
            .lock()
            .ok()
            .and_then(|connections| connections.get(address).cloned());
        match connection {
            Some(connection) => Ok(connection),
            None => Err(MeshError::Driver(format!("no scripted connection for {address}"))),
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

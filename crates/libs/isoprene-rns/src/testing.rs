//! Scripted in-memory substrate doubles.
//!
//! These stand in for a live Reticulum stack in unit and integration tests:
//! every operation is recorded, and failure behavior can be scripted per
//! instance. Kept in the library (not a dev-dependency) so downstream crates
//! can drive their own tests against the same contract.

use crate::error::RnsError;
use crate::hash::DestinationHash;
use crate::identity::{Identity, IdentityStore, PrivateIdentity};
use crate::link::{Link, LinkId, LinkStatus};
use crate::transport::Transport;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Identity cache backed by a plain map.
#[derive(Default)]
pub struct MemoryIdentityStore {
    known: Mutex<HashMap<DestinationHash, Identity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identities<I: IntoIterator<Item = Identity>>(identities: I) -> Self {
        let store = Self::new();
        for identity in identities {
            store.remember(&identity);
        }
        store
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn identity_for(&self, destination: &DestinationHash) -> Option<Identity> {
        self.known
            .lock()
            .ok()
            .and_then(|map| map.get(destination).cloned())
    }

    fn remember(&self, identity: &Identity) {
        if let Ok(mut map) = self.known.lock() {
            map.insert(identity.destination_hash(), identity.clone());
        }
    }
}

/// Scriptable link double recording everything sent through it.
pub struct StubLink {
    id: LinkId,
    destination: DestinationHash,
    outgoing: bool,
    status: Mutex<LinkStatus>,
    remote: Mutex<Option<Identity>>,
    fail_sends: AtomicBool,
    resource_acceptance: AtomicBool,
    pub sent_packets: Mutex<Vec<(Vec<u8>, u64)>>,
    pub sent_requests: Mutex<Vec<(String, Vec<u8>, u64)>>,
    pub sent_resources: Mutex<Vec<(u64, Vec<u8>)>>,
    pub identified_as: Mutex<Vec<[u8; 32]>>,
    pub closed: AtomicBool,
}

impl StubLink {
    pub fn new(id: LinkId, destination: DestinationHash, outgoing: bool) -> Self {
        Self {
            id,
            destination,
            outgoing,
            status: Mutex::new(LinkStatus::Active),
            remote: Mutex::new(None),
            fail_sends: AtomicBool::new(false),
            resource_acceptance: AtomicBool::new(false),
            sent_packets: Mutex::new(Vec::new()),
            sent_requests: Mutex::new(Vec::new()),
            sent_resources: Mutex::new(Vec::new()),
            identified_as: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_status(&self, status: LinkStatus) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status;
        }
    }

    pub fn set_remote_identity(&self, identity: Identity) {
        if let Ok(mut guard) = self.remote.lock() {
            *guard = Some(identity);
        }
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn resource_acceptance(&self) -> bool {
        self.resource_acceptance.load(Ordering::SeqCst)
    }

    fn check_active(&self) -> Result<(), RnsError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(RnsError::Send("scripted failure".into()));
        }
        match self.status() {
            LinkStatus::Active => Ok(()),
            _ => Err(RnsError::LinkNotActive),
        }
    }
}

impl Link for StubLink {
    fn link_id(&self) -> LinkId {
        self.id
    }

    fn status(&self) -> LinkStatus {
        self.status.lock().map(|s| *s).unwrap_or(LinkStatus::Closed)
    }

    fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    fn destination(&self) -> DestinationHash {
        self.destination
    }

    fn remote_identity(&self) -> Option<Identity> {
        self.remote.lock().ok().and_then(|guard| guard.clone())
    }

    fn send(&self, payload: &[u8], receipt_id: u64) -> Result<(), RnsError> {
        self.check_active()?;
        if let Ok(mut sent) = self.sent_packets.lock() {
            sent.push((payload.to_vec(), receipt_id));
        }
        Ok(())
    }

    fn request(&self, path: &str, data: &[u8], request_id: u64) -> Result<(), RnsError> {
        self.check_active()?;
        if let Ok(mut requests) = self.sent_requests.lock() {
            requests.push((path.to_string(), data.to_vec(), request_id));
        }
        Ok(())
    }

    fn send_resource(&self, resource_id: u64, payload: &[u8]) -> Result<(), RnsError> {
        self.check_active()?;
        if let Ok(mut resources) = self.sent_resources.lock() {
            resources.push((resource_id, payload.to_vec()));
        }
        Ok(())
    }

    fn identify(&self, identity: &PrivateIdentity) -> Result<(), RnsError> {
        if let Ok(mut identified) = self.identified_as.lock() {
            identified.push(identity.public().public_bytes());
        }
        Ok(())
    }

    fn set_resource_acceptance(&self, enabled: bool) {
        self.resource_acceptance.store(enabled, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.set_status(LinkStatus::Closed);
    }
}

/// Scriptable transport double recording every substrate operation.
#[derive(Default)]
pub struct StubTransport {
    paths: Mutex<HashSet<DestinationHash>>,
    fail_opportunistic: AtomicBool,
    fail_link_establishment: AtomicBool,
    pub path_requests: Mutex<Vec<DestinationHash>>,
    pub expired_paths: Mutex<Vec<DestinationHash>>,
    /// Every opportunistic send attempt, including ones that failed.
    pub attempted_sends: Mutex<Vec<(DestinationHash, u64)>>,
    pub opportunistic_sends: Mutex<Vec<(DestinationHash, Vec<u8>, u64)>>,
    pub link_attempts: Mutex<Vec<DestinationHash>>,
    pub announces: Mutex<Vec<(DestinationHash, Vec<u8>)>>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_path(&self, destination: DestinationHash) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.insert(destination);
        }
    }

    pub fn drop_path(&self, destination: &DestinationHash) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.remove(destination);
        }
    }

    pub fn set_fail_opportunistic(&self, fail: bool) {
        self.fail_opportunistic.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_link_establishment(&self, fail: bool) {
        self.fail_link_establishment.store(fail, Ordering::SeqCst);
    }

    pub fn opportunistic_count(&self) -> usize {
        self.opportunistic_sends.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn attempted_send_count(&self) -> usize {
        self.attempted_sends.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn path_request_count(&self) -> usize {
        self.path_requests.lock().map(|v| v.len()).unwrap_or(0)
    }
}

impl Transport for StubTransport {
    fn has_path(&self, destination: &DestinationHash) -> bool {
        self.paths
            .lock()
            .map(|paths| paths.contains(destination))
            .unwrap_or(false)
    }

    fn request_path(&self, destination: &DestinationHash) {
        if let Ok(mut requests) = self.path_requests.lock() {
            requests.push(*destination);
        }
    }

    fn expire_path(&self, destination: &DestinationHash) {
        self.drop_path(destination);
        if let Ok(mut expired) = self.expired_paths.lock() {
            expired.push(*destination);
        }
    }

    fn send_opportunistic(
        &self,
        destination: &DestinationHash,
        payload: &[u8],
        receipt_id: u64,
    ) -> Result<(), RnsError> {
        if let Ok(mut attempts) = self.attempted_sends.lock() {
            attempts.push((*destination, receipt_id));
        }
        if self.fail_opportunistic.load(Ordering::SeqCst) {
            return Err(RnsError::Send("scripted failure".into()));
        }
        if !self.has_path(destination) {
            return Err(RnsError::NoPath(destination.to_hex()));
        }
        if let Ok(mut sends) = self.opportunistic_sends.lock() {
            sends.push((*destination, payload.to_vec(), receipt_id));
        }
        Ok(())
    }

    fn establish_link(&self, destination: &DestinationHash) -> Result<(), RnsError> {
        if self.fail_link_establishment.load(Ordering::SeqCst) {
            return Err(RnsError::Unavailable("scripted failure".into()));
        }
        if let Ok(mut attempts) = self.link_attempts.lock() {
            attempts.push(*destination);
        }
        Ok(())
    }

    fn announce(&self, destination: &DestinationHash, app_data: &[u8]) -> Result<(), RnsError> {
        if let Ok(mut announces) = self.announces.lock() {
            announces.push((*destination, app_data.to_vec()));
        }
        Ok(())
    }
}

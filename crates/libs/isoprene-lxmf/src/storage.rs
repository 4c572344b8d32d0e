//! Msgpack-persisted router caches under `<storage>/lxmf/`.

use crate::error::LxmfError;
use crate::ticket::TicketSnapshot;
use rns_contract::DestinationHash;
use serde_bytes::ByteBuf;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

const STAMP_COSTS_FILE: &str = "outbound_stamp_costs";
const TICKETS_FILE: &str = "available_tickets";
const LOCAL_DELIVERIES_FILE: &str = "local_deliveries";

/// File-backed store for the router's durable caches.
///
/// All maps are written as msgpack with raw binary keys; a missing file
/// loads as empty state.
#[derive(Debug, Clone)]
pub struct RouterStore {
    root: PathBuf,
}

impl RouterStore {
    pub fn new(storage_root: &Path) -> Result<Self, LxmfError> {
        let root = storage_root.join("lxmf");
        fs::create_dir_all(&root).map_err(|err| LxmfError::Io(err.to_string()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write(&self, file: &str, bytes: &[u8]) -> Result<(), LxmfError> {
        fs::write(self.root.join(file), bytes).map_err(|err| LxmfError::Io(err.to_string()))
    }

    fn read(&self, file: &str) -> Result<Option<Vec<u8>>, LxmfError> {
        match fs::read(self.root.join(file)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(LxmfError::Io(err.to_string())),
        }
    }

    /// `dest_hash(16) → [recorded_epoch_s, cost]`.
    pub fn save_stamp_costs(
        &self,
        costs: &HashMap<DestinationHash, (i64, u8)>,
    ) -> Result<(), LxmfError> {
        let on_disk: BTreeMap<ByteBuf, (i64, i32)> = costs
            .iter()
            .map(|(dest, (recorded, cost))| {
                (
                    ByteBuf::from(dest.as_slice().to_vec()),
                    (*recorded, *cost as i32),
                )
            })
            .collect();
        let bytes =
            rmp_serde::to_vec(&on_disk).map_err(|err| LxmfError::Encode(err.to_string()))?;
        self.write(STAMP_COSTS_FILE, &bytes)
    }

    pub fn load_stamp_costs(&self) -> Result<HashMap<DestinationHash, (i64, u8)>, LxmfError> {
        let Some(bytes) = self.read(STAMP_COSTS_FILE)? else {
            return Ok(HashMap::new());
        };
        let on_disk: BTreeMap<ByteBuf, (i64, i32)> =
            rmp_serde::from_slice(&bytes).map_err(|err| LxmfError::Decode(err.to_string()))?;
        Ok(on_disk
            .into_iter()
            .filter_map(|(dest, (recorded, cost))| {
                let dest = DestinationHash::from_slice(&dest).ok()?;
                let cost = u8::try_from(cost).ok()?;
                Some((dest, (recorded, cost)))
            })
            .collect())
    }

    pub fn save_tickets(&self, snapshot: &TicketSnapshot) -> Result<(), LxmfError> {
        let bytes =
            rmp_serde::to_vec(snapshot).map_err(|err| LxmfError::Encode(err.to_string()))?;
        self.write(TICKETS_FILE, &bytes)
    }

    pub fn load_tickets(&self) -> Result<TicketSnapshot, LxmfError> {
        let Some(bytes) = self.read(TICKETS_FILE)? else {
            return Ok(TicketSnapshot::default());
        };
        rmp_serde::from_slice(&bytes).map_err(|err| LxmfError::Decode(err.to_string()))
    }

    /// `transient_id → received_epoch_s`, the dedup cache.
    pub fn save_local_deliveries(
        &self,
        deliveries: &HashMap<[u8; 32], i64>,
    ) -> Result<(), LxmfError> {
        let on_disk: BTreeMap<ByteBuf, i64> = deliveries
            .iter()
            .map(|(id, ts)| (ByteBuf::from(id.to_vec()), *ts))
            .collect();
        let bytes =
            rmp_serde::to_vec(&on_disk).map_err(|err| LxmfError::Encode(err.to_string()))?;
        self.write(LOCAL_DELIVERIES_FILE, &bytes)
    }

    pub fn load_local_deliveries(&self) -> Result<HashMap<[u8; 32], i64>, LxmfError> {
        let Some(bytes) = self.read(LOCAL_DELIVERIES_FILE)? else {
            return Ok(HashMap::new());
        };
        let on_disk: BTreeMap<ByteBuf, i64> =
            rmp_serde::from_slice(&bytes).map_err(|err| LxmfError::Decode(err.to_string()))?;
        Ok(on_disk
            .into_iter()
            .filter_map(|(id, ts)| {
                let id = <[u8; 32]>::try_from(id.as_slice()).ok()?;
                Some((id, ts))
            })
            .collect())
    }
}

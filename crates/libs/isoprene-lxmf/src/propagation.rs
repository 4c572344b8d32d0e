//! Propagation-node client: announce records, the store-and-forward send
//! wrapper and the two-stage list/get retrieval state machine.

use crate::constants::{DELIVERY_LIMIT_KB, PN_META_NAME};
use crate::error::LxmfError;
use rns_contract::{DestinationHash, Identity, Link, LinkId, Transport};
use std::sync::Arc;

/// Request endpoint served by propagation nodes.
pub const GET_PATH: &str = "/get";

/// A propagation node discovered via announce.
#[derive(Debug, Clone)]
pub struct PropagationNodeEntry {
    pub destination: DestinationHash,
    pub identity: Identity,
    pub display_name: Option<String>,
    pub timebase: i64,
    pub is_active: bool,
    pub per_transfer_limit_kb: u32,
    pub per_sync_limit_kb: u32,
    pub stamp_cost: u32,
    pub stamp_cost_flex: u32,
    pub peering_cost: u32,
    pub last_seen_epoch_s: i64,
}

impl PartialEq for PropagationNodeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.destination == other.destination
    }
}

impl PropagationNodeEntry {
    /// Parse a 7-element propagation announce:
    /// `[legacy_flag, timebase, is_active, per_transfer_kb, per_sync_kb,
    ///   [cost, flex, peering], metadata_map]`.
    pub fn from_announce(
        destination: DestinationHash,
        identity: Identity,
        app_data: &[u8],
        now_epoch_s: i64,
    ) -> Result<Self, LxmfError> {
        let mut cursor = app_data;
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|err| LxmfError::Decode(err.to_string()))?;
        let rmpv::Value::Array(elements) = value else {
            return Err(LxmfError::Decode("announce must be an array".into()));
        };
        if elements.len() != 7 {
            return Err(LxmfError::Decode(format!(
                "propagation announce must have 7 elements, got {}",
                elements.len()
            )));
        }

        let timebase = elements[1]
            .as_i64()
            .ok_or_else(|| LxmfError::Decode("timebase must be an integer".into()))?;
        let is_active = elements[2]
            .as_bool()
            .ok_or_else(|| LxmfError::Decode("active flag must be a bool".into()))?;
        let per_transfer_limit_kb = decode_u32(&elements[3], "per-transfer limit")?;
        let per_sync_limit_kb = decode_u32(&elements[4], "per-sync limit")?;

        let costs = elements[5]
            .as_array()
            .ok_or_else(|| LxmfError::Decode("cost block must be an array".into()))?;
        if costs.len() != 3 {
            return Err(LxmfError::Decode("cost block must have 3 elements".into()));
        }
        let stamp_cost = decode_u32(&costs[0], "stamp cost")?;
        let stamp_cost_flex = decode_u32(&costs[1], "stamp cost flexibility")?;
        let peering_cost = decode_u32(&costs[2], "peering cost")?;

        let display_name = elements[6].as_map().and_then(|entries| {
            entries.iter().find_map(|(key, value)| {
                (key.as_u64() == Some(PN_META_NAME as u64))
                    .then(|| value.as_slice())
                    .flatten()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            })
        });

        Ok(Self {
            destination,
            identity,
            display_name,
            timebase,
            is_active,
            per_transfer_limit_kb,
            per_sync_limit_kb,
            stamp_cost,
            stamp_cost_flex,
            peering_cost,
            last_seen_epoch_s: now_epoch_s,
        })
    }
}

fn decode_u32(value: &rmpv::Value, what: &str) -> Result<u32, LxmfError> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| LxmfError::Decode(format!("{what} must be an unsigned integer")))
}

/// Wrap packed message bytes for a store-and-forward upload:
/// `msgpack([timebase_f64_seconds, [packed]])`.
pub fn pack_for_node(timebase_epoch_s: f64, packed: &[u8]) -> Result<Vec<u8>, LxmfError> {
    let value = rmpv::Value::Array(vec![
        rmpv::Value::F64(timebase_epoch_s),
        rmpv::Value::Array(vec![rmpv::Value::Binary(packed.to_vec())]),
    ]);
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, &value)
        .map_err(|err| LxmfError::Encode(err.to_string()))?;
    Ok(out)
}

/// LIST request body: `msgpack([nil, nil])`.
pub fn list_request() -> Result<Vec<u8>, LxmfError> {
    encode(&rmpv::Value::Array(vec![
        rmpv::Value::Nil,
        rmpv::Value::Nil,
    ]))
}

/// GET request body: `msgpack([[wants…], [], limit_kb])`.
pub fn get_request(wants: &[Vec<u8>], limit_kb: u32) -> Result<Vec<u8>, LxmfError> {
    let ids = wants
        .iter()
        .map(|id| rmpv::Value::Binary(id.clone()))
        .collect();
    encode(&rmpv::Value::Array(vec![
        rmpv::Value::Array(ids),
        rmpv::Value::Array(Vec::new()),
        rmpv::Value::Integer((limit_kb as u64).into()),
    ]))
}

fn encode(value: &rmpv::Value) -> Result<Vec<u8>, LxmfError> {
    let mut out = Vec::new();
    rmpv::encode::write_value(&mut out, value)
        .map_err(|err| LxmfError::Encode(err.to_string()))?;
    Ok(out)
}

/// A `/get` response: either a list of binaries or a remote error code.
fn decode_response(bytes: &[u8]) -> Result<Vec<Vec<u8>>, LxmfError> {
    let mut cursor = bytes;
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|err| LxmfError::Decode(err.to_string()))?;
    match value {
        rmpv::Value::Integer(code) => Err(LxmfError::Remote(code.as_u64().unwrap_or(0))),
        rmpv::Value::Array(elements) => elements
            .iter()
            .map(|element| {
                element
                    .as_slice()
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| LxmfError::Decode("response entry must be binary".into()))
            })
            .collect(),
        _ => Err(LxmfError::Decode("unexpected response shape".into())),
    }
}

/// Two-stage retrieval progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationState {
    Idle,
    LinkEstablishing,
    LinkEstablished,
    ListingMessages,
    RequestingMessages,
    ReceivingMessages,
    Complete,
    Failed,
    NoPath,
    NoLink,
}

impl PropagationState {
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::LinkEstablishing
                | Self::LinkEstablished
                | Self::ListingMessages
                | Self::RequestingMessages
                | Self::ReceivingMessages
        )
    }
}

/// What a response advanced the sync to.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Stage advanced, nothing to deliver yet.
    Pending,
    /// Retrieved message payloads to run through the inbound gate.
    Messages(Vec<Vec<u8>>),
    /// Sync finished with this many retrieved messages.
    Complete(usize),
    /// Remote error code or local failure.
    Failed(Option<u64>),
    /// The response did not belong to this client.
    Unrelated,
}

/// Client half of the store-and-forward protocol.
pub struct PropagationClient {
    state: PropagationState,
    active_node: Option<PropagationNodeEntry>,
    link: Option<Arc<dyn Link>>,
    pending_list_request: Option<u64>,
    pending_get_request: Option<u64>,
    wanted: usize,
    received: usize,
    last_result: Option<usize>,
}

impl Default for PropagationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl PropagationClient {
    pub fn new() -> Self {
        Self {
            state: PropagationState::Idle,
            active_node: None,
            link: None,
            pending_list_request: None,
            pending_get_request: None,
            wanted: 0,
            received: 0,
            last_result: None,
        }
    }

    pub fn state(&self) -> PropagationState {
        self.state
    }

    pub fn active_node(&self) -> Option<&PropagationNodeEntry> {
        self.active_node.as_ref()
    }

    pub fn link(&self) -> Option<&Arc<dyn Link>> {
        self.link.as_ref()
    }

    /// Fraction of wanted messages received in the current sync.
    pub fn progress(&self) -> f32 {
        if self.wanted == 0 {
            0.0
        } else {
            self.received as f32 / self.wanted as f32
        }
    }

    pub fn last_result(&self) -> Option<usize> {
        self.last_result
    }

    /// Replace the active node when the announce is newer.
    pub fn update_node(&mut self, entry: PropagationNodeEntry) {
        let replace = self
            .active_node
            .as_ref()
            .map(|current| {
                current.destination == entry.destination
                    || entry.last_seen_epoch_s >= current.last_seen_epoch_s
            })
            .unwrap_or(true);
        if replace {
            self.active_node = Some(entry);
        }
    }

    /// Begin a retrieval sync. Returns an error when no node is known; when
    /// a link must first be established, the state moves to
    /// `LinkEstablishing` and the caller resumes via
    /// [`on_link_established`](Self::on_link_established).
    pub fn begin_sync(
        &mut self,
        transport: &dyn Transport,
        list_request_id: u64,
    ) -> Result<(), LxmfError> {
        if self.state.is_busy() {
            return Ok(());
        }
        let node = self
            .active_node
            .as_ref()
            .ok_or(LxmfError::NoPropagationNode)?;
        let destination = node.destination;

        if let Some(link) = self.link.clone() {
            if link.status() == rns_contract::LinkStatus::Active {
                return self.issue_list(&link, list_request_id);
            }
            self.link = None;
        }

        if !transport.has_path(&destination) {
            transport.request_path(&destination);
            self.state = PropagationState::NoPath;
            return Ok(());
        }

        transport.establish_link(&destination)?;
        self.state = PropagationState::LinkEstablishing;
        Ok(())
    }

    /// A link to the active node came up while a sync was pending.
    pub fn on_link_established(
        &mut self,
        link: Arc<dyn Link>,
        list_request_id: u64,
    ) -> Result<(), LxmfError> {
        self.state = PropagationState::LinkEstablished;
        let result = self.issue_list(&link, list_request_id);
        self.link = Some(link);
        result
    }

    fn issue_list(&mut self, link: &Arc<dyn Link>, request_id: u64) -> Result<(), LxmfError> {
        let body = list_request()?;
        link.request(GET_PATH, &body, request_id)?;
        self.pending_list_request = Some(request_id);
        self.wanted = 0;
        self.received = 0;
        self.state = PropagationState::ListingMessages;
        Ok(())
    }

    /// Whether the sync is waiting on this request id.
    pub fn owns_request(&self, request_id: u64) -> bool {
        self.pending_list_request == Some(request_id)
            || self.pending_get_request == Some(request_id)
    }

    /// Drive the FSM with a `/get` response. `is_known` filters transient IDs
    /// already in the dedup cache; `get_request_id` is used when the LIST
    /// stage advances into GET.
    pub fn on_request_response(
        &mut self,
        request_id: u64,
        response: &[u8],
        is_known: &dyn Fn(&[u8]) -> bool,
        get_request_id: u64,
    ) -> SyncOutcome {
        if self.pending_list_request == Some(request_id) {
            self.pending_list_request = None;
            return self.advance_from_list(response, is_known, get_request_id);
        }
        if self.pending_get_request == Some(request_id) {
            self.pending_get_request = None;
            return self.advance_from_get(response);
        }
        SyncOutcome::Unrelated
    }

    fn advance_from_list(
        &mut self,
        response: &[u8],
        is_known: &dyn Fn(&[u8]) -> bool,
        get_request_id: u64,
    ) -> SyncOutcome {
        let ids = match decode_response(response) {
            Ok(ids) => ids,
            Err(LxmfError::Remote(code)) => {
                self.state = PropagationState::Failed;
                return SyncOutcome::Failed(Some(code));
            }
            Err(_) => {
                self.state = PropagationState::Failed;
                return SyncOutcome::Failed(None);
            }
        };

        let wants: Vec<Vec<u8>> = ids.into_iter().filter(|id| !is_known(id)).collect();
        if wants.is_empty() {
            self.state = PropagationState::Complete;
            self.last_result = Some(0);
            return SyncOutcome::Complete(0);
        }

        let Some(link) = self.link.clone() else {
            self.state = PropagationState::NoLink;
            return SyncOutcome::Failed(None);
        };
        let body = match get_request(&wants, DELIVERY_LIMIT_KB) {
            Ok(body) => body,
            Err(_) => {
                self.state = PropagationState::Failed;
                return SyncOutcome::Failed(None);
            }
        };
        if link.request(GET_PATH, &body, get_request_id).is_err() {
            self.state = PropagationState::Failed;
            return SyncOutcome::Failed(None);
        }

        self.wanted = wants.len();
        self.pending_get_request = Some(get_request_id);
        self.state = PropagationState::RequestingMessages;
        SyncOutcome::Pending
    }

    fn advance_from_get(&mut self, response: &[u8]) -> SyncOutcome {
        self.state = PropagationState::ReceivingMessages;
        match decode_response(response) {
            Ok(messages) => {
                self.received = messages.len();
                self.last_result = Some(messages.len());
                self.state = PropagationState::Complete;
                SyncOutcome::Messages(messages)
            }
            Err(LxmfError::Remote(code)) => {
                self.state = PropagationState::Failed;
                SyncOutcome::Failed(Some(code))
            }
            Err(_) => {
                self.state = PropagationState::Failed;
                SyncOutcome::Failed(None)
            }
        }
    }

    pub fn on_request_failed(&mut self, request_id: u64) -> bool {
        if !self.owns_request(request_id) {
            return false;
        }
        self.pending_list_request = None;
        self.pending_get_request = None;
        self.state = PropagationState::Failed;
        true
    }

    pub fn on_link_closed(&mut self, link_id: LinkId) {
        let ours = self
            .link
            .as_ref()
            .map(|link| link.link_id() == link_id)
            .unwrap_or(false);
        if !ours {
            return;
        }
        self.link = None;
        if self.state.is_busy() {
            self.state = PropagationState::NoLink;
            self.pending_list_request = None;
            self.pending_get_request = None;
        }
    }

    pub fn reset(&mut self) {
        self.state = PropagationState::Idle;
        self.pending_list_request = None;
        self.pending_get_request = None;
    }
}

#[cfg(test)]
mod tests {
    use super::{
        decode_response, get_request, list_request, pack_for_node, PropagationNodeEntry,
    };
    use crate::constants::ERROR_NO_ACCESS;
    use crate::error::LxmfError;
    use rand_core::OsRng;
    use rns_contract::{DestinationHash, PrivateIdentity};

    #[test]
    fn list_request_is_two_nils() {
        let body = list_request().expect("encode");
        assert_eq!(body, vec![0x92, 0xC0, 0xC0]);
    }

    #[test]
    fn get_request_shape() {
        let body = get_request(&[vec![0xAA; 4]], 1_000).expect("encode");
        let decoded: rmpv::Value =
            rmpv::decode::read_value(&mut body.as_slice()).expect("decode");
        let elements = decoded.as_array().expect("array");
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[0].as_array().expect("wants").len(), 1);
        assert!(elements[1].as_array().expect("offsets").is_empty());
        assert_eq!(elements[2].as_u64(), Some(1_000));
    }

    #[test]
    fn integer_response_is_remote_error() {
        let mut bytes = Vec::new();
        rmpv::encode::write_value(
            &mut bytes,
            &rmpv::Value::Integer((ERROR_NO_ACCESS as u64).into()),
        )
        .expect("encode");
        assert!(matches!(
            decode_response(&bytes),
            Err(LxmfError::Remote(code)) if code == ERROR_NO_ACCESS
        ));
    }

    #[test]
    fn pack_for_node_wraps_single_message() {
        let wrapped = pack_for_node(123.5, &[1, 2, 3]).expect("encode");
        let decoded: rmpv::Value =
            rmpv::decode::read_value(&mut wrapped.as_slice()).expect("decode");
        let elements = decoded.as_array().expect("array");
        assert_eq!(elements[0].as_f64(), Some(123.5));
        let inner = elements[1].as_array().expect("messages");
        assert_eq!(inner[0].as_slice(), Some([1u8, 2, 3].as_slice()));
    }

    #[test]
    fn announce_roundtrip() {
        let identity = PrivateIdentity::generate(&mut OsRng).public();
        let value = rmpv::Value::Array(vec![
            rmpv::Value::Boolean(false),
            rmpv::Value::Integer(1_700_000_000i64.into()),
            rmpv::Value::Boolean(true),
            rmpv::Value::Integer(256u64.into()),
            rmpv::Value::Integer(10_240u64.into()),
            rmpv::Value::Array(vec![
                rmpv::Value::Integer(16u64.into()),
                rmpv::Value::Integer(3u64.into()),
                rmpv::Value::Integer(18u64.into()),
            ]),
            rmpv::Value::Map(vec![(
                rmpv::Value::Integer(0x01u64.into()),
                rmpv::Value::Binary(b"relay-node".to_vec()),
            )]),
        ]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &value).expect("encode");

        let entry = PropagationNodeEntry::from_announce(
            DestinationHash::new([9u8; 16]),
            identity,
            &bytes,
            1_700_000_100,
        )
        .expect("parse");
        assert!(entry.is_active);
        assert_eq!(entry.timebase, 1_700_000_000);
        assert_eq!(entry.per_transfer_limit_kb, 256);
        assert_eq!(entry.per_sync_limit_kb, 10_240);
        assert_eq!(entry.stamp_cost, 16);
        assert_eq!(entry.stamp_cost_flex, 3);
        assert_eq!(entry.peering_cost, 18);
        assert_eq!(entry.display_name.as_deref(), Some("relay-node"));
    }

    #[test]
    fn short_announce_is_rejected() {
        let value = rmpv::Value::Array(vec![rmpv::Value::Boolean(false)]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &value).expect("encode");
        let identity = PrivateIdentity::generate(&mut OsRng).public();
        assert!(PropagationNodeEntry::from_announce(
            DestinationHash::new([9u8; 16]),
            identity,
            &bytes,
            0,
        )
        .is_err());
    }
}

mod fields;
mod types;
mod wire;

pub use fields::MessageFields;
pub use types::{DeliveryMethod, MessageState, Representation, UnverifiedReason};
pub use wire::WireMessage;

use crate::constants::{STAMP_LENGTH, TICKET_LENGTH};
use crate::error::LxmfError;
use rns_contract::{DestinationHash, IdentityStore, PrivateIdentity};
use std::fmt;
use std::sync::Arc;

pub type MessageCallback = Arc<dyn Fn(&LxmMessage) + Send + Sync>;

/// One LXMF message and its delivery lifecycle.
///
/// Outbound messages are built mutable, sealed with [`seal`](Self::seal) and
/// packed with [`pack`](Self::pack); once packed the wire form is immutable.
/// Inbound messages are constructed from raw bytes via
/// [`from_bytes`](Self::from_bytes).
#[derive(Clone)]
pub struct LxmMessage {
    pub destination_hash: DestinationHash,
    pub source_hash: DestinationHash,
    pub title: Vec<u8>,
    pub content: Vec<u8>,
    pub fields: MessageFields,
    pub timestamp: Option<f64>,

    pub desired_method: DeliveryMethod,
    pub method: DeliveryMethod,
    pub representation: Representation,
    state: MessageState,
    pub delivery_attempts: u32,
    pub next_delivery_attempt_ms: u64,
    pub progress: f32,

    pub stamp_cost: Option<u8>,
    pub stamp: Option<[u8; STAMP_LENGTH]>,
    pub defer_stamp: bool,
    pub outbound_ticket: Option<[u8; TICKET_LENGTH]>,
    pub include_ticket: bool,

    packed: Option<Vec<u8>>,
    transient_id: Option<[u8; 32]>,
    message_id: Option<[u8; 32]>,
    /// Raw wire stamp slot of an inbound message: a 32-byte stamp or a
    /// 16-byte ticket token.
    wire_stamp: Option<Vec<u8>>,

    pub signature_validated: bool,
    pub unverified_reason: Option<UnverifiedReason>,
    source_identity: Option<PrivateIdentity>,

    pub on_delivered: Option<MessageCallback>,
    pub on_failed: Option<MessageCallback>,
}

impl LxmMessage {
    pub fn outbound(
        destination_hash: DestinationHash,
        source_identity: PrivateIdentity,
        title: impl Into<Vec<u8>>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            destination_hash,
            source_hash: source_identity.destination_hash(),
            title: title.into(),
            content: content.into(),
            fields: MessageFields::new(),
            timestamp: None,
            desired_method: DeliveryMethod::Opportunistic,
            method: DeliveryMethod::Opportunistic,
            representation: Representation::Unknown,
            state: MessageState::Generating,
            delivery_attempts: 0,
            next_delivery_attempt_ms: 0,
            progress: 0.0,
            stamp_cost: None,
            stamp: None,
            defer_stamp: true,
            outbound_ticket: None,
            include_ticket: false,
            packed: None,
            transient_id: None,
            message_id: None,
            wire_stamp: None,
            signature_validated: false,
            unverified_reason: None,
            source_identity: Some(source_identity),
            on_delivered: None,
            on_failed: None,
        }
    }

    pub fn with_desired_method(mut self, method: DeliveryMethod) -> Self {
        self.desired_method = method;
        self
    }

    pub fn with_fields(mut self, fields: MessageFields) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_stamp_cost(mut self, cost: u8) -> Self {
        self.stamp_cost = Some(cost);
        self
    }

    pub fn with_include_ticket(mut self, include: bool) -> Self {
        self.include_ticket = include;
        self
    }

    pub fn state(&self) -> MessageState {
        self.state
    }

    /// Apply a state transition. Terminal states are sticky: a transition
    /// out of one is refused.
    pub fn transition(&mut self, next: MessageState) -> bool {
        if self.state.is_terminal() && next != self.state {
            return false;
        }
        self.state = next;
        true
    }

    /// Record one delivery attempt and its follow-up time.
    pub fn register_attempt(&mut self, next_attempt_ms: u64) {
        self.delivery_attempts += 1;
        self.next_delivery_attempt_ms = next_attempt_ms;
    }

    /// Fix the timestamp and derive the message id; the message can then be
    /// stamped and packed.
    pub fn seal(&mut self, now_epoch_s: f64) -> Result<(), LxmfError> {
        if self.state != MessageState::Generating {
            return Err(LxmfError::InvalidArgument(
                "message already sealed".into(),
            ));
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(now_epoch_s);
        }
        self.message_id = Some(self.wire_view()?.message_id()?);
        Ok(())
    }

    fn wire_view(&self) -> Result<WireMessage, LxmfError> {
        let timestamp = self
            .timestamp
            .ok_or_else(|| LxmfError::InvalidArgument("message not sealed".into()))?;
        Ok(WireMessage::new(
            self.destination_hash,
            self.source_hash,
            timestamp,
            self.title.clone(),
            self.content.clone(),
            self.fields.clone(),
        ))
    }

    /// Whether a proof-of-work search is still required before packing.
    pub fn needs_stamp(&self) -> bool {
        self.stamp_cost.is_some() && self.stamp.is_none() && self.outbound_ticket.is_none()
    }

    pub fn set_stamp(&mut self, stamp: [u8; STAMP_LENGTH]) {
        self.stamp = Some(stamp);
    }

    /// Seal the wire form: sign, attach the stamp slot and pack.
    pub fn pack(&mut self) -> Result<(), LxmfError> {
        let signer = self
            .source_identity
            .clone()
            .ok_or_else(|| LxmfError::InvalidArgument("no source identity to sign with".into()))?;
        let mut wire = self.wire_view()?;
        wire.sign(&signer)?;

        // A reply ticket substitutes for the stamp when available.
        if let Some(ticket) = self.outbound_ticket {
            wire.stamp = Some(ticket.to_vec());
        } else if let Some(stamp) = self.stamp {
            wire.stamp = Some(stamp.to_vec());
        }

        let packed = wire.pack()?;
        let representation = WireMessage::representation_for(packed.len(), self.desired_method);
        if self.desired_method == DeliveryMethod::Opportunistic
            && representation == Representation::Resource
        {
            return Err(LxmfError::InvalidArgument(
                "message too large for opportunistic delivery".into(),
            ));
        }

        self.transient_id = Some(WireMessage::transient_id(&packed));
        self.message_id = Some(wire.message_id()?);
        self.representation = representation;
        self.method = self.desired_method;
        self.packed = Some(packed);
        self.transition(MessageState::Outbound);
        Ok(())
    }

    /// Construct an inbound message from raw wire bytes, verifying the
    /// signature against the external identity cache.
    pub fn from_bytes(bytes: &[u8], identities: &dyn IdentityStore) -> Result<Self, LxmfError> {
        let wire = WireMessage::unpack(bytes)?;
        let transient_id = WireMessage::transient_id(bytes);
        let message_id = wire.message_id()?;

        let (signature_validated, unverified_reason) =
            match identities.identity_for(&wire.source) {
                None => (false, Some(UnverifiedReason::SourceUnknown)),
                Some(identity) => {
                    if wire.verify(&identity)? {
                        (true, None)
                    } else {
                        (false, Some(UnverifiedReason::SignatureInvalid))
                    }
                }
            };

        Ok(Self {
            destination_hash: wire.destination,
            source_hash: wire.source,
            title: wire.title,
            content: wire.content,
            fields: wire.fields,
            timestamp: Some(wire.timestamp),
            desired_method: DeliveryMethod::Opportunistic,
            method: DeliveryMethod::Opportunistic,
            representation: Representation::Unknown,
            state: MessageState::Generating,
            delivery_attempts: 0,
            next_delivery_attempt_ms: 0,
            progress: 0.0,
            stamp_cost: None,
            stamp: None,
            defer_stamp: false,
            outbound_ticket: None,
            include_ticket: false,
            packed: Some(bytes.to_vec()),
            transient_id: Some(transient_id),
            message_id: Some(message_id),
            wire_stamp: wire.stamp,
            signature_validated,
            unverified_reason,
            source_identity: None,
            on_delivered: None,
            on_failed: None,
        })
    }

    pub fn packed(&self) -> Option<&[u8]> {
        self.packed.as_deref()
    }

    /// Wire bytes for opportunistic sends: the destination hash is stripped
    /// because it already travels in the substrate packet header.
    pub fn packed_for_opportunistic(&self) -> Option<&[u8]> {
        self.packed
            .as_deref()
            .map(|packed| &packed[crate::constants::DESTINATION_LENGTH..])
    }

    pub fn transient_id(&self) -> Option<[u8; 32]> {
        self.transient_id
    }

    pub fn message_id(&self) -> Option<[u8; 32]> {
        self.message_id
    }

    pub fn wire_stamp(&self) -> Option<&[u8]> {
        self.wire_stamp.as_deref()
    }

    /// Offline representation: `lxm://<base64url(packed)>`.
    pub fn as_uri(&self) -> Result<String, LxmfError> {
        let packed = self
            .packed
            .as_deref()
            .ok_or_else(|| LxmfError::InvalidArgument("message not packed".into()))?;
        Ok(WireMessage::encode_lxm_uri(packed))
    }
}

impl fmt::Debug for LxmMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LxmMessage")
            .field("destination_hash", &self.destination_hash)
            .field("source_hash", &self.source_hash)
            .field("state", &self.state)
            .field("desired_method", &self.desired_method)
            .field("delivery_attempts", &self.delivery_attempts)
            .field("transient_id", &self.transient_id.map(hex::encode))
            .finish_non_exhaustive()
    }
}

use crate::error::RnsError;
use crate::hash::DestinationHash;
use crate::identity::Identity;
use crate::link::{Link, LinkId};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceKind {
    Delivery,
    PropagationNode,
}

/// Typed events emitted by the substrate towards a consumer.
///
/// The substrate invokes its callbacks on its own threads; the contract here
/// is that those callbacks only enqueue one of these events on a bounded
/// channel, and the consumer's worker drains the channel. Consumers never
/// share mutable state with substrate threads.
pub enum TransportEvent {
    /// Encrypted single packet addressed to a local destination.
    PacketInbound {
        destination: DestinationHash,
        payload: Vec<u8>,
    },
    LinkEstablished {
        link: Arc<dyn Link>,
    },
    LinkClosed {
        link_id: LinkId,
        destination: DestinationHash,
    },
    /// Packet arriving on an established link.
    LinkPacket {
        link_id: LinkId,
        payload: Vec<u8>,
    },
    /// Inbound resource completed on a link.
    LinkResource {
        link_id: LinkId,
        payload: Vec<u8>,
    },
    ReceiptDelivered {
        receipt_id: u64,
    },
    ReceiptTimeout {
        receipt_id: u64,
    },
    ResourceProgress {
        resource_id: u64,
        progress: f32,
    },
    ResourceConcluded {
        resource_id: u64,
        success: bool,
    },
    RequestResponse {
        link_id: LinkId,
        request_id: u64,
        response: Vec<u8>,
    },
    RequestFailed {
        link_id: LinkId,
        request_id: u64,
    },
    AnnounceReceived {
        kind: AnnounceKind,
        destination: DestinationHash,
        identity: Identity,
        app_data: Vec<u8>,
    },
}

/// Operations the substrate offers to a consumer.
pub trait Transport: Send + Sync {
    fn has_path(&self, destination: &DestinationHash) -> bool;

    fn request_path(&self, destination: &DestinationHash);

    fn expire_path(&self, destination: &DestinationHash);

    /// Send a single opportunistic packet. The payload is encrypted for the
    /// destination by the substrate; the destination hash travels in the
    /// packet header, not in `payload`.
    fn send_opportunistic(
        &self,
        destination: &DestinationHash,
        payload: &[u8],
        receipt_id: u64,
    ) -> Result<(), RnsError>;

    /// Begin establishing a link. Completion is reported asynchronously via
    /// `TransportEvent::LinkEstablished`.
    fn establish_link(&self, destination: &DestinationHash) -> Result<(), RnsError>;

    /// Emit an announce for a local destination with attached app data.
    fn announce(&self, destination: &DestinationHash, app_data: &[u8]) -> Result<(), RnsError>;
}

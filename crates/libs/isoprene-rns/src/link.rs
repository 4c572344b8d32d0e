use crate::error::RnsError;
use crate::hash::DestinationHash;
use crate::identity::{Identity, PrivateIdentity};

/// Opaque link handle identifier, unique for the lifetime of the transport.
pub type LinkId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Pending,
    Active,
    Closed,
}

/// A substrate link between two endpoints.
///
/// Links are owned by the transport; consumers hold `Arc<dyn Link>` lookup
/// references and react to close events, they never destroy the link.
pub trait Link: Send + Sync {
    fn link_id(&self) -> LinkId;

    fn status(&self) -> LinkStatus;

    /// Whether this side originated the link. Links opened towards us are
    /// backchannels: safe for replies, never for originating sends.
    fn is_outgoing(&self) -> bool;

    fn destination(&self) -> DestinationHash;

    /// Identity the remote end proved on this link, if it identified.
    fn remote_identity(&self) -> Option<Identity>;

    /// Send a single packet over the link. Delivery proof arrives as a
    /// `TransportEvent::ReceiptDelivered` carrying `receipt_id`.
    fn send(&self, payload: &[u8], receipt_id: u64) -> Result<(), RnsError>;

    /// Issue a request against a remote request endpoint. The response (or
    /// failure) arrives as a `TransportEvent::RequestResponse` /
    /// `RequestFailed` carrying `request_id`.
    fn request(&self, path: &str, data: &[u8], request_id: u64) -> Result<(), RnsError>;

    /// Start a chunked resource transfer. Progress and conclusion arrive as
    /// `TransportEvent::ResourceProgress` / `ResourceConcluded`.
    fn send_resource(&self, resource_id: u64, payload: &[u8]) -> Result<(), RnsError>;

    /// Prove our identity to the remote end.
    fn identify(&self, identity: &PrivateIdentity) -> Result<(), RnsError>;

    /// Allow or refuse inbound resource transfers on this link.
    fn set_resource_acceptance(&self, enabled: bool);

    fn close(&self);
}

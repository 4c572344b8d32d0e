//! # isoprene-lxmf
//!
//! LXMF (Lightweight Extensible Message Format) messaging layer: wire codec,
//! proof-of-work stamps, reply tickets, the delivery router and the
//! propagation-node client. Runs over any substrate implementing the
//! `isoprene-rns` contract.

pub mod constants;
pub mod error;
pub mod message;
pub mod propagation;
pub mod router;
pub mod stamp;
pub mod stamper;
pub mod storage;
pub mod ticket;

pub use error::LxmfError;
pub use message::{
    DeliveryMethod, LxmMessage, MessageFields, MessageState, Representation, UnverifiedReason,
    WireMessage,
};
pub use propagation::{PropagationClient, PropagationNodeEntry, PropagationState};
pub use router::{DeliveryDestination, Router, RouterConfig};
pub use stamper::Stamper;
pub use ticket::{Ticket, TicketStore};

//! # isoprene-rns
//!
//! Contract surface of the Reticulum transport substrate as seen by the
//! isoprene messaging crates. The substrate itself (packet encryption,
//! link handshakes, path discovery, resource chunking) lives out of tree;
//! this crate pins down the value types, traits and event stream that the
//! LXMF router and the BLE mesh orchestrator program against.
//!
//! ## Crate Family
//!
//! - **`isoprene-rns`** (this crate) — substrate contract
//! - [`isoprene-lxmf`] — LXMF message layer
//! - [`isoprene-mesh`] — BLE mesh transport

pub mod error;
pub mod hash;
pub mod identity;
pub mod iface;
pub mod link;
pub mod testing;
pub mod time;
pub mod transport;

pub use error::RnsError;
pub use hash::DestinationHash;
pub use identity::{Identity, IdentityStore, PrivateIdentity};
pub use iface::{InterfaceRegistry, TransportInterface};
pub use link::{Link, LinkId, LinkStatus};
pub use transport::{AnnounceKind, Transport, TransportEvent};

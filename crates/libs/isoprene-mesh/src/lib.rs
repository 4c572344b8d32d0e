//! # isoprene-mesh
//!
//! BLE mesh transport: a dual-role (central + peripheral) peer
//! orchestrator that discovers neighbours, performs an identity handshake,
//! deduplicates connections by identity across MAC rotations, supervises
//! peers with keepalives and zombie detection, and exposes one child
//! interface per peer to the substrate transport.
//!
//! The LXMF layer knows nothing about BLE; the mesh registers its child
//! interfaces through the `isoprene-rns` contract.
//!
//! ## Wire
//!
//! Packets are split into MTU-bounded fragments with a 5-byte big-endian
//! header:
//!
//! ```text
//! [type:1][seq:2][total:2][payload:variable]
//!  0x01 START / 0x02 CONTINUE / 0x03 END
//! ```
//!
//! A keepalive is the single byte `0x00`, never a header.

pub mod driver;
pub mod error;
pub mod fragment;
#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
pub mod native;
pub mod orchestrator;
pub mod peer;
pub mod score;

pub use driver::{BleConnection, BleDriver, DiscoveredPeer, DriverConfig, DriverEvent};
pub use error::MeshError;
pub use fragment::{Fragmenter, Reassembler, ReassemblerStats, FRAGMENT_HEADER_LEN};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use peer::PeerInterface;

/// Keepalive frame: one `0x00` byte, no header.
pub const KEEPALIVE: [u8; 1] = [0x00];

/// Length of the mesh peer identity exchanged in the handshake.
pub const IDENTITY_LENGTH: usize = 16;

//! Extension interfaces for out-of-tree transport carriers.
//!
//! Carrier crates (the BLE mesh, serial bridges, test harnesses) implement
//! [`TransportInterface`] per peer and hand instances to the substrate
//! through an [`InterfaceRegistry`].

use crate::error::RnsError;
use std::sync::Arc;

/// One attachable carrier for raw transport frames.
pub trait TransportInterface: Send + Sync {
    /// Stable identifier for metrics/config mapping, e.g. `ble/<peer-hex>`.
    fn interface_id(&self) -> String;

    /// Frame MTU supported by this carrier.
    fn mtu(&self) -> usize;

    /// Emit one outbound frame towards the peer behind this interface.
    fn send_frame(&self, frame: &[u8]) -> Result<(), RnsError>;
}

/// Registration surface the substrate exposes to carrier orchestrators.
pub trait InterfaceRegistry: Send + Sync {
    fn attach(&self, iface: Arc<dyn TransportInterface>) -> Result<(), RnsError>;

    fn detach(&self, interface_id: &str);

    /// Deliver one frame that arrived from the peer behind `interface_id`.
    fn inbound_frame(&self, interface_id: &str, frame: &[u8]);
}

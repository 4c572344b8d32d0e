use std::time::Duration;

/// Errors surfaced by the BLE mesh layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MeshError {
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("unknown fragment type 0x{0:02X}")]
    UnknownFragmentType(u8),

    #[error("fragment sequence {seq} outside total {total}")]
    SequenceOutOfRange { seq: u16, total: u16 },

    #[error("fragment total changed mid-packet: expected {expected}, got {got}")]
    TotalMismatch { expected: u16, got: u16 },

    #[error("conflicting payload for fragment sequence {seq}")]
    FragmentConflict { seq: u16 },

    #[error("empty packet")]
    EmptyPacket,

    #[error("packet needs {needed} fragments, limit is {limit}")]
    TooManyFragments { needed: usize, limit: usize },

    #[error("mtu {0} cannot carry a fragment header and payload")]
    MtuTooSmall(usize),

    #[error("identity must be 16 bytes, got {0}")]
    BadIdentityLength(usize),

    #[error("gatt operation timed out after {0:?}")]
    OpTimeout(Duration),

    #[error("operation queue closed")]
    QueueClosed,

    #[error("peer disconnected")]
    Disconnected,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("driver error: {0}")]
    Driver(String),
}

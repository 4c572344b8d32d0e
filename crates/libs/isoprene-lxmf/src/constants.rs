//! Protocol constants and router tunables.

pub const DESTINATION_LENGTH: usize = 16;
pub const SIGNATURE_LENGTH: usize = 64;
pub const TICKET_LENGTH: usize = 16;
pub const STAMP_LENGTH: usize = 32;
pub const TRANSIENT_ID_LENGTH: usize = 32;

/// HKDF expansion rounds for message stamp workblocks.
pub const WORKBLOCK_EXPAND_ROUNDS: usize = 3000;
/// HKDF expansion rounds for propagation-node-issued stamp workblocks.
pub const WORKBLOCK_EXPAND_ROUNDS_PN: usize = 1000;

// Payload size classes. Wire overhead is 2*DESTINATION_LENGTH + SIGNATURE_LENGTH
// + 8 (timestamp) + 8 (struct framing) = 112 bytes.
pub const ENCRYPTED_PACKET_MAX_CONTENT: usize = 295;
pub const LINK_PACKET_MAX_CONTENT: usize = 319;
pub const PLAIN_PACKET_MAX_CONTENT: usize = 368;
pub const PACKED_OVERHEAD: usize = 112;

// Router cadence.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;
pub const PROCESSING_INTERVAL_MS: u64 = 4_000;
pub const DELIVERY_RETRY_WAIT_MS: u64 = 10_000;
pub const PATH_REQUEST_WAIT_MS: u64 = 7_000;
pub const PATH_REREQUEST_DELAY_MS: u64 = 500;
pub const MAX_PATHLESS_TRIES: u32 = 1;
/// Outbound-loop ticks between cache cleanup passes.
pub const CLEANUP_INTERVAL_TICKS: u64 = 60;

// Expiries, in seconds.
pub const MESSAGE_EXPIRY_S: u64 = 30 * 24 * 60 * 60;
pub const TRANSIENT_ID_EXPIRY_S: u64 = 6 * MESSAGE_EXPIRY_S;
pub const STAMP_COST_EXPIRY_S: u64 = 45 * 24 * 60 * 60;
pub const TICKET_EXPIRY_S: u64 = 21 * 24 * 60 * 60;
pub const TICKET_GRACE_S: u64 = 5 * 24 * 60 * 60;
pub const TICKET_RENEW_S: u64 = 14 * 24 * 60 * 60;
pub const TICKET_INTERVAL_S: u64 = 24 * 60 * 60;

// Propagation-node defaults.
pub const PROPAGATION_COST: u32 = 16;
pub const PROPAGATION_COST_MIN: u32 = 13;
pub const PROPAGATION_COST_FLEX: u32 = 3;
pub const PEERING_COST: u32 = 18;
pub const MAX_PEERING_COST: u32 = 26;
pub const PROPAGATION_LIMIT_KB: u32 = 256;
pub const SYNC_LIMIT_KB: u32 = 10_240;
pub const DELIVERY_LIMIT_KB: u32 = 1_000;

// Remote error codes in `/get` responses.
pub const ERROR_NO_IDENTITY: u64 = 0xF0;
pub const ERROR_NO_ACCESS: u64 = 0xF1;
pub const ERROR_INVALID_STAMP: u64 = 0xF5;

// Message field identifiers.
pub const FIELD_EMBEDDED_LXMS: u8 = 0x01;
pub const FIELD_TELEMETRY: u8 = 0x02;
pub const FIELD_TELEMETRY_STREAM: u8 = 0x03;
pub const FIELD_ICON_APPEARANCE: u8 = 0x04;
pub const FIELD_FILE_ATTACHMENTS: u8 = 0x05;
pub const FIELD_IMAGE: u8 = 0x06;
pub const FIELD_AUDIO: u8 = 0x07;
pub const FIELD_THREAD: u8 = 0x08;
pub const FIELD_COMMANDS: u8 = 0x09;
pub const FIELD_RESULTS: u8 = 0x0A;
pub const FIELD_GROUP: u8 = 0x0B;
pub const FIELD_TICKET: u8 = 0x0C;
pub const FIELD_EVENT: u8 = 0x0D;
pub const FIELD_RNR_REFS: u8 = 0x0E;
pub const FIELD_RENDERER: u8 = 0x0F;
pub const FIELD_CUSTOM_TYPE: u8 = 0xFB;
pub const FIELD_CUSTOM_DATA: u8 = 0xFC;
pub const FIELD_CUSTOM_META: u8 = 0xFD;
pub const FIELD_NON_SPECIFIC: u8 = 0xFE;
pub const FIELD_DEBUG: u8 = 0xFF;

/// Declared for wire-table completeness; not consulted in send or receive
/// paths.
pub const COST_TICKET: u32 = 0x100;

/// Propagation-node announce metadata key carrying the display name.
pub const PN_META_NAME: u8 = 0x01;

pub const LXM_URI_PREFIX: &str = "lxm://";

/// Lifecycle states of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Generating,
    Outbound,
    Sending,
    Sent,
    Delivered,
    Rejected,
    Cancelled,
    Failed,
}

impl MessageState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::Rejected | Self::Cancelled | Self::Failed
        )
    }
}

/// How the sender wants the message moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    Opportunistic,
    Direct,
    Propagated,
    Paper,
}

/// Wire representation chosen after packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    Unknown,
    Packet,
    Resource,
}

/// Why an inbound message failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnverifiedReason {
    SourceUnknown,
    SignatureInvalid,
}

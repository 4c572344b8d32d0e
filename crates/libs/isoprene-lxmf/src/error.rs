/// Errors surfaced by the LXMF layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LxmfError {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("verify error: {0}")]
    Verify(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("propagation node returned error code 0x{0:02X}")]
    Remote(u64),

    #[error("no active propagation node")]
    NoPropagationNode,
}

impl From<rns_contract::RnsError> for LxmfError {
    fn from(err: rns_contract::RnsError) -> Self {
        Self::Transport(err.to_string())
    }
}

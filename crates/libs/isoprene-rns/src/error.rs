/// Errors surfaced across the substrate contract boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RnsError {
    #[error("invalid {what} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("no path to destination {0}")]
    NoPath(String),

    #[error("link is not active")]
    LinkNotActive,

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("send failed: {0}")]
    Send(String),
}

use crate::error::RnsError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a truncated destination address hash.
pub const DESTINATION_LENGTH: usize = 16;

/// 16-byte truncated hash addressing a Reticulum endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DestinationHash([u8; DESTINATION_LENGTH]);

impl DestinationHash {
    pub const fn new(bytes: [u8; DESTINATION_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, RnsError> {
        let arr: [u8; DESTINATION_LENGTH] =
            bytes.try_into().map_err(|_| RnsError::InvalidLength {
                what: "destination hash",
                expected: DESTINATION_LENGTH,
                got: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub fn from_hex(value: &str) -> Result<Self, RnsError> {
        let bytes = hex::decode(value).map_err(|_| RnsError::InvalidLength {
            what: "destination hash hex",
            expected: DESTINATION_LENGTH * 2,
            got: value.len(),
        })?;
        Self::from_slice(&bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; DESTINATION_LENGTH] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for DestinationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", hex::encode(self.0))
    }
}

impl fmt::Debug for DestinationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for DestinationHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

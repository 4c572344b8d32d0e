use crate::error::RnsError;
use crate::hash::{DestinationHash, DESTINATION_LENGTH};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SIGNATURE_LENGTH: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Public half of a Reticulum identity.
///
/// The substrate derives the addressable destination hash from the signing
/// public key: the first 16 bytes of its SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    verifying: VerifyingKey,
}

impl Identity {
    pub fn from_public_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self, RnsError> {
        let verifying = VerifyingKey::from_bytes(bytes)
            .map_err(|e| RnsError::InvalidKey(e.to_string()))?;
        Ok(Self { verifying })
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying.to_bytes()
    }

    pub fn destination_hash(&self) -> DestinationHash {
        let digest = Sha256::digest(self.verifying.as_bytes());
        let mut out = [0u8; DESTINATION_LENGTH];
        out.copy_from_slice(&digest[..DESTINATION_LENGTH]);
        DestinationHash::new(out)
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.verifying.verify(data, &signature).is_ok()
    }
}

/// Private half of a Reticulum identity, able to sign.
#[derive(Debug, Clone)]
pub struct PrivateIdentity {
    signing: SigningKey,
}

impl PrivateIdentity {
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self {
            signing: SigningKey::generate(rng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing.sign(data).to_bytes()
    }

    pub fn public(&self) -> Identity {
        Identity {
            verifying: self.signing.verifying_key(),
        }
    }

    pub fn destination_hash(&self) -> DestinationHash {
        self.public().destination_hash()
    }
}

/// External identity cache consulted when verifying inbound messages.
pub trait IdentityStore: Send + Sync {
    fn identity_for(&self, destination: &DestinationHash) -> Option<Identity>;

    /// Remember an identity learned out of band (announce, link identify).
    fn remember(&self, identity: &Identity);
}

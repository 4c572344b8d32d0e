//! Stamp workblock derivation and validation.
//!
//! Byte-exact with the Python LXMF implementation: the workblock expands the
//! stamp material through salted HKDF-SHA256 rounds, and a stamp is valid
//! when `SHA256(workblock || stamp)` clears the difficulty target.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

/// Output size of one HKDF expansion round.
const ROUND_OUTPUT_LEN: usize = 256;

/// Derive the proof-of-work search space for `material`.
///
/// For each round `n`, the salt is `SHA256(material || msgpack_int(n))` and
/// the round contributes 256 bytes of HKDF-SHA256 output keyed on the
/// material.
pub fn stamp_workblock(material: &[u8], expand_rounds: usize) -> Vec<u8> {
    let mut workblock = Vec::with_capacity(expand_rounds * ROUND_OUTPUT_LEN);

    for n in 0..expand_rounds {
        let mut salt_data = Vec::with_capacity(material.len() + 8);
        salt_data.extend_from_slice(material);
        // msgpack integer encoding keeps the salt byte-compatible with
        // Python's umsgpack.packb(n).
        let packed = rmp_serde::to_vec(&n).unwrap_or_default();
        salt_data.extend_from_slice(&packed);
        let salt = Sha256::digest(&salt_data);

        let hk = Hkdf::<Sha256>::new(Some(salt.as_slice()), material);
        let mut okm = [0u8; ROUND_OUTPUT_LEN];
        // 256 bytes is within HKDF-SHA256's output bound, expand cannot fail.
        if hk.expand(&[], &mut okm).is_err() {
            break;
        }
        workblock.extend_from_slice(&okm);
    }

    workblock
}

/// Number of leading zero bits of `SHA256(workblock || stamp)`.
pub fn stamp_value(workblock: &[u8], stamp: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(workblock);
    hasher.update(stamp);
    let hash = hasher.finalize();

    let mut value = 0u32;
    for byte in hash.iter() {
        if *byte == 0 {
            value += 8;
        } else {
            value += byte.leading_zeros();
            break;
        }
    }
    value
}

/// Whether `stamp` clears `target_cost` leading zero bits over `workblock`.
pub fn stamp_valid(stamp: &[u8], target_cost: u32, workblock: &[u8]) -> bool {
    stamp_value(workblock, stamp) >= target_cost
}

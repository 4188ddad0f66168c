//! Deterministic request identification and MPC key derivation
//!
//! Both the source-ledger program and the threshold-signing service recompute
//! these values independently, so every byte of the encodings here is part of
//! the wire contract.

pub mod derivation;
pub mod request_id;

pub use derivation::{
    address_from_public_key, derive_address, derive_epsilon, derive_public_key, DerivationConfig,
    WITHDRAWAL_ROOT_PATH,
};
pub use request_id::{compute_request_id, RequestId, SignRequest};

use sha3::{Digest, Keccak256};

/// Keccak-256 as used by the target ledger
pub fn keccak256(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}

/// Strip an optional 0x prefix and decode hex
pub(crate) fn decode_hex(input: &str) -> Result<Vec<u8>, hex::FromHexError> {
    let trimmed = input.strip_prefix("0x").unwrap_or(input);
    hex::decode(trimmed)
}

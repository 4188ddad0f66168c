//! Epsilon key derivation
//!
//! `derived = epsilon·G + base` on secp256k1, where
//! `epsilon = keccak256("<prefix>,<chain tag>,<requester>,<path>")`.
//! The derived point is the public key of a target-ledger account whose
//! signing key is held by the threshold network.

use crate::error::{BridgeError, BridgeResult};
use crate::state::Identity;

use ethers::core::k256::elliptic_curve::ops::Reduce;
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::core::k256::{FieldBytes, ProjectivePoint, PublicKey, Scalar};
use ethers::types::Address;

use super::keccak256;

pub const EPSILON_DERIVATION_PREFIX: &str = "sig.network v1.0.0 epsilon derivation";
/// CAIP-style tag of the source ledger mixed into every epsilon
pub const SOURCE_CHAIN_TAG: &str = "0x800001f5";
/// Derivation path of the global vault that signs withdrawals
pub const WITHDRAWAL_ROOT_PATH: &str = "root";

/// Constants that parameterize derivation
#[derive(Debug, Clone)]
pub struct DerivationConfig {
    pub prefix: String,
    pub chain_tag: String,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            prefix: EPSILON_DERIVATION_PREFIX.to_string(),
            chain_tag: SOURCE_CHAIN_TAG.to_string(),
        }
    }
}

/// Hash-derived scalar offset for a requester and path
pub fn derive_epsilon(config: &DerivationConfig, requester: &Identity, path: &str) -> Scalar {
    let preimage = format!(
        "{},{},{},{}",
        config.prefix,
        config.chain_tag,
        requester.as_str(),
        path
    );
    let hash = keccak256(preimage.as_bytes());
    <Scalar as Reduce<ethers::core::k256::U256>>::reduce_bytes(&FieldBytes::from(hash))
}

fn parse_base_key(base_public_key: &str) -> BridgeResult<PublicKey> {
    let bytes = super::decode_hex(base_public_key)
        .map_err(|e| BridgeError::Crypto(format!("Base public key is not hex: {}", e)))?;
    PublicKey::from_sec1_bytes(&bytes)
        .map_err(|_| BridgeError::Crypto("Base public key is not a valid curve point".to_string()))
}

/// Derive the uncompressed (0x04-prefixed, 65 byte) public key for `requester` and `path`
pub fn derive_public_key(
    path: &str,
    requester: &Identity,
    base_public_key: &str,
) -> BridgeResult<[u8; 65]> {
    derive_public_key_with(&DerivationConfig::default(), path, requester, base_public_key)
}

pub fn derive_public_key_with(
    config: &DerivationConfig,
    path: &str,
    requester: &Identity,
    base_public_key: &str,
) -> BridgeResult<[u8; 65]> {
    let base = parse_base_key(base_public_key)?;
    let epsilon = derive_epsilon(config, requester, path);

    let derived = ProjectivePoint::GENERATOR * epsilon + base.to_projective();
    let derived = PublicKey::from_affine(derived.to_affine())
        .map_err(|_| BridgeError::Crypto("Derived key is the point at infinity".to_string()))?;

    let encoded = derived.to_encoded_point(false);
    let mut out = [0u8; 65];
    out.copy_from_slice(encoded.as_bytes());
    Ok(out)
}

/// Target-ledger address of an uncompressed public key
pub fn address_from_public_key(uncompressed: &[u8; 65]) -> Address {
    let hash = keccak256(&uncompressed[1..]);
    Address::from_slice(&hash[12..])
}

/// Derive the target-ledger address controlled by the signing network for `requester` and `path`
pub fn derive_address(
    path: &str,
    requester: &Identity,
    base_public_key: &str,
) -> BridgeResult<Address> {
    derive_public_key(path, requester, base_public_key).map(|key| address_from_public_key(&key))
}

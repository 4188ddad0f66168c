//! Request ID computation
//!
//! `request_id = keccak256(abi.encodePacked(string sender, bytes tx, uint32 coinType,
//! uint32 keyVersion, string path, string algo, string dest, string params))`
//!
//! Packed encoding writes strings and bytes raw and integers as fixed-width
//! big-endian words, exactly as the on-ledger verifier does.

use crate::error::{BridgeError, BridgeResult};
use crate::state::Identity;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::keccak256;

/// SLIP-44 coin type of the target ledger
pub const ETHEREUM_COIN_TYPE: u32 = 60;
/// Key version requested from the signing service
pub const DEFAULT_KEY_VERSION: u32 = 0;
pub const SIGNATURE_ALGORITHM: &str = "ECDSA";
pub const TARGET_DESTINATION: &str = "ethereum";

/// 32-byte correlation ID shared by both ledgers and the signing service
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub [u8; 32]);

impl RequestId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.to_hex())
    }
}

impl FromStr for RequestId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = super::decode_hex(s)
            .map_err(|e| BridgeError::InputValidation(format!("Invalid request id hex: {}", e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            BridgeError::InputValidation(format!("Request id must be 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 32]> for RequestId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Compute the request ID for a signing request
#[allow(clippy::too_many_arguments)]
pub fn compute_request_id(
    sender: &Identity,
    unsigned_tx: &[u8],
    coin_type: u32,
    key_version: u32,
    path: &str,
    algo: &str,
    dest: &str,
    params: &str,
) -> BridgeResult<RequestId> {
    if sender.as_str().is_empty() {
        return Err(BridgeError::InputValidation(
            "Request sender identity must not be empty".to_string(),
        ));
    }

    let sender = sender.as_str().as_bytes();
    let mut encoded = Vec::with_capacity(
        sender.len() + unsigned_tx.len() + 8 + path.len() + algo.len() + dest.len() + params.len(),
    );
    encoded.extend_from_slice(sender);
    encoded.extend_from_slice(unsigned_tx);
    encoded.extend_from_slice(&coin_type.to_be_bytes());
    encoded.extend_from_slice(&key_version.to_be_bytes());
    encoded.extend_from_slice(path.as_bytes());
    encoded.extend_from_slice(algo.as_bytes());
    encoded.extend_from_slice(dest.as_bytes());
    encoded.extend_from_slice(params.as_bytes());

    Ok(RequestId(keccak256(&encoded)))
}

/// Semantic inputs of one signing request
#[derive(Debug, Clone)]
pub struct SignRequest {
    pub sender: Identity,
    pub unsigned_tx: Vec<u8>,
    pub coin_type: u32,
    pub key_version: u32,
    pub path: String,
    pub algo: String,
    pub dest: String,
    pub params: String,
}

impl SignRequest {
    /// Request for an Ethereum-family target with default key version and algorithm
    pub fn ethereum(sender: Identity, unsigned_tx: Vec<u8>, path: impl Into<String>) -> Self {
        Self {
            sender,
            unsigned_tx,
            coin_type: ETHEREUM_COIN_TYPE,
            key_version: DEFAULT_KEY_VERSION,
            path: path.into(),
            algo: SIGNATURE_ALGORITHM.to_string(),
            dest: TARGET_DESTINATION.to_string(),
            params: String::new(),
        }
    }

    pub fn request_id(&self) -> BridgeResult<RequestId> {
        compute_request_id(
            &self.sender,
            &self.unsigned_tx,
            self.coin_type,
            self.key_version,
            &self.path,
            &self.algo,
            &self.dest,
            &self.params,
        )
    }
}

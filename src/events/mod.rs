//! Signing-service event types
//!
//! The threshold-signing service reports progress through two events, each
//! carrying the request id it answers:
//! - `SignatureEvent`: an ECDSA signature over the unsigned target transaction
//! - `ReadResponseEvent`: an authenticated copy of what the target ledger returned

pub mod broker;
pub mod listener;

pub use broker::{
    BrokerConfig, EventFuture, EventPromises, EventSubscriptionBroker, SubscriptionSnapshot,
};
pub use listener::SignerEventListener;

use crate::crypto::{keccak256, RequestId};
use crate::error::{BridgeError, BridgeResult};

use ethers::types::{Address, Signature, H256, U256};
use serde::{Deserialize, Serialize};

/// Prefix the signing service puts in front of error-shaped read outputs
pub const ERROR_OUTPUT_MAGIC: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

/// Affine secp256k1 point as two big-endian coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcPoint {
    #[serde(with = "hex_serde::bytes32")]
    pub x: [u8; 32],
    #[serde(with = "hex_serde::bytes32")]
    pub y: [u8; 32],
}

/// Signature as emitted by the signing service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MpcSignature {
    pub big_r: EcPoint,
    #[serde(with = "hex_serde::bytes32")]
    pub s: [u8; 32],
    pub recovery_id: u8,
}

impl MpcSignature {
    /// `r = bigR.x`; `v` carries the bare recovery id (0 or 1)
    pub fn to_ethers(&self) -> Signature {
        Signature {
            r: U256::from_big_endian(&self.big_r.x),
            s: U256::from_big_endian(&self.s),
            v: self.recovery_id as u64,
        }
    }

    pub fn recover(&self, message_hash: H256) -> BridgeResult<Address> {
        if self.recovery_id > 1 {
            return Err(BridgeError::Crypto(format!(
                "Recovery id must be 0 or 1, got {}",
                self.recovery_id
            )));
        }
        self.to_ethers()
            .recover(message_hash)
            .map_err(|e| BridgeError::Crypto(format!("Signature recovery failed: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureEvent {
    pub request_id: RequestId,
    pub signature: MpcSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResponseEvent {
    pub request_id: RequestId,
    #[serde(with = "hex_serde::bytes")]
    pub serialized_output: Vec<u8>,
    pub signature: MpcSignature,
}

impl ReadResponseEvent {
    /// Message the responder signs: `keccak256(request_id ∥ serialized_output)`
    pub fn message_hash(&self) -> H256 {
        let mut message = Vec::with_capacity(32 + self.serialized_output.len());
        message.extend_from_slice(self.request_id.as_bytes());
        message.extend_from_slice(&self.serialized_output);
        H256(keccak256(&message))
    }

    pub fn recover_signer(&self) -> BridgeResult<Address> {
        self.signature.recover(self.message_hash())
    }

    pub fn output(&self) -> ReadOutput {
        ReadOutput::decode(&self.serialized_output)
    }
}

/// Read-response payload, classified once at the boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutput {
    Bool(bool),
    Error(Vec<u8>),
    Raw(Vec<u8>),
}

impl ReadOutput {
    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.starts_with(&ERROR_OUTPUT_MAGIC) {
            return ReadOutput::Error(bytes[ERROR_OUTPUT_MAGIC.len()..].to_vec());
        }
        match bytes {
            [0x00] => ReadOutput::Bool(false),
            [0x01] => ReadOutput::Bool(true),
            _ => ReadOutput::Raw(bytes.to_vec()),
        }
    }

    /// True when the payload says the target transfer did not take effect
    pub fn indicates_failure(&self) -> bool {
        matches!(self, ReadOutput::Bool(false) | ReadOutput::Error(_))
    }
}

/// Event emitted by the signing program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignerEvent {
    Signature(SignatureEvent),
    ReadResponse(ReadResponseEvent),
}

impl SignerEvent {
    pub fn request_id(&self) -> RequestId {
        match self {
            SignerEvent::Signature(e) => e.request_id,
            SignerEvent::ReadResponse(e) => e.request_id,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self {
            SignerEvent::Signature(_) => "signature",
            SignerEvent::ReadResponse(_) => "read_response",
        }
    }
}

/// Signer event plus where on the source ledger it was observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedEvent {
    pub event: SignerEvent,
    pub slot: u64,
    pub source_tx: String,
}

/// Path by which an event reached the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Live,
    Backfill,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Live => "live",
            EventOrigin::Backfill => "backfill",
        }
    }
}

pub(crate) mod hex_serde {
    //! 0x-prefixed hex encodings for byte fields

    pub mod bytes32 {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&format!("0x{}", hex::encode(value)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
            let s = String::deserialize(deserializer)?;
            let bytes = crate::crypto::decode_hex(&s).map_err(serde::de::Error::custom)?;
            bytes
                .try_into()
                .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
        }
    }

    pub mod bytes {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&format!("0x{}", hex::encode(value)))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
            let s = String::deserialize(deserializer)?;
            crate::crypto::decode_hex(&s).map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::LocalWallet;

    #[test]
    fn test_read_output_classification() {
        assert_eq!(ReadOutput::decode(&[0x00]), ReadOutput::Bool(false));
        assert_eq!(ReadOutput::decode(&[0x01]), ReadOutput::Bool(true));
        assert_eq!(
            ReadOutput::decode(&[0xde, 0xad, 0xbe, 0xef, 0x05]),
            ReadOutput::Error(vec![0x05])
        );
        assert_eq!(ReadOutput::decode(&[0x02]), ReadOutput::Raw(vec![0x02]));
        assert_eq!(ReadOutput::decode(&[0x00, 0x00]), ReadOutput::Raw(vec![0x00, 0x00]));
        assert_eq!(ReadOutput::decode(&[]), ReadOutput::Raw(vec![]));
    }

    #[test]
    fn test_failure_shapes() {
        assert!(ReadOutput::Bool(false).indicates_failure());
        assert!(ReadOutput::Error(vec![]).indicates_failure());
        assert!(!ReadOutput::Bool(true).indicates_failure());
        assert!(!ReadOutput::Raw(vec![0u8; 32]).indicates_failure());
    }

    #[test]
    fn test_response_signer_recovery() {
        let wallet: LocalWallet = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318"
            .parse()
            .unwrap();
        let mut response = ReadResponseEvent {
            request_id: RequestId([9u8; 32]),
            serialized_output: vec![0x01],
            signature: MpcSignature::default(),
        };
        let signed = wallet.sign_hash(response.message_hash()).unwrap();

        let mut r = [0u8; 32];
        signed.r.to_big_endian(&mut r);
        let mut s = [0u8; 32];
        signed.s.to_big_endian(&mut s);
        response.signature = MpcSignature {
            big_r: EcPoint { x: r, y: [0u8; 32] },
            s,
            recovery_id: (signed.v - 27) as u8,
        };

        assert_eq!(response.recover_signer().unwrap(), ethers::signers::Signer::address(&wallet));
    }

    #[test]
    fn test_signer_event_json() {
        let event = SignerEvent::ReadResponse(ReadResponseEvent {
            request_id: RequestId([1u8; 32]),
            serialized_output: vec![0xde, 0xad],
            signature: MpcSignature::default(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "readResponse");
        assert_eq!(json["serializedOutput"], "0xdead");

        let back: SignerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}

//! Signed protocol envelopes.
//!
//! Every protocol message travels inside a [`SignedEnvelope`]: the JSON encoding of the
//! message plus a base64 Ed25519 signature by the sender. A trader's [`PeerId`] is the
//! hex encoded verifying key, so receivers verify without any key directory.

use crate::{
    error::{Result, TradeError},
    model::{PeerId, ProtocolMessage},
};
use base64::{engine::general_purpose, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub message: ProtocolMessage,
    pub signature: String,
}

/// Long-lived signing identity of this node.
pub struct NodeIdentity {
    signing_key: SigningKey,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_seed_hex(seed: &str) -> Result<Self> {
        let bytes = hex::decode(seed.trim())
            .map_err(|e| TradeError::Config(format!("Identity seed is not hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TradeError::Config("Identity seed must be 32 bytes".to_string()))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::new(hex::encode(self.signing_key.verifying_key().as_bytes()))
    }

    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

pub struct MessageCodec {
    identity: NodeIdentity,
}

impl MessageCodec {
    pub fn new(identity: NodeIdentity) -> Self {
        Self { identity }
    }

    pub fn local_peer(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn seal(&self, message: &ProtocolMessage) -> Result<SignedEnvelope> {
        if message.sender != self.local_peer() {
            return Err(TradeError::Signature(format!(
                "Refusing to sign message {} on behalf of {}",
                message.seq, message.sender
            )));
        }
        let bytes = serde_json::to_vec(message)?;
        let signature = self.identity.signing_key.sign(&bytes);
        Ok(SignedEnvelope {
            message: message.clone(),
            signature: general_purpose::STANDARD.encode(signature.to_bytes()),
        })
    }

    /// Verifies the envelope against the key embedded in the sender's id.
    pub fn open(&self, envelope: SignedEnvelope) -> Result<ProtocolMessage> {
        let key_bytes = hex::decode(envelope.message.sender.as_str())
            .map_err(|e| TradeError::Signature(format!("Sender id is not hex: {}", e)))?;
        let key_bytes: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| TradeError::Signature("Sender id must be a 32 byte key".to_string()))?;
        let verifying_key = VerifyingKey::from_bytes(&key_bytes)?;

        let signature_bytes = general_purpose::STANDARD
            .decode(&envelope.signature)
            .map_err(|e| TradeError::Signature(format!("Signature is not base64: {}", e)))?;
        let signature = Signature::from_slice(&signature_bytes)?;

        let bytes = serde_json::to_vec(&envelope.message)?;
        verifying_key.verify(&bytes, &signature)?;
        Ok(envelope.message)
    }

    pub fn to_bytes(envelope: &SignedEnvelope) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(envelope)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SignedEnvelope> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgreedTerms, Direction, PaymentMethod};
    use chrono::Utc;
    use uuid::Uuid;

    fn message_from(codec: &MessageCodec, peer: PeerId) -> ProtocolMessage {
        let terms = AgreedTerms::new(50_000, 6_000_000, "EUR", PaymentMethod::Revolut, Direction::Buy);
        ProtocolMessage::take_offer(Uuid::new_v4(), peer, codec.local_peer(), terms, Utc::now())
    }

    #[test]
    fn test_sealed_envelope_verifies() {
        let codec = MessageCodec::new(NodeIdentity::generate());
        let maker = NodeIdentity::generate().peer_id();
        let message = message_from(&codec, maker);

        let envelope = codec.seal(&message).unwrap();
        let bytes = MessageCodec::to_bytes(&envelope).unwrap();
        let decoded = MessageCodec::from_bytes(&bytes).unwrap();
        assert_eq!(codec.open(decoded).unwrap(), message);
    }

    #[test]
    fn test_tampered_envelope_is_rejected() {
        let codec = MessageCodec::new(NodeIdentity::generate());
        let maker = NodeIdentity::generate().peer_id();
        let mut envelope = codec.seal(&message_from(&codec, maker)).unwrap();
        envelope.message.terms.btc_amount_sats += 1;
        assert!(matches!(codec.open(envelope), Err(TradeError::Signature(_))));
    }

    #[test]
    fn test_cannot_sign_for_someone_else() {
        let codec = MessageCodec::new(NodeIdentity::generate());
        let other = NodeIdentity::generate().peer_id();
        let mut message = message_from(&codec, other.clone());
        message.sender = other;
        assert!(codec.seal(&message).is_err());
    }

    #[test]
    fn test_identity_seed_round_trip() {
        let identity = NodeIdentity::generate();
        let restored = NodeIdentity::from_seed_hex(&identity.seed_hex()).unwrap();
        assert_eq!(identity.peer_id(), restored.peer_id());
        assert!(NodeIdentity::from_seed_hex("abcd").is_err());
    }
}

//! Signed entity claims and the sealed envelope that carries them.
//!
//! A [`SignedClaim`] says "peer P speaks for entity E" and is signed with
//! E's key. The [`SealedEnvelope`] wraps it with the sending node's public
//! key and a second signature by the node identity, so the receiver can
//! tie the claim to the connection it arrived on.

use serde::{Deserialize, Serialize};
use veredarii_transport::{Keypair, PeerId, PublicKey};

use crate::ProtocolError;

/// Domain separation string for envelope signatures.
pub const AUTH_RECORD_DOMAIN: &str = "veredarii-auth-v1";

/// Payload type tag of an envelope carrying a [`SignedClaim`].
pub const AUTH_RECORD_TYPE: &str = "/veredarii/entity-claim";

/// Claim that `peer` acts for `entity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedClaim {
    /// Unique claim identifier (UUID v4).
    pub id: String,
    pub entity: String,
    pub peer: PeerId,
    /// Ed25519 signature over `id:entity:peer` by the entity key.
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl SignedClaim {
    /// Build and sign a fresh claim.
    pub fn create(entity: &str, entity_key: &Keypair, peer: PeerId) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let signature = entity_key.sign(Self::message(&id, entity, &peer).as_bytes());
        Self {
            id,
            entity: entity.to_string(),
            peer,
            signature: signature.to_vec(),
        }
    }

    /// The bytes the entity signs.
    pub fn message(id: &str, entity: &str, peer: &PeerId) -> String {
        format!("{id}:{entity}:{peer}")
    }

    /// Check the signature against the entity's registered key.
    pub fn verify(&self, entity_key: &PublicKey) -> Result<(), ProtocolError> {
        let message = Self::message(&self.id, &self.entity, &self.peer);
        if entity_key.verify(message.as_bytes(), &self.signature) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidSignature)
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(Into::into)
    }
}

/// Outer signing wrapper sent on the authentication stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    /// Sender node public key (32 bytes).
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub payload_type: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Node signature over [`SealedEnvelope::signing_bytes`].
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl SealedEnvelope {
    /// Seal `claim` with the node identity.
    pub fn seal(identity: &Keypair, claim: &SignedClaim) -> Result<Self, ProtocolError> {
        let payload = claim.to_bytes()?;
        let signature = identity.sign(&Self::signing_bytes(AUTH_RECORD_TYPE, &payload));
        Ok(Self {
            public_key: identity.public().to_bytes().to_vec(),
            payload_type: AUTH_RECORD_TYPE.to_string(),
            payload,
            signature: signature.to_vec(),
        })
    }

    /// Length-prefixed `domain ‖ payload_type ‖ payload`.
    fn signing_bytes(payload_type: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            12 + AUTH_RECORD_DOMAIN.len() + payload_type.len() + payload.len(),
        );
        for part in [AUTH_RECORD_DOMAIN.as_bytes(), payload_type.as_bytes(), payload] {
            out.extend_from_slice(&(part.len() as u32).to_be_bytes());
            out.extend_from_slice(part);
        }
        out
    }

    /// Verify the outer signature and decode the claim.
    ///
    /// Returns the sender key alongside the claim so the caller can compare
    /// it with the connected peer.
    pub fn open(&self) -> Result<(PublicKey, SignedClaim), ProtocolError> {
        let sender = PublicKey::from_bytes(&self.public_key).map_err(|e| {
            ProtocolError::InvalidEnvelope {
                reason: format!("bad sender key: {e}"),
            }
        })?;
        if self.payload_type != AUTH_RECORD_TYPE {
            return Err(ProtocolError::InvalidEnvelope {
                reason: format!("unexpected payload type {}", self.payload_type),
            });
        }
        let signed = Self::signing_bytes(&self.payload_type, &self.payload);
        if !sender.verify(&signed, &self.signature) {
            return Err(ProtocolError::InvalidSignature);
        }
        let claim = SignedClaim::from_bytes(&self.payload)?;
        Ok((sender, claim))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data).map_err(|e| ProtocolError::InvalidEnvelope {
            reason: e.to_string(),
        })
    }
}

//! Invitation tokens for onboarding.
//!
//! A token is the hex encoding of the AES-GCM encryption of
//! `inviter;peer;guest;network;expiration` under the network invitation key,
//! with `auth:<inviter>` as associated data. A token presented under any
//! other inviter name fails to decrypt.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crypto::{self, SymmetricKey};
use crate::ProtocolError;

/// Peer slot value used when the guest's peer id is unknown at minting time.
pub const PEER_PLACEHOLDER: &str = "pending-peer";

/// Default lifetime of a freshly minted invitation.
pub const DEFAULT_VALIDITY_HOURS: i64 = 24;

const FIELD_SEPARATOR: char = ';';

/// Decrypted contents of an invitation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub inviter: String,
    pub peer: String,
    pub guest: String,
    pub network: String,
    pub expires_at: DateTime<Utc>,
}

fn associated_data(inviter: &str) -> Vec<u8> {
    format!("auth:{inviter}").into_bytes()
}

impl Invitation {
    pub fn new(
        inviter: impl Into<String>,
        guest: impl Into<String>,
        network: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            inviter: inviter.into(),
            peer: PEER_PLACEHOLDER.to_string(),
            guest: guest.into(),
            network: network.into(),
            expires_at,
        }
    }

    /// Serialize to the `;`-separated plaintext form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        for (name, value) in [
            ("inviter", &self.inviter),
            ("peer", &self.peer),
            ("guest", &self.guest),
            ("network", &self.network),
        ] {
            if value.contains(FIELD_SEPARATOR) {
                return Err(ProtocolError::MalformedInvitation(format!(
                    "{name} must not contain '{FIELD_SEPARATOR}'"
                )));
            }
        }
        Ok([
            self.inviter.as_str(),
            self.peer.as_str(),
            self.guest.as_str(),
            self.network.as_str(),
            self.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true).as_str(),
        ]
        .join(";"))
    }

    /// Parse the plaintext form.
    pub fn decode(plaintext: &str) -> Result<Self, ProtocolError> {
        let fields: Vec<&str> = plaintext.split(FIELD_SEPARATOR).collect();
        let [inviter, peer, guest, network, expiration] = fields.as_slice() else {
            return Err(ProtocolError::MalformedInvitation(format!(
                "expected 5 fields, got {}",
                fields.len()
            )));
        };
        let expires_at = DateTime::parse_from_rfc3339(expiration)
            .map_err(|e| ProtocolError::MalformedInvitation(format!("bad expiration: {e}")))?
            .with_timezone(&Utc);
        Ok(Self {
            inviter: inviter.to_string(),
            peer: peer.to_string(),
            guest: guest.to_string(),
            network: network.to_string(),
            expires_at,
        })
    }

    /// Encrypt into a hex token.
    pub fn seal(&self, key: &SymmetricKey) -> Result<String, ProtocolError> {
        let plaintext = self.encode()?;
        let sealed =
            crypto::encrypt_with_aad(key, plaintext.as_bytes(), &associated_data(&self.inviter))?;
        Ok(hex::encode(sealed))
    }

    /// Decrypt a hex token presented under `claimed_inviter`.
    pub fn open(
        token: &str,
        claimed_inviter: &str,
        key: &SymmetricKey,
    ) -> Result<Self, ProtocolError> {
        let sealed = hex::decode(token.trim()).map_err(|_| ProtocolError::InvitationUndecryptable)?;
        let plaintext = crypto::decrypt_with_aad(key, &sealed, &associated_data(claimed_inviter))
            .map_err(|_| ProtocolError::InvitationUndecryptable)?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| ProtocolError::MalformedInvitation("not utf-8".into()))?;
        Self::decode(&plaintext)
    }

    /// Every field must equal what the request claims.
    pub fn check_request(
        &self,
        inviter: &str,
        guest: &str,
        network: &str,
    ) -> Result<(), ProtocolError> {
        if self.inviter != inviter {
            return Err(ProtocolError::InvitationMismatch { field: "inviter" });
        }
        if self.network != network {
            return Err(ProtocolError::InvitationMismatch { field: "network" });
        }
        if self.guest != guest {
            return Err(ProtocolError::InvitationMismatch { field: "guest" });
        }
        Ok(())
    }

    pub fn check_expiry(&self, now: DateTime<Utc>) -> Result<(), ProtocolError> {
        if now > self.expires_at {
            return Err(ProtocolError::InvitationExpired {
                expired_at: self.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            });
        }
        Ok(())
    }
}

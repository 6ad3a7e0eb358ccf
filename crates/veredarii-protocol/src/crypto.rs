//! Symmetric encryption for invitations and membership gossip.
//!
//! AES-GCM with a random 96-bit nonce prepended to the ciphertext. The key
//! length picks the variant: 16, 24 or 32 bytes for AES-128/192/256.
//!
//! Keys come from two places: the invitation key is stretched from a shared
//! passphrase with Argon2id, and the membership key is the SHA-256 of the
//! network's swarm key.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::ProtocolError;

type Aes192Gcm = AesGcm<Aes192, U12>;

/// AES-GCM nonce size in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag size in bytes.
pub const TAG_LEN: usize = 16;

/// AES key material, wiped on drop.
#[derive(Clone)]
pub struct SymmetricKey(Zeroizing<Vec<u8>>);

impl SymmetricKey {
    /// Wrap raw key bytes. Only 16, 24 and 32 byte keys are valid.
    pub fn new(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match bytes.len() {
            16 | 24 | 32 => Ok(Self(Zeroizing::new(bytes.to_vec()))),
            n => Err(ProtocolError::Crypto(format!("invalid AES key length {n}"))),
        }
    }

    /// Key for the `members` gossip topic: SHA-256 of the swarm key.
    pub fn for_members_topic(swarm_key: &[u8]) -> Self {
        let digest = Sha256::digest(swarm_key);
        Self(Zeroizing::new(digest.to_vec()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey(AES-{})", self.0.len() * 8)
    }
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 1,
            parallelism: 4,
        }
    }
}

/// Stretch a passphrase into a 32-byte key with Argon2id.
pub fn derive_passphrase_key(
    passphrase: &str,
    salt: &[u8],
    params: KdfParams,
) -> Result<SymmetricKey, ProtocolError> {
    let params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| ProtocolError::Crypto(format!("invalid kdf parameters: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new(vec![0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| ProtocolError::Crypto(format!("key derivation failed: {e}")))?;
    Ok(SymmetricKey(key))
}

fn seal_with<C: Aead + KeyInit>(
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    payload: Payload<'_, '_>,
) -> Result<Vec<u8>, ProtocolError> {
    let cipher = C::new_from_slice(key)
        .map_err(|e| ProtocolError::Crypto(format!("failed to create cipher: {e}")))?;
    cipher
        .encrypt(aes_gcm::aead::Nonce::<C>::from_slice(nonce), payload)
        .map_err(|e| ProtocolError::Crypto(format!("encryption failed: {e}")))
}

fn open_with<C: Aead + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    payload: Payload<'_, '_>,
) -> Result<Vec<u8>, ProtocolError> {
    let cipher = C::new_from_slice(key)
        .map_err(|e| ProtocolError::Crypto(format!("failed to create cipher: {e}")))?;
    cipher
        .decrypt(aes_gcm::aead::Nonce::<C>::from_slice(nonce), payload)
        .map_err(|_| ProtocolError::Crypto("decryption failed: authentication error".into()))
}

/// Encrypt with associated data. Output is `nonce ‖ ciphertext ‖ tag`.
pub fn encrypt_with_aad(
    key: &SymmetricKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    let nonce: [u8; NONCE_LEN] = rand::random();
    let payload = Payload {
        msg: plaintext,
        aad,
    };
    let ciphertext = match key.len() {
        16 => seal_with::<Aes128Gcm>(key.as_bytes(), &nonce, payload)?,
        24 => seal_with::<Aes192Gcm>(key.as_bytes(), &nonce, payload)?,
        _ => seal_with::<Aes256Gcm>(key.as_bytes(), &nonce, payload)?,
    };

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `nonce ‖ ciphertext ‖ tag` produced by [`encrypt_with_aad`].
pub fn decrypt_with_aad(
    key: &SymmetricKey,
    data: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(ProtocolError::Crypto("ciphertext too short".into()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    match key.len() {
        16 => open_with::<Aes128Gcm>(key.as_bytes(), nonce, payload),
        24 => open_with::<Aes192Gcm>(key.as_bytes(), nonce, payload),
        _ => open_with::<Aes256Gcm>(key.as_bytes(), nonce, payload),
    }
}

/// Encrypt without associated data.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    encrypt_with_aad(key, plaintext, &[])
}

/// Decrypt without associated data.
pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    decrypt_with_aad(key, data, &[])
}

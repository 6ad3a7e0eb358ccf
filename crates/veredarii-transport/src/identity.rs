//! Long-lived Ed25519 identities.
//!
//! Key files use the libp2p protobuf encoding (`08 01 12 40` followed by the
//! 64-byte seed‖public key) so existing node keys can be reused. Bare 32-byte
//! seeds and 64-byte seed‖public blobs are accepted on load as well.

use std::fmt;
use std::io::Write;
use std::path::Path;

use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::{PeerId, TransportError};

const PROTOBUF_PRIVATE_PREFIX: [u8; 4] = [0x08, 0x01, 0x12, 0x40];
const PROTOBUF_PUBLIC_PREFIX: [u8; 4] = [0x08, 0x01, 0x12, 0x20];

/// Ed25519 signing identity of a node or an entity.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self::from_seed(seed)
    }

    /// Build a keypair from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Decode a keypair from a 32-byte seed, a 64-byte seed‖public blob, or
    /// the libp2p protobuf-wrapped form of the latter.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        let bytes = match bytes.strip_prefix(&PROTOBUF_PRIVATE_PREFIX[..]) {
            Some(inner) if inner.len() == 64 => inner,
            _ => bytes,
        };
        match bytes.len() {
            32 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(bytes);
                Ok(Self::from_seed(seed))
            }
            64 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&bytes[..32]);
                let keypair = Self::from_seed(seed);
                if keypair.public().to_bytes()[..] != bytes[32..] {
                    return Err(TransportError::InvalidKey(
                        "public half does not match seed".into(),
                    ));
                }
                Ok(keypair)
            }
            n => Err(TransportError::InvalidKey(format!(
                "unexpected private key length {n}"
            ))),
        }
    }

    /// Encode as the libp2p protobuf private key form.
    pub fn to_protobuf(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(68);
        out.extend_from_slice(&PROTOBUF_PRIVATE_PREFIX);
        out.extend_from_slice(&self.signing.to_bytes());
        out.extend_from_slice(self.signing.verifying_key().as_bytes());
        out
    }

    /// Read the key at `path`.
    pub fn load(path: &Path) -> Result<Self, TransportError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Read the key at `path`, creating it (mode 0600) when missing.
    pub fn load_or_generate(path: &Path) -> Result<Self, TransportError> {
        if path.exists() {
            return Self::load(path);
        }
        let keypair = Self::generate();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(&keypair.to_protobuf())?;
        tracing::info!(path = %path.display(), peer = %keypair.peer_id(), "generated new identity key");
        Ok(keypair)
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.signing.verifying_key())
    }

    pub fn peer_id(&self) -> PeerId {
        self.public().peer_id()
    }

    /// Sign `message`, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key with strict signature verification.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Decode from raw 32 bytes or the libp2p protobuf-wrapped form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TransportError> {
        let bytes = match bytes.strip_prefix(&PROTOBUF_PUBLIC_PREFIX[..]) {
            Some(inner) if inner.len() == 32 => inner,
            _ => bytes,
        };
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransportError::InvalidKey(format!("unexpected public key length {}", bytes.len())))?;
        VerifyingKey::from_bytes(&raw)
            .map(Self)
            .map_err(|e| TransportError::InvalidKey(e.to_string()))
    }

    pub fn from_hex(s: &str) -> Result<Self, TransportError> {
        let bytes = hex::decode(s.trim()).map_err(|e| TransportError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_base64(s: &str) -> Result<Self, TransportError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.trim())
            .map_err(|e| TransportError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Decode a key written either as hex or as base64.
    pub fn from_encoded(s: &str) -> Result<Self, TransportError> {
        Self::from_hex(s).or_else(|_| Self::from_base64(s))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0.as_bytes())
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(self.0.to_bytes())
    }

    /// Strictly verify `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.0.verify_strict(message, &signature).is_ok()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({:?})", self.peer_id())
    }
}

impl TryFrom<PeerId> for PublicKey {
    type Error = TransportError;

    fn try_from(peer: PeerId) -> Result<Self, Self::Error> {
        Self::from_bytes(&peer.as_bytes())
    }
}

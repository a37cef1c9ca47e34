//! Identity and signing capability
//!
//! The engine consumes signing through [`EventSigner`] and verification through
//! [`SignatureVerifier`]. Key custody belongs to the wallet layer; the Ed25519
//! implementation here covers embedding and tests.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::chain::Hash;
use crate::error::NotabotError;

/// Bytes of the public-key digest used as an address
const ADDRESS_LEN: usize = 20;

/// Private signing capability bound to one identity
pub trait EventSigner: Send + Sync {
    /// Sign a chain hash. Failure aborts the append that requested it.
    fn sign(&self, hash: &Hash) -> Result<Vec<u8>, NotabotError>;

    /// Public key relying parties verify against
    fn public_key(&self) -> Vec<u8>;

    /// Stable identity address the authority keys admission state by
    fn address(&self) -> String;
}

/// Public verification capability
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, hash: &Hash, signature: &[u8], public_key: &[u8]) -> bool;

    /// Address bound to `public_key`, when the scheme defines one
    fn address_of(&self, _public_key: &[u8]) -> Option<String> {
        None
    }
}

/// Derive the `0x`-prefixed address for an Ed25519 public key
pub fn ed25519_address(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    format!("0x{}", hex::encode(&digest[..ADDRESS_LEN]))
}

/// Ed25519 keypair
pub struct Ed25519Identity {
    signing_key: SigningKey,
}

impl Ed25519Identity {
    /// Generate a fresh keypair from the OS RNG
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Load from a hex-encoded 32-byte seed
    pub fn from_hex_seed(seed_hex: &str) -> Result<Self, NotabotError> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| NotabotError::SigningFailed(format!("Invalid seed hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| NotabotError::SigningFailed("Seed must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl EventSigner for Ed25519Identity {
    fn sign(&self, hash: &Hash) -> Result<Vec<u8>, NotabotError> {
        Ok(self.signing_key.sign(hash).to_bytes().to_vec())
    }

    fn public_key(&self) -> Vec<u8> {
        self.verifying_key().to_bytes().to_vec()
    }

    fn address(&self) -> String {
        ed25519_address(&self.public_key())
    }
}

impl SignatureVerifier for Ed25519Identity {
    fn verify(&self, hash: &Hash, signature: &[u8], public_key: &[u8]) -> bool {
        Ed25519Verifier.verify(hash, signature, public_key)
    }

    fn address_of(&self, public_key: &[u8]) -> Option<String> {
        Ed25519Verifier.address_of(public_key)
    }
}

/// Stateless Ed25519 verifier for relying parties
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, hash: &Hash, signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(hash, &signature).is_ok()
    }

    fn address_of(&self, public_key: &[u8]) -> Option<String> {
        Some(ed25519_address(public_key))
    }
}

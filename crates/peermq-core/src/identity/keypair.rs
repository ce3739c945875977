//! Ed25519 key pairs used for log authorship and transport authentication

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::{MqError, MqResult};
use crate::types::PeerId;

/// Length of a detached signature
pub const SIGNATURE_LEN: usize = 64;

/// An ed25519 signing key with its public half.
#[derive(Clone)]
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> MqResult<Self> {
        // Use getrandom directly to avoid rand version conflicts with ed25519-dalek
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| MqError::Crypto(format!("failed to get random bytes: {}", e)))?;
        Ok(Self::from_secret_bytes(&seed))
    }

    /// Rebuild a key pair from its 32-byte secret seed
    pub fn from_secret_bytes(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// The 32-byte secret seed
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Public key as a mailbox address
    pub fn public_key(&self) -> PeerId {
        PeerId(self.signing.verifying_key().to_bytes())
    }

    /// Detached signature over `message`
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Verify a detached signature made by `public`.
///
/// Malformed keys or signatures simply fail verification.
pub fn verify(public: &PeerId, message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public.as_bytes()) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
}

//! Static key material: the persistent X25519 Diffie-Hellman pair used by
//! Noise sessions, and the persistent Ed25519 signing pair used by the
//! Security Gate.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::protocol::PeerId;

/// Persistent X25519 static pair used as the Noise `s` key.
#[derive(Clone, ZeroizeOnDrop)]
pub struct NoiseKeyPair {
    #[zeroize(skip)]
    public: [u8; 32],
    private: [u8; 32],
}

impl std::fmt::Debug for NoiseKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseKeyPair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

impl NoiseKeyPair {
    /// Generate a fresh static key pair via real X25519 scalar multiplication.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private: secret.to_bytes(),
            public: public.to_bytes(),
        }
    }

    pub fn from_bytes(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: private_bytes,
            public: public.to_bytes(),
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.private
    }
}

/// Persistent Ed25519 signing pair used to authenticate packets.
#[derive(Clone)]
pub struct SigningKeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("public", &hex::encode(self.verifying_key.to_bytes()))
            .finish_non_exhaustive()
    }
}

impl Drop for SigningKeyPair {
    fn drop(&mut self) {
        let mut bytes = self.signing_key.to_bytes();
        bytes.zeroize();
    }
}

impl SigningKeyPair {
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut secret_bytes);
        let signing_key = SigningKey::from_bytes(&secret_bytes);
        secret_bytes.zeroize();
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn from_bytes(private_bytes: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&private_bytes);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(
        verifying_key: &VerifyingKey,
        message: &[u8],
        signature: &Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        verifying_key.verify(message, signature)
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn private_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// The two persistent key pairs an identity needs: one for Noise
/// Diffie-Hellman, one for Ed25519 signing.
#[derive(Debug, Clone)]
pub struct Identity {
    pub noise_keypair: NoiseKeyPair,
    pub signing_keypair: SigningKeyPair,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            noise_keypair: NoiseKeyPair::generate(),
            signing_keypair: SigningKeyPair::generate(),
        }
    }

    /// A stable peer handle derived from the signing public key: the first
    /// 8 bytes of its SHA-256 hash.
    pub fn peer_id(&self) -> PeerId {
        let digest = Sha256::digest(self.signing_keypair.public_bytes());
        let mut id = [0u8; 8];
        id.copy_from_slice(&digest[..8]);
        id
    }

    /// SHA-256 fingerprint of the Noise static public key, used as a stable
    /// cross-session identity once a peer authenticates.
    pub fn noise_fingerprint(noise_pubkey: &[u8; 32]) -> [u8; 32] {
        Sha256::digest(noise_pubkey).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_keypair_public_is_real_scalar_multiplication() {
        let a = NoiseKeyPair::generate();
        let b = NoiseKeyPair::from_bytes(a.private_bytes());
        assert_eq!(a.public_bytes(), b.public_bytes());

        let secret = StaticSecret::from(a.private_bytes());
        let expected = PublicKey::from(&secret);
        assert_eq!(a.public_bytes(), expected.to_bytes());
    }

    #[test]
    fn signing_round_trips() {
        let keypair = SigningKeyPair::generate();
        let sig = keypair.sign(b"hello mesh");
        assert!(SigningKeyPair::verify(&keypair.verifying_key, b"hello mesh", &sig).is_ok());
    }

    #[test]
    fn peer_id_is_stable_for_same_signing_key() {
        let signing = SigningKeyPair::generate();
        let identity = Identity {
            noise_keypair: NoiseKeyPair::generate(),
            signing_keypair: signing.clone(),
        };
        let other = Identity {
            noise_keypair: NoiseKeyPair::generate(),
            signing_keypair: signing,
        };
        assert_eq!(identity.peer_id(), other.peer_id());
    }
}

//! Identity key persistence: the `KeyStore` capability the core consumes,
//! plus a file-backed default implementation so the crate is runnable
//! standalone without an embedder supplying its own.

use std::fs;
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::crypto::{Identity, NoiseKeyPair, SigningKeyPair};
use crate::error::{Error, Result};

/// The identity material a core instance needs: a persistent Noise static
/// pair and a persistent Ed25519 signing pair.
///
/// Implementors decide how (or whether) to persist across restarts; a
/// production embedder typically backs this with platform keychain storage
/// instead of the bundled file-backed implementation.
pub trait KeyStore: Send + Sync {
    /// Load the current identity, generating and persisting one on first use.
    fn load_or_generate(&self) -> Result<Identity>;

    /// Atomically wipe and regenerate both key pairs, persisting the result.
    fn clear_and_regenerate(&self) -> Result<Identity>;
}

#[derive(Serialize, Deserialize)]
struct StoredKeys {
    noise_private: [u8; 32],
    signing_private: [u8; 32],
}

/// Default `KeyStore`: identity keys are encrypted at rest with
/// ChaCha20-Poly1305 under a key derived via HKDF-SHA256 from a
/// locally-stored passphrase-equivalent seed file, and stored as a single
/// blob at `path`.
pub struct FileKeyStore {
    path: PathBuf,
    seed: [u8; 32],
}

impl FileKeyStore {
    /// Open (or prepare to create) a key store at `path`, deriving its
    /// at-rest encryption key from `seed` via HKDF. Callers typically load
    /// `seed` from platform-specific secure storage; it is not itself
    /// written to `path`.
    pub fn new<P: AsRef<Path>>(path: P, seed: [u8; 32]) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            seed,
        }
    }

    fn derive_cipher_key(&self) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(None, &self.seed);
        let mut key = [0u8; 32];
        hk.expand(b"meshcore-keystore-v1", &mut key)
            .expect("32 bytes is a valid HKDF output length");
        key
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        let key = self.derive_cipher_key();
        ChaCha20Poly1305::new((&key).into())
    }

    fn read_stored(&self) -> Result<Option<StoredKeys>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let blob = fs::read(&self.path).map_err(|e| Error::Fatal(e.to_string()))?;
        if blob.len() < 12 {
            return Err(Error::Fatal("key store file truncated".into()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(12);
        let cipher = self.cipher();
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Fatal("failed to decrypt key store".into()))?;
        let stored: StoredKeys = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Fatal(format!("corrupt key store: {e}")))?;
        Ok(Some(stored))
    }

    fn write_stored(&self, stored: &StoredKeys) -> Result<()> {
        let plaintext =
            serde_json::to_vec(stored).map_err(|e| Error::Fatal(format!("encode failure: {e}")))?;
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let cipher = self.cipher();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|_| Error::Fatal("failed to encrypt key store".into()))?;
        let mut blob = Vec::with_capacity(12 + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::Fatal(e.to_string()))?;
            }
        }
        fs::write(&self.path, blob).map_err(|e| Error::Fatal(e.to_string()))
    }

    fn generate_and_persist(&self) -> Result<Identity> {
        let identity = Identity::generate();
        let stored = StoredKeys {
            noise_private: identity.noise_keypair.private_bytes(),
            signing_private: identity.signing_keypair.private_bytes(),
        };
        self.write_stored(&stored)?;
        Ok(identity)
    }
}

impl KeyStore for FileKeyStore {
    fn load_or_generate(&self) -> Result<Identity> {
        match self.read_stored()? {
            Some(mut stored) => {
                let identity = Identity {
                    noise_keypair: NoiseKeyPair::from_bytes(stored.noise_private),
                    signing_keypair: SigningKeyPair::from_bytes(stored.signing_private),
                };
                stored.noise_private.zeroize();
                stored.signing_private.zeroize();
                Ok(identity)
            }
            None => self.generate_and_persist(),
        }
    }

    fn clear_and_regenerate(&self) -> Result<Identity> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| Error::Fatal(e.to_string()))?;
        }
        self.generate_and_persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("meshcore-keystore-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn generates_and_reloads_same_identity() {
        let path = temp_path("reload");
        let _ = fs::remove_file(&path);
        let store = FileKeyStore::new(&path, [7u8; 32]);

        let first = store.load_or_generate().unwrap();
        let second = store.load_or_generate().unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(
            first.noise_keypair.public_bytes(),
            second.noise_keypair.public_bytes()
        );

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn clear_and_regenerate_produces_a_different_identity() {
        let path = temp_path("regen");
        let _ = fs::remove_file(&path);
        let store = FileKeyStore::new(&path, [9u8; 32]);

        let first = store.load_or_generate().unwrap();
        let regenerated = store.clear_and_regenerate().unwrap();
        assert_ne!(first.peer_id(), regenerated.peer_id());

        let _ = fs::remove_file(&path);
    }
}

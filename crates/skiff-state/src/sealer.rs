//! AES-256-GCM sealing of secret payloads at rest.
//!
//! The key is the SHA-256 digest of an operator-supplied passphrase. Each
//! sealed blob is `nonce (12 bytes) || ciphertext+tag`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use sha2::{Digest, Sha256};

use crate::error::{StateError, StateResult};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct SecretSealer {
    cipher: Aes256Gcm,
}

impl SecretSealer {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Sealer keyed by random material that lives only as long as the
    /// process. Secrets sealed with it are unreadable after a restart.
    pub fn ephemeral() -> StateResult<Self> {
        let mut key = [0u8; 32];
        getrandom::getrandom(&mut key).map_err(|e| StateError::Seal(e.to_string()))?;
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        })
    }

    pub fn seal(&self, plaintext: &[u8]) -> StateResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce).map_err(|e| StateError::Seal(e.to_string()))?;
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| StateError::Seal(e.to_string()))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> StateResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(StateError::Seal("sealed payload too short".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StateError::Seal("payload failed authentication".to_string()))
    }
}

impl std::fmt::Debug for SecretSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretSealer(..)")
    }
}

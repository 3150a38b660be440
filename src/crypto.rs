//! Token vault: AES-256-GCM encryption of OAuth access/refresh tokens at rest.
//!
//! Key management is an external collaborator's concern — the crate consumes
//! a 32-byte key handed to it via `Config` and exposes only
//! `encrypt`/`decrypt` over it, with no OS-keychain sourcing (this is a
//! headless service, not a desktop app).

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

use crate::error::IngestError;

pub struct TokenVault {
    cipher: Aes256Gcm,
}

impl TokenVault {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt plaintext, returning `(base64_ciphertext, base64_nonce)` for DB storage.
    pub fn encrypt(&self, plaintext: &str) -> Result<(String, String), IngestError> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| IngestError::Internal(format!("encrypt failed: {e}")))?;

        Ok((B64.encode(ciphertext), B64.encode(nonce_bytes)))
    }

    /// Decrypt from DB columns (base64 ciphertext + base64 nonce) back to plaintext.
    /// A decryption failure is treated as permanent for the owning connection:
    /// an opaque token that doesn't decrypt cannot be recovered by retrying.
    pub fn decrypt(&self, ciphertext_b64: &str, nonce_b64: &str) -> Result<String, IngestError> {
        let ciphertext = B64
            .decode(ciphertext_b64)
            .map_err(|e| IngestError::Decryption(e.to_string()))?;
        let nonce_bytes = B64
            .decode(nonce_b64)
            .map_err(|e| IngestError::Decryption(e.to_string()))?;

        if nonce_bytes.len() != 12 {
            return Err(IngestError::Decryption(format!(
                "invalid nonce length: {} (expected 12)",
                nonce_bytes.len()
            )));
        }

        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|e| IngestError::Decryption(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| IngestError::Decryption(format!("invalid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> TokenVault {
        TokenVault::new(&[7u8; 32])
    }

    #[test]
    fn round_trips() {
        let v = vault();
        let (ct, nonce) = v.encrypt("ya29.access-token").unwrap();
        let plain = v.decrypt(&ct, &nonce).unwrap();
        assert_eq!(plain, "ya29.access-token");
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let v = vault();
        let (ct, nonce) = v.encrypt("secret").unwrap();
        let mut bytes = B64.decode(&ct).unwrap();
        bytes[0] ^= 0xFF;
        let tampered = B64.encode(bytes);
        assert!(v.decrypt(&tampered, &nonce).is_err());
    }

    #[test]
    fn rejects_wrong_key() {
        let v1 = TokenVault::new(&[1u8; 32]);
        let v2 = TokenVault::new(&[2u8; 32]);
        let (ct, nonce) = v1.encrypt("secret").unwrap();
        assert!(v2.decrypt(&ct, &nonce).is_err());
    }
}

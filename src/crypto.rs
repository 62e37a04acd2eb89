//! AES-256-GCM encryption for credential storage in the database.
//!
//! Per-organization upstream credentials are stored as
//! `base64(nonce[12] || ciphertext)` where the AES key is derived from the
//! service `ENCRYPTION_KEY` via SHA-256. The nonce is random per encryption,
//! so encrypting the same credentials twice yields different ciphertexts.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext is not valid base64")]
    Encoding(#[from] base64::DecodeError),
    #[error("ciphertext too short to contain a nonce")]
    Truncated,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed — wrong key or corrupted ciphertext")]
    Decrypt,
    #[error("credential payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Derive the 256-bit AES key from the app encryption secret.
fn derive_key(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    digest.into()
}

/// Encrypt a credential document to its stored wire form.
pub fn encrypt_credentials(
    credentials: &serde_json::Value,
    secret: &str,
) -> Result<String, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&derive_key(secret)).expect("SHA-256 output is 32 bytes");
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let plaintext = serde_json::to_vec(credentials)?;
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_ref())
        .map_err(|_| CryptoError::Encrypt)?;

    let mut raw = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    raw.extend_from_slice(&nonce);
    raw.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(raw))
}

/// Decrypt a stored credential string back into its JSON document.
pub fn decrypt_credentials(stored: &str, secret: &str) -> Result<serde_json::Value, CryptoError> {
    let raw = BASE64.decode(stored)?;
    if raw.len() <= NONCE_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(&derive_key(secret)).expect("SHA-256 output is 32 bytes");
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_restores_credentials() {
        let creds = json!({
            "access_key_id": "AKIAEXAMPLE",
            "secret_access_key": "abc123",
            "region": "us-east-1",
        });
        let stored = encrypt_credentials(&creds, "test-secret").unwrap();
        let restored = decrypt_credentials(&stored, "test-secret").unwrap();
        assert_eq!(restored, creds);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let creds = json!({ "api_key": "sk-123" });
        let stored = encrypt_credentials(&creds, "key-a").unwrap();
        let err = decrypt_credentials(&stored, "key-b").unwrap_err();
        assert!(matches!(err, CryptoError::Decrypt));
    }

    #[test]
    fn ciphertext_differs_per_encryption() {
        // Random nonce — identical plaintext must not produce identical output.
        let creds = json!({ "api_key": "sk-123" });
        let a = encrypt_credentials(&creds, "k").unwrap();
        let b = encrypt_credentials(&creds, "k").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn garbage_input_is_rejected_not_panicked() {
        assert!(matches!(
            decrypt_credentials("not base64!!!", "k"),
            Err(CryptoError::Encoding(_))
        ));
        // Valid base64 but shorter than a nonce.
        assert!(matches!(
            decrypt_credentials(&BASE64.encode(b"short"), "k"),
            Err(CryptoError::Truncated)
        ));
        // Valid base64, long enough, but not a real ciphertext.
        let junk = BASE64.encode([0u8; 64]);
        assert!(matches!(
            decrypt_credentials(&junk, "k"),
            Err(CryptoError::Decrypt)
        ));
    }
}

use std::collections::HashMap;

use aes_gcm::{aead::Aead, aead::KeyInit, Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::OsRng;
use rand_core::RngCore;

const NONCE_LEN: usize = 12;
/// Marks a credential value as already encrypted so upserts are idempotent.
const CIPHERTEXT_PREFIX: &str = "enc:v1:";

#[derive(thiserror::Error, Debug)]
pub enum EncryptionError {
    #[error("encryption key must be 32 bytes")]
    InvalidKeyLength,
    #[error("failed to encrypt credential")]
    Encrypt,
    #[error("failed to decrypt credential")]
    Decrypt,
    #[error("invalid ciphertext encoding")]
    InvalidEncoding,
}

/// Accepts a base64-encoded 32-byte key, or 32 raw bytes.
pub fn decode_key(raw: &str) -> Result<Vec<u8>, EncryptionError> {
    if let Ok(decoded) = STANDARD.decode(raw) {
        if decoded.len() == 32 {
            return Ok(decoded);
        }
    }
    if raw.len() == 32 {
        return Ok(raw.as_bytes().to_vec());
    }
    Err(EncryptionError::InvalidKeyLength)
}

pub fn encrypt_value(key: &[u8], plaintext: &str) -> Result<String, EncryptionError> {
    if plaintext.starts_with(CIPHERTEXT_PREFIX) {
        return Ok(plaintext.to_string());
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| EncryptionError::Encrypt)?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(format!("{}{}", CIPHERTEXT_PREFIX, STANDARD.encode(combined)))
}

pub fn decrypt_value(key: &[u8], stored: &str) -> Result<String, EncryptionError> {
    let Some(encoded) = stored.strip_prefix(CIPHERTEXT_PREFIX) else {
        // Legacy plaintext written before a key was configured.
        return Ok(stored.to_string());
    };

    let data = STANDARD
        .decode(encoded)
        .map_err(|_| EncryptionError::InvalidEncoding)?;
    if data.len() <= NONCE_LEN {
        return Err(EncryptionError::InvalidEncoding);
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| EncryptionError::InvalidKeyLength)?;
    let nonce = Nonce::from_slice(nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EncryptionError::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| EncryptionError::Decrypt)
}

/// Encrypts every value of a credential map. Keys stay plaintext.
pub fn encrypt_credentials(
    key: Option<&[u8]>,
    credentials: &HashMap<String, String>,
) -> Result<HashMap<String, String>, EncryptionError> {
    let Some(key) = key else {
        return Ok(credentials.clone());
    };
    credentials
        .iter()
        .map(|(name, value)| Ok((name.clone(), encrypt_value(key, value)?)))
        .collect()
}

/// Decrypts every value of a stored credential map.
pub fn decrypt_credentials(
    key: Option<&[u8]>,
    credentials: &HashMap<String, String>,
) -> Result<HashMap<String, String>, EncryptionError> {
    let Some(key) = key else {
        return Ok(credentials.clone());
    };
    credentials
        .iter()
        .map(|(name, value)| Ok((name.clone(), decrypt_value(key, value)?)))
        .collect()
}

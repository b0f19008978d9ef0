//! At-rest encryption for integration secrets.
//!
//! GitHub App private keys and installation access tokens are sealed with
//! AES-256-GCM before they reach the database. Sealed values look like
//! `ENC:` + base64(nonce || ciphertext || tag); anything without the prefix
//! is treated as a legacy plain-text value and passed through.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::pbkdf2;
use std::num::NonZeroU32;

const KEY_LENGTH: usize = 32;

const NONCE_LENGTH: usize = 12;

const PBKDF2_ITERATIONS: NonZeroU32 = match NonZeroU32::new(100_000) {
    Some(n) => n,
    None => panic!("iteration count must be non-zero"),
};

const PBKDF2_SALT: &[u8] = b"ghapp-bridge-credential-encryption-v1";

pub const ENCRYPTED_PREFIX: &str = "ENC:";

/// Derive a 256-bit key from a configured secret with PBKDF2-HMAC-SHA256.
pub fn derive_key(secret: &str) -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        PBKDF2_ITERATIONS,
        PBKDF2_SALT,
        secret.as_bytes(),
        &mut key,
    );
    key
}

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// Seals and opens secret columns. Without a key both directions are the
/// identity, except that opening a sealed value without a key fails.
#[derive(Clone)]
pub struct SecretBox {
    key: Option<[u8; KEY_LENGTH]>,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox")
            .field("enabled", &self.key.is_some())
            .finish()
    }
}

impl SecretBox {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            key: secret.map(derive_key),
        }
    }

    pub fn disabled() -> Self {
        Self { key: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn seal(&self, plaintext: &str) -> Result<String> {
        match &self.key {
            Some(key) => encrypt(plaintext, key),
            None => Ok(plaintext.to_string()),
        }
    }

    pub fn open(&self, stored: &str) -> Result<String> {
        match (is_encrypted(stored), &self.key) {
            (true, Some(key)) => decrypt(stored, key),
            (true, None) => {
                anyhow::bail!("Value is encrypted but no encryption key is configured")
            }
            (false, _) => Ok(stored.to_string()),
        }
    }
}

fn encrypt(plaintext: &str, key: &[u8; KEY_LENGTH]) -> Result<String> {
    use rand::RngCore;

    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key).context("Failed to create cipher")?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

    let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(format!("{}{}", ENCRYPTED_PREFIX, BASE64.encode(&combined)))
}

fn decrypt(sealed: &str, key: &[u8; KEY_LENGTH]) -> Result<String> {
    let encoded = sealed
        .strip_prefix(ENCRYPTED_PREFIX)
        .context("Ciphertext doesn't have expected prefix")?;
    let combined = BASE64.decode(encoded).context("Failed to decode base64")?;

    if combined.len() < NONCE_LENGTH + 1 {
        anyhow::bail!("Ciphertext too short");
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).context("Failed to create cipher")?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| anyhow::anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
}

// =============================================================================
// API-key encryption - HKDF-SHA256 key derivation + AES-256-GCM
// =============================================================================
//
// The mobile app encrypts each user's panel API key under a key derived from
// the shared agent secret; the agent derives the same key and decrypts. The
// salt, info string, nonce length, and nonce-prepended framing are a wire
// contract with the app and must not change.
//
// Framing: base64(standard) of nonce(12) || ciphertext || tag(16).
// =============================================================================

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use sha2::Sha256;

/// Fixed HKDF salt, shared with the mobile app.
const HKDF_SALT: &[u8] = b"xyidactyl-salt";
/// Fixed HKDF info string, shared with the mobile app.
const HKDF_INFO: &[u8] = b"xyidactyl-api-key-encryption";
/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
const TAG_LEN: usize = 16;
/// Minimum length accepted for the shared secret.
const MIN_SECRET_LEN: usize = 16;

/// AES-256-GCM cipher keyed from the shared agent secret.
pub struct ApiKeyCipher {
    cipher: Aes256Gcm,
}

impl ApiKeyCipher {
    /// Derive the 32-byte AES key from `secret` via HKDF-SHA256.
    ///
    /// Secrets shorter than 16 bytes are rejected.
    pub fn new(secret: &str) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            bail!("agent secret must be at least {MIN_SECRET_LEN} bytes");
        }

        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), secret.as_bytes());
        let mut key = [0u8; 32];
        hk.expand(HKDF_INFO, &mut key)
            .map_err(|_| anyhow!("HKDF expand failed"))?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| anyhow!("derived key has invalid length"))?;
        Ok(Self { cipher })
    }

    /// Encrypt `plaintext`, returning base64(nonce || ciphertext || tag)
    /// with a freshly random 12-byte nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("encryption failed"))?;

        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(framed))
    }

    /// Decrypt the inverse of [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let framed = BASE64
            .decode(encoded.trim())
            .context("encrypted key is not valid base64")?;
        if framed.len() < NONCE_LEN + TAG_LEN {
            bail!(
                "encrypted key too short: {} bytes, need at least {}",
                framed.len(),
                NONCE_LEN + TAG_LEN
            );
        }

        let (nonce, ciphertext) = framed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow!("decryption failed: authentication tag mismatch"))?;

        String::from_utf8(plaintext).context("decrypted key is not valid UTF-8")
    }
}

impl std::fmt::Debug for ApiKeyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyCipher").finish_non_exhaustive()
    }
}

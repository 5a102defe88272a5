//! Webhook secret handling: generation, encryption at rest and signing
//!
//! Secrets are encrypted with AES-256-GCM and bound to their webhook id as
//! associated data. Stored form is `base64(nonce || ciphertext)`.

use crate::error::{AutomationError, AutomationResult};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

const NONCE_SIZE: usize = 12;

/// Header carrying the hex HMAC-SHA256 of the raw request body
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the event type of a webhook request
pub const EVENT_HEADER: &str = "X-Webhook-Event";

/// Encrypts webhook secrets at rest
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher").finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Derive the key from a passphrase, or use a random key when none is
    /// configured
    pub fn new(passphrase: Option<&str>) -> Self {
        match passphrase {
            Some(passphrase) => Self::from_passphrase(passphrase),
            None => {
                warn!("No secret encryption key configured, webhook secrets will not survive a restart");
                Self::random()
            }
        }
    }

    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    pub fn random() -> Self {
        Self {
            cipher: Aes256Gcm::new(&Aes256Gcm::generate_key(&mut OsRng)),
        }
    }

    /// Encrypt `plaintext`, binding it to `context` (the webhook id)
    pub fn encrypt(&self, plaintext: &str, context: &[u8]) -> AutomationResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: context,
                },
            )
            .map_err(|e| AutomationError::encryption(format!("Secret encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64_STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, sealed: &str, context: &[u8]) -> AutomationResult<String> {
        let sealed = BASE64_STANDARD
            .decode(sealed)
            .map_err(|e| AutomationError::encryption(format!("Invalid sealed secret: {}", e)))?;

        if sealed.len() <= NONCE_SIZE {
            return Err(AutomationError::encryption("Sealed secret is too short"));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: context,
                },
            )
            .map_err(|e| AutomationError::encryption(format!("Secret decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| AutomationError::encryption(format!("Secret is not UTF-8: {}", e)))
    }
}

/// Generate a new webhook secret: prefix plus 32 random bytes in hex
pub fn generate_secret(prefix: &str) -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", prefix, hex::encode(bytes))
}

/// Lowercase hex HMAC-SHA256 of `payload` keyed with `secret`
pub fn sign_payload(secret: &str, payload: &[u8]) -> AutomationResult<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|e| AutomationError::internal(format!("HMAC error: {}", e)))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a received signature, with or without a
/// `sha256=` prefix
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
    let provided = match hex::decode(signature) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    let computed = mac.finalize().into_bytes();

    computed.ct_eq(provided.as_slice()).into()
}

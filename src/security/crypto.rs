//! Cryptographic primitives for credential encryption.
//!
//! AES-256-GCM with a random 96-bit nonce and caller-supplied additional
//! authenticated data, PBKDF2-HMAC key derivation, and HMAC-SHA256 key check
//! values. All randomness comes from the OS entropy source; a failure there is
//! reported as `VaultError::Entropy` rather than silently degrading.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VaultError};

/// Key length in bytes (256 bits for AES-256)
pub const KEY_LENGTH: usize = 32;

/// Nonce length in bytes (96 bits for AES-GCM)
pub const NONCE_LENGTH: usize = 12;

/// Per-record salt length in bytes
pub const SALT_LENGTH: usize = 32;

/// Authentication tag appended to every ciphertext
pub const TAG_LENGTH: usize = 16;

const FINGERPRINT_CONTEXT: &[u8] = b"connector-vault:key-check:v1";

/// 256-bit symmetric key that is wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureKey {
    bytes: [u8; KEY_LENGTH],
}

impl SecureKey {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self { bytes }
    }

    /// Generate a new random key from the OS entropy source.
    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; KEY_LENGTH];
        fill_random(&mut bytes)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.bytes
    }

    #[cfg(test)]
    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8; KEY_LENGTH] {
        &mut self.bytes
    }
}

impl std::fmt::Debug for SecureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecureKey([REDACTED])")
    }
}

/// Hash function underlying PBKDF2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfDigest {
    #[default]
    Sha256,
    Sha512,
}

/// Parameters for password-based key derivation.
#[derive(Debug, Clone)]
pub struct KdfParams {
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub key_length: usize,
    pub digest: KdfDigest,
}

/// Fill `buf` from the OS entropy source.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| VaultError::Entropy(e.to_string()))
}

/// Generate `len` random bytes (salts, nonces).
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Deterministic PBKDF2-HMAC derivation. Pure: same inputs, same output.
pub fn derive_key(master: &[u8], params: &KdfParams) -> Vec<u8> {
    let mut out = vec![0u8; params.key_length];
    match params.digest {
        KdfDigest::Sha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(master, &params.salt, params.iterations, &mut out)
        }
        KdfDigest::Sha512 => {
            pbkdf2::pbkdf2_hmac::<Sha512>(master, &params.salt, params.iterations, &mut out)
        }
    }
    out
}

/// Derive the per-record AES key from the master key and the record's salt.
pub fn derive_record_key(
    master: &SecureKey,
    salt: &[u8],
    iterations: u32,
    digest: KdfDigest,
) -> SecureKey {
    let mut derived = derive_key(
        master.as_bytes(),
        &KdfParams {
            salt: salt.to_vec(),
            iterations,
            key_length: KEY_LENGTH,
            digest,
        },
    );
    let mut bytes = [0u8; KEY_LENGTH];
    bytes.copy_from_slice(&derived);
    derived.zeroize();
    SecureKey::from_bytes(bytes)
}

/// Encrypt `plaintext` under `key` with an explicit nonce, binding `aad`.
/// The returned ciphertext carries the authentication tag.
pub fn encrypt(key: &SecureKey, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LENGTH {
        return Err(VaultError::Crypto(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LENGTH,
            nonce.len()
        )));
    }
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Crypto(format!("Failed to create cipher: {}", e)))?;
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| VaultError::Crypto(format!("Encryption failed: {}", e)))
}

/// Decrypt and verify a ciphertext produced by [`encrypt`].
///
/// Any mismatch in key, nonce, ciphertext or `aad` fails tag verification.
pub fn decrypt(key: &SecureKey, nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LENGTH {
        return Err(VaultError::Crypto(format!(
            "nonce must be {} bytes, got {}",
            NONCE_LENGTH,
            nonce.len()
        )));
    }
    if ciphertext.len() < TAG_LENGTH {
        return Err(VaultError::Crypto("ciphertext too short".to_string()));
    }
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Crypto(format!("Failed to create cipher: {}", e)))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| VaultError::Crypto("Decryption failed: invalid key or corrupted data".into()))
}

/// Encrypt with a fresh random nonce, returning `(nonce, ciphertext)`.
pub fn seal(key: &SecureKey, plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let nonce = random_bytes(NONCE_LENGTH)?;
    let ciphertext = encrypt(key, &nonce, plaintext, aad)?;
    Ok((nonce, ciphertext))
}

/// Key check value: truncated HMAC-SHA256 of a fixed context under the key.
///
/// Stored alongside key metadata so corrupted key bytes are detectable even
/// though a corrupted key still round-trips its own ciphertexts.
pub fn fingerprint(key: &SecureKey) -> Result<String> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key.as_bytes())
        .map_err(|e| VaultError::Crypto(format!("Failed to create HMAC: {}", e)))?;
    mac.update(FINGERPRINT_CONTEXT);
    let digest = mac.finalize().into_bytes();
    Ok(hex::encode(&digest[..16]))
}

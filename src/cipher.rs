//! AES-GCM helper for payloads exchanged with the backend.
//!
//! Encoded form: `base64(nonce).base64(ciphertext)`, both standard base64.
//! The key itself is base64 and must decode to 16, 24 or 32 bytes.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{PepeunitError, Result};

type Aes192Gcm = AesGcm<Aes192, U12>;

enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

fn cipher_error(msg: impl std::fmt::Display) -> PepeunitError {
    PepeunitError::Cipher(msg.to_string())
}

impl Cipher {
    fn from_b64_key(key_b64: &str) -> Result<Self> {
        let key = STANDARD.decode(key_b64.trim()).map_err(cipher_error)?;
        match key.len() {
            16 => Aes128Gcm::new_from_slice(&key).map(Cipher::Aes128),
            24 => Aes192Gcm::new_from_slice(&key).map(Cipher::Aes192),
            32 => Aes256Gcm::new_from_slice(&key).map(Cipher::Aes256),
            n => return Err(cipher_error(format!("invalid AES key length {n}"))),
        }
        .map_err(cipher_error)
    }

    fn seal(&self, nonce: &Nonce<U12>, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Cipher::Aes128(c) => c.encrypt(nonce, data),
            Cipher::Aes192(c) => c.encrypt(nonce, data),
            Cipher::Aes256(c) => c.encrypt(nonce, data),
        }
        .map_err(|_| cipher_error("encryption failed"))
    }

    fn open(&self, nonce: &Nonce<U12>, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Cipher::Aes128(c) => c.decrypt(nonce, data),
            Cipher::Aes192(c) => c.decrypt(nonce, data),
            Cipher::Aes256(c) => c.decrypt(nonce, data),
        }
        .map_err(|_| cipher_error("authentication failed"))
    }
}

/// Encrypts `data` under a fresh random nonce.
pub fn aes_gcm_encode(data: &str, key_b64: &str) -> Result<String> {
    let cipher = Cipher::from_b64_key(key_b64)?;
    let nonce = Aes128Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher.seal(&nonce, data.as_bytes())?;
    Ok(format!("{}.{}", STANDARD.encode(nonce), STANDARD.encode(sealed)))
}

pub fn aes_gcm_decode(encoded: &str, key_b64: &str) -> Result<String> {
    let (nonce_b64, sealed_b64) = encoded
        .split_once('.')
        .filter(|(_, rest)| !rest.contains('.'))
        .ok_or_else(|| cipher_error("invalid encoded data format"))?;
    let cipher = Cipher::from_b64_key(key_b64)?;
    let nonce = STANDARD.decode(nonce_b64).map_err(cipher_error)?;
    if nonce.len() != 12 {
        return Err(cipher_error(format!("invalid nonce length {}", nonce.len())));
    }
    let sealed = STANDARD.decode(sealed_b64).map_err(cipher_error)?;
    let plain = cipher.open(Nonce::from_slice(&nonce), &sealed)?;
    String::from_utf8(plain).map_err(cipher_error)
}

//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! Sealed records are `nonce || ciphertext || tag`. The 24-byte nonce is
//! drawn at random per record. Associated data is authenticated but not
//! stored, so the opener must supply the same bytes.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng, Payload},
    XChaCha20Poly1305,
};

use crate::keys::KEY_LENGTH;
use vaultdrive_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Bytes a sealed record adds to its plaintext.
pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

fn cipher(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key)))
}

/// Seal `plaintext`, binding `aad` into the tag.
pub fn seal(key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut record = Vec::with_capacity(OVERHEAD + plaintext.len());
    record.extend_from_slice(&nonce);
    record.extend_from_slice(&ciphertext);
    Ok(record)
}

/// Open a record produced by [`seal`] with the same `aad`.
///
/// # Errors
/// - Wrong key length
/// - Record shorter than [`OVERHEAD`]
/// - Authentication failure (tampering, wrong key or wrong `aad`)
pub fn open(key: &[u8], record: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;
    if record.len() < OVERHEAD {
        return Err(Error::Crypto("Ciphertext too short".to_string()));
    }

    let (nonce, ciphertext) = record.split_at(NONCE_SIZE);
    cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
}

//! Cryptographic primitives and document codecs for vaultdrive.
//!
//! This module provides:
//! - Key derivation using Argon2id
//! - Authenticated encryption using XChaCha20-Poly1305
//! - Secure key management with automatic zeroization
//! - A chunked stream format for document bodies
//! - The pluggable [`CryptoCodec`] boundary used by lock/unlock
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod codec;
pub mod kdf;
pub mod keys;
pub mod stream;

pub use aead::{open, seal};
pub use codec::{
    create_default_registry, AeadCodec, CodecFactory, CodecRegistry, CryptoCodec, FormatHeader,
    PlainCodec, ALGORITHM_PLAIN, ALGORITHM_XCHACHA,
};
pub use kdf::{derive_key, seal_key_check, verify_key_check, KdfParams};
pub use keys::{ContentKey, MasterKey, Salt, KEY_LENGTH};
pub use stream::{DecryptingStream, EncryptingStream};

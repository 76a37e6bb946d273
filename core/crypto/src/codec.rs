//! Pluggable document codecs.
//!
//! A [`CryptoCodec`] turns a plaintext byte stream into its persisted form and
//! back. Every persisted form starts with a [`FormatHeader`], so callers can
//! tell ciphertext from foreign bytes before trusting a decode.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

use tracing::debug;

use crate::keys::{ContentKey, MasterKey};
use crate::stream::{DecryptingStream, EncryptingStream};
use vaultdrive_common::{Error, Result};

/// Algorithm id of the marker-only codec.
pub const ALGORITHM_PLAIN: &str = "plain";

/// Algorithm id of the XChaCha20-Poly1305 codec.
pub const ALGORITHM_XCHACHA: &str = "xchacha20poly1305";

const MAGIC: [u8; 4] = *b"VDRV";
const FORMAT_VERSION: u8 = 1;
const TAG_PLAIN: u8 = 0;
const TAG_XCHACHA: u8 = 1;

/// Leading bytes of every encoded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatHeader {
    /// Format version.
    pub version: u8,
    /// Codec tag.
    pub tag: u8,
}

impl FormatHeader {
    /// Encoded header length in bytes.
    pub const LEN: usize = 6;

    fn new(tag: u8) -> Self {
        Self {
            version: FORMAT_VERSION,
            tag,
        }
    }

    /// Parse a header from the start of `data`.
    ///
    /// Returns `None` when the magic is missing or the version is unknown.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < Self::LEN || data[..4] != MAGIC || data[4] != FORMAT_VERSION {
            return None;
        }
        Some(Self {
            version: data[4],
            tag: data[5],
        })
    }

    fn to_bytes(self) -> [u8; Self::LEN] {
        [MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3], self.version, self.tag]
    }

    fn write_to(self, writer: &mut dyn Write) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Read a header and check it carries `tag`.
    fn expect(reader: &mut dyn Read, tag: u8) -> Result<()> {
        let mut bytes = [0u8; Self::LEN];
        reader.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::Crypto("Input is too short to be an encoded document".to_string())
            } else {
                Error::Io(e)
            }
        })?;

        match Self::parse(&bytes) {
            Some(header) if header.tag == tag => Ok(()),
            Some(header) => Err(Error::Crypto(format!(
                "Document was encoded with codec tag {}, expected {}",
                header.tag, tag
            ))),
            None => Err(Error::Crypto(
                "Missing format marker: input is not an encoded document".to_string(),
            )),
        }
    }
}

/// Transforms document bytes to and from their persisted form.
///
/// Implementations are stateless with respect to documents: the same codec
/// instance is shared by every entry of a vault during lock and unlock.
pub trait CryptoCodec: Send + Sync {
    /// Algorithm identifier recorded in the vault descriptor.
    fn algorithm(&self) -> &str;

    /// Codec tag written into the format header.
    fn tag(&self) -> u8;

    /// Encode `input` into `output`. Returns the plaintext byte count.
    fn encrypt(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64>;

    /// Decode `input` into `output`. Returns the plaintext byte count.
    ///
    /// Fails without writing anything when the format marker is absent.
    fn decrypt(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64>;

    /// Whether `data` looks like something this codec produced.
    fn is_encoded(&self, data: &[u8]) -> bool {
        FormatHeader::parse(data).is_some_and(|h| h.tag == self.tag())
    }

    /// Encode a complete buffer.
    fn encrypt_bytes(&self, mut data: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(data.len() + FormatHeader::LEN);
        self.encrypt(&mut data, &mut output)?;
        Ok(output)
    }

    /// Decode a complete buffer.
    fn decrypt_bytes(&self, mut data: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(data.len());
        self.decrypt(&mut data, &mut output)?;
        Ok(output)
    }
}

/// Marker-only codec: the body is stored unchanged behind the format header.
///
/// Useful for vaults that only need the drive semantics, and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainCodec;

impl CryptoCodec for PlainCodec {
    fn algorithm(&self) -> &str {
        ALGORITHM_PLAIN
    }

    fn tag(&self) -> u8 {
        TAG_PLAIN
    }

    fn encrypt(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        FormatHeader::new(TAG_PLAIN).write_to(output)?;
        let copied = std::io::copy(input, output)?;
        output.flush()?;
        Ok(copied)
    }

    fn decrypt(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        FormatHeader::expect(input, TAG_PLAIN)?;
        let copied = std::io::copy(input, output)?;
        output.flush()?;
        Ok(copied)
    }
}

/// XChaCha20-Poly1305 chunked codec keyed by a content key.
pub struct AeadCodec {
    key: ContentKey,
}

impl AeadCodec {
    /// Purpose label for the document content key.
    const CONTENT_PURPOSE: &'static [u8] = b"documents";

    /// Create a codec from the vault master key.
    pub fn new(master_key: &MasterKey) -> Self {
        Self {
            key: master_key.derive_content_key(Self::CONTENT_PURPOSE),
        }
    }
}

impl CryptoCodec for AeadCodec {
    fn algorithm(&self) -> &str {
        ALGORITHM_XCHACHA
    }

    fn tag(&self) -> u8 {
        TAG_XCHACHA
    }

    fn encrypt(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        FormatHeader::new(TAG_XCHACHA).write_to(output)?;
        EncryptingStream::new(self.key.as_bytes())?.encrypt_stream(input, output)
    }

    fn decrypt(&self, input: &mut dyn Read, output: &mut dyn Write) -> Result<u64> {
        FormatHeader::expect(input, TAG_XCHACHA)?;
        // Authenticate everything before handing plaintext to the caller.
        let mut staged = Vec::new();
        let total = DecryptingStream::new(self.key.as_bytes())?.decrypt_stream(input, &mut staged)?;
        output.write_all(&staged)?;
        output.flush()?;
        Ok(total)
    }
}

impl std::fmt::Debug for AeadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AeadCodec").finish_non_exhaustive()
    }
}

/// Factory building a codec from optional key material.
pub type CodecFactory =
    Box<dyn Fn(Option<&MasterKey>) -> Result<Arc<dyn CryptoCodec>> + Send + Sync>;

/// Registry resolving algorithm identifiers to codecs.
pub struct CodecRegistry {
    factories: HashMap<String, (bool, CodecFactory)>,
}

impl CodecRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a codec factory.
    ///
    /// `keyed` states whether the codec needs a master key.
    ///
    /// # Errors
    /// - Returns error if the algorithm is already registered
    pub fn register(
        &mut self,
        algorithm: impl Into<String>,
        keyed: bool,
        factory: CodecFactory,
    ) -> Result<()> {
        let algorithm = algorithm.into();
        if self.factories.contains_key(&algorithm) {
            return Err(Error::AlreadyExists(format!(
                "Codec '{}' is already registered",
                algorithm
            )));
        }
        self.factories.insert(algorithm, (keyed, factory));
        Ok(())
    }

    /// Resolve a codec by algorithm id.
    ///
    /// # Errors
    /// - Algorithm not registered
    /// - Keyed codec resolved without a key
    pub fn resolve(
        &self,
        algorithm: &str,
        master_key: Option<&MasterKey>,
    ) -> Result<Arc<dyn CryptoCodec>> {
        let (_, factory) = self.factories.get(algorithm).ok_or_else(|| {
            Error::NotFound(format!("Codec '{}' is not registered", algorithm))
        })?;
        debug!(algorithm, keyed = master_key.is_some(), "Resolving codec");
        factory(master_key)
    }

    /// Whether the algorithm needs a master key.
    pub fn requires_key(&self, algorithm: &str) -> Result<bool> {
        self.factories
            .get(algorithm)
            .map(|(keyed, _)| *keyed)
            .ok_or_else(|| Error::NotFound(format!("Codec '{}' is not registered", algorithm)))
    }

    /// Registered algorithm ids.
    pub fn algorithms(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in codecs.
pub fn create_default_registry() -> CodecRegistry {
    let mut factories: HashMap<String, (bool, CodecFactory)> = HashMap::new();

    factories.insert(
        ALGORITHM_PLAIN.to_string(),
        (false, Box::new(|_| Ok(Arc::new(PlainCodec) as Arc<dyn CryptoCodec>))),
    );

    factories.insert(
        ALGORITHM_XCHACHA.to_string(),
        (
            true,
            Box::new(|key| {
                let key = key.ok_or_else(|| {
                    Error::NotPermitted(format!("Codec '{}' requires a passphrase", ALGORITHM_XCHACHA))
                })?;
                Ok(Arc::new(AeadCodec::new(key)) as Arc<dyn CryptoCodec>)
            }),
        ),
    );

    CodecRegistry { factories }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KEY_LENGTH;

    fn master() -> MasterKey {
        MasterKey::from_bytes([5u8; KEY_LENGTH])
    }

    #[test]
    fn test_plain_codec_roundtrip_and_marker() {
        let codec = PlainCodec;
        let encoded = codec.encrypt_bytes(b"Hello World").unwrap();

        assert!(codec.is_encoded(&encoded));
        assert_eq!(&encoded[FormatHeader::LEN..], b"Hello World");
        assert_eq!(codec.decrypt_bytes(&encoded).unwrap(), b"Hello World");
    }

    #[test]
    fn test_decrypting_foreign_bytes_fails() {
        let plain = PlainCodec;
        let aead = AeadCodec::new(&master());

        assert!(!plain.is_encoded(b"just some text"));
        assert!(plain.decrypt_bytes(b"just some text").is_err());
        assert!(aead.decrypt_bytes(b"just some text").is_err());
        assert!(aead.decrypt_bytes(b"").is_err());
    }

    #[test]
    fn test_aead_codec_hides_plaintext() {
        let codec = AeadCodec::new(&master());
        let encoded = codec.encrypt_bytes(b"top secret contents").unwrap();

        assert!(codec.is_encoded(&encoded));
        assert!(!encoded
            .windows(b"secret".len())
            .any(|w| w == b"secret"));
        assert_eq!(codec.decrypt_bytes(&encoded).unwrap(), b"top secret contents");
    }

    #[test]
    fn test_codecs_reject_each_other() {
        let plain = PlainCodec;
        let aead = AeadCodec::new(&master());

        let plain_encoded = plain.encrypt_bytes(b"data").unwrap();
        let aead_encoded = aead.encrypt_bytes(b"data").unwrap();

        assert!(aead.decrypt_bytes(&plain_encoded).is_err());
        assert!(plain.decrypt_bytes(&aead_encoded).is_err());
    }

    #[test]
    fn test_aead_codec_wrong_key_fails() {
        let encoded = AeadCodec::new(&master()).encrypt_bytes(b"data").unwrap();
        let other = AeadCodec::new(&MasterKey::from_bytes([6u8; KEY_LENGTH]));

        let mut output = Vec::new();
        assert!(other.decrypt(&mut &encoded[..], &mut output).is_err());
        assert!(output.is_empty());
    }

    #[test]
    fn test_default_registry() {
        let registry = create_default_registry();

        assert!(!registry.requires_key(ALGORITHM_PLAIN).unwrap());
        assert!(registry.requires_key(ALGORITHM_XCHACHA).unwrap());

        let plain = registry.resolve(ALGORITHM_PLAIN, None).unwrap();
        assert_eq!(plain.algorithm(), ALGORITHM_PLAIN);

        assert!(registry.resolve(ALGORITHM_XCHACHA, None).is_err());
        let keyed = registry.resolve(ALGORITHM_XCHACHA, Some(&master())).unwrap();
        assert_eq!(keyed.algorithm(), ALGORITHM_XCHACHA);

        assert!(registry.resolve("rot13", None).is_err());
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = create_default_registry();
        let result = registry.register(
            ALGORITHM_PLAIN,
            false,
            Box::new(|_| Ok(Arc::new(PlainCodec) as Arc<dyn CryptoCodec>)),
        );
        assert!(result.is_err());
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn aead_roundtrips_arbitrary_documents(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
                let codec = AeadCodec::new(&master());
                let encoded = codec.encrypt_bytes(&data).unwrap();
                prop_assert_eq!(codec.decrypt_bytes(&encoded).unwrap(), data);
            }
        }
    }
}

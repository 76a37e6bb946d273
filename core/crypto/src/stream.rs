//! Chunked encryption for document bodies.
//!
//! Each chunk is sealed on its own with its index as associated data, so
//! reordering and splicing fail authentication. A missing terminator
//! reveals truncation.
//!
//! # Format
//! - `chunk_size` (u32 LE)
//! - records: `len` (u32 LE) followed by `nonce || ciphertext || tag`
//! - a zero-length record terminates the stream

use std::io::{ErrorKind, Read, Write};

use crate::aead::{open, seal, OVERHEAD};
use crate::keys::KEY_LENGTH;
use vaultdrive_common::{Error, Result};

/// Default chunk size for streaming encryption (64 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Encrypting stream that processes data in chunks.
pub struct EncryptingStream<'a> {
    key: &'a [u8],
    chunk_size: usize,
}

impl<'a> EncryptingStream<'a> {
    /// Create a new encrypting stream.
    ///
    /// # Errors
    /// - Returns error if key length is invalid
    pub fn new(key: &'a [u8]) -> Result<Self> {
        if key.len() != KEY_LENGTH {
            return Err(Error::Crypto("Invalid key length".to_string()));
        }
        Ok(Self {
            key,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Set custom chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Encrypt data from reader and write to writer.
    ///
    /// Returns the number of plaintext bytes consumed.
    pub fn encrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let chunk_size = u32::try_from(self.chunk_size)
            .map_err(|_| Error::Crypto("Chunk size too large".to_string()))?;
        writer.write_all(&chunk_size.to_le_bytes())?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut total_bytes = 0u64;
        let mut index = 0u64;

        loop {
            let filled = fill_buffer(&mut reader, &mut buffer)?;
            if filled == 0 {
                break;
            }

            let sealed = seal(self.key, &buffer[..filled], &index.to_le_bytes())?;
            writer.write_all(&(sealed.len() as u32).to_le_bytes())?;
            writer.write_all(&sealed)?;

            total_bytes += filled as u64;
            index += 1;

            if filled < self.chunk_size {
                break;
            }
        }

        writer.write_all(&0u32.to_le_bytes())?;
        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Decrypting stream that processes encrypted chunks.
pub struct DecryptingStream<'a> {
    key: &'a [u8],
}

impl<'a> DecryptingStream<'a> {
    /// Create a new decrypting stream.
    ///
    /// # Errors
    /// - Returns error if key length is invalid
    pub fn new(key: &'a [u8]) -> Result<Self> {
        if key.len() != KEY_LENGTH {
            return Err(Error::Crypto("Invalid key length".to_string()));
        }
        Ok(Self { key })
    }

    /// Decrypt data from reader and write to writer.
    ///
    /// Returns the number of plaintext bytes produced.
    ///
    /// # Errors
    /// - Truncated stream or missing terminator
    /// - Oversized or undersized records
    /// - Authentication failure, including reordered chunks
    pub fn decrypt_stream<R: Read, W: Write>(&self, mut reader: R, mut writer: W) -> Result<u64> {
        let chunk_size = read_u32(&mut reader)? as usize;
        if chunk_size == 0 {
            return Err(Error::Crypto("Invalid chunk size".to_string()));
        }

        let max_record = OVERHEAD + chunk_size;
        let min_record = OVERHEAD + 1;
        let mut record = Vec::with_capacity(max_record);
        let mut total_bytes = 0u64;
        let mut expected_index = 0u64;

        loop {
            let len = read_u32(&mut reader)? as usize;
            if len == 0 {
                break;
            }
            if len < min_record || len > max_record {
                return Err(Error::Crypto(format!("Invalid chunk length: {}", len)));
            }

            record.resize(len, 0);
            read_exact(&mut reader, &mut record)?;

            let plaintext = open(self.key, &record, &expected_index.to_le_bytes())?;
            writer.write_all(&plaintext)?;
            total_bytes += plaintext.len() as u64;
            expected_index += 1;
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Read until the buffer is full or the reader is exhausted.
fn fill_buffer<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut bytes = [0u8; 4];
    read_exact(reader, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_exact<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<()> {
    reader.read_exact(buffer).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::Crypto("Unexpected end of stream".to_string())
        } else {
            Error::Io(e)
        }
    })
}

/// Encrypt a complete byte slice using streaming encryption.
pub fn encrypt_bytes(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let stream = EncryptingStream::new(key)?;
    let mut output = Vec::new();
    stream.encrypt_stream(data, &mut output)?;
    Ok(output)
}

/// Decrypt a complete byte slice that was encrypted with streaming encryption.
pub fn decrypt_bytes(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let stream = DecryptingStream::new(key)?;
    let mut output = Vec::new();
    stream.decrypt_stream(data, &mut output)?;
    Ok(output)
}

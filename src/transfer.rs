//! Persistence facade for the compiler's three artefacts.
//!
//! The compiler can write and reload the raw instruction buffer
//! (`bytecode`), the linker's offset map (`linker`), and the static
//! analyser's regions and metadata (`sa`). Each is a self-describing,
//! little-endian, length-prefixed byte stream; where the blobs live is the
//! embedder's concern, expressed through [`BlobStore`].

use std::collections::HashMap;

use crate::error::TransferError;

/// Storage for named opaque blobs.
pub trait BlobStore {
    /// Stores `bytes` under `name`, replacing any previous content.
    fn write(&mut self, name: &str, bytes: &[u8]) -> Result<(), TransferError>;

    /// Retrieves the blob stored under `name`, if present.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, TransferError>;
}

/// An in-memory store, used by the tests and as a staging area for hosts
/// that flush blobs to flash themselves.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    blobs: HashMap<String, Vec<u8>>,
}

impl BlobStore for MemoryStore {
    fn write(&mut self, name: &str, bytes: &[u8]) -> Result<(), TransferError> {
        self.blobs.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, TransferError> {
        Ok(self.blobs.get(name).cloned())
    }
}

/// Little-endian byte-stream writer.
#[derive(Debug, Default)]
pub struct Serializer {
    bytes: Vec<u8>,
}

impl Serializer {
    /// An empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a `u32`.
    pub fn push_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends an `i32`.
    pub fn push_i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a `u16`.
    pub fn push_u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a byte.
    pub fn push_u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    /// Appends raw bytes without a length prefix.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// The finished stream.
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Little-endian byte-stream reader.
#[derive(Debug)]
pub struct Deserializer<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Deserializer<'a> {
    /// Reader over `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TransferError> {
        let end = self.at.checked_add(n).ok_or(TransferError::Corrupt)?;
        if end > self.bytes.len() {
            return Err(TransferError::UnexpectedEnd);
        }
        let slice = &self.bytes[self.at..end];
        self.at = end;
        Ok(slice)
    }

    /// Reads a `u32`.
    pub fn u32(&mut self) -> Result<u32, TransferError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads an `i32`.
    pub fn i32(&mut self) -> Result<i32, TransferError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a `u16`.
    pub fn u16(&mut self) -> Result<u16, TransferError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Reads a byte.
    pub fn u8(&mut self) -> Result<u8, TransferError> {
        Ok(self.take(1)?[0])
    }

    /// Reads `n` raw bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], TransferError> {
        self.take(n)
    }

    /// Bytes left unread.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.at
    }
}

//! The index metadata file.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::Path;
use tracing::debug;

use arbor_common::{ArborError, Position, Result};

/// Contents of the metadata file: storage identity, root position, degree.
///
/// Fixed field order, length-prefixed strings, big-endian integers:
/// directory path, storage file name, root file number (i64), root offset
/// (i64), degree (u32).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Metadata {
    /// Absolute path of the storage directory.
    pub storage_directory: String,
    /// File name of the storage file within the directory.
    pub storage_name: String,
    /// Position of the root node.
    pub root: Position,
    /// Degree of the tree; overrides any builder-configured degree.
    pub degree: u32,
}

impl Metadata {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.storage_directory);
        put_string(&mut buf, &self.storage_name);
        self.root.put(&mut buf);
        buf.put_u32(self.degree);
        buf.freeze()
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let storage_directory = get_string(&mut bytes)?;
        let storage_name = get_string(&mut bytes)?;
        if bytes.remaining() < 20 {
            return Err(truncated());
        }
        let file_number = bytes.get_i64();
        let offset = bytes.get_i64();
        let root = Position::from_pair(file_number, offset)
            .ok_or_else(|| ArborError::Corrupted("metadata has no root position".to_string()))?;
        let degree = bytes.get_u32();
        Ok(Self {
            storage_directory,
            storage_name,
            root,
            degree,
        })
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::decode(&bytes)
    }

    /// Rewrites the metadata file in place.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.encode())?;
        debug!(path = %path.display(), root = %self.root, degree = self.degree, "metadata written");
        Ok(())
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(bytes: &mut &[u8]) -> Result<String> {
    if bytes.remaining() < 4 {
        return Err(truncated());
    }
    let len = bytes.get_u32() as usize;
    if bytes.remaining() < len {
        return Err(truncated());
    }
    let s = String::from_utf8(bytes[..len].to_vec())
        .map_err(|e| ArborError::Corrupted(format!("invalid UTF-8 in metadata: {}", e)))?;
    bytes.advance(len);
    Ok(s)
}

fn truncated() -> ArborError {
    ArborError::Corrupted("truncated metadata file".to_string())
}

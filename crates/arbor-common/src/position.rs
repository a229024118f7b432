//! Storage positions for serialized nodes.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

/// Location of a node's serialized bytes in storage.
///
/// A position is a file number plus a byte offset within that file. The
/// current storage layout keeps everything in file 0; the file number is
/// reserved for future file rollover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Storage file number (0 throughout).
    pub file_number: i64,
    /// Byte offset of the node record within the file.
    pub offset: i64,
}

impl Position {
    /// Creates a new Position.
    pub fn new(file_number: i64, offset: i64) -> Self {
        Self {
            file_number,
            offset,
        }
    }

    /// Appends this position as two big-endian i64 fields.
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.file_number);
        buf.put_i64(self.offset);
    }

    /// Appends the absent-child sentinel `(-1, -1)`.
    pub fn put_absent(buf: &mut impl BufMut) {
        buf.put_i64(-1);
        buf.put_i64(-1);
    }

    /// Reconstructs a position from a decoded field pair.
    ///
    /// The sentinel `(-1, -1)` (and any negative pair) maps to `None`.
    pub fn from_pair(file_number: i64, offset: i64) -> Option<Self> {
        if file_number < 0 || offset < 0 {
            None
        } else {
            Some(Self::new(file_number, offset))
        }
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_number, self.offset)
    }
}

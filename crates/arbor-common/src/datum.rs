//! Value codec for index entries.

use bytes::{BufMut, BytesMut};

use crate::{ArborError, Result};

/// A value that can live in the index: totally ordered and serializable.
///
/// Node records length-prefix every encoded value, so `read_from` always
/// receives exactly the bytes produced by `write_to`. Decoding a buffer of
/// the wrong shape is a [`ArborError::Corrupted`], never a panic.
pub trait Datum: Ord + Clone + Send + Sync + 'static {
    /// Appends the encoded value to `buf`.
    fn write_to(&self, buf: &mut BytesMut);

    /// Decodes a value from its encoded bytes.
    fn read_from(bytes: &[u8]) -> Result<Self>;
}

impl Datum for i32 {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32(*self);
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 4] = bytes.try_into().map_err(|_| {
            ArborError::Corrupted(format!("expected 4 bytes for i32, got {}", bytes.len()))
        })?;
        Ok(i32::from_be_bytes(array))
    }
}

impl Datum for i64 {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i64(*self);
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 8] = bytes.try_into().map_err(|_| {
            ArborError::Corrupted(format!("expected 8 bytes for i64, got {}", bytes.len()))
        })?;
        Ok(i64::from_be_bytes(array))
    }
}

impl Datum for u64 {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u64(*self);
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 8] = bytes.try_into().map_err(|_| {
            ArborError::Corrupted(format!("expected 8 bytes for u64, got {}", bytes.len()))
        })?;
        Ok(u64::from_be_bytes(array))
    }
}

impl Datum for String {
    fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(self.as_bytes());
    }

    fn read_from(bytes: &[u8]) -> Result<Self> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ArborError::Corrupted(format!("invalid UTF-8 in stored string: {}", e)))
    }
}

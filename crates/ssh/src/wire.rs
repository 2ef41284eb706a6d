//! SSH data type encoding (RFC 4251 Section 5).
//!
//! Every message struct in this crate serializes through the helpers here:
//!
//! ```text
//! byte, boolean, uint32, uint64, string, mpint, name-list
//! ```
//!
//! Encoding writes into a [`BytesMut`]; decoding walks a borrowed slice with
//! a [`Reader`] that fails with [`FynxError::Protocol`] on truncation.
//!
//! # Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use fynx_ssh::wire::{write_name_list, write_string, Reader};
//!
//! let mut buf = BytesMut::new();
//! write_string(&mut buf, b"session");
//! write_name_list(&mut buf, &["aes128-ctr".to_string(), "none".to_string()]);
//!
//! let mut reader = Reader::new(&buf);
//! assert_eq!(reader.read_string().unwrap(), b"session");
//! assert_eq!(reader.read_name_list().unwrap(), vec!["aes128-ctr", "none"]);
//! ```

use bytes::{BufMut, BytesMut};
use fynx_platform::{FynxError, FynxResult};

/// Writes an SSH `string` (uint32 length followed by raw bytes).
pub fn write_string(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Writes an SSH `boolean`.
pub fn write_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Writes an SSH `name-list` (comma separated names inside a string).
pub fn write_name_list(buf: &mut BytesMut, names: &[String]) {
    let joined = names.join(",");
    write_string(buf, joined.as_bytes());
}

/// Writes an SSH `mpint` from big-endian unsigned magnitude bytes.
pub fn write_mpint(buf: &mut BytesMut, magnitude: &[u8]) {
    let encoded = encode_mpint(magnitude);
    buf.put_slice(&encoded);
}

/// Encodes unsigned big-endian bytes as an SSH `mpint`, including the
/// uint32 length prefix.
///
/// Leading zero bytes are stripped and a single zero byte is prepended when
/// the most significant bit is set, so the value stays positive.
pub fn encode_mpint(magnitude: &[u8]) -> Vec<u8> {
    let start = magnitude
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(magnitude.len());
    let trimmed = &magnitude[start..];

    let needs_pad = trimmed.first().map_or(false, |&b| b & 0x80 != 0);
    let len = trimmed.len() + usize::from(needs_pad);

    let mut out = Vec::with_capacity(4 + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    if needs_pad {
        out.push(0);
    }
    out.extend_from_slice(trimmed);
    out
}

/// Cursor over an SSH-encoded byte slice.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Current offset into the underlying slice.
    pub fn position(&self) -> usize {
        self.offset
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    /// Returns true once everything has been read.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Reads exactly `len` raw bytes.
    pub fn read_raw(&mut self, len: usize) -> FynxResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(FynxError::Protocol(format!(
                "Data truncated: expected {} bytes at offset {}",
                len, self.offset
            )));
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> FynxResult<u8> {
        Ok(self.read_raw(1)?[0])
    }

    /// Reads an SSH `boolean` (any non-zero value is true).
    pub fn read_bool(&mut self) -> FynxResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a big-endian `uint32`.
    pub fn read_u32(&mut self) -> FynxResult<u32> {
        let bytes = self.read_raw(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Reads an SSH `string` as raw bytes.
    pub fn read_string(&mut self) -> FynxResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_raw(len)
    }

    /// Reads an SSH `string` that must be valid UTF-8.
    pub fn read_utf8(&mut self) -> FynxResult<String> {
        let bytes = self.read_string()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| FynxError::Protocol("String contains invalid UTF-8".to_string()))
    }

    /// Reads an SSH `name-list`.
    pub fn read_name_list(&mut self) -> FynxResult<Vec<String>> {
        let list = self.read_utf8()?;
        if list.is_empty() {
            return Ok(Vec::new());
        }
        Ok(list.split(',').map(str::to_string).collect())
    }

    /// Reads an SSH `mpint` and returns its unsigned magnitude bytes
    /// (leading sign byte stripped).
    pub fn read_mpint(&mut self) -> FynxResult<&'a [u8]> {
        let bytes = self.read_string()?;
        if bytes.first().map_or(false, |&b| b & 0x80 != 0) {
            return Err(FynxError::Protocol(
                "Negative mpint where a positive value is required".to_string(),
            ));
        }
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        Ok(&bytes[start..])
    }

    /// Returns everything not yet read.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        rest
    }
}

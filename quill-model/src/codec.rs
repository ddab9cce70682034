//! Raw length-prefixed codec
//!
//! Minimal little-endian writer/reader shared by the KV entry format,
//! snapshots, receipts, and the consensus wire messages. Fixed-width
//! integers, fixed byte arrays, and length-prefixed blobs only; readers
//! fail cleanly on truncated input instead of panicking.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input: wanted {wanted} bytes, {remaining} remain")]
    Truncated { wanted: usize, remaining: usize },

    #[error("length prefix {len} exceeds remaining input {remaining}")]
    BadLength { len: usize, remaining: usize },

    #[error("trailing bytes after decode: {0}")]
    TrailingBytes(usize),
}

/// Append-only byte writer.
#[derive(Default)]
pub struct RawWriter {
    buf: Vec<u8>,
}

impl RawWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    /// Fixed-width array; the reader must know the length.
    pub fn write_array(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Length-prefixed blob, skippable without decoding its contents.
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u64(v.len() as u64);
        self.buf.extend_from_slice(v);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor-style reader over a borrowed byte slice.
pub struct RawReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> RawReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_eos(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                wanted: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let b = self.take(N)?;
        Ok(b.try_into().unwrap())
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.read_u64()? as usize;
        if len > self.remaining() {
            return Err(CodecError::BadLength {
                len,
                remaining: self.remaining(),
            });
        }
        self.take(len)
    }

    /// Skip a length-prefixed blob without copying it.
    pub fn skip_bytes(&mut self) -> Result<(), CodecError> {
        let len = self.read_u64()? as usize;
        if len > self.remaining() {
            return Err(CodecError::BadLength {
                len,
                remaining: self.remaining(),
            });
        }
        self.offset += len;
        Ok(())
    }

    /// Require that the input has been fully consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        if self.remaining() > 0 {
            return Err(CodecError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}

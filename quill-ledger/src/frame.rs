//! Entry framing
//!
//! Every ledger entry is a length-prefixed frame: a little-endian u32
//! byte count followed by the opaque entry. AppendEntries payloads carry
//! the same framing so a follower can skip entries it already holds
//! without decoding them.

use crate::LedgerError;

/// Frame header length: the u32 byte count.
pub const FRAME_HEADER_LEN: usize = 4;

/// Append `entry` to `out` as a length-prefixed frame.
pub fn frame_entry(out: &mut Vec<u8>, entry: &[u8]) {
    out.extend_from_slice(&(entry.len() as u32).to_le_bytes());
    out.extend_from_slice(entry);
}

/// Walks a byte buffer of consecutive frames.
pub struct FrameCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FrameCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn frame_len(&self) -> Result<usize, LedgerError> {
        let remaining = self.data.len() - self.offset;
        if remaining < FRAME_HEADER_LEN {
            return Err(LedgerError::Malformed(
                "<frame buffer>".into(),
                format!("truncated frame header: {} bytes remain", remaining),
            ));
        }
        let len = u32::from_le_bytes(
            self.data[self.offset..self.offset + FRAME_HEADER_LEN]
                .try_into()
                .unwrap(),
        ) as usize;
        if remaining - FRAME_HEADER_LEN < len {
            return Err(LedgerError::Malformed(
                "<frame buffer>".into(),
                format!(
                    "frame wants {} bytes but {} remain",
                    len,
                    remaining - FRAME_HEADER_LEN
                ),
            ));
        }
        Ok(len)
    }

    /// The next entry's bytes.
    pub fn next_entry(&mut self) -> Result<&'a [u8], LedgerError> {
        let len = self.frame_len()?;
        let start = self.offset + FRAME_HEADER_LEN;
        self.offset = start + len;
        Ok(&self.data[start..start + len])
    }

    /// Skip the next entry without touching its contents.
    pub fn skip_entry(&mut self) -> Result<(), LedgerError> {
        let len = self.frame_len()?;
        self.offset += FRAME_HEADER_LEN + len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_and_walk() {
        let mut buf = Vec::new();
        frame_entry(&mut buf, b"first");
        frame_entry(&mut buf, b"second");
        frame_entry(&mut buf, b"");

        let mut cursor = FrameCursor::new(&buf);
        assert_eq!(cursor.next_entry().unwrap(), b"first");
        cursor.skip_entry().unwrap();
        assert_eq!(cursor.next_entry().unwrap(), b"");
        assert!(cursor.is_empty());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut buf = Vec::new();
        frame_entry(&mut buf, b"entry");
        buf.truncate(buf.len() - 2);

        let mut cursor = FrameCursor::new(&buf);
        assert!(cursor.next_entry().is_err());
    }
}

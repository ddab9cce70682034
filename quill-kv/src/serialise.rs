//! KV entry serialisation
//!
//! A serialised entry is a sequence of per-map segments split into a
//! public block and a private block. The private block is sealed by the
//! encryptor with the public block as additional data, so tampering with
//! either half is detected. The outermost framing (in the ledger and in
//! AppendEntries payloads) length-prefixes the whole entry so a reader
//! can skip it without decoding.
//!
//! Layout (raw codec, little-endian):
//!
//! ```text
//! entry   := format(u8) version(u64) public_block(bytes) private_block(bytes)
//! block   := segment_count(u32) segment*
//! segment := name(bytes) read_version(u64)
//!            nreads(u64)   { key(bytes) version(u64) }*
//!            nwrites(u64)  { key(bytes) value(bytes) }*
//!            nremoves(u64) { key(bytes) }*
//! ```

use quill_model::codec::{CodecError, RawReader, RawWriter};
use quill_model::Version;

use crate::encryptor::Encryptor;
use crate::types::{KvError, SecurityDomain};

pub const ENTRY_FORMAT: u8 = 1;

/// One map's contribution to an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    pub name: String,
    /// Whole-map read marker recorded by iteration, [`NO_VERSION`] if unset.
    pub read_version: Version,
    pub reads: Vec<(Vec<u8>, Version)>,
    /// `None` value is a remove.
    pub writes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl Segment {
    pub fn has_writes(&self) -> bool {
        !self.writes.is_empty()
    }
}

/// A decoded entry: version plus segments in application order
/// (public domain first).
#[derive(Debug, Clone)]
pub struct DecodedEntry {
    pub version: Version,
    pub segments: Vec<Segment>,
}

fn write_block(segments: &[&Segment]) -> Vec<u8> {
    let mut w = RawWriter::new();
    w.write_u32(segments.len() as u32);
    for seg in segments {
        w.write_bytes(seg.name.as_bytes());
        w.write_u64(seg.read_version);

        w.write_u64(seg.reads.len() as u64);
        for (key, version) in &seg.reads {
            w.write_bytes(key);
            w.write_u64(*version);
        }

        let writes: Vec<_> = seg.writes.iter().filter(|(_, v)| v.is_some()).collect();
        let removes: Vec<_> = seg.writes.iter().filter(|(_, v)| v.is_none()).collect();

        w.write_u64(writes.len() as u64);
        for (key, value) in writes {
            w.write_bytes(key);
            w.write_bytes(value.as_deref().unwrap());
        }

        w.write_u64(removes.len() as u64);
        for (key, _) in removes {
            w.write_bytes(key);
        }
    }
    w.into_vec()
}

fn read_block(data: &[u8], segments: &mut Vec<Segment>) -> Result<(), CodecError> {
    let mut r = RawReader::new(data);
    let count = r.read_u32()?;
    for _ in 0..count {
        let name = String::from_utf8_lossy(r.read_bytes()?).into_owned();
        let read_version = r.read_u64()?;

        let mut seg = Segment {
            name,
            read_version,
            ..Default::default()
        };

        let nreads = r.read_u64()?;
        for _ in 0..nreads {
            let key = r.read_bytes()?.to_vec();
            let version = r.read_u64()?;
            seg.reads.push((key, version));
        }

        let nwrites = r.read_u64()?;
        for _ in 0..nwrites {
            let key = r.read_bytes()?.to_vec();
            let value = r.read_bytes()?.to_vec();
            seg.writes.push((key, Some(value)));
        }

        let nremoves = r.read_u64()?;
        for _ in 0..nremoves {
            let key = r.read_bytes()?.to_vec();
            seg.writes.push((key, None));
        }

        segments.push(seg);
    }
    r.finish()
}

/// Serialise an entry at `version` from per-map segments. Segments are
/// partitioned by security domain (public first); the private block is
/// sealed when an encryptor is supplied.
pub fn serialise_entry(
    version: Version,
    segments: &[(SecurityDomain, &Segment)],
    encryptor: Option<&dyn Encryptor>,
    is_snapshot: bool,
) -> Result<Vec<u8>, KvError> {
    let public: Vec<&Segment> = segments
        .iter()
        .filter(|(d, s)| *d == SecurityDomain::Public && s.has_writes())
        .map(|(_, s)| *s)
        .collect();
    let private: Vec<&Segment> = segments
        .iter()
        .filter(|(d, s)| *d == SecurityDomain::Private && s.has_writes())
        .map(|(_, s)| *s)
        .collect();

    let public_block = write_block(&public);
    let private_block = if private.is_empty() {
        Vec::new()
    } else {
        let plain = write_block(&private);
        match encryptor {
            Some(e) => e.encrypt(&plain, &public_block, version, is_snapshot)?,
            None => plain,
        }
    };

    let mut w = RawWriter::with_capacity(1 + 8 + 16 + public_block.len() + private_block.len());
    w.write_u8(ENTRY_FORMAT);
    w.write_u64(version);
    w.write_bytes(&public_block);
    w.write_bytes(&private_block);
    Ok(w.into_vec())
}

/// Peek at the version of a serialised entry without decoding it.
pub fn peek_version(data: &[u8]) -> Result<Version, KvError> {
    let mut r = RawReader::new(data);
    let _format = r.read_u8()?;
    Ok(r.read_u64()?)
}

/// Deserialise an entry. PUBLIC segments are always decoded; PRIVATE
/// segments are skipped when `public_only` or when no encryptor is
/// available to open a sealed block.
pub fn deserialise_entry(
    data: &[u8],
    encryptor: Option<&dyn Encryptor>,
    public_only: bool,
) -> Result<DecodedEntry, KvError> {
    let mut r = RawReader::new(data);
    let _format = r.read_u8()?;
    let version = r.read_u64()?;
    let public_block = r.read_bytes()?;
    let private_block = r.read_bytes()?;
    r.finish()?;

    let mut segments = Vec::new();
    read_block(public_block, &mut segments)?;

    if !public_only && !private_block.is_empty() {
        match encryptor {
            Some(e) => {
                let plain = e.decrypt(private_block, public_block, version)?;
                read_block(&plain, &mut segments)?;
            }
            None => read_block(private_block, &mut segments)?,
        }
    }

    Ok(DecodedEntry { version, segments })
}

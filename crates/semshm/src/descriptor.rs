//! Read descriptors: the metadata a writer hands to a reader.
//!
//! A descriptor names the segment (and, for keyed segments, the semaphore
//! and generation) holding the latest payload, plus the payload length. It
//! travels over whatever side channel the caller already has; the payload
//! itself never does.
//!
//! Two encodings are provided:
//!
//! - JSON, internally tagged with `"kind": "keyed" | "named"`.
//! - A fixed big-endian record:
//!
//! ```text
//! magic "SSHM" (u32) | version (u8) | kind (u8: 1 keyed, 2 named)
//! keyed: segment_key i32 | mutex_key i32 | generation i64 | size u32
//! named: size u32 | name_length u16 | name bytes
//! ```

use std::fmt;
use std::io::Cursor;

use binrw::{BinRead, BinWrite};
use serde::{Deserialize, Serialize};

use crate::key::Key;
use crate::segment::SegmentId;
use crate::{IpcError, Result};

/// Magic bytes at the start of a binary descriptor ("SSHM").
const DESCRIPTOR_MAGIC: u32 = 0x5353_484D;

/// Current binary descriptor version.
const DESCRIPTOR_VERSION: u8 = 1;

/// Descriptor for a SystemV segment guarded by a semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyedDescriptor {
    /// Key of the segment holding the payload
    pub segment_key: Key,
    /// Key of the semaphore guarding the segment
    pub mutex_key: Key,
    /// Stamp assigned when the segment was allocated
    pub generation: i64,
    /// Payload length in bytes
    pub size: u32,
}

/// Descriptor for a POSIX segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamedDescriptor {
    /// Segment name, without a leading `/`
    pub name: String,
    /// Payload length in bytes
    pub size: u32,
}

/// Where a reader finds the latest payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReadDescriptor {
    /// SystemV segment + semaphore.
    Keyed(KeyedDescriptor),
    /// POSIX segment.
    Named(NamedDescriptor),
}

impl ReadDescriptor {
    /// Payload length in bytes.
    pub const fn size(&self) -> u32 {
        match self {
            Self::Keyed(d) => d.size,
            Self::Named(d) => d.size,
        }
    }

    /// The segment the payload lives in.
    pub fn segment_id(&self) -> SegmentId {
        match self {
            Self::Keyed(d) => SegmentId::Key(d.segment_key),
            Self::Named(d) => SegmentId::Name(d.name.clone()),
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| IpcError::InvalidDescriptor(e.to_string()))
    }

    /// Parse from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| IpcError::InvalidDescriptor(e.to_string()))
    }

    /// Serialize to the fixed binary record.
    ///
    /// # Errors
    ///
    /// Returns error if a name is longer than `u16::MAX` bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut cursor = Cursor::new(&mut buf);

        let kind = match self {
            Self::Keyed(_) => RecordKind::Keyed,
            Self::Named(_) => RecordKind::Named,
        };
        RecordHeader {
            magic: DESCRIPTOR_MAGIC,
            version: DESCRIPTOR_VERSION,
            kind,
        }
        .write(&mut cursor)
        .map_err(|e| IpcError::InvalidDescriptor(format!("header serialization error: {e}")))?;

        match self {
            Self::Keyed(d) => KeyedRecord {
                segment_key: d.segment_key.get(),
                mutex_key: d.mutex_key.get(),
                generation: d.generation,
                size: d.size,
            }
            .write(&mut cursor),
            Self::Named(d) => {
                let name = d.name.as_bytes().to_vec();
                let name_length = u16::try_from(name.len()).map_err(|_| {
                    IpcError::InvalidDescriptor(format!("name too long: {} bytes", name.len()))
                })?;
                NamedRecord {
                    size: d.size,
                    name_length,
                    name,
                }
                .write(&mut cursor)
            }
        }
        .map_err(|e| IpcError::InvalidDescriptor(format!("record serialization error: {e}")))?;

        Ok(buf)
    }

    /// Parse the fixed binary record.
    ///
    /// # Errors
    ///
    /// Returns error on bad magic, unknown version or kind, truncated
    /// input, trailing bytes or a name that is not UTF-8.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let header = RecordHeader::read(&mut cursor)
            .map_err(|e| IpcError::InvalidDescriptor(format!("header deserialization error: {e}")))?;

        let descriptor = match header.kind {
            RecordKind::Keyed => {
                let r = KeyedRecord::read(&mut cursor).map_err(|e| {
                    IpcError::InvalidDescriptor(format!("keyed record deserialization error: {e}"))
                })?;
                Self::Keyed(KeyedDescriptor {
                    segment_key: Key::new(r.segment_key),
                    mutex_key: Key::new(r.mutex_key),
                    generation: r.generation,
                    size: r.size,
                })
            }
            RecordKind::Named => {
                let r = NamedRecord::read(&mut cursor).map_err(|e| {
                    IpcError::InvalidDescriptor(format!("named record deserialization error: {e}"))
                })?;
                let name = String::from_utf8(r.name)
                    .map_err(|e| IpcError::InvalidDescriptor(format!("invalid UTF-8 name: {e}")))?;
                Self::Named(NamedDescriptor { name, size: r.size })
            }
        };

        let consumed = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
        if consumed != data.len() {
            return Err(IpcError::InvalidDescriptor(format!(
                "{} trailing bytes",
                data.len().saturating_sub(consumed)
            )));
        }
        Ok(descriptor)
    }
}

impl From<KeyedDescriptor> for ReadDescriptor {
    fn from(d: KeyedDescriptor) -> Self {
        Self::Keyed(d)
    }
}

impl From<NamedDescriptor> for ReadDescriptor {
    fn from(d: NamedDescriptor) -> Self {
        Self::Named(d)
    }
}

impl fmt::Display for ReadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyed(d) => write!(
                f,
                "segment {} / semaphore {} (generation {}, {} bytes)",
                d.segment_key, d.mutex_key, d.generation, d.size
            ),
            Self::Named(d) => write!(f, "segment {} ({} bytes)", d.name, d.size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[br(repr = u8)]
#[bw(repr = u8)]
enum RecordKind {
    Keyed = 1,
    Named = 2,
}

#[derive(Debug, BinRead, BinWrite)]
#[br(big)]
#[bw(big)]
struct RecordHeader {
    #[br(assert(magic == DESCRIPTOR_MAGIC))]
    magic: u32,
    #[br(assert(version == DESCRIPTOR_VERSION))]
    version: u8,
    kind: RecordKind,
}

#[derive(Debug, BinRead, BinWrite)]
#[br(big)]
#[bw(big)]
struct KeyedRecord {
    segment_key: i32,
    mutex_key: i32,
    generation: i64,
    size: u32,
}

#[derive(Debug, BinRead, BinWrite)]
#[br(big)]
#[bw(big)]
struct NamedRecord {
    size: u32,
    name_length: u16,
    #[br(count = name_length)]
    name: Vec<u8>,
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn keyed() -> ReadDescriptor {
        ReadDescriptor::Keyed(KeyedDescriptor {
            segment_key: Key::new(0x1234_5678),
            mutex_key: Key::new(42),
            generation: 1_700_000_000_123_456_789,
            size: 9,
        })
    }

    fn named() -> ReadDescriptor {
        ReadDescriptor::Named(NamedDescriptor {
            name: "frames-9".to_string(),
            size: 9,
        })
    }

    #[test]
    fn test_json_shape() {
        let json = named().to_json().expect("json");
        assert_eq!(json, r#"{"kind":"named","name":"frames-9","size":9}"#);

        let json = keyed().to_json().expect("json");
        assert!(json.starts_with(r#"{"kind":"keyed","segment_key":305419896,"mutex_key":42"#));
        assert_eq!(ReadDescriptor::from_json(&json).expect("parse"), keyed());
    }

    #[test]
    fn test_json_rejects_garbage() {
        assert!(matches!(
            ReadDescriptor::from_json(r#"{"kind":"carrier-pigeon","size":1}"#),
            Err(IpcError::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_binary_layout() {
        let bytes = keyed().to_bytes().expect("bytes");
        assert_eq!(bytes.len(), 4 + 1 + 1 + 4 + 4 + 8 + 4);
        assert_eq!(&bytes[..6], &[b'S', b'S', b'H', b'M', 1, 1]);
        assert_eq!(&bytes[6..10], &0x1234_5678_i32.to_be_bytes());
        assert_eq!(ReadDescriptor::from_bytes(&bytes).expect("parse"), keyed());

        let bytes = named().to_bytes().expect("bytes");
        assert_eq!(bytes[5], 2);
        assert_eq!(&bytes[6..10], &9u32.to_be_bytes());
        assert_eq!(&bytes[10..12], &8u16.to_be_bytes());
        assert_eq!(&bytes[12..], b"frames-9");
        assert_eq!(ReadDescriptor::from_bytes(&bytes).expect("parse"), named());
    }

    #[test]
    fn test_binary_rejects_bad_input() {
        let mut bytes = keyed().to_bytes().expect("bytes");

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(ReadDescriptor::from_bytes(&bad_magic).is_err());

        let mut bad_version = bytes.clone();
        bad_version[4] = 9;
        assert!(ReadDescriptor::from_bytes(&bad_version).is_err());

        let mut bad_kind = bytes.clone();
        bad_kind[5] = 7;
        assert!(ReadDescriptor::from_bytes(&bad_kind).is_err());

        assert!(ReadDescriptor::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        bytes.push(0);
        let err = ReadDescriptor::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.to_string(), "invalid read descriptor: 1 trailing bytes");
    }

    #[test]
    fn test_accessors_and_display() {
        assert_eq!(keyed().size(), 9);
        assert_eq!(keyed().segment_id(), SegmentId::Key(Key::new(0x1234_5678)));
        assert_eq!(named().segment_id(), SegmentId::Name("frames-9".into()));
        assert_eq!(named().to_string(), "segment frames-9 (9 bytes)");
        assert!(keyed().to_string().contains("generation 1700000000123456789"));
    }
}

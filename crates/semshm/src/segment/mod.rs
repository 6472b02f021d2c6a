//! Shared memory segments.
//!
//! Two addressing schemes live side by side:
//!
//! - [`SysvSegment`]: integer keys, `shmget` / `shmat`. Keys can be reused
//!   after a segment is removed, which is why keyed descriptors carry a
//!   generation stamp.
//! - [`PosixSegment`]: names, `shm_open` / `mmap`. The creator unlinks the
//!   name on close; mappings already established elsewhere stay valid.
//!
//! Both implement [`SharedMemory`]. [`Segment`] wraps either so callers pick
//! the scheme once, at construction time.
//!
//! Copies are plain byte copies at offset 0. Cross-process exclusion is the
//! caller's job (see [`crate::semaphore`]).

use std::fmt;

use crate::config::TransportConfig;
use crate::key::Key;
use crate::Result;

pub mod posix;
pub mod sysv;

pub use posix::PosixSegment;
pub use sysv::SysvSegment;

/// Operations shared by both segment kinds.
pub trait SharedMemory {
    /// Copy `data` to the start of the segment.
    fn write_bytes(&mut self, data: &[u8]) -> Result<()>;

    /// Copy `size` bytes from the start of the segment.
    fn read_bytes(&self, size: usize) -> Result<Vec<u8>>;

    /// Detach this process's mapping; the creator also removes the object.
    ///
    /// Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Mapped length in bytes.
    fn capacity(&self) -> usize;

    /// Whether this handle created the object and is responsible for
    /// removing it.
    fn is_owner(&self) -> bool;

    /// Whether [`close`](SharedMemory::close) has run.
    fn is_closed(&self) -> bool;
}

/// How a segment is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SegmentId {
    /// SystemV key.
    Key(Key),
    /// POSIX name, without the leading `/`.
    Name(String),
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "key {key}"),
            Self::Name(name) => write!(f, "name {name}"),
        }
    }
}

/// A segment in either addressing scheme.
#[derive(Debug)]
pub enum Segment {
    /// SystemV segment.
    Keyed(SysvSegment),
    /// POSIX segment.
    Named(PosixSegment),
}

impl Segment {
    /// Exclusively create a segment of at least `size` bytes.
    pub fn create(id: &SegmentId, size: usize, config: &TransportConfig) -> Result<Self> {
        match id {
            SegmentId::Key(key) => {
                SysvSegment::create(*key, size, config.sysv_permissions).map(Self::Keyed)
            }
            SegmentId::Name(name) => {
                PosixSegment::create(name, size, config.posix_permissions).map(Self::Named)
            }
        }
    }

    /// Attach to an existing segment.
    pub fn open(id: &SegmentId) -> Result<Self> {
        match id {
            SegmentId::Key(key) => SysvSegment::open(*key).map(Self::Keyed),
            SegmentId::Name(name) => PosixSegment::open(name).map(Self::Named),
        }
    }

    /// The identity this segment was created or opened with.
    pub fn id(&self) -> SegmentId {
        match self {
            Self::Keyed(s) => SegmentId::Key(s.key()),
            Self::Named(s) => SegmentId::Name(s.name().to_string()),
        }
    }
}

impl SharedMemory for Segment {
    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Keyed(s) => s.write_bytes(data),
            Self::Named(s) => s.write_bytes(data),
        }
    }

    fn read_bytes(&self, size: usize) -> Result<Vec<u8>> {
        match self {
            Self::Keyed(s) => s.read_bytes(size),
            Self::Named(s) => s.read_bytes(size),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            Self::Keyed(s) => s.close(),
            Self::Named(s) => s.close(),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            Self::Keyed(s) => s.capacity(),
            Self::Named(s) => s.capacity(),
        }
    }

    fn is_owner(&self) -> bool {
        match self {
            Self::Keyed(s) => s.is_owner(),
            Self::Named(s) => s.is_owner(),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            Self::Keyed(s) => s.is_closed(),
            Self::Named(s) => s.is_closed(),
        }
    }
}

/// Bounds check shared by both implementations.
pub(crate) fn check_bounds(requested: usize, capacity: usize) -> Result<()> {
    if requested > capacity {
        return Err(crate::IpcError::OutOfBounds {
            requested,
            capacity,
        });
    }
    Ok(())
}

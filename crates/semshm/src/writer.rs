//! Writer sessions.
//!
//! A writer owns at most one live segment (and, for the keyed scheme, one
//! semaphore). Each write reuses the segment while the payload fits and
//! reallocates it when it does not, so capacity only ever grows. Every call
//! returns a [`ReadDescriptor`] naming where the payload now lives.
//!
//! Calls on one writer value are serialized by an in-process lock; this is
//! what keeps a reallocation from racing an in-flight copy. Two writer
//! values sharing resources are not coordinated.

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::descriptor::{KeyedDescriptor, NamedDescriptor, ReadDescriptor};
use crate::generation;
use crate::key::{KeySource, RandomKeys, allocate, segment_name};
use crate::segment::{PosixSegment, SharedMemory, SysvSegment};
use crate::semaphore::Semaphore;
use crate::{IpcError, Resource, Result};

/// Payload length as it appears in a descriptor.
fn payload_size(data: &[u8]) -> Result<u32> {
    u32::try_from(data.len()).map_err(|_| IpcError::OutOfBounds {
        requested: data.len(),
        capacity: u32::MAX as usize,
    })
}

/// Close a handle that is being replaced or torn down.
fn close_slot<T: SharedMemory>(slot: &mut Option<T>) -> Result<()> {
    match slot.take() {
        Some(mut handle) => handle.close(),
        None => Ok(()),
    }
}

struct KeyedState {
    keys: Box<dyn KeySource>,
    segment: Option<SysvSegment>,
    generation: i64,
    semaphore: Option<Semaphore>,
    closed: bool,
}

impl KeyedState {
    fn ensure_segment(&mut self, len: usize, config: &TransportConfig) -> Result<()> {
        if let Some(segment) = &self.segment {
            if len <= segment.capacity() {
                debug!(
                    "Reusing segment {} ({} of {} bytes)",
                    segment.key(),
                    len,
                    segment.capacity()
                );
                return Ok(());
            }
        }

        close_slot(&mut self.segment)?;

        let segment = allocate(self.keys.as_mut(), config.max_key_attempts, |key| {
            SysvSegment::create(key, len, config.sysv_permissions)
        })?;
        self.generation = generation::next();
        info!(
            "Allocated segment {} ({} bytes, generation {})",
            segment.key(),
            segment.capacity(),
            self.generation
        );
        self.segment = Some(segment);
        Ok(())
    }

    fn ensure_semaphore(&mut self, config: &TransportConfig) -> Result<()> {
        if self.semaphore.is_some() {
            return Ok(());
        }
        let semaphore = allocate(self.keys.as_mut(), config.max_key_attempts, |key| {
            Semaphore::create(key, config.sysv_permissions)
        })?;
        info!("Allocated semaphore {}", semaphore.key());
        self.semaphore = Some(semaphore);
        Ok(())
    }
}

/// Writer for SystemV segments guarded by a semaphore.
pub struct KeyedWriter {
    config: TransportConfig,
    state: Mutex<KeyedState>,
}

impl KeyedWriter {
    /// Create a writer drawing random keys from the thread generator.
    pub fn new(config: TransportConfig) -> Result<Self> {
        Self::with_key_source(config, RandomKeys::from_entropy())
    }

    /// Create a writer with an explicit key source.
    pub fn with_key_source(
        config: TransportConfig,
        keys: impl KeySource + 'static,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(KeyedState {
                keys: Box::new(keys),
                segment: None,
                generation: 0,
                semaphore: None,
                closed: false,
            }),
        })
    }

    /// Copy `data` into shared memory and describe where it went.
    pub fn write(&self, data: &[u8]) -> Result<ReadDescriptor> {
        let size = payload_size(data)?;
        let mut guard = self.state.lock();
        if guard.closed {
            return Err(IpcError::Closed(Resource::Writer));
        }
        let state = &mut *guard;

        state.ensure_segment(data.len(), &self.config)?;
        state.ensure_semaphore(&self.config)?;

        let segment = state
            .segment
            .as_mut()
            .ok_or(IpcError::Closed(Resource::Segment))?;
        let semaphore = state
            .semaphore
            .as_ref()
            .ok_or(IpcError::Closed(Resource::Semaphore))?;

        semaphore.lock()?;
        let written = segment.write_bytes(data);
        let unlocked = semaphore.unlock();
        written?;
        unlocked?;

        Ok(ReadDescriptor::Keyed(KeyedDescriptor {
            segment_key: segment.key(),
            mutex_key: semaphore.key(),
            generation: state.generation,
            size,
        }))
    }

    /// Capacity of the current segment, 0 before the first write.
    pub fn capacity(&self) -> usize {
        self.state
            .lock()
            .segment
            .as_ref()
            .map_or(0, SharedMemory::capacity)
    }

    /// Remove the segment and semaphore. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let segment = close_slot(&mut state.segment);
        let semaphore = match state.semaphore.take() {
            Some(mut semaphore) => semaphore.close(),
            None => Ok(()),
        };
        info!("Closed keyed writer");
        segment.and(semaphore)
    }
}

impl std::fmt::Debug for KeyedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("KeyedWriter")
            .field("segment", &state.segment.as_ref().map(SysvSegment::key))
            .field("generation", &state.generation)
            .field("semaphore", &state.semaphore.as_ref().map(Semaphore::key))
            .field("closed", &state.closed)
            .finish()
    }
}

#[derive(Debug)]
struct NamedState {
    segment: Option<PosixSegment>,
    closed: bool,
}

/// Writer for POSIX segments named `<prefix>-<size>`.
///
/// No semaphore is used. A name collision surfaces as
/// [`IpcError::Collision`]; two producers sharing a prefix is the caller's
/// problem.
#[derive(Debug)]
pub struct NamedWriter {
    prefix: String,
    config: TransportConfig,
    state: Mutex<NamedState>,
}

impl NamedWriter {
    /// Create a writer that names its segments after `prefix`.
    pub fn new(prefix: impl Into<String>, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let prefix = prefix.into();
        if prefix.trim_start_matches('/').is_empty() {
            return Err(IpcError::InvalidName(prefix));
        }
        Ok(Self {
            prefix,
            config,
            state: Mutex::new(NamedState {
                segment: None,
                closed: false,
            }),
        })
    }

    /// The configured name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Copy `data` into shared memory and describe where it went.
    pub fn write(&self, data: &[u8]) -> Result<ReadDescriptor> {
        let size = payload_size(data)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(IpcError::Closed(Resource::Writer));
        }

        let reuse = state
            .segment
            .as_ref()
            .is_some_and(|segment| data.len() <= segment.capacity());
        if reuse {
            debug!("Reusing named segment for {} bytes", data.len());
        } else {
            close_slot(&mut state.segment)?;
            let name = segment_name(&self.prefix, data.len());
            let segment =
                PosixSegment::create(&name, data.len(), self.config.posix_permissions)?;
            info!(
                "Allocated segment {} ({} bytes)",
                segment.name(),
                segment.capacity()
            );
            state.segment = Some(segment);
        }

        let segment = state
            .segment
            .as_mut()
            .ok_or(IpcError::Closed(Resource::Segment))?;
        segment.write_bytes(data)?;

        Ok(ReadDescriptor::Named(NamedDescriptor {
            name: segment.name().to_string(),
            size,
        }))
    }

    /// Capacity of the current segment, 0 before the first write.
    pub fn capacity(&self) -> usize {
        self.state
            .lock()
            .segment
            .as_ref()
            .map_or(0, SharedMemory::capacity)
    }

    /// Unlink and unmap the segment. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        let result = close_slot(&mut state.segment);
        info!("Closed named writer {}", self.prefix);
        result
    }
}

/// A writer in either addressing scheme.
#[derive(Debug)]
pub enum Writer {
    /// SystemV segment + semaphore.
    Keyed(KeyedWriter),
    /// POSIX segment named after a prefix.
    Named(NamedWriter),
}

impl Writer {
    /// Keyed writer with random keys.
    pub fn keyed(config: TransportConfig) -> Result<Self> {
        KeyedWriter::new(config).map(Self::Keyed)
    }

    /// Named writer for `prefix`.
    pub fn named(prefix: impl Into<String>, config: TransportConfig) -> Result<Self> {
        NamedWriter::new(prefix, config).map(Self::Named)
    }

    /// Copy `data` into shared memory and describe where it went.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Closed`] after [`close`](Self::close), and any
    /// allocation or OS error otherwise.
    pub fn write(&self, data: &[u8]) -> Result<ReadDescriptor> {
        match self {
            Self::Keyed(w) => w.write(data),
            Self::Named(w) => w.write(data),
        }
    }

    /// Capacity of the current segment, 0 before the first write.
    pub fn capacity(&self) -> usize {
        match self {
            Self::Keyed(w) => w.capacity(),
            Self::Named(w) => w.capacity(),
        }
    }

    /// Release every resource this writer created.
    pub fn close(&self) -> Result<()> {
        match self {
            Self::Keyed(w) => w.close(),
            Self::Named(w) => w.close(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::key::testing::{Scripted, free_segment_key, free_semaphore_key};
    use crate::segment::{Segment, SegmentId};

    fn unique_prefix(tag: &str) -> String {
        format!("semshm-writer-{tag}-{}", std::process::id())
    }

    fn keyed_parts(descriptor: &ReadDescriptor) -> KeyedDescriptor {
        match descriptor {
            ReadDescriptor::Keyed(d) => *d,
            ReadDescriptor::Named(_) => panic!("expected keyed descriptor"),
        }
    }

    #[test]
    fn test_keyed_reuse_and_growth() {
        let writer = Writer::keyed(TransportConfig::default()).expect("writer");
        assert_eq!(writer.capacity(), 0);

        let first = keyed_parts(&writer.write(b"testtest").expect("write"));
        assert_eq!(first.size, 8);
        assert_eq!(writer.capacity(), 8);

        let smaller = keyed_parts(&writer.write(b"test").expect("write"));
        assert_eq!(smaller.segment_key, first.segment_key);
        assert_eq!(smaller.generation, first.generation);
        assert_eq!(smaller.mutex_key, first.mutex_key);
        assert_eq!(smaller.size, 4);
        assert_eq!(writer.capacity(), 8);

        let larger = keyed_parts(&writer.write(b"testtest1").expect("write"));
        assert!(larger.generation > first.generation);
        assert_eq!(larger.mutex_key, first.mutex_key);
        assert_eq!(writer.capacity(), 9);

        // The old segment is gone.
        if larger.segment_key != first.segment_key {
            let err = Segment::open(&SegmentId::Key(first.segment_key)).unwrap_err();
            assert!(err.is_not_found());
        }

        writer.close().expect("close");
        assert!(writer.write(b"x").unwrap_err().is_closed());
        writer.close().expect("second close is a no-op");
        assert!(Semaphore::open(larger.mutex_key).unwrap_err().is_not_found());
    }

    #[test]
    fn test_keyed_writer_uses_injected_keys() {
        let segment_key = free_segment_key();
        let semaphore_key = free_semaphore_key();

        let writer = KeyedWriter::with_key_source(
            TransportConfig::default(),
            Scripted::new([segment_key, semaphore_key]),
        )
        .expect("writer");
        let d = keyed_parts(&writer.write(b"abc").expect("write"));
        assert_eq!(d.segment_key, segment_key);
        assert_eq!(d.mutex_key, semaphore_key);
    }

    #[test]
    fn test_keyed_writer_reports_exhausted_key_space() {
        // Every candidate names a segment that already exists.
        let taken = SysvSegment::create(free_segment_key(), 1, 0o600).expect("occupy key");
        let keys = Scripted::new(std::iter::repeat_n(taken.key(), 3));
        let config = TransportConfig::default().with_max_key_attempts(3);

        let writer = KeyedWriter::with_key_source(config, keys).expect("writer");
        assert!(matches!(
            writer.write(b"nowhere to go"),
            Err(IpcError::KeySpaceExhausted { attempts: 3 })
        ));
        assert_eq!(writer.capacity(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = TransportConfig::default().with_max_key_attempts(0);
        assert!(matches!(KeyedWriter::new(config), Err(IpcError::Config(_))));
        assert!(matches!(
            NamedWriter::new("/", TransportConfig::default()),
            Err(IpcError::InvalidName(_))
        ));
    }

    #[test]
    fn test_named_reuse_and_growth() {
        let prefix = unique_prefix("growth");
        let writer = Writer::named(prefix.clone(), TransportConfig::default()).expect("writer");

        let first = writer.write(b"test").expect("write");
        assert_eq!(
            first,
            ReadDescriptor::Named(NamedDescriptor {
                name: format!("{prefix}-4"),
                size: 4
            })
        );

        let smaller = writer.write(b"tes").expect("write");
        assert_eq!(smaller.segment_id(), first.segment_id());
        assert_eq!(smaller.size(), 3);

        let larger = writer.write(b"testtest1").expect("write");
        assert_eq!(larger.segment_id(), SegmentId::Name(format!("{prefix}-9")));
        assert!(Segment::open(&first.segment_id()).unwrap_err().is_not_found());

        writer.close().expect("close");
        assert!(writer.write(b"x").unwrap_err().is_closed());
        writer.close().expect("second close is a no-op");
        assert!(Segment::open(&larger.segment_id()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_empty_payload() {
        let writer = Writer::named(unique_prefix("empty"), TransportConfig::default())
            .expect("writer");
        let d = writer.write(b"").expect("write");
        assert_eq!(d.size(), 0);
        assert_eq!(writer.capacity(), 1);
    }
}

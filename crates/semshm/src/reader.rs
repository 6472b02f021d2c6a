//! Reader sessions.
//!
//! A reader attaches lazily to whatever a descriptor names and keeps that
//! attachment for later calls. It re-attaches when the descriptor points at
//! a different segment, or at the same key under a different generation,
//! which is how it survives the writer reallocating between calls. The
//! semaphore attachment carries the same generation tag: a writer that
//! closes removes its semaphore, and a later writer may create a new one
//! under the same key.
//!
//! Readers never remove anything; closing one only detaches this process.

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::descriptor::ReadDescriptor;
use crate::key::Key;
use crate::segment::{Segment, SegmentId, SharedMemory};
use crate::semaphore::Semaphore;
use crate::{IpcError, Resource, Result};

/// A segment attachment tagged with what it was attached for.
#[derive(Debug)]
struct Attached {
    id: SegmentId,
    generation: Option<i64>,
    segment: Segment,
}

/// A semaphore attachment tagged with the generation it was opened for.
#[derive(Debug)]
struct AttachedSemaphore {
    generation: i64,
    semaphore: Semaphore,
}

#[derive(Debug, Default)]
struct ReaderState {
    segment: Option<Attached>,
    semaphore: Option<AttachedSemaphore>,
    closed: bool,
}

impl ReaderState {
    fn attach_segment(&mut self, id: SegmentId, generation: Option<i64>) -> Result<()> {
        let current = self
            .segment
            .as_ref()
            .is_some_and(|a| a.id == id && a.generation == generation);

        if !current {
            if let Some(mut old) = self.segment.take() {
                if let Err(e) = old.segment.close() {
                    warn!("Failed to detach segment {}: {}", old.id, e);
                }
                info!("Re-attaching: segment {} replaced by {}", old.id, id);
            }
            let segment = Segment::open(&id)?;
            debug!("Attached segment {} ({} bytes)", id, segment.capacity());
            self.segment = Some(Attached {
                id,
                generation,
                segment,
            });
        }
        Ok(())
    }

    fn segment(&self) -> Result<&Segment> {
        self.segment
            .as_ref()
            .map(|a| &a.segment)
            .ok_or(IpcError::Closed(Resource::Segment))
    }

    fn attach_semaphore(&mut self, key: Key, generation: i64) -> Result<()> {
        let current = self
            .semaphore
            .as_ref()
            .is_some_and(|a| a.semaphore.key() == key && a.generation == generation);
        if current {
            return Ok(());
        }
        if let Some(mut old) = self.semaphore.take() {
            if let Err(e) = old.semaphore.close() {
                warn!("Failed to release semaphore {}: {}", old.semaphore.key(), e);
            }
        }
        let semaphore = Semaphore::open(key)?;
        debug!("Attached semaphore {} (generation {})", key, generation);
        self.semaphore = Some(AttachedSemaphore {
            generation,
            semaphore,
        });
        Ok(())
    }

    fn semaphore(&self) -> Result<&Semaphore> {
        self.semaphore
            .as_ref()
            .map(|a| &a.semaphore)
            .ok_or(IpcError::Closed(Resource::Semaphore))
    }
}

/// Reads payloads described by [`ReadDescriptor`]s of either kind.
#[derive(Debug, Default)]
pub struct Reader {
    state: Mutex<ReaderState>,
}

impl Reader {
    /// Create a reader with nothing attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the payload named by `descriptor` out of shared memory.
    ///
    /// For keyed descriptors the copy happens under the descriptor's
    /// semaphore.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Closed`] after [`close`](Self::close),
    /// [`IpcError::NotFound`] for a stale or unknown descriptor and
    /// [`IpcError::OutOfBounds`] if the size exceeds the segment.
    pub fn read(&self, descriptor: &ReadDescriptor) -> Result<Vec<u8>> {
        let mut guard = self.state.lock();
        if guard.closed {
            return Err(IpcError::Closed(Resource::Reader));
        }
        let state = &mut *guard;
        let size = descriptor.size() as usize;

        match descriptor {
            ReadDescriptor::Keyed(d) => {
                state.attach_segment(SegmentId::Key(d.segment_key), Some(d.generation))?;
                state.attach_semaphore(d.mutex_key, d.generation)?;
                let segment = state.segment()?;
                let semaphore = state.semaphore()?;

                semaphore.lock()?;
                let read = segment.read_bytes(size);
                let unlocked = semaphore.unlock();
                let bytes = read?;
                unlocked?;
                Ok(bytes)
            }
            ReadDescriptor::Named(d) => {
                state.attach_segment(SegmentId::Name(d.name.clone()), None)?;
                state.segment()?.read_bytes(size)
            }
        }
    }

    /// The segment currently attached, if any.
    pub fn attached(&self) -> Option<SegmentId> {
        self.state.lock().segment.as_ref().map(|a| a.id.clone())
    }

    /// Detach everything. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let segment = match state.segment.take() {
            Some(mut attached) => attached.segment.close(),
            None => Ok(()),
        };
        let semaphore = match state.semaphore.take() {
            Some(mut attached) => attached.semaphore.close(),
            None => Ok(()),
        };
        info!("Closed reader");
        segment.and(semaphore)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::descriptor::{KeyedDescriptor, NamedDescriptor};
    use crate::key::testing::{Scripted, free_segment_key, free_semaphore_key};
    use crate::writer::{KeyedWriter, Writer};

    fn keyed_parts(descriptor: &ReadDescriptor) -> KeyedDescriptor {
        match descriptor {
            ReadDescriptor::Keyed(d) => *d,
            ReadDescriptor::Named(_) => panic!("expected keyed descriptor"),
        }
    }

    fn unique_prefix(tag: &str) -> String {
        format!("semshm-reader-{tag}-{}", std::process::id())
    }

    #[test]
    fn test_keyed_scenario() {
        let writer = Writer::keyed(TransportConfig::default()).expect("writer");
        let reader = Reader::new();

        let first = writer.write(b"test").expect("write");
        assert_eq!(first.size(), 4);
        assert_eq!(reader.read(&first).expect("read"), b"test");
        assert_eq!(reader.attached(), Some(first.segment_id()));

        let second = writer.write(b"testtest1").expect("write");
        assert_ne!(first, second);
        assert_eq!(reader.read(&second).expect("read"), b"testtest1");
        assert_eq!(reader.attached(), Some(second.segment_id()));

        reader.close().expect("close");
        assert!(reader.read(&second).unwrap_err().is_closed());
        reader.close().expect("second close is a no-op");

        // Closing the reader left the writer's objects in place.
        assert_eq!(writer.write(b"again").expect("write").size(), 5);
        let fresh = writer.write(b"fresh").expect("write");
        assert_eq!(Reader::new().read(&fresh).expect("read"), b"fresh");
    }

    #[test]
    fn test_named_scenario() {
        let writer = Writer::named(unique_prefix("scenario"), TransportConfig::default())
            .expect("writer");
        let reader = Reader::new();

        let first = writer.write(b"test").expect("write");
        assert_eq!(reader.read(&first).expect("read"), b"test");

        let second = writer.write(b"testtest1").expect("write");
        assert_eq!(reader.read(&second).expect("read"), b"testtest1");
        assert_eq!(reader.attached(), Some(second.segment_id()));
    }

    #[test]
    fn test_recreated_segment_under_same_key_is_reattached() {
        let segment_key = free_segment_key();
        let semaphore_key = free_semaphore_key();
        // Growing the segment removes it and allocates the same key again.
        let keys = Scripted::new([segment_key, semaphore_key, segment_key]);
        let writer =
            KeyedWriter::with_key_source(TransportConfig::default(), keys).expect("writer");
        let reader = Reader::new();

        let first = writer.write(b"abcd").expect("write");
        assert_eq!(reader.read(&first).expect("read"), b"abcd");

        let second = writer.write(b"abcdefgh").expect("write");
        let (a, b) = (keyed_parts(&first), keyed_parts(&second));
        assert_eq!(a.segment_key, b.segment_key);
        assert_ne!(a.generation, b.generation);

        // The cached mapping is the removed 4-byte segment; reading 8 bytes
        // only works after re-attaching to the new one.
        assert_eq!(reader.read(&second).expect("read"), b"abcdefgh");
    }

    #[test]
    fn test_semaphore_key_reused_by_next_writer() {
        let semaphore_key = free_semaphore_key();
        let first_writer = KeyedWriter::with_key_source(
            TransportConfig::default(),
            Scripted::new([free_segment_key(), semaphore_key]),
        )
        .expect("writer");
        let reader = Reader::new();

        let first = first_writer.write(b"first").expect("write");
        assert_eq!(reader.read(&first).expect("read"), b"first");
        first_writer.close().expect("close");

        let second_writer = KeyedWriter::with_key_source(
            TransportConfig::default(),
            Scripted::new([free_segment_key(), semaphore_key]),
        )
        .expect("writer");
        let second = second_writer.write(b"second").expect("write");
        assert_eq!(keyed_parts(&second).mutex_key, semaphore_key);

        assert_eq!(reader.read(&second).expect("read"), b"second");
        assert_eq!(reader.read(&second).expect("read again"), b"second");
    }

    #[test]
    fn test_unknown_descriptor() {
        let reader = Reader::new();
        let missing = ReadDescriptor::Named(NamedDescriptor {
            name: unique_prefix("missing"),
            size: 1,
        });
        assert!(reader.read(&missing).unwrap_err().is_not_found());
        assert_eq!(reader.attached(), None);
    }

    #[test]
    fn test_size_beyond_segment() {
        let writer = Writer::named(unique_prefix("bounds"), TransportConfig::default())
            .expect("writer");
        let ReadDescriptor::Named(d) = writer.write(b"abc").expect("write") else {
            panic!("expected named descriptor");
        };
        let oversized = ReadDescriptor::Named(NamedDescriptor { size: 64, ..d });
        assert!(matches!(
            Reader::new().read(&oversized),
            Err(IpcError::OutOfBounds { requested: 64, .. })
        ));
    }
}

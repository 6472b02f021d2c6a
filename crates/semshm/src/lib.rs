//! Semaphore-guarded shared memory transport.
//!
//! One process writes a variable-size payload into an OS shared memory
//! segment; another, unrelated process attaches to the same segment and
//! reads it back. Only a small [`ReadDescriptor`] crosses between them, over
//! whatever channel the caller already has (a pipe, a socket, an RPC field).
//!
//! Two addressing schemes are supported:
//!
//! - **Keyed**: SystemV segments addressed by integer keys, guarded by a
//!   SystemV semaphore. Keys are allocated randomly with exclusive create and
//!   bounded retry. Keys can be recycled by the OS, so descriptors carry a
//!   generation stamp that readers compare before trusting a cached mapping.
//! - **Named**: POSIX segments named `<prefix>-<size>`. No semaphore.
//!
//! The transport is a single-slot, latest-value handoff: there is no queue,
//! no back-pressure and no peer discovery.
//!
//! # Example
//!
//! ```no_run
//! use semshm::{Reader, TransportConfig, Writer};
//!
//! # fn example() -> semshm::Result<()> {
//! let writer = Writer::keyed(TransportConfig::default())?;
//! let descriptor = writer.write(b"payload")?;
//!
//! // Ship `descriptor.to_json()?` to the other process, then there:
//! let reader = Reader::new();
//! assert_eq!(reader.read(&descriptor)?, b"payload");
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]
#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

// Error taxonomy
mod error;

// Configuration
pub mod config;

// Identity allocation
pub mod key;

// OS shared memory
pub mod segment;

// Cross-process mutex
pub mod semaphore;

// Descriptor encodings
pub mod descriptor;

// Generation stamps
pub mod generation;

// Sessions
pub mod reader;
pub mod writer;

pub use config::TransportConfig;
pub use descriptor::{KeyedDescriptor, NamedDescriptor, ReadDescriptor};
pub use error::{IpcError, Resource, Result};
pub use key::{Key, KeySource, PathKeys, RandomKeys};
pub use reader::Reader;
pub use segment::{PosixSegment, Segment, SegmentId, SharedMemory, SysvSegment};
pub use semaphore::Semaphore;
pub use writer::{KeyedWriter, NamedWriter, Writer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Error types for the shared-memory transport.
//!
//! Every OS failure carries the name of the call that produced it so a
//! failed `semop` can be told apart from a failed `shmat` in logs.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, IpcError>;

/// The kind of object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// A shared memory segment.
    Segment,
    /// A semaphore used as a cross-process mutex.
    Semaphore,
    /// A writer session.
    Writer,
    /// A reader session.
    Reader,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Segment => "shared memory segment",
            Self::Semaphore => "semaphore",
            Self::Writer => "writer",
            Self::Reader => "reader",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while creating, attaching or using IPC resources.
#[derive(Debug, Error)]
pub enum IpcError {
    /// An exclusive create found the identity already in use.
    #[error("{resource} {id} already exists")]
    Collision {
        /// Kind of object that collided
        resource: Resource,
        /// Key or name that was taken
        id: String,
    },

    /// The identity is unknown to the OS.
    #[error("{resource} {id} not found")]
    NotFound {
        /// Kind of object that was looked up
        resource: Resource,
        /// Key or name that was looked up
        id: String,
    },

    /// The object has been closed.
    #[error("{0} is closed")]
    Closed(Resource),

    /// Random key allocation kept colliding.
    #[error("no free IPC key after {attempts} attempts")]
    KeySpaceExhausted {
        /// Number of keys tried
        attempts: u32,
    },

    /// A system call failed.
    #[error("{op} failed for {id}: {source}")]
    Os {
        /// Name of the failing call
        op: &'static str,
        /// Key, name or path the call was made for
        id: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// A copy would run past the end of the mapping.
    #[error("copy of {requested} bytes exceeds segment capacity of {capacity} bytes")]
    OutOfBounds {
        /// Bytes requested
        requested: usize,
        /// Bytes mapped
        capacity: usize,
    },

    /// A segment name that the OS would reject or misinterpret.
    #[error("invalid shared memory name: {0}")]
    InvalidName(String),

    /// A read descriptor could not be decoded.
    #[error("invalid read descriptor: {0}")]
    InvalidDescriptor(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl IpcError {
    /// Classify an errno from a create/open call.
    ///
    /// `EEXIST` becomes [`IpcError::Collision`], `ENOENT` becomes
    /// [`IpcError::NotFound`], everything else is kept as [`IpcError::Os`].
    pub(crate) fn from_os(
        op: &'static str,
        resource: Resource,
        id: impl fmt::Display,
        source: io::Error,
    ) -> Self {
        match source.raw_os_error() {
            Some(libc::EEXIST) => Self::Collision {
                resource,
                id: id.to_string(),
            },
            Some(libc::ENOENT) => Self::NotFound {
                resource,
                id: id.to_string(),
            },
            _ => Self::Os {
                op,
                id: id.to_string(),
                source,
            },
        }
    }

    /// Wrap the calling thread's last OS error.
    pub(crate) fn last_os(op: &'static str, resource: Resource, id: impl fmt::Display) -> Self {
        Self::from_os(op, resource, id, io::Error::last_os_error())
    }

    /// Whether this is an exclusive-create collision.
    pub const fn is_collision(&self) -> bool {
        matches!(self, Self::Collision { .. })
    }

    /// Whether the identity was unknown to the OS.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the operation hit a closed resource.
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

//! Identity allocation for SystemV segments and semaphores.
//!
//! Keys come from a [`KeySource`] that the writer owns. Random keys are
//! drawn from an explicitly supplied generator so tests can script
//! collisions; path-derived keys go through `ftok` over freshly created
//! temporary files. [`allocate`] wraps either source in the bounded
//! exclusive-create retry loop.

use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, RngExt, SeedableRng};
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tracing::debug;

use crate::config::TransportConfig;
use crate::{IpcError, Result};

/// A SystemV IPC key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(i32);

impl Key {
    /// The reserved `IPC_PRIVATE` key, never handed out by an allocator.
    pub const PRIVATE: Self = Self(libc::IPC_PRIVATE);

    /// Wrap a raw key value.
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw key value.
    pub const fn get(self) -> i32 {
        self.0
    }

    /// Whether this is the reserved private key.
    pub const fn is_private(self) -> bool {
        self.0 == libc::IPC_PRIVATE
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl From<i32> for Key {
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

/// A supplier of candidate keys.
pub trait KeySource: Send {
    /// Produce the next candidate key.
    ///
    /// Candidates may collide with existing objects; [`allocate`] handles
    /// that by asking again.
    fn next_key(&mut self) -> Result<Key>;
}

/// Uniformly random keys over the non-negative 31-bit range.
#[derive(Debug)]
pub struct RandomKeys<R> {
    rng: R,
}

impl<R: Rng + Send> RandomKeys<R> {
    /// Draw keys from the given generator.
    pub const fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl RandomKeys<StdRng> {
    /// Reproducible keys from a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    /// Keys seeded from the thread-local generator.
    pub fn from_entropy() -> Self {
        Self::seeded(rand::rng().random())
    }
}

impl<R: Rng + Send> KeySource for RandomKeys<R> {
    fn next_key(&mut self) -> Result<Key> {
        Ok(Key(self.rng.random_range(0..=i32::MAX)))
    }
}

/// Keys derived with `ftok` from temporary files.
///
/// Every request creates a new file so the derived keys differ; the files
/// stay on disk until the source is dropped, which keeps the inodes (and so
/// the keys) from being recycled while the objects they name are alive.
#[derive(Debug)]
pub struct PathKeys {
    dir: PathBuf,
    prefix: String,
    project_id: u8,
    paths: Vec<TempPath>,
}

impl PathKeys {
    /// Derive keys from files created in `dir` named `prefix*`.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>, project_id: u8) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            project_id,
            paths: Vec::new(),
        }
    }

    /// Derive keys from files in `dir` with the configured project id.
    pub fn from_config(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        config: &TransportConfig,
    ) -> Self {
        Self::new(dir, prefix, config.project_id)
    }

    /// Derive keys from files in the system temporary directory.
    pub fn in_temp_dir(prefix: impl Into<String>, project_id: u8) -> Self {
        Self::new(std::env::temp_dir(), prefix, project_id)
    }

    /// Paths of the files currently backing handed-out keys.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(|p| &**p)
    }
}

impl KeySource for PathKeys {
    fn next_key(&mut self) -> Result<Key> {
        let file = tempfile::Builder::new()
            .prefix(&self.prefix)
            .tempfile_in(&self.dir)
            .map_err(|source| IpcError::Os {
                op: "mkstemp",
                id: self.dir.display().to_string(),
                source,
            })?;
        let path = file.into_temp_path();
        let key = key_from_path(&path, self.project_id)?;
        self.paths.push(path);
        Ok(key)
    }
}

/// Derive a key from an existing path and a project id with `ftok`.
///
/// Both processes can call this with the same arguments to agree on a key
/// ahead of time.
#[allow(unsafe_code)]
pub fn key_from_path(path: &Path, project_id: u8) -> Result<Key> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| IpcError::InvalidName(format!("invalid path {}: {e}", path.display())))?;

    let key = unsafe { libc::ftok(c_path.as_ptr(), libc::c_int::from(project_id)) };
    if key == -1 {
        return Err(IpcError::Os {
            op: "ftok",
            id: path.display().to_string(),
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(Key(key))
}

/// Run `create` with fresh keys until one does not collide.
///
/// Only [`IpcError::Collision`] triggers another attempt; any other error
/// is returned as-is. The reserved private key is skipped and counts as an
/// attempt. After `attempts` tries the loop gives up with
/// [`IpcError::KeySpaceExhausted`].
pub fn allocate<S, T, F>(source: &mut S, attempts: u32, mut create: F) -> Result<T>
where
    S: KeySource + ?Sized,
    F: FnMut(Key) -> Result<T>,
{
    for attempt in 1..=attempts {
        let key = source.next_key()?;
        if key.is_private() {
            continue;
        }
        match create(key) {
            Err(IpcError::Collision { resource, id }) => {
                debug!("Key {} for {} is taken (attempt {})", id, resource, attempt);
            }
            other => return other,
        }
    }
    Err(IpcError::KeySpaceExhausted { attempts })
}

/// Name of the POSIX segment a named writer uses for a payload size.
pub fn segment_name(prefix: &str, size: usize) -> String {
    format!("{prefix}-{size}")
}

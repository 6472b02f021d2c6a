//! POSIX shared memory (`shm_open` / `mmap`).
//!
//! The public name never has a leading `/`; the name handed to the OS
//! always has exactly one. Callers may pass either form.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::{self, NonNull};

use libc::{c_uint, c_void, mode_t, off_t};
use tracing::debug;

use super::{SharedMemory, check_bounds};
use crate::{IpcError, Resource, Result};

/// A live `mmap` of the shared memory object.
#[derive(Debug)]
struct Mapping {
    _fd: OwnedFd,
    addr: NonNull<u8>,
    len: usize,
}

/// A POSIX shared memory object addressed by name.
#[derive(Debug)]
pub struct PosixSegment {
    name: String,
    os_name: CString,
    mapping: Option<Mapping>,
    unlink: bool,
    owner: bool,
}

impl PosixSegment {
    /// Exclusively create `name`, size it to `size` bytes (at least one) and
    /// map it.
    pub fn create(name: &str, size: usize, permissions: u32) -> Result<Self> {
        let (name, os_name) = normalize(name)?;
        let fd = shm_open(&os_name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, permissions)?;

        // From here on the name exists; dropping `segment` on an early
        // return unlinks it again.
        let mut segment = Self {
            name,
            os_name,
            mapping: None,
            unlink: true,
            owner: true,
        };

        let len = size.max(1);
        segment.truncate(&fd, len)?;
        segment.mapping = Some(segment.map(fd)?);
        debug!("Created POSIX segment {} ({} bytes)", segment.name, len);
        Ok(segment)
    }

    /// Open and map an existing object. The mapped length is whatever the
    /// creator truncated it to.
    pub fn open(name: &str) -> Result<Self> {
        let (name, os_name) = normalize(name)?;
        let fd = shm_open(&os_name, libc::O_RDWR, 0)?;

        let mut segment = Self {
            name,
            os_name,
            mapping: None,
            unlink: false,
            owner: false,
        };
        segment.mapping = Some(segment.map(fd)?);
        Ok(segment)
    }

    /// The public name, without a leading `/`.
    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(unsafe_code)]
    fn truncate(&self, fd: &OwnedFd, len: usize) -> Result<()> {
        let length = off_t::try_from(len).map_err(|_| IpcError::OutOfBounds {
            requested: len,
            capacity: usize::try_from(off_t::MAX).unwrap_or(usize::MAX),
        })?;
        if unsafe { libc::ftruncate(fd.as_raw_fd(), length) } == -1 {
            return Err(IpcError::last_os("ftruncate", Resource::Segment, &self.name));
        }
        Ok(())
    }

    #[allow(unsafe_code)]
    fn map(&self, fd: OwnedFd) -> Result<Mapping> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd.as_raw_fd(), &raw mut stat) } == -1 {
            return Err(IpcError::last_os("fstat", Resource::Segment, &self.name));
        }
        let len = usize::try_from(stat.st_size).unwrap_or(0);

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(IpcError::last_os("mmap", Resource::Segment, &self.name));
        }
        let addr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| IpcError::last_os("mmap", Resource::Segment, &self.name))?;

        Ok(Mapping { _fd: fd, addr, len })
    }

    fn live(&self) -> Result<&Mapping> {
        self.mapping
            .as_ref()
            .ok_or(IpcError::Closed(Resource::Segment))
    }
}

impl SharedMemory for PosixSegment {
    #[allow(unsafe_code)]
    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let mapping = self.live()?;
        check_bounds(data.len(), mapping.len)?;
        // SAFETY: `len` bytes are mapped read-write and `&mut self` rules out
        // other references into the mapping in this process.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), mapping.addr.as_ptr(), data.len());
        }
        Ok(())
    }

    #[allow(unsafe_code)]
    fn read_bytes(&self, size: usize) -> Result<Vec<u8>> {
        let mapping = self.live()?;
        check_bounds(size, mapping.len)?;
        let mut out = vec![0u8; size];
        // SAFETY: bounds checked above.
        unsafe {
            ptr::copy_nonoverlapping(mapping.addr.as_ptr(), out.as_mut_ptr(), size);
        }
        Ok(out)
    }

    #[allow(unsafe_code)]
    fn close(&mut self) -> Result<()> {
        if self.unlink {
            if unsafe { libc::shm_unlink(self.os_name.as_ptr()) } == -1 {
                return Err(IpcError::last_os("shm_unlink", Resource::Segment, &self.name));
            }
            self.unlink = false;
            debug!("Unlinked POSIX segment {}", self.name);
        }

        if let Some(mapping) = self.mapping.as_ref() {
            if unsafe { libc::munmap(mapping.addr.as_ptr().cast::<c_void>(), mapping.len) } == -1 {
                return Err(IpcError::last_os("munmap", Resource::Segment, &self.name));
            }
            // Dropping the mapping closes the descriptor.
            self.mapping = None;
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.mapping.as_ref().map_or(0, |m| m.len)
    }

    fn is_owner(&self) -> bool {
        self.owner
    }

    fn is_closed(&self) -> bool {
        self.mapping.is_none()
    }
}

impl Drop for PosixSegment {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close POSIX segment {}: {}", self.name, e);
        }
    }
}

// SAFETY: same reasoning as `SysvSegment`: the mapping is owned by this
// value, shared access only reads and writes need `&mut self`.
#[allow(unsafe_code)]
unsafe impl Send for PosixSegment {}

#[allow(unsafe_code)]
unsafe impl Sync for PosixSegment {}

/// Split a user-supplied name into its public and OS forms.
fn normalize(name: &str) -> Result<(String, CString)> {
    let public = name.strip_prefix('/').unwrap_or(name);
    if public.is_empty() || public.contains('/') {
        return Err(IpcError::InvalidName(name.to_string()));
    }
    let os_name =
        CString::new(format!("/{public}")).map_err(|_| IpcError::InvalidName(name.to_string()))?;
    Ok((public.to_string(), os_name))
}

#[allow(unsafe_code)]
fn shm_open(os_name: &CString, flags: libc::c_int, permissions: u32) -> Result<OwnedFd> {
    let fd = unsafe {
        libc::shm_open(
            os_name.as_ptr(),
            flags,
            (permissions & 0o777) as mode_t as c_uint,
        )
    };
    if fd == -1 {
        let err = std::io::Error::last_os_error();
        let public = os_name.to_string_lossy();
        return Err(IpcError::from_os(
            "shm_open",
            Resource::Segment,
            public.trim_start_matches('/'),
            err,
        ));
    }
    // SAFETY: `fd` was just returned by shm_open and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("semshm-posix-{tag}-{}", std::process::id())
    }

    #[test]
    fn test_name_normalization() {
        let (public, os) = normalize("/frames").expect("valid");
        assert_eq!(public, "frames");
        assert_eq!(os.to_str().expect("utf8"), "/frames");

        let (public, os) = normalize("frames").expect("valid");
        assert_eq!(public, "frames");
        assert_eq!(os.to_str().expect("utf8"), "/frames");

        assert!(matches!(normalize(""), Err(IpcError::InvalidName(_))));
        assert!(matches!(normalize("/"), Err(IpcError::InvalidName(_))));
        assert!(matches!(normalize("a/b"), Err(IpcError::InvalidName(_))));
        assert!(matches!(normalize("a\0b"), Err(IpcError::InvalidName(_))));
    }

    #[test]
    fn test_create_open_read_close() {
        let name = unique_name("basic");
        let mut created = PosixSegment::create(&format!("/{name}"), 8, 0o600).expect("create");
        assert_eq!(created.name(), name);
        assert_eq!(created.capacity(), 8);
        assert!(created.is_owner());

        let err = PosixSegment::create(&name, 8, 0o600).unwrap_err();
        assert!(err.is_collision());

        created.write_bytes(b"test").expect("write");

        let mut opened = PosixSegment::open(&name).expect("open");
        assert!(!opened.is_owner());
        assert_eq!(opened.capacity(), 8);
        assert_eq!(opened.read_bytes(4).expect("read"), b"test");

        created.close().expect("close");
        assert!(created.write_bytes(b"test").unwrap_err().is_closed());
        created.close().expect("second close is a no-op");

        // Unlinked: new attaches fail, the existing mapping still works.
        assert!(PosixSegment::open(&name).unwrap_err().is_not_found());
        assert_eq!(opened.read_bytes(4).expect("stale read"), b"test");

        opened.close().expect("close");
        assert!(opened.read_bytes(4).unwrap_err().is_closed());
        opened.close().expect("second close is a no-op");
    }

    #[test]
    fn test_open_unknown_name() {
        let err = PosixSegment::open(&unique_name("missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_drop_unlinks() {
        let name = unique_name("drop");
        {
            let _segment = PosixSegment::create(&name, 4, 0o600).expect("create");
        }
        assert!(PosixSegment::open(&name).unwrap_err().is_not_found());
    }

    #[test]
    fn test_zero_size_and_bounds() {
        let name = unique_name("bounds");
        let mut created = PosixSegment::create(&name, 0, 0o600).expect("create");
        assert_eq!(created.capacity(), 1);
        created.write_bytes(b"").expect("empty write");
        assert!(matches!(
            created.write_bytes(b"ab"),
            Err(IpcError::OutOfBounds {
                requested: 2,
                capacity: 1
            })
        ));
    }
}

//! SystemV shared memory (`shmget` / `shmat`).

use std::ptr::{self, NonNull};

use libc::{c_int, c_void};
use tracing::debug;

use super::{SharedMemory, check_bounds};
use crate::key::Key;
use crate::semaphore::mode_bits;
use crate::{IpcError, Resource, Result};

/// A live `shmat` attachment.
#[derive(Debug)]
struct Attachment {
    id: c_int,
    addr: NonNull<u8>,
    capacity: usize,
}

/// A SystemV shared memory segment addressed by key.
///
/// Segments are always allocated with at least one byte because `shmget`
/// rejects zero-sized requests.
#[derive(Debug)]
pub struct SysvSegment {
    key: Key,
    attachment: Option<Attachment>,
    owner: bool,
}

impl SysvSegment {
    /// Exclusively create a segment under `key` and attach to it.
    #[allow(unsafe_code)]
    pub fn create(key: Key, size: usize, permissions: u32) -> Result<Self> {
        let size = size.max(1);
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | mode_bits(permissions);
        let id = unsafe { libc::shmget(key.get(), size, flags) };
        if id == -1 {
            return Err(IpcError::last_os("shmget", Resource::Segment, key));
        }

        match attach(key, id, size) {
            Ok(attachment) => {
                debug!("Created SystemV segment {} ({} bytes)", key, size);
                Ok(Self {
                    key,
                    attachment: Some(attachment),
                    owner: true,
                })
            }
            Err(e) => {
                // Nobody else knows the segment exists yet; remove it.
                unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
                Err(e)
            }
        }
    }

    /// Attach to an existing segment.
    ///
    /// The capacity is read back from the kernel so reads can be bounds
    /// checked against what the creator allocated.
    #[allow(unsafe_code)]
    pub fn open(key: Key) -> Result<Self> {
        let id = unsafe { libc::shmget(key.get(), 0, 0) };
        if id == -1 {
            return Err(IpcError::last_os("shmget", Resource::Segment, key));
        }

        let mut stat: libc::shmid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::shmctl(id, libc::IPC_STAT, &raw mut stat) } == -1 {
            return Err(IpcError::last_os("shmctl(IPC_STAT)", Resource::Segment, key));
        }

        #[allow(clippy::useless_conversion)]
        let capacity = usize::try_from(stat.shm_segsz).unwrap_or(0);
        let attachment = attach(key, id, capacity)?;
        Ok(Self {
            key,
            attachment: Some(attachment),
            owner: false,
        })
    }

    /// The key this segment was created or opened with.
    pub const fn key(&self) -> Key {
        self.key
    }

    fn live(&self) -> Result<&Attachment> {
        self.attachment
            .as_ref()
            .ok_or(IpcError::Closed(Resource::Segment))
    }
}

impl SharedMemory for SysvSegment {
    #[allow(unsafe_code)]
    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        let attachment = self.live()?;
        check_bounds(data.len(), attachment.capacity)?;
        // SAFETY: the attachment maps `capacity` bytes and `&mut self`
        // guarantees no other reference into the mapping in this process.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), attachment.addr.as_ptr(), data.len());
        }
        Ok(())
    }

    #[allow(unsafe_code)]
    fn read_bytes(&self, size: usize) -> Result<Vec<u8>> {
        let attachment = self.live()?;
        check_bounds(size, attachment.capacity)?;
        let mut out = vec![0u8; size];
        // SAFETY: bounds checked above; the mapping stays valid while the
        // attachment exists.
        unsafe {
            ptr::copy_nonoverlapping(attachment.addr.as_ptr(), out.as_mut_ptr(), size);
        }
        Ok(out)
    }

    #[allow(unsafe_code)]
    fn close(&mut self) -> Result<()> {
        let Some(attachment) = self.attachment.as_ref() else {
            return Ok(());
        };
        let id = attachment.id;

        if unsafe { libc::shmdt(attachment.addr.as_ptr().cast::<c_void>()) } == -1 {
            return Err(IpcError::last_os("shmdt", Resource::Segment, self.key));
        }
        // The mapping is gone from here on, whatever IPC_RMID returns.
        self.attachment = None;

        if self.owner {
            if unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) } == -1 {
                return Err(IpcError::last_os("shmctl(IPC_RMID)", Resource::Segment, self.key));
            }
            debug!("Removed SystemV segment {}", self.key);
        }
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.attachment.as_ref().map_or(0, |a| a.capacity)
    }

    fn is_owner(&self) -> bool {
        self.owner
    }

    fn is_closed(&self) -> bool {
        self.attachment.is_none()
    }
}

impl Drop for SysvSegment {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close SystemV segment {}: {}", self.key, e);
        }
    }
}

// SAFETY: the attachment is process-wide memory owned by this value; moving
// it between threads is fine. Shared access only reads, and writes need
// `&mut self`. Cross-process exclusion is handled by the caller's semaphore.
#[allow(unsafe_code)]
unsafe impl Send for SysvSegment {}

#[allow(unsafe_code)]
unsafe impl Sync for SysvSegment {}

#[allow(unsafe_code)]
fn attach(key: Key, id: c_int, capacity: usize) -> Result<Attachment> {
    let addr = unsafe { libc::shmat(id, ptr::null(), 0) };
    if addr as isize == -1 {
        return Err(IpcError::last_os("shmat", Resource::Segment, key));
    }
    let addr = NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| IpcError::last_os("shmat", Resource::Segment, key))?;
    Ok(Attachment { id, addr, capacity })
}

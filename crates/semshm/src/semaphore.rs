//! SystemV semaphore used as a cross-process binary mutex.
//!
//! The semaphore holds 0 when free and 1 when held. Locking is one `semop`
//! with two operations: wait for zero, then increment. Because both run
//! atomically, a second locker parks on the wait-for-zero step until the
//! holder decrements.
//!
//! There is no timeout, no fairness and no owner tracking; unlocking a
//! semaphore this process never locked is not detected.

use libc::c_int;
use tracing::debug;

use crate::key::Key;
use crate::{IpcError, Resource, Result};

/// A single-slot SystemV semaphore.
///
/// Only the creator removes the semaphore from the system on [`close`];
/// attachers just forget their id.
///
/// [`close`]: Semaphore::close
#[derive(Debug)]
pub struct Semaphore {
    id: Option<c_int>,
    key: Key,
    owner: bool,
}

impl Semaphore {
    /// Create a new semaphore under `key`, failing with
    /// [`IpcError::Collision`] if the key is taken.
    #[allow(unsafe_code)]
    pub fn create(key: Key, permissions: u32) -> Result<Self> {
        let flags = libc::IPC_CREAT | libc::IPC_EXCL | mode_bits(permissions);
        let id = semget(key, flags)?;

        // A fresh set's value is unspecified by POSIX; start it free.
        let free: c_int = 0;
        if unsafe { libc::semctl(id, 0, libc::SETVAL, free) } == -1 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::semctl(id, 0, libc::IPC_RMID) };
            return Err(IpcError::from_os(
                "semctl(SETVAL)",
                Resource::Semaphore,
                key,
                err,
            ));
        }
        debug!("Created semaphore {} (id {})", key, id);
        Ok(Self {
            id: Some(id),
            key,
            owner: true,
        })
    }

    /// Attach to an existing semaphore.
    pub fn open(key: Key) -> Result<Self> {
        let id = semget(key, 0)?;
        Ok(Self {
            id: Some(id),
            key,
            owner: false,
        })
    }

    /// Block until the semaphore is free, then take it.
    pub fn lock(&self) -> Result<()> {
        let mut ops = [
            libc::sembuf {
                sem_num: 0,
                sem_op: 0,
                sem_flg: 0,
            },
            libc::sembuf {
                sem_num: 0,
                sem_op: 1,
                sem_flg: 0,
            },
        ];
        self.semop("semop(lock)", &mut ops)
    }

    /// Release the semaphore.
    pub fn unlock(&self) -> Result<()> {
        let mut ops = [libc::sembuf {
            sem_num: 0,
            sem_op: -1,
            sem_flg: 0,
        }];
        self.semop("semop(unlock)", &mut ops)
    }

    /// Release this handle. The creator also removes the semaphore, which
    /// invalidates it for every attached process.
    ///
    /// Closing twice is a no-op.
    #[allow(unsafe_code)]
    pub fn close(&mut self) -> Result<()> {
        let Some(id) = self.id else {
            return Ok(());
        };

        if self.owner {
            if unsafe { libc::semctl(id, 0, libc::IPC_RMID) } == -1 {
                return Err(IpcError::last_os("semctl(IPC_RMID)", Resource::Semaphore, self.key));
            }
            debug!("Removed semaphore {} (id {})", self.key, id);
        }
        self.id = None;
        Ok(())
    }

    /// The key this semaphore was created or opened with.
    pub const fn key(&self) -> Key {
        self.key
    }

    /// Whether this handle created the semaphore.
    pub const fn is_owner(&self) -> bool {
        self.owner
    }

    /// Whether [`close`](Self::close) has run.
    pub const fn is_closed(&self) -> bool {
        self.id.is_none()
    }

    /// Current value of the semaphore.
    #[cfg(test)]
    #[allow(unsafe_code)]
    fn value(&self) -> Result<c_int> {
        let id = self.id.ok_or(IpcError::Closed(Resource::Semaphore))?;
        let value = unsafe { libc::semctl(id, 0, libc::GETVAL) };
        if value == -1 {
            return Err(IpcError::last_os("semctl(GETVAL)", Resource::Semaphore, self.key));
        }
        Ok(value)
    }

    #[allow(unsafe_code)]
    fn semop(&self, op: &'static str, ops: &mut [libc::sembuf]) -> Result<()> {
        let id = self.id.ok_or(IpcError::Closed(Resource::Semaphore))?;
        loop {
            if unsafe { libc::semop(id, ops.as_mut_ptr(), ops.len()) } == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(IpcError::Os {
                    op,
                    id: self.key.to_string(),
                    source: err,
                });
            }
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close semaphore {}: {}", self.key, e);
        }
    }
}

#[allow(unsafe_code)]
fn semget(key: Key, flags: c_int) -> Result<c_int> {
    let id = unsafe { libc::semget(key.get(), 1, flags) };
    if id == -1 {
        return Err(IpcError::last_os("semget", Resource::Semaphore, key));
    }
    Ok(id)
}

/// Permission bits as the `c_int` flag word SystemV calls expect.
pub(crate) const fn mode_bits(permissions: u32) -> c_int {
    (permissions & 0o777) as c_int
}

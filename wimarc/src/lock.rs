//! Advisory file locking for in-place writes.
//!
//! An exclusive lock is held for the duration of any operation that
//! modifies a WIM file in place. The lock is taken on a separate descriptor
//! of the same path, so it serializes against other processes without
//! interfering with this process's data descriptor.

use std::path::Path;

use crate::error::{Result, WimError};

/// An exclusive advisory lock, released on drop.
pub struct WimLock {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<std::fs::File>,
    #[cfg(not(unix))]
    _file: std::fs::File,
}

impl WimLock {
    /// Acquires the lock without blocking; fails with
    /// [`WimError::AlreadyLocked`] if another process holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|source| WimError::Io {
            path: Some(path.to_owned()),
            source,
        })?;

        #[cfg(unix)]
        {
            match nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusiveNonblock) {
                Ok(lock) => Ok(Self { _lock: lock }),
                Err((_, nix::errno::Errno::EWOULDBLOCK)) => Err(WimError::AlreadyLocked),
                Err((_, errno)) => Err(WimError::Io {
                    path: Some(path.to_owned()),
                    source: std::io::Error::from_raw_os_error(errno as i32),
                }),
            }
        }

        #[cfg(not(unix))]
        {
            // No advisory locking on this platform; hold the handle only.
            Ok(Self { _file: file })
        }
    }
}

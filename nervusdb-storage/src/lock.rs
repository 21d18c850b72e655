//! Advisory exclusive writer lock on the `P.lock` sentinel.
//!
//! Single writer guarantee across processes. On Unix the lock is a
//! non-blocking `flock(2)` released when the guard drops (or the process
//! dies and the OS closes the fd). Elsewhere the sentinel itself is the
//! lock: created with `create_new`, removed on drop.

use crate::{Error, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Fails fast with a conflict when another process holds the lock.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if ret != 0 {
                return Err(Error::LockHeld { path });
            }
            Ok(Self { _file: file, path })
        }

        #[cfg(not(unix))]
        {
            match OpenOptions::new().create_new(true).write(true).open(&path) {
                Ok(file) => Ok(Self { _file: file, path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Err(Error::LockHeld { path })
                }
                Err(e) => Err(e.into()),
            }
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;

            unsafe {
                libc::flock(self._file.as_raw_fd(), libc::LOCK_UN);
            }
        }

        #[cfg(not(unix))]
        {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_is_exclusive_within_scope() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.lock");
        let first = FileLock::acquire(&path).unwrap();

        // Locking is per open file description, so a second acquire in
        // this process contends the same way another process would.
        let err = FileLock::acquire(&path).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);

        drop(first);
        let _reacquired = FileLock::acquire(&path).unwrap();
    }
}

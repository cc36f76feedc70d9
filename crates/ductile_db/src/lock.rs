//! Single-instance process locking.
//!
//! Two orchestrators sharing one state directory would race the queue and
//! the workspace tree. An advisory exclusive lock on `ductile.lock` keeps
//! the second process out; the file also carries the holder's pid so the
//! operator can see who owns the directory.
//!
//! Uses the `fs2` crate for cross-platform file locking (MSRV 1.75
//! compatible; std::fs::File::lock() requires Rust 1.89+).

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("state directory is locked by another process{}: {}", held_by(.pid), .path.display())]
    Held { path: PathBuf, pid: Option<u32> },

    #[error("failed to create lock file {}: {source}", .path.display())]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to acquire lock on {}: {source}", .path.display())]
    AcquireFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn held_by(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (pid {})", pid),
        None => String::new(),
    }
}

/// A guard holding the exclusive single-instance lock.
///
/// The lock is released when the guard is dropped; the file descriptor
/// stays open for the guard's whole lifetime.
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock, writing our pid into the lock file.
    ///
    /// Non-blocking: if another process holds the lock this fails
    /// immediately with [`LockError::Held`], carrying the holder's pid
    /// when the file contains one.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| LockError::CreateFailed {
                path: path.to_path_buf(),
                source,
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                    pid: read_holder_pid(&mut file),
                });
            }
            Err(source) => {
                return Err(LockError::AcquireFailed {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        let pid = std::process::id();
        let mut write_pid = || -> io::Result<()> {
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(pid.to_string().as_bytes())?;
            file.flush()
        };
        write_pid().map_err(|source| LockError::AcquireFailed {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Acquired instance lock: {} (pid {})", path.display(), pid);
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path of the lock file this guard holds.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        debug!("Releasing instance lock: {}", self.path.display());
        // fs2 releases the lock when the descriptor closes; the explicit
        // unlock just makes the release immediate.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl std::fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLock")
            .field("path", &self.path)
            .finish()
    }
}

fn read_holder_pid(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

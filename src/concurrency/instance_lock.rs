//! Single-instance guard using advisory file locking (fs2 flock).
//!
//! Two engines on one device would each own a bypass window and a set of
//! countdowns, and both would write the state file. `pinguard run` takes
//! this lock for its whole lifetime.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Lock file lives at `<runtime_dir>/pinguard.lock`.
#[derive(Debug, Clone)]
pub struct InstanceLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
#[derive(Debug)]
pub struct InstanceGuard {
    file: File,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl InstanceLock {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Non-blocking acquire. `None` means another engine is running. The
    /// holder's PID is written into the file for diagnostics.
    pub fn try_acquire(&self) -> Result<Option<InstanceGuard>> {
        // Not `File::create`: truncating would wipe the holder's PID.
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                file.set_len(0)?;
                file.seek(SeekFrom::Start(0))?;
                write!(file, "{}", std::process::id())?;
                file.flush()?;
                Ok(Some(InstanceGuard { file }))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => {
                // EAGAIN(11) / EWOULDBLOCK(35 on macOS)
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// PID recorded by the current or last holder, if readable.
    pub fn holder_pid(&self) -> Option<u32> {
        let mut content = String::new();
        File::open(&self.path)
            .ok()?
            .read_to_string(&mut content)
            .ok()?;
        content.trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = InstanceLock::new(tmp.path().join("run").join("pinguard.lock")).unwrap();

        let guard = lock.try_acquire().unwrap();
        assert!(guard.is_some());

        // A second handle on the same file models a second process.
        let other = InstanceLock::new(lock.path()).unwrap();
        assert!(other.try_acquire().unwrap().is_none());
        assert_eq!(other.holder_pid(), Some(std::process::id()));

        drop(guard);
        assert!(other.try_acquire().unwrap().is_some());
    }

    #[test]
    fn holder_pid_absent_before_first_acquire() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = InstanceLock::new(tmp.path().join("pinguard.lock")).unwrap();
        assert_eq!(lock.holder_pid(), None);
    }
}

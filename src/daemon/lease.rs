//! PID lease: the on-disk record that keeps one daemon running.
//!
//! The record is a PID file holding a single process id. Its holder is
//! alive when `kill(pid, 0)` succeeds (or fails with `EPERM`). Acquisition
//! runs under an exclusive advisory lock on a sidecar `<pid file>.lock` so
//! two racing starters cannot both win.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::errors::DaemonError;

/// What the PID file currently says.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Free,
    Held { pid: u32 },
    /// Record names a process that no longer exists.
    Stale { pid: u32 },
}

/// Whether a process with this id exists.
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[derive(Debug, Clone)]
pub struct PidLease {
    path: PathBuf,
}

impl PidLease {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sidecar(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }

    fn io_err(&self, source: std::io::Error) -> DaemonError {
        DaemonError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// The recorded pid, `None` when there is no record.
    pub fn read_record(&self) -> Result<Option<u32>, DaemonError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        match content.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => Err(DaemonError::InvalidRecord {
                path: self.path.clone(),
                content,
            }),
        }
    }

    pub fn status(&self) -> Result<LeaseStatus, DaemonError> {
        Ok(match self.read_record()? {
            None => LeaseStatus::Free,
            Some(pid) if process_alive(pid) => LeaseStatus::Held { pid },
            Some(pid) => LeaseStatus::Stale { pid },
        })
    }

    fn lock(&self) -> Result<File, DaemonError> {
        let lock_path = self.sidecar(".lock");
        if let Some(parent) = lock_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| DaemonError::LockFailed {
                path: lock_path.clone(),
                source,
            })?;
        file.lock_exclusive()
            .map_err(|source| DaemonError::LockFailed {
                path: lock_path,
                source,
            })?;
        Ok(file)
    }

    /// Record `pid` as the holder.
    ///
    /// Fails with [`DaemonError::AlreadyRunning`] when a live process other
    /// than `pid` holds the lease. Stale or unreadable records are replaced.
    pub fn acquire_for(&self, pid: u32) -> Result<LeaseGuard, DaemonError> {
        // released when the file is closed
        let _lock = self.lock()?;

        match self.status() {
            Ok(LeaseStatus::Held { pid: holder }) if holder != pid => {
                return Err(DaemonError::AlreadyRunning { pid: holder });
            }
            Ok(LeaseStatus::Stale { pid: stale }) => {
                tracing::warn!(pid = stale, path = %self.path.display(), "discarding stale PID file");
            }
            Err(DaemonError::InvalidRecord { content, .. }) => {
                tracing::warn!(content = %content.trim(), path = %self.path.display(), "discarding unreadable PID file");
            }
            Err(e) => return Err(e),
            Ok(_) => {}
        }

        self.write_record(pid)?;
        tracing::info!(pid, path = %self.path.display(), "PID lease acquired");
        Ok(LeaseGuard {
            lease: self.clone(),
            pid,
            armed: true,
        })
    }

    fn write_record(&self, pid: u32) -> Result<(), DaemonError> {
        let tmp = self.sidecar(".tmp");
        let mut file = File::create(&tmp).map_err(|e| self.io_err(e))?;
        file.write_all(pid.to_string().as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }

    /// Remove the record, whoever it names.
    pub fn release(&self) -> Result<(), DaemonError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// Remove the record only if it still names `pid`.
    pub fn release_if_held_by(&self, pid: u32) -> Result<bool, DaemonError> {
        let _lock = self.lock()?;
        match self.read_record() {
            Ok(Some(holder)) if holder == pid => self.release().map(|_| true),
            Ok(_) | Err(DaemonError::InvalidRecord { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Holds a lease; removes the record on drop if it still names the holder.
#[derive(Debug)]
pub struct LeaseGuard {
    lease: PidLease,
    pid: u32,
    armed: bool,
}

impl LeaseGuard {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Keep the record after this guard is gone. Used when the lease was
    /// taken on behalf of another process.
    pub fn persist(mut self) {
        self.armed = false;
    }

    /// Release now and report failures instead of logging them.
    pub fn release(mut self) -> Result<(), DaemonError> {
        self.armed = false;
        self.lease.release_if_held_by(self.pid).map(drop)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.lease.release_if_held_by(self.pid) {
            tracing::warn!(pid = self.pid, error = %e, "failed to release PID lease");
        }
    }
}

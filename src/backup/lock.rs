//! File-based mutual exclusion, one lock per target key.
//!
//! A lock is a plain-text file under the configured lock directory holding
//! the owning process's PID. Liveness is probed through `/proc/<pid>`
//! presence, so reclaiming is Linux-specific and subject to PID reuse: a
//! recycled PID makes a dead owner look alive until the next run. That race
//! is a known limitation of PID-file locking and is deliberately left as-is.

use crate::backup::result_error::result::Result;
use bon::Builder;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How an acquire attempt ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    /// No one held the key.
    Granted,
    /// The key was held by a dead owner; the lock file was rewritten with
    /// the caller's PID. `stale_pid` is `None` when the old file content
    /// was not a PID at all.
    Reclaimed { stale_pid: Option<u32> },
    /// The key is held by a live process. Not an error: the target is
    /// simply skipped this run.
    Denied { holder: u32 },
}

impl LockOutcome {
    pub fn is_granted(&self) -> bool {
        !matches!(self, LockOutcome::Denied { .. })
    }
}

/// Lock capability used by the dispatcher: acquire, release, and the
/// liveness probe that acquire relies on.
pub trait LockProvider: Send + Sync {
    fn acquire(&self, key: &str) -> Result<LockOutcome>;
    fn release(&self, key: &str) -> Result<()>;
    fn probe(&self, pid: u32) -> bool;
}

/// PID-file locks under a single directory.
#[derive(Clone, Debug, Builder)]
pub struct PidFileLocks {
    #[builder(into)]
    dir: Arc<Path>,
}

impl PidFileLocks {
    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.lock", sanitize_filename::sanitize(key)))
    }

    fn write_pid_file(path: &Path) -> std::io::Result<()> {
        let mut file = File::create_new(path)?;
        writeln!(file, "{}", std::process::id())
    }
}

impl LockProvider for PidFileLocks {
    fn acquire(&self, key: &str) -> Result<LockOutcome> {
        let path = self.lock_path(key);
        match Self::write_pid_file(&path) {
            Ok(()) => Ok(LockOutcome::Granted),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let stale_pid = std::fs::read_to_string(&path)?.trim().parse::<u32>().ok();
                if let Some(pid) = stale_pid {
                    if self.probe(pid) {
                        return Ok(LockOutcome::Denied { holder: pid });
                    }
                }
                std::fs::remove_file(&path)?;
                Self::write_pid_file(&path)?;
                Ok(LockOutcome::Reclaimed { stale_pid })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn release(&self, key: &str) -> Result<()> {
        std::fs::remove_file(self.lock_path(key))?;
        Ok(())
    }

    fn probe(&self, pid: u32) -> bool {
        // Linux: rely on /proc/<pid> presence to detect liveness.
        if pid == 0 {
            return false;
        }
        Path::new("/proc").join(pid.to_string()).exists()
    }
}

//! Advisory run lock so two scheduled runs never race on the same output.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

#[derive(Debug)]
pub enum LockError {
    /// Another run holds the lock; carries whatever the holder wrote (its pid).
    Held { path: PathBuf, holder: String },
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Held { path, holder } => write!(
                f,
                "lock {} is held by another run (pid {})",
                path.display(),
                if holder.is_empty() { "unknown" } else { holder }
            ),
            LockError::Io { path, source } => {
                write!(f, "cannot create lock {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {}

/// Held for the duration of a run; the lock file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        Self::acquire_with(path, write_holder)
    }

    fn acquire_with(
        path: &Path,
        write: impl FnOnce(&mut fs::File) -> io::Result<()>,
    ) -> Result<Self, LockError> {
        let io_err = |source: io::Error| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default();
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                    holder,
                });
            }
            Err(e) => return Err(io_err(e)),
        };
        if let Err(e) = write(&mut file) {
            drop(file);
            // An unwritten lock would block every later run.
            let _ = fs::remove_file(path);
            return Err(io_err(e));
        }
        info!(path = %path.display(), "[MERGE] Acquired run lock");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_holder(out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "{}", std::process::id())?;
    out.flush()
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(error = ?e, path = %self.path.display(), "[MERGE] Failed to release run lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_the_first_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");

        let first = RunLock::acquire(&path).unwrap();
        let pid = fs::read_to_string(&path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());

        match RunLock::acquire(&path) {
            Err(LockError::Held { holder, .. }) => assert_eq!(holder, pid.trim()),
            other => panic!("expected held lock, got {other:?}"),
        }

        drop(first);
        assert!(!path.exists());
        assert!(RunLock::acquire(&path).is_ok());
    }

    #[test]
    fn failed_pid_write_leaves_no_lock_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");

        let result = RunLock::acquire_with(&path, |_| Err(io::Error::other("disk full")));

        assert!(matches!(result, Err(LockError::Io { .. })));
        assert!(!path.exists());
        assert!(RunLock::acquire(&path).is_ok());
    }
}

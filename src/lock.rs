//! Advisory inter-process locking on `<root>/lock` (spec §5 "Shared
//! resources", §6 "Flag files").
//!
//! Grounded in the teacher's `backup.rs` locking model (`ProcessLocker`,
//! shared-vs-exclusive), reimplemented over the portable `fs2` crate since
//! `proxmox-sys::process_locker` is not a reusable public dependency here.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::Result;

/// An open handle on `<root>/lock`, held shared by readers/writers or
/// exclusive by maintenance.
pub struct ProcessLock {
    file: File,
    path: PathBuf,
    exclusive: bool,
}

impl ProcessLock {
    fn open(root: &Path) -> Result<File> {
        let path = root.join("lock");
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?)
    }

    /// Acquire a shared lock: blocks only behind an exclusive holder.
    pub fn shared(root: &Path) -> Result<Self> {
        let file = Self::open(root)?;
        file.lock_shared()?;
        Ok(Self {
            file,
            path: root.join("lock"),
            exclusive: false,
        })
    }

    /// Acquire an exclusive lock: blocks until all shared and exclusive
    /// holders release (spec §5: "blocks until all other writers/
    /// maintenance complete but not readers" — readers use their own
    /// short-lived shared acquisitions and release promptly).
    pub fn exclusive(root: &Path) -> Result<Self> {
        let file = Self::open(root)?;
        file.lock_exclusive()?;
        Ok(Self {
            file,
            path: root.join("lock"),
            exclusive: true,
        })
    }

    /// Non-blocking attempt at an exclusive lock; used by maintenance to
    /// avoid piling up waiters when another run is already in progress.
    pub fn try_exclusive(root: &Path) -> Result<Option<Self>> {
        let file = Self::open(root)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                file,
                path: root.join("lock"),
                exclusive: true,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Path of the do-not-pack flag file (spec §4.5, §6 "Flag files").
pub fn do_not_pack_flag_path(root: &Path) -> PathBuf {
    root.join("needs-check-do-not-pack")
}

/// Sets the do-not-pack flag: created by a `check` run when it reports an
/// error, gating the next `repack` (spec §4.5 "Ordering and safety").
pub fn set_do_not_pack(root: &Path) -> Result<()> {
    std::fs::write(do_not_pack_flag_path(root), b"")?;
    Ok(())
}

pub fn clear_do_not_pack(root: &Path) -> Result<()> {
    let path = do_not_pack_flag_path(root);
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

pub fn do_not_pack_is_set(root: &Path) -> bool {
    do_not_pack_flag_path(root).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn shared_locks_do_not_conflict_within_process() {
        let dir = tempdir().unwrap();
        let a = ProcessLock::shared(dir.path()).unwrap();
        let b = ProcessLock::shared(dir.path()).unwrap();
        assert!(!a.is_exclusive());
        assert!(!b.is_exclusive());
    }

    #[test]
    fn do_not_pack_flag_round_trips() {
        let dir = tempdir().unwrap();
        assert!(!do_not_pack_is_set(dir.path()));
        set_do_not_pack(dir.path()).unwrap();
        assert!(do_not_pack_is_set(dir.path()));
        clear_do_not_pack(dir.path()).unwrap();
        assert!(!do_not_pack_is_set(dir.path()));
    }
}

//! Exclusive per-subject lock.
//!
//! One run per subject at a time: a second process touching the same
//! subject fails fast instead of interleaving snapshots.
//!
//! Lock files live under `<root>/.locks/`, outside the subject directories,
//! so a run that stops before its first snapshot leaves no subject directory
//! behind for identity resolution to count.

use crate::models::{PeruseError, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory under the store root holding one lock file per subject.
pub const LOCK_DIR: &str = ".locks";

/// Held lock on a subject; released on drop.
#[derive(Debug)]
pub struct SubjectLock {
    file: File,
    path: PathBuf,
}

impl SubjectLock {
    /// Try to lock `subject_id` in the store at `store_root` without blocking.
    ///
    /// Returns [`PeruseError::Locked`] when another holder exists.
    pub fn acquire(store_root: &Path, subject_id: &str) -> Result<Self> {
        let lock_dir = store_root.join(LOCK_DIR);
        fs::create_dir_all(&lock_dir)
            .map_err(|e| PeruseError::io("creating lock directory", e))?;

        let path = lock_dir.join(format!("{subject_id}.lock"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| PeruseError::io("opening subject lock", e))?;

        // fully qualified: std's File::try_lock_exclusive has a different error type
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(path = %path.display(), "Acquired subject lock");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(PeruseError::Locked { path, source: e })
            }
            Err(e) => Err(PeruseError::io("locking subject", e)),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SubjectLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "Released subject lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::identity;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_while_held() {
        let temp = TempDir::new().unwrap();

        let first = SubjectLock::acquire(temp.path(), "2510.19555v1").unwrap();
        assert!(first.path().exists());

        let err = SubjectLock::acquire(temp.path(), "2510.19555v1").unwrap_err();
        assert!(matches!(err, PeruseError::Locked { .. }));

        drop(first);
        SubjectLock::acquire(temp.path(), "2510.19555v1").unwrap();
    }

    #[test]
    fn different_subjects_do_not_conflict() {
        let temp = TempDir::new().unwrap();
        let _a = SubjectLock::acquire(temp.path(), "a").unwrap();
        let _b = SubjectLock::acquire(temp.path(), "b").unwrap();
    }

    #[test]
    fn locking_leaves_no_subject_directory() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cp");
        let input = temp.path().join("untitled.pdf");
        fs::write(&input, "plain text").unwrap();

        let first = identity::resolve(&input, "", &root);
        drop(SubjectLock::acquire(&root, &first).unwrap());
        assert!(!root.join(&first).exists());

        let second = identity::resolve(&input, "", &root);
        drop(SubjectLock::acquire(&root, &second).unwrap());
        let third = identity::resolve(&input, "", &root);

        assert_eq!(first, "fallback_1");
        assert_eq!(first, second);
        assert_eq!(second, third);
    }
}

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{BuildError, BuildResult};

/// Exclusive advisory lock over one profile, held for the whole of a build
/// or an update. Released when dropped.
#[derive(Debug)]
pub struct ProfileLock {
    _file: File,
    path: PathBuf,
}

impl ProfileLock {
    /// Take the lock at `<images_dir>/<profile>.lock` without blocking.
    pub fn acquire(images_dir: &Path, profile: &str) -> BuildResult<Self> {
        fs::create_dir_all(images_dir)?;
        let path = images_dir.join(format!("{profile}.lock"));

        // The file is never unlinked. Removing a lock file another process
        // still holds would let a third process lock a fresh inode at the
        // same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(BuildError::ProfileLocked {
                profile: profile.to_string(),
                lock: path,
            });
        }
        debug!(lock = %path.display(), "Acquired profile lock");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_holder_is_refused_until_release() {
        let temp = TempDir::new().unwrap();
        let first = ProfileLock::acquire(temp.path(), "main-x86_64").unwrap();

        let err = ProfileLock::acquire(temp.path(), "main-x86_64").unwrap_err();
        assert!(matches!(err, BuildError::ProfileLocked { .. }));

        // Other profiles are independent.
        ProfileLock::acquire(temp.path(), "unstable-x86_64").unwrap();

        let path = first.path().to_path_buf();
        drop(first);
        assert!(path.exists());
        ProfileLock::acquire(temp.path(), "main-x86_64").unwrap();
    }
}

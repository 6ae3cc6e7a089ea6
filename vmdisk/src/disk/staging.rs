//! RAII-managed staging directory.
//!
//! Imports and plugin VM creation write into a directory they own
//! exclusively. The directory is removed on drop unless it has been
//! committed with [`StagingDir::take`].

use std::fs::{self, DirBuilder};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use vmdisk_shared::errors::{VmDiskError, VmDiskResult};

use super::constants::modes;

/// Exclusively owned staging directory.
///
/// Automatically deletes the directory (recursively) when dropped unless
/// ownership was released with `take()`.
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    /// Set once ownership has been given up; drop leaves the tree alone.
    released: bool,
}

impl StagingDir {
    /// Create a fresh staging directory at `path`.
    ///
    /// Fails with `AlreadyExists` if anything is already there: another
    /// job owns it. The parent directory must exist.
    pub fn create(path: &Path) -> VmDiskResult<Self> {
        if path.exists() {
            return Err(VmDiskError::AlreadyExists(format!(
                "staging directory {} already exists",
                path.display()
            )));
        }

        DirBuilder::new()
            .mode(modes::STAGING_DIR)
            .create(path)
            .map_err(|e| {
                VmDiskError::from_io(
                    format!("failed to create staging directory {}", path.display()),
                    e,
                )
            })?;

        tracing::debug!(path = %path.display(), "Created staging directory");
        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    /// Get the staging directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release ownership (prevent cleanup) and return the path.
    ///
    /// Use once the contents have been committed elsewhere or the
    /// directory itself is the final result.
    pub fn take(mut self) -> PathBuf {
        self.released = true;
        std::mem::take(&mut self.path)
    }

    /// Remove the (now empty) directory immediately.
    ///
    /// Used after the staged file has been renamed into place.
    pub fn remove_empty(mut self) -> VmDiskResult<()> {
        self.released = true;
        fs::remove_dir(&self.path).map_err(|e| {
            VmDiskError::from_io(
                format!("failed to remove staging directory {}", self.path.display()),
                e,
            )
        })
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if self.path.exists() {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                tracing::warn!(
                    "Failed to cleanup staging directory {}: {}",
                    self.path.display(),
                    e
                );
            } else {
                tracing::debug!("Cleaned up staging directory: {}", self.path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_dropped_staging_dir_is_removed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stage");

        {
            let staging = StagingDir::create(&path).unwrap();
            fs::write(staging.path().join("partial.img"), b"half").unwrap();
            assert!(path.is_dir());
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_taken_staging_dir_survives() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("vm");

        let staging = StagingDir::create(&path).unwrap();
        let kept = staging.take();

        assert_eq!(kept, path);
        assert!(path.is_dir());
    }

    #[test]
    fn test_existing_path_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stage");

        let _first = StagingDir::create(&path).unwrap();
        let second = StagingDir::create(&path);

        assert!(matches!(second, Err(VmDiskError::AlreadyExists(_))));
        // The losing attempt must not delete the winner's directory.
        assert!(path.is_dir());
    }

    #[test]
    fn test_directory_mode() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stage");

        let staging = StagingDir::create(&path).unwrap();
        let mode = fs::metadata(staging.path()).unwrap().permissions().mode();

        // umask may only clear bits
        assert_eq!(mode & 0o7777 & !modes::STAGING_DIR, 0);
    }

    #[test]
    fn test_remove_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stage");

        let staging = StagingDir::create(&path).unwrap();
        staging.remove_empty().unwrap();

        assert!(!path.exists());
    }
}

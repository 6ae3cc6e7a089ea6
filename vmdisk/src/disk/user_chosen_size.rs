//! Support for the `user.crostini.user_chosen_size` xattr.
//!
//! Disk images restored from an export already have the size the user
//! picked when the VM was created. The xattr tells the resize logic not
//! to grow or shrink them automatically.

use std::io;
use std::path::Path;

use vmdisk_shared::constants::xattrs::{USER_CHOSEN_SIZE, USER_CHOSEN_SIZE_VALUE};
use vmdisk_shared::errors::{VmDiskError, VmDiskResult};

/// Outcome of tagging a disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The xattr was written.
    Marked,
    /// The filesystem does not store user xattrs; nothing was written.
    Unsupported,
}

/// Mark `path` as pre-sized so automatic resizing leaves it alone.
///
/// Filesystems without user xattr support are tolerated (the image is
/// still usable, it just loses the hint); every other error fails.
pub fn mark(path: &Path) -> VmDiskResult<MarkOutcome> {
    match xattr::set(path, USER_CHOSEN_SIZE, USER_CHOSEN_SIZE_VALUE) {
        Ok(()) => Ok(MarkOutcome::Marked),
        Err(e) if is_unsupported(&e) => {
            tracing::warn!(
                path = %path.display(),
                "Filesystem does not support user xattrs, skipping {}",
                USER_CHOSEN_SIZE
            );
            Ok(MarkOutcome::Unsupported)
        }
        Err(e) => Err(VmDiskError::from_io(
            format!("failed to set {} on {}", USER_CHOSEN_SIZE, path.display()),
            e,
        )),
    }
}

/// Whether `path` carries the user-chosen-size marker.
pub fn is_marked(path: &Path) -> io::Result<bool> {
    match xattr::get(path, USER_CHOSEN_SIZE) {
        Ok(value) => Ok(value.is_some()),
        Err(e) if is_unsupported(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_unsupported(err: &io::Error) -> bool {
    // ENOTSUP and EOPNOTSUPP share a value on Linux but not on macOS
    matches!(err.raw_os_error(), Some(code) if code == libc::ENOTSUP || code == libc::EOPNOTSUPP)
        || err.kind() == io::ErrorKind::Unsupported
}

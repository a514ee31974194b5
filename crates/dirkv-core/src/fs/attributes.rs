//! Read-only attribute access for stored values.

use std::fs;
use std::io;
use std::path::Path;

/// OS file attribute operations the store needs.
///
/// Implementations are called from blocking worker threads.
pub trait AttributeBoundary: Send + Sync {
    /// Whether the entry at `path` is marked read-only.
    fn is_read_only(&self, path: &Path) -> io::Result<bool>;

    /// Set or clear the read-only mark on the entry at `path`.
    fn set_read_only(&self, path: &Path, read_only: bool) -> io::Result<()>;
}

/// `AttributeBoundary` backed by `std::fs::Permissions`.
///
/// On Unix the owner write bit is toggled, leaving group and other bits as
/// they were when clearing the flag.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdAttributes;

impl AttributeBoundary for StdAttributes {
    fn is_read_only(&self, path: &Path) -> io::Result<bool> {
        Ok(fs::metadata(path)?.permissions().readonly())
    }

    #[cfg(unix)]
    fn set_read_only(&self, path: &Path, read_only: bool) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let mut permissions = fs::metadata(path)?.permissions();
        let mode = permissions.mode();
        let updated = if read_only { mode & !0o222 } else { mode | 0o200 };
        if updated == mode {
            return Ok(());
        }
        permissions.set_mode(updated);
        fs::set_permissions(path, permissions)
    }

    #[cfg(not(unix))]
    #[allow(clippy::permissions_set_readonly_false)]
    fn set_read_only(&self, path: &Path, read_only: bool) -> io::Result<()> {
        let mut permissions = fs::metadata(path)?.permissions();
        if permissions.readonly() == read_only {
            return Ok(());
        }
        permissions.set_readonly(read_only);
        fs::set_permissions(path, permissions)
    }
}

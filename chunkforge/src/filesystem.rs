//! Filesystem seam for the constructor.
//!
//! Bulk file I/O goes through `std::fs` directly; this trait covers only the
//! operations tests need to substitute — free-space queries, symlink
//! creation, and the executable-bit epilogue.

use std::io;
use std::path::Path;

/// OS-level operations the constructor depends on.
pub trait FileSystem: Send + Sync {
    /// Free bytes available to this process on the volume containing `path`.
    fn available_disk_space(&self, path: &Path) -> io::Result<u64>;

    /// Create a symlink at `link` pointing to `target`.
    fn create_symlink(&self, target: &Path, link: &Path) -> io::Result<()>;

    /// Set the unix executable bit on a constructed file.
    fn set_executable(&self, path: &Path) -> io::Result<()>;
}

/// Real filesystem implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl OsFileSystem {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for OsFileSystem {
    #[cfg(unix)]
    fn available_disk_space(&self, path: &Path) -> io::Result<u64> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    #[cfg(not(unix))]
    fn available_disk_space(&self, _path: &Path) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "disk space query not implemented on this platform",
        ))
    }

    #[cfg(unix)]
    fn create_symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(not(unix))]
    fn create_symlink(&self, _target: &Path, _link: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlink construction not supported on this platform",
        ))
    }

    #[cfg(unix)]
    fn set_executable(&self, path: &Path) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let mut permissions = std::fs::metadata(path)?.permissions();
        permissions.set_mode(permissions.mode() | 0o111);
        std::fs::set_permissions(path, permissions)
    }

    #[cfg(not(unix))]
    fn set_executable(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

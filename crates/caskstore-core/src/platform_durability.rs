//! Platform-specific durable sync
//!
//! Segment appends, hint files, and merge renames all need their bytes on
//! stable media before the engine reports success. This module maps that
//! requirement to the strongest primitive each platform offers.

use std::fs::File;
use std::io;
use std::path::Path;

/// Block until `file`'s data has reached persistent storage.
///
/// - Linux: `fdatasync()`, data only, metadata is left to the directory sync
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`, plain fsync stops at the drive cache there
/// - Windows: `FlushFileBuffers()`
/// - Other: `File::sync_data()`
///
/// May block for a long time under heavy I/O. Callers holding the engine's
/// index lock should only do this for the active segment.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File borrow and stays open for the call.
        let result = unsafe { libc::fdatasync(fd) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd comes from a live File borrow and stays open for the call.
        let result = unsafe { libc::fcntl(fd, libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        let handle = file.as_raw_handle();
        // SAFETY: handle comes from a live File borrow and stays valid for the call.
        let result = unsafe { FlushFileBuffers(handle as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(
        target_os = "linux",
        target_os = "macos",
        target_os = "ios",
        target_os = "windows"
    )))]
    {
        file.sync_data()
    }
}

/// Persist directory entries (creates, renames, deletes) under `dir`.
///
/// Needed after segment rollover and after each merge phase so that a
/// crash cannot resurrect a renamed-away file. Windows has no directory
/// handle to flush and NTFS journals renames, so this is a no-op there.
pub fn sync_directory(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        handle.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_durable_sync_success() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"store_1 record bytes").unwrap();

        let result = durable_sync(file.as_file());
        assert!(result.is_ok(), "durable_sync failed: {:?}", result.err());
    }

    #[test]
    fn test_sync_directory_success() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("store_1.data"), b"x").unwrap();
        assert!(sync_directory(dir.path()).is_ok());
    }

    #[test]
    fn test_sync_directory_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        if cfg!(unix) {
            assert!(sync_directory(&missing).is_err());
        }
    }
}

//! Exclusive lock on a database directory.
//!
//! Only one process may open a durable contact store at a time. The lock is
//! taken non-blocking on `<dir>/.lock` and released when the file handle is
//! closed, i.e. when [`FileLock`] is dropped.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

/// Held for as long as the store is open.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to take the lock on `dir`.
    ///
    /// # Errors
    /// - `ErrorKind::WouldBlock` if another process holds the lock
    /// - `ErrorKind::PermissionDenied` if the directory is not writable
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let path = dir.join(".lock");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        try_lock(&file)?;
        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> IoResult<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: `file` owns a valid descriptor for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = IoError::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Err(IoError::new(
            ErrorKind::WouldBlock,
            "contact store is locked by another process",
        ));
    }
    Err(err)
}

#[cfg(windows)]
fn try_lock(file: &File) -> IoResult<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };

    let handle = file.as_raw_handle() as HANDLE;
    // SAFETY: `handle` is a valid open file handle and `overlapped` outlives the call.
    let rc = unsafe {
        let mut overlapped = std::mem::zeroed::<windows_sys::Win32::System::IO::OVERLAPPED>();
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if rc == 0 {
        return Err(IoError::new(
            ErrorKind::WouldBlock,
            format!("contact store is locked by another process: {}", IoError::last_os_error()),
        ));
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn try_lock(_file: &File) -> IoResult<()> {
    Err(IoError::new(
        ErrorKind::Unsupported,
        "file locking not supported on this platform",
    ))
}

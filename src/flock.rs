//! The LOCK file: exclusive ownership of a database directory.
//!
//! Opening a database takes an advisory lock on `<db>/LOCK` and holds it
//! until the handle drops. A second open of the same directory fails with
//! an `Io` error naming the path instead of silently sharing state. The
//! lock lives and dies with the file handle; the LOCK file itself stays
//! behind for the next open, carrying the owning pid for post-mortems.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn lock(path: PathBuf) -> Result<FileLock> {
        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;

        if let Err(err) = acquire_exclusive(&file) {
            return Err(Error::Io(format!(
                "unable to lock {}: {err}; is the database open in another process?",
                path.display()
            )));
        }

        // Truncate only after the lock is ours, so a losing opener never
        // clobbers the winner's pid.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        tracing::debug!(lock = %path.display(), "database directory locked");

        Ok(FileLock { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn acquire_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
        0 => Ok(()),
        _ => Err(std::io::Error::last_os_error()),
    }
}

#[cfg(windows)]
fn acquire_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let acquired = unsafe {
        LockFileEx(
            file.as_raw_handle() as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            std::ptr::null_mut(),
        )
    };
    if acquired == 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn acquire_exclusive(_file: &File) -> std::io::Result<()> {
    // No advisory locking on this platform; single-process use assumed.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_records_owner_pid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("LOCK");

        let lock = FileLock::lock(lock_path.clone()).expect("acquire lock");
        assert_eq!(lock.path(), lock_path.as_path());
        let contents = std::fs::read_to_string(&lock_path).expect("read lock file");
        assert_eq!(contents.trim(), std::process::id().to_string());
    }

    #[test]
    fn test_second_lock_fails_with_context() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("LOCK");

        let _held = FileLock::lock(lock_path.clone()).expect("acquire lock");
        match FileLock::lock(lock_path.clone()) {
            Err(Error::Io(msg)) => {
                assert!(msg.contains("LOCK"), "error does not name the path: {msg}");
            }
            Err(other) => panic!("expected an Io error, got {other:?}"),
            Ok(_) => panic!("second lock on a held directory must fail"),
        }
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let lock_path = dir.path().join("LOCK");

        drop(FileLock::lock(lock_path.clone()).expect("acquire lock"));
        // The file survives the drop, but the lock does not.
        assert!(lock_path.exists());
        let _relock = FileLock::lock(lock_path).expect("reacquire after drop");
    }
}

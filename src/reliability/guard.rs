//! Cross-process singleton lock.
//!
//! Holding a `ProcessGuard` is the startup precondition for any process that
//! mutates the ledger. Acquisition never blocks: if another process holds the
//! lock the caller gets `LedgerError::AlreadyLocked` and is expected to exit.
//!
//! The lock is an OS lock on the file (`flock` on unix, an exclusive share
//! mode on Windows), never the file's contents. The operating system drops it
//! when the holder exits, crashed or not, so a leftover pid file is harmless.
//! Other targets have no such primitive and run unguarded.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{LedgerError, LedgerResult};
use crate::logging::{log, obj, v_num, v_str, Domain, Level};

#[derive(Debug)]
pub struct ProcessGuard {
    file: File,
    path: PathBuf,
}

impl ProcessGuard {
    pub fn acquire(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();

        let Some(mut file) = try_lock_exclusive(&path)? else {
            let holder = std::fs::read_to_string(&path).unwrap_or_default();
            let holder = holder.trim();
            let holder = if holder.is_empty() { "unknown" } else { holder };
            log(
                Level::Fatal,
                Domain::System,
                "singleton_held",
                obj(&[
                    ("path", v_str(&path.to_string_lossy())),
                    ("holder", v_str(holder)),
                ]),
            );
            return Err(LedgerError::AlreadyLocked {
                path: path.to_string_lossy().into_owned(),
                holder: holder.to_string(),
            });
        };

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        log(
            Level::Info,
            Domain::System,
            "singleton_acquired",
            obj(&[
                ("path", v_str(&path.to_string_lossy())),
                ("pid", v_num(std::process::id() as f64)),
            ]),
        );
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        unlock(&self.file);
    }
}

/// `Ok(None)` when another process holds the lock.
#[cfg(unix)]
fn try_lock_exclusive(path: &Path) -> LedgerResult<Option<File>> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(Some(file));
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(None)
    } else {
        Err(err.into())
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(windows)]
fn try_lock_exclusive(path: &Path) -> LedgerResult<Option<File>> {
    use std::os::windows::fs::OpenOptionsExt;

    const ERROR_SHARING_VIOLATION: i32 = 32;
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .share_mode(0)
        .open(path)
    {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.raw_os_error() == Some(ERROR_SHARING_VIOLATION) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(any(unix, windows)))]
fn try_lock_exclusive(path: &Path) -> LedgerResult<Option<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    Ok(Some(file))
}

// Closing the handle releases the share-mode lock.
#[cfg(not(unix))]
fn unlock(_file: &File) {}

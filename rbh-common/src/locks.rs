//! Advisory file locks in the shared state directory.
//!
//! Every cross-process coordination primitive of the dispatcher is a
//! whole-file `flock(2)` on a file under the state directory: one lock per
//! (machine, slot), one global admission lock, one upload lock per host.
//! The kernel releases them when the holding process exits, so a crashed
//! hook can never leak a slot.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{DirBuilder, File, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::warn;

/// File name of the global admission lock.
pub const MAIN_LOCK_NAME: &str = "main-lock";

/// How long an upload may wait for the per-host upload lock.
pub const UPLOAD_LOCK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const UPLOAD_LOCK_POLL: Duration = Duration::from_millis(500);

/// An open, not-yet-locked lock file.
pub struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Open or create the lock file, creating the parent directory first if
    /// missing (directory mode 0777, file mode 0600). Idempotent across
    /// processes.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o777)
                .create(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Try to take the exclusive lock without blocking. `Ok(None)` means
    /// somebody else holds it.
    pub fn try_exclusive(self) -> io::Result<Option<HeldLock>> {
        match Flock::lock(self.file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => Ok(Some(HeldLock {
                path: self.path,
                guard,
            })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(io::Error::from(errno)),
        }
    }

    /// Take the exclusive lock, blocking until it is free.
    pub fn lock_exclusive(self) -> io::Result<HeldLock> {
        match Flock::lock(self.file, FlockArg::LockExclusive) {
            Ok(guard) => Ok(HeldLock {
                path: self.path,
                guard,
            }),
            Err((_, errno)) => Err(io::Error::from(errno)),
        }
    }
}

/// A held exclusive lock. Dropping it (or exiting) releases the lock.
pub struct HeldLock {
    path: PathBuf,
    guard: Flock<File>,
}

impl HeldLock {
    /// Bump the lock file's mtime so `ls -l` on the state directory shows
    /// when the slot was taken.
    pub fn touch(&self) -> io::Result<()> {
        self.guard.set_modified(SystemTime::now())
    }
}

impl std::fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeldLock").field("path", &self.path).finish()
    }
}

/// Report whether somebody currently holds the exclusive lock on `path`,
/// by briefly taking and releasing it.
pub fn probe_busy(path: &Path) -> io::Result<bool> {
    Ok(LockFile::open(path)?.try_exclusive()?.is_none())
}

/// Acquire the global admission lock (blocking).
pub fn acquire_main(state_dir: &Path) -> io::Result<HeldLock> {
    LockFile::open(&state_dir.join(MAIN_LOCK_NAME))?.lock_exclusive()
}

/// Path of the per-host upload lock.
pub fn upload_lock_path(state_dir: &Path, host: &str) -> PathBuf {
    state_dir.join(format!("{host}.upload-lock"))
}

/// Acquire the per-host upload lock, waiting up to `timeout`.
///
/// On expiry the lock file is unlinked so future hooks start from a fresh
/// file, and `Ok(None)` is returned: the caller proceeds with the upload
/// unserialized rather than waiting forever on a crashed peer.
///
/// The file is reopened on every attempt because a starved peer may have
/// unlinked it in the meantime; a lock on an unlinked inode coordinates
/// with nobody.
pub fn acquire_upload(
    state_dir: &Path,
    host: &str,
    timeout: Duration,
) -> io::Result<Option<HeldLock>> {
    let path = upload_lock_path(state_dir, host);
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(held) = LockFile::open(&path)?.try_exclusive()? {
            return Ok(Some(held));
        }
        if Instant::now() >= deadline {
            warn!(
                lock = %path.display(),
                "upload lock held for too long, removing it and proceeding without"
            );
            let _ = std::fs::remove_file(&path);
            return Ok(None);
        }
        std::thread::sleep(UPLOAD_LOCK_POLL);
    }
}

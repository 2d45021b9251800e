//! Update lock - one update at a time, across processes
//!
//! Backed by `flock(2)` on a lock file:
//! - contended: log once, then block until the holder goes away
//! - stale: the path was replaced after we opened it, reopen and retry
//! - reboot pending: a previous update asked for a reboot, wait forever
//!
//! The file content is the holder's PID, for diagnostics only. Dropping a
//! held lock closes the descriptor (the kernel releases the flock) but leaves
//! the file in place; only [`UpdateLock::release`] removes it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use swu_common::config::LockConfig;
use swu_common::{SwuError, SwuResult};
use tracing::{debug, error, info};

/// Sleep period of the reboot-pending wait
const REBOOT_WAIT: Duration = Duration::from_secs(1000);

/// Device and inode of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl FileIdentity {
    fn of(meta: &fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

/// Held lock descriptor
struct Held {
    file: File,
    identity: FileIdentity,
}

/// Outcome of checking a held descriptor against its path
enum Validation {
    Valid,
    /// The path no longer names the file we hold
    Stale,
}

/// Process-wide update lock
pub struct UpdateLock {
    path: PathBuf,
    reboot_marker: PathBuf,
    held: Option<Held>,
}

impl UpdateLock {
    /// Lock for the current user: the system lock for root, a per-uid file
    /// otherwise so unprivileged runs never contend with real updates.
    pub fn new(config: &LockConfig) -> Self {
        let euid = nix::unistd::geteuid().as_raw();
        Self::with_path(lock_path_for(config, euid), config.reboot_marker.clone())
    }

    pub fn with_path(path: impl Into<PathBuf>, reboot_marker: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reboot_marker: reboot_marker.into(),
            held: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Identity of the file currently held
    pub fn identity(&self) -> Option<FileIdentity> {
        self.held.as_ref().map(|h| h.identity)
    }

    /// Take the lock, waiting as long as needed.
    ///
    /// Calling this while already holding the lock re-validates the held
    /// descriptor and re-acquires if the lock file was replaced.
    pub fn acquire(&mut self) -> SwuResult<()> {
        loop {
            if self.held.is_none() {
                self.held = Some(self.open_and_lock()?);
            }
            match self.validate()? {
                Validation::Valid => break,
                Validation::Stale => {
                    debug!("lock file {} changed, grabbing again", self.path.display());
                    self.held = None;
                }
            }
        }

        if self.reboot_marker.exists() {
            info!("Previous update marked us for reboot, waiting forever...");
            loop {
                std::thread::sleep(REBOOT_WAIT);
            }
        }

        if let Some(held) = &mut self.held {
            // informational only
            if let Err(e) = write_pid(&mut held.file) {
                debug!("Could not record pid in {}: {}", self.path.display(), e);
            }
        }
        debug!("Update lock {} acquired", self.path.display());
        Ok(())
    }

    /// Remove the lock file and close the descriptor. No-op when not held.
    pub fn release(&mut self) {
        if let Some(held) = self.held.take() {
            if let Err(e) = fs::remove_file(&self.path) {
                debug!("Could not remove lock file {}: {}", self.path.display(), e);
            }
            drop(held);
            debug!("Update lock {} released", self.path.display());
        }
    }

    fn open_and_lock(&self) -> SwuResult<Held> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&self.path)
            .map_err(|e| {
                error!("Could not open update lock file {}: {}", self.path.display(), e);
                SwuError::io(format!("Could not open {}", self.path.display()), e)
            })?;

        lock_exclusive(&file, || info!("Waiting for update lock..."))?;

        let meta = file.metadata().map_err(|e| {
            error!("Could not stat update lock (fd): {}", e);
            SwuError::io("Could not stat update lock", e)
        })?;
        Ok(Held {
            identity: FileIdentity::of(&meta),
            file,
        })
    }

    fn validate(&self) -> SwuResult<Validation> {
        let Some(held) = &self.held else {
            return Err(SwuError::Internal("validating an unheld lock".to_string()));
        };
        match fs::symlink_metadata(&self.path) {
            Ok(meta) if FileIdentity::of(&meta) == held.identity => Ok(Validation::Valid),
            Ok(_) => Ok(Validation::Stale),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Validation::Stale),
            Err(e) => Err(SwuError::io(
                format!("Could not stat {}", self.path.display()),
                e,
            )),
        }
    }
}

/// Lock file for a given effective uid
pub fn lock_path_for(config: &LockConfig, euid: u32) -> PathBuf {
    if euid == 0 {
        config.lock_file.clone()
    } else {
        config.user_lock_dir.join(format!(".swupdate_lock_{}", euid))
    }
}

/// Exclusive flock, blocking if needed. `on_wait` runs once, before blocking.
fn lock_exclusive(file: &File, on_wait: impl FnOnce()) -> SwuResult<()> {
    if !try_flock(file)? {
        on_wait();
        flock_blocking(file)?;
    }
    Ok(())
}

/// Non-blocking exclusive flock. `Ok(false)` when it was not taken: someone
/// else holds it, or the attempt was interrupted.
fn try_flock(file: &File) -> SwuResult<bool> {
    // SAFETY: flock on a descriptor owned by `file`, which outlives the call.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => Ok(false),
        Some(libc::EINTR) => Ok(false),
        _ => {
            error!("Could not take update lock: {}", err);
            Err(SwuError::io("Could not take update lock", err))
        }
    }
}

fn flock_blocking(file: &File) -> SwuResult<()> {
    loop {
        // SAFETY: as in try_flock.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => {
                error!("Could not take update lock: {}", err);
                return Err(SwuError::io("Could not take update lock", err));
            }
        }
    }
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    writeln!(file, "{}", std::process::id())
}

//! Unix process control and lock-file singleton leases

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::core::bypass::{LeaseMethod, LeaseToken, LockBackend};

/// Terminate a process gracefully (SIGTERM)
pub fn terminate_process(pid: u32) -> Result<()> {
    signal(pid, libc::SIGTERM, "terminate")
}

/// Force kill a process (SIGKILL)
pub fn kill_process(pid: u32) -> Result<()> {
    signal(pid, libc::SIGKILL, "kill")
}

/// Convert to a single-process pid; 0 and negative values address process groups
fn process_id(pid: u32) -> Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(value) if value > 0 => Ok(value),
        _ => anyhow::bail!("{} is not a valid process id", pid),
    }
}

fn signal(pid: u32, sig: libc::c_int, what: &str) -> Result<()> {
    let target = process_id(pid)?;
    let result = unsafe { libc::kill(target, sig) };
    if result == 0 {
        Ok(())
    } else {
        anyhow::bail!(
            "Failed to {} process {}: {}",
            what,
            pid,
            std::io::Error::last_os_error()
        )
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    let Ok(target) = process_id(pid) else {
        return false;
    };
    // signal 0 checks existence without delivering anything
    unsafe { libc::kill(target, 0) == 0 }
}

/// Current nice value of a process
pub fn get_process_priority(pid: u32) -> Result<i32> {
    let target = process_id(pid)?;
    let value = unsafe { libc::getpriority(libc::PRIO_PROCESS, target as libc::id_t) };
    if value == -1 {
        // -1 is also a legal nice value
        let err = std::io::Error::last_os_error();
        if matches!(err.raw_os_error(), Some(libc::ESRCH) | Some(libc::EINVAL)) {
            anyhow::bail!("Failed to read priority of {}: {}", pid, err);
        }
    }
    Ok(value)
}

/// Set process nice value
pub fn set_process_priority(pid: u32, priority: i32) -> Result<()> {
    let target = process_id(pid)?;
    let result = unsafe {
        libc::setpriority(libc::PRIO_PROCESS, target as libc::id_t, priority.clamp(-20, 19))
    };
    if result == 0 {
        Ok(())
    } else {
        anyhow::bail!(
            "Failed to set priority of {}: {}",
            pid,
            std::io::Error::last_os_error()
        )
    }
}

struct HeldLock {
    file: File,
    path: PathBuf,
    owned: bool,
}

/// Named singleton objects as lock files in a runtime directory.
///
/// Exclusive creation decides between claimed-new and opened-existing; the file stays
/// `flock`ed for as long as the lease is held.
pub struct FileLockBackend {
    dir: PathBuf,
    held: Mutex<HashMap<LeaseToken, HeldLock>>,
    next_token: AtomicU64,
}

impl FileLockBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.lock", file_name))
    }

    fn hold(&self, path: &Path) -> Result<(LeaseToken, LeaseMethod)> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create lock directory {:?}", self.dir))?;

        let (file, method) = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => (file, LeaseMethod::ClaimedNew),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .with_context(|| format!("Failed to open existing lock {:?}", path))?;
                (file, LeaseMethod::OpenedExisting)
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to create lock {:?}", path)),
        };

        let owned = method == LeaseMethod::ClaimedNew;
        let op = if owned { libc::LOCK_EX } else { libc::LOCK_SH };
        if unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) } != 0 {
            // holder keeps it exclusively; the open handle is still a valid lease
            debug!(
                "Lock {:?} held elsewhere: {}",
                path,
                std::io::Error::last_os_error()
            );
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.held
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock table poisoned: {}", e))?
            .insert(
                token,
                HeldLock {
                    file,
                    path: path.to_path_buf(),
                    owned,
                },
            );
        Ok((token, method))
    }

    fn drop_held(&self, token: LeaseToken) -> Result<()> {
        let held = self
            .held
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock table poisoned: {}", e))?
            .remove(&token)
            .with_context(|| format!("Unknown lease token {}", token))?;

        unsafe {
            libc::flock(held.file.as_raw_fd(), libc::LOCK_UN);
        }
        if held.owned {
            if let Err(e) = std::fs::remove_file(&held.path) {
                warn!("Failed to remove lock file {:?}: {}", held.path, e);
            }
        }
        Ok(())
    }
}

impl LockBackend for FileLockBackend {
    fn methods(&self) -> Vec<&'static str> {
        vec!["lock-file", "keep-alive-file"]
    }

    fn claim(&self, name: &str) -> Result<(LeaseToken, LeaseMethod)> {
        let path = self.lock_path(name);
        self.hold(&path)
    }

    fn release(&self, token: LeaseToken) -> Result<()> {
        self.drop_held(token)
    }

    fn create_keep_alive(&self) -> Result<LeaseToken> {
        let path = self.dir.join(format!("keepalive-{}.pid", std::process::id()));
        let (token, _) = self.hold(&path)?;
        if let Some(held) = self
            .held
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock table poisoned: {}", e))?
            .get_mut(&token)
        {
            writeln!(held.file, "{}", std::process::id())?;
        }
        Ok(token)
    }

    fn destroy_keep_alive(&self, token: LeaseToken) -> Result<()> {
        self.drop_held(token)
    }
}

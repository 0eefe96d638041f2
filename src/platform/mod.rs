//! Platform-specific implementations for Windows and Unix

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub mod unix;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::core::bypass::LockBackend;

/// Terminate a process gracefully
pub fn terminate_process(pid: u32) -> Result<()> {
    #[cfg(windows)]
    {
        windows::terminate_process(pid)
    }
    #[cfg(unix)]
    {
        unix::terminate_process(pid)
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Force kill a process
pub fn kill_process(pid: u32) -> Result<()> {
    #[cfg(windows)]
    {
        windows::kill_process(pid)
    }
    #[cfg(unix)]
    {
        unix::kill_process(pid)
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Check if a process is running
pub fn is_process_running(pid: u32) -> bool {
    #[cfg(windows)]
    {
        windows::is_process_running(pid)
    }
    #[cfg(unix)]
    {
        unix::is_process_running(pid)
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = pid;
        false
    }
}

/// Process priority on the nice scale (0 = normal, positive = lower)
pub fn get_process_priority(pid: u32) -> Result<i32> {
    #[cfg(windows)]
    {
        windows::get_process_priority(pid)
    }
    #[cfg(unix)]
    {
        unix::get_process_priority(pid)
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = pid;
        anyhow::bail!("Unsupported platform")
    }
}

/// Set process priority on the nice scale
pub fn set_process_priority(pid: u32, priority: i32) -> Result<()> {
    #[cfg(windows)]
    {
        windows::set_process_priority(pid, priority)
    }
    #[cfg(unix)]
    {
        unix::set_process_priority(pid, priority)
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = (pid, priority);
        anyhow::bail!("Unsupported platform")
    }
}

/// Lock backend for the current platform.
///
/// Windows uses real named mutexes; Unix emulates them with lock files in `locks_dir`.
pub fn default_lock_backend(locks_dir: &Path) -> Arc<dyn LockBackend> {
    #[cfg(windows)]
    {
        let _ = locks_dir;
        Arc::new(windows::WindowsMutexBackend::new())
    }
    #[cfg(unix)]
    {
        Arc::new(unix::FileLockBackend::new(locks_dir))
    }
    #[cfg(not(any(windows, unix)))]
    {
        let _ = locks_dir;
        Arc::new(UnsupportedBackend)
    }
}

#[cfg(not(any(windows, unix)))]
struct UnsupportedBackend;

#[cfg(not(any(windows, unix)))]
impl LockBackend for UnsupportedBackend {
    fn methods(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn claim(&self, _name: &str) -> Result<(crate::core::bypass::LeaseToken, crate::core::bypass::LeaseMethod)> {
        anyhow::bail!("Unsupported platform")
    }

    fn release(&self, _token: crate::core::bypass::LeaseToken) -> Result<()> {
        anyhow::bail!("Unsupported platform")
    }

    fn create_keep_alive(&self) -> Result<crate::core::bypass::LeaseToken> {
        anyhow::bail!("Unsupported platform")
    }

    fn destroy_keep_alive(&self, _token: crate::core::bypass::LeaseToken) -> Result<()> {
        anyhow::bail!("Unsupported platform")
    }
}

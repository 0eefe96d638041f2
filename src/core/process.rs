//! Process management - Launch paths and OS process control

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, info, trace, warn};

use super::instance::{LaunchMethod, LaunchTarget};
use super::resource::{ResourceLimits, ResourceUsage, SystemLoad};
use crate::platform;

/// Sampling and control of OS processes
pub trait ProcessHost: Send + Sync {
    /// Current usage, `None` once the process is gone
    fn sample(&self, pid: u32) -> Option<ResourceUsage>;

    fn is_running(&self, pid: u32) -> bool;

    /// Ask the process to exit
    fn terminate(&self, pid: u32) -> Result<()>;

    fn kill(&self, pid: u32) -> Result<()>;

    /// Priority on the nice scale, `None` if it cannot be read
    fn priority(&self, pid: u32) -> Option<i32>;

    fn set_priority(&self, pid: u32, priority: i32) -> Result<()>;

    /// Machine-wide CPU and memory
    fn system_load(&self) -> SystemLoad;
}

/// [`ProcessHost`] backed by sysinfo and the platform layer
pub struct SystemProcessHost {
    system: Mutex<System>,
}

impl SystemProcessHost {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemProcessHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHost for SystemProcessHost {
    fn sample(&self, pid: u32) -> Option<ResourceUsage> {
        let mut system = self.system.lock().ok()?;
        let pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        let process = system.process(pid)?;
        let usage = ResourceUsage::from_bytes(process.cpu_usage(), process.memory());
        trace!("Sampled PID {}: {} / {}", pid, usage.cpu_string(), usage.memory_string());
        Some(usage)
    }

    fn is_running(&self, pid: u32) -> bool {
        platform::is_process_running(pid)
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        platform::terminate_process(pid)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        platform::kill_process(pid)
    }

    fn priority(&self, pid: u32) -> Option<i32> {
        platform::get_process_priority(pid).ok()
    }

    fn set_priority(&self, pid: u32, priority: i32) -> Result<()> {
        platform::set_process_priority(pid, priority)
    }

    /// CPU usage is measured between calls, so the first call reports 0
    fn system_load(&self) -> SystemLoad {
        let Ok(mut system) = self.system.lock() else {
            return SystemLoad::default();
        };
        system.refresh_cpu_usage();
        system.refresh_memory();
        SystemLoad {
            cpu_percent: system.global_cpu_usage(),
            total_memory: system.total_memory(),
            used_memory: system.used_memory(),
        }
    }
}

/// Everything a launcher needs to start one instance
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub instance_name: String,
    pub account: String,
    pub target: LaunchTarget,
    pub limits: ResourceLimits,
}

/// What a successful launch produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub method: LaunchMethod,
    /// Present only when the launch path can report the process id
    pub pid: Option<u32>,
}

/// One way of starting a client
#[async_trait]
pub trait Launcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchOutcome>;
}

#[derive(Debug, Deserialize)]
struct ApiLaunchResponse {
    #[serde(default)]
    pid: Option<u32>,
}

/// Pids that name exactly one process; 0 and anything past `i32::MAX` address groups on Unix
fn single_process_pid(pid: u32) -> Option<u32> {
    (1..=i32::MAX as u32).contains(&pid).then_some(pid)
}

/// Primary launcher: asks the local launch API to start the instance
pub struct ApiLauncher {
    client: reqwest::Client,
    url: String,
}

impl ApiLauncher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        // The launch API is local; never route it through an environment proxy
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("Failed to build launch API client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Launcher for ApiLauncher {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchOutcome> {
        let body = json!({
            "name": request.instance_name,
            "account": request.account,
            "gameUrl": request.target.url,
            "resourceLimits": {
                "maxCpu": request.limits.cpu_percent,
                "maxMemory": request.limits.memory_mb,
            },
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Launch API unreachable at {}", self.url))?
            .error_for_status()
            .context("Launch API rejected the request")?;

        // A body without a usable pid is still a successful, untracked launch
        let reported = response
            .json::<ApiLaunchResponse>()
            .await
            .ok()
            .and_then(|r| r.pid);
        let pid = reported.and_then(single_process_pid);
        if pid.is_none() {
            if let Some(bad) = reported {
                warn!("Launch API reported unusable pid {}; treating as untracked", bad);
            }
        }

        info!("Launch API started '{}' (pid: {:?})", request.instance_name, pid);
        Ok(LaunchOutcome {
            method: LaunchMethod::Api,
            pid,
        })
    }
}

/// Fallback launcher: spawns the client directly when it can be located,
/// otherwise hands the target URL to the OS protocol handler
pub struct LocalLauncher {
    install_dirs: Vec<PathBuf>,
    executable: String,
}

impl LocalLauncher {
    pub fn new(install_dirs: Vec<PathBuf>, executable: impl Into<String>) -> Self {
        Self {
            install_dirs,
            executable: executable.into(),
        }
    }

    fn spawn_direct(&self, exe: &Path, request: &LaunchRequest) -> Result<u32> {
        let mut cmd = tokio::process::Command::new(exe);
        cmd.arg(&request.target.url);
        if let Some(parent) = exe.parent() {
            cmd.current_dir(parent);
        }

        // Detach from our process group
        #[cfg(windows)]
        {
            cmd.creation_flags(0x00000008); // DETACHED_PROCESS
        }

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        // Dropping the child leaves it running; tokio reaps it once it exits
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", exe))?;

        child
            .id()
            .context("Spawned client exited before reporting a PID")
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchOutcome> {
        if let Some(exe) = locate_client(&self.install_dirs, &self.executable) {
            let pid = self.spawn_direct(&exe, request)?;
            info!("Spawned client {:?} with PID {}", exe, pid);
            return Ok(LaunchOutcome {
                method: LaunchMethod::DirectProcess,
                pid: Some(pid),
            });
        }

        debug!(
            "No '{}' under {:?}, using protocol handler",
            self.executable, self.install_dirs
        );
        open::that_detached(&request.target.url)
            .with_context(|| format!("Protocol handler failed for {}", request.target.url))?;
        info!("Handed {} to the protocol handler", request.target.url);
        Ok(LaunchOutcome {
            method: LaunchMethod::ProtocolHandler,
            pid: None,
        })
    }
}

/// Find the client executable in the newest version directory under any root
pub fn locate_client(roots: &[PathBuf], executable: &str) -> Option<PathBuf> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for root in roots {
        let Ok(entries) = std::fs::read_dir(root) else {
            continue;
        };
        for entry in entries.flatten() {
            let candidate = entry.path().join(executable);
            let Ok(meta) = std::fs::metadata(&candidate) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if newest.as_ref().map_or(true, |(time, _)| modified > *time) {
                newest = Some((modified, candidate));
            }
        }
    }

    newest.map(|(_, path)| path)
}

//! Fleet settings management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::resource::ResourceLimits;

/// Named singleton objects the client is known to create
pub const DEFAULT_MUTEX_NAMES: &[&str] = &[
    "ROBLOX_singletonMutex",
    "ROBLOX_singletonEvent",
    "ROBLOX_singletonEvent2",
    "RobloxPlayerBeta_Mutex",
    "Global\\ROBLOX_singletonMutex",
];

/// Longest a coordination role may stay live (one week)
pub const MAX_FOLLOW_SECS_LIMIT: u64 = 7 * 24 * 3600;

/// Fleet settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Bypass
    /// Named objects claimed on activation
    pub mutex_names: Vec<String>,
    /// Lower bound of the activation jitter (ms)
    pub jitter_min_ms: u64,
    /// Upper bound of the activation jitter (ms, exclusive)
    pub jitter_max_ms: u64,

    // Launching
    /// Default protocol URL handed to new instances
    pub default_target_url: String,
    /// Local launch API endpoint used by the primary launcher
    pub launch_api_url: String,
    /// Request timeout for the launch API (ms)
    pub launch_api_timeout_ms: u64,
    /// Directories that contain versioned client installs
    pub client_install_dirs: Vec<PathBuf>,
    /// Client executable file name inside a version directory
    pub client_executable: String,
    /// Delay between batch launches (ms)
    pub launch_delay_ms: u64,
    /// Maximum live instances (0 = unlimited)
    pub max_instances: u32,

    // Monitoring
    /// Monitor tick interval (ms)
    pub monitor_interval_ms: u64,
    /// Graceful stop wait before forcing (ms)
    pub stop_grace_ms: u64,
    /// Enable soft governance on new instances
    pub protection_enabled: bool,
    /// Per-instance ceilings
    pub resource_limits: ResourceLimits,

    // Coordination
    /// How long a role stays live (seconds)
    pub max_follow_secs: u64,
    /// Per-target delivery timeout (ms)
    pub delivery_timeout_ms: u64,

    // Advanced
    /// Custom data directory
    pub data_directory: Option<PathBuf>,
    /// Enable debug logging
    pub debug_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mutex_names: DEFAULT_MUTEX_NAMES.iter().map(|s| s.to_string()).collect(),
            jitter_min_ms: 100,
            jitter_max_ms: 500,

            default_target_url: "roblox://placeId=8737899170".to_string(),
            launch_api_url: "http://localhost:5000/api/instances".to_string(),
            launch_api_timeout_ms: 15_000,
            client_install_dirs: default_install_dirs(),
            client_executable: "RobloxPlayerBeta.exe".to_string(),
            launch_delay_ms: 3_000,
            max_instances: 20,

            monitor_interval_ms: 2_000,
            stop_grace_ms: 5_000,
            protection_enabled: true,
            resource_limits: ResourceLimits::default(),

            max_follow_secs: 900,
            delivery_timeout_ms: 5_000,

            data_directory: None,
            debug_logging: false,
        }
    }
}

impl Settings {
    /// Get the data directory, using default if not set
    pub fn get_data_directory(&self) -> PathBuf {
        self.data_directory.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("MultiFleet")
        })
    }

    /// Get the accounts file path
    pub fn get_accounts_file(&self) -> PathBuf {
        self.get_data_directory().join("accounts.json")
    }

    /// Get the directory that holds Unix lock files
    pub fn get_locks_directory(&self) -> PathBuf {
        self.get_data_directory().join("locks")
    }

    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.monitor_interval_ms = self.monitor_interval_ms.max(100);
        self.jitter_max_ms = self.jitter_max_ms.max(self.jitter_min_ms);
        self.delivery_timeout_ms = self.delivery_timeout_ms.max(10);
        self.max_follow_secs = self.max_follow_secs.clamp(1, MAX_FOLLOW_SECS_LIMIT);
        self.launch_api_timeout_ms = self.launch_api_timeout_ms.max(100);
        self.resource_limits = self
            .resource_limits
            .with_cpu_limit(self.resource_limits.cpu_percent)
            .with_memory_limit(self.resource_limits.memory_mb);
        self.mutex_names.retain(|name| !name.trim().is_empty());
        self.mutex_names.dedup();
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn launch_delay(&self) -> Duration {
        Duration::from_millis(self.launch_delay_ms)
    }

    pub fn max_follow_time(&self) -> Duration {
        Duration::from_secs(self.max_follow_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

fn default_install_dirs() -> Vec<PathBuf> {
    let mut dirs_list = Vec::new();
    if let Some(local) = dirs::data_local_dir() {
        dirs_list.push(local.join("Roblox").join("Versions"));
    }
    #[cfg(windows)]
    {
        dirs_list.push(PathBuf::from(r"C:\Program Files (x86)\Roblox\Versions"));
        dirs_list.push(PathBuf::from(r"C:\Program Files\Roblox\Versions"));
    }
    dirs_list
}

//! Instance management - Represents a single launched client instance

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::resource::ResourceUsage;

/// Unique identifier for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Launch is in progress
    Launching,
    /// Instance is running (tracked or untracked)
    Running,
    /// A stop request owns the instance
    Stopping,
    /// Instance has stopped
    Stopped,
    /// Both launch paths failed
    Failed,
}

impl InstanceStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Launching | Self::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Launching => "Launching",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        }
    }
}

/// Which launch path produced the instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMethod {
    /// Launched through the local launch API
    Api,
    /// Client executable spawned directly
    DirectProcess,
    /// Handed to the OS protocol handler, not trackable
    ProtocolHandler,
}

impl LaunchMethod {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::DirectProcess => "direct-process",
            Self::ProtocolHandler => "protocol-handler",
        }
    }
}

/// Where a launched client should go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchTarget {
    /// Protocol URL handed to the client, e.g. `roblox://placeId=8737899170`
    pub url: String,
    /// Optional experience/place identifier for display
    pub place_id: Option<String>,
}

impl LaunchTarget {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let place_id = url
            .split_once("placeId=")
            .map(|(_, rest)| rest.split('&').next().unwrap_or(rest).to_string())
            .filter(|id| !id.is_empty());
        Self { url, place_id }
    }
}

/// A managed client instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Owning account username
    pub account: String,
    pub target: LaunchTarget,
    pub status: InstanceStatus,
    /// Operating system process ID, absent when the launch is untracked
    pub pid: Option<u32>,
    pub launch_method: Option<LaunchMethod>,
    pub resource_usage: ResourceUsage,
    pub fps: u32,
    pub ping_ms: u32,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub protection_enabled: bool,
    pub automation_enabled: bool,
}

impl Instance {
    pub fn new(account: impl Into<String>, target: LaunchTarget) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            account: account.into(),
            target,
            status: InstanceStatus::Launching,
            pid: None,
            launch_method: None,
            resource_usage: ResourceUsage::default(),
            fps: 0,
            ping_ms: 0,
            created_at: now,
            last_active: now,
            protection_enabled: true,
            automation_enabled: false,
        }
    }

    pub fn is_tracked(&self) -> bool {
        self.pid.is_some()
    }

    /// Seconds since creation, used for playtime accounting
    pub fn session_secs(&self) -> u64 {
        (Utc::now() - self.created_at).num_seconds().max(0) as u64
    }

    /// Format uptime as human-readable string
    pub fn uptime_string(&self) -> String {
        let secs = self.session_secs();
        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else if secs < 86400 {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        } else {
            format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
        }
    }

    /// Mark instance as running after a successful launch
    pub fn mark_running(&mut self, method: LaunchMethod, pid: Option<u32>) {
        self.status = InstanceStatus::Running;
        self.launch_method = Some(method);
        self.pid = pid;
        self.last_active = Utc::now();
    }

    pub fn mark_stopping(&mut self) {
        self.status = InstanceStatus::Stopping;
    }

    /// Mark instance as stopped
    pub fn mark_stopped(&mut self) {
        self.status = InstanceStatus::Stopped;
        self.resource_usage = ResourceUsage::default();
    }

    pub fn mark_failed(&mut self) {
        self.status = InstanceStatus::Failed;
    }

    /// Update resource usage from a monitor sample
    pub fn update_resource_usage(&mut self, usage: ResourceUsage) {
        self.resource_usage = usage;
        self.last_active = Utc::now();
    }
}

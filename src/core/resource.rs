//! Resource management - Ceilings and usage snapshots

use serde::{Deserialize, Serialize};

use super::instance::{Instance, InstanceStatus};

/// Resource ceilings enforced softly by the governor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum CPU usage percentage per instance
    pub cpu_percent: f32,
    /// Maximum resident memory in MB per instance
    pub memory_mb: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_percent: 25.0,
            memory_mb: 2048.0,
        }
    }
}

impl ResourceLimits {
    pub fn with_cpu_limit(mut self, percent: f32) -> Self {
        self.cpu_percent = percent.clamp(0.0, 100.0);
        self
    }

    pub fn with_memory_limit(mut self, mb: f64) -> Self {
        self.memory_mb = mb.max(0.0);
        self
    }
}

/// Point-in-time resource usage of one instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage percentage (0.0-100.0 per core)
    pub cpu_percent: f32,
    /// Resident memory in MB
    pub memory_mb: f64,
    /// GPU usage percentage (not sampled, kept for telemetry consumers)
    pub gpu_percent: f32,
}

impl ResourceUsage {
    pub fn from_bytes(cpu_percent: f32, memory_bytes: u64) -> Self {
        Self {
            cpu_percent,
            memory_mb: memory_bytes as f64 / (1024.0 * 1024.0),
            gpu_percent: 0.0,
        }
    }

    /// Format memory as human-readable string
    pub fn memory_string(&self) -> String {
        format_bytes((self.memory_mb * 1024.0 * 1024.0) as u64)
    }

    /// Format CPU percentage
    pub fn cpu_string(&self) -> String {
        format!("{:.1}%", self.cpu_percent)
    }
}

/// Machine-wide CPU and memory at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemLoad {
    /// Global CPU usage percentage
    pub cpu_percent: f32,
    /// Total physical memory in bytes
    pub total_memory: u64,
    /// Used physical memory in bytes
    pub used_memory: u64,
}

impl SystemLoad {
    pub fn memory_percent(&self) -> f32 {
        if self.total_memory > 0 {
            (self.used_memory as f32 / self.total_memory as f32) * 100.0
        } else {
            0.0
        }
    }
}

const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Fleet-wide performance snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemPerformance {
    pub system_cpu: f32,
    pub system_memory_percent: f32,
    pub system_memory_total_gb: f64,
    pub system_memory_used_gb: f64,
    /// Running instances the averages are taken over
    pub total_instances: usize,
    pub avg_cpu_per_instance: f32,
    pub avg_memory_per_instance: f64,
    pub avg_fps: f64,
    pub bypass_active: bool,
    pub protection_active: bool,
}

impl SystemPerformance {
    /// Combine a system sample with per-instance averages over the Running instances
    pub fn summarize(
        load: SystemLoad,
        instances: &[Instance],
        bypass_active: bool,
        protection_active: bool,
    ) -> Self {
        let running: Vec<&Instance> = instances
            .iter()
            .filter(|i| i.status == InstanceStatus::Running)
            .collect();
        let count = running.len();
        let divisor = count.max(1);

        let cpu: f32 = running.iter().map(|i| i.resource_usage.cpu_percent).sum();
        let memory: f64 = running.iter().map(|i| i.resource_usage.memory_mb).sum();
        let fps: u64 = running.iter().map(|i| u64::from(i.fps)).sum();

        Self {
            system_cpu: load.cpu_percent,
            system_memory_percent: load.memory_percent(),
            system_memory_total_gb: load.total_memory as f64 / GB,
            system_memory_used_gb: load.used_memory as f64 / GB,
            total_instances: count,
            avg_cpu_per_instance: cpu / divisor as f32,
            avg_memory_per_instance: memory / divisor as f64,
            avg_fps: fps as f64 / divisor as f64,
            bypass_active,
            protection_active,
        }
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

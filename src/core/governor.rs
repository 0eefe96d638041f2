//! Resource governor - Soft ceilings checked on every monitor tick
//!
//! Breaches are reported and logged; the only corrective action is restoring a drifted
//! process priority. Processes are never terminated here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::instance::InstanceId;
use super::process::ProcessHost;
use super::resource::{ResourceLimits, ResourceUsage};

/// Neutral priority on the nice scale
const NORMAL_PRIORITY: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

/// A ceiling exceeded during one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionBreach {
    pub instance: InstanceId,
    pub resource: ResourceKind,
    pub observed: f64,
    pub limit: f64,
}

/// Outcome of one governor pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GovernorVerdict {
    pub breaches: Vec<ProtectionBreach>,
    pub priority_normalized: bool,
}

pub struct Governor {
    limits: ResourceLimits,
    host: Arc<dyn ProcessHost>,
}

impl Governor {
    pub fn new(limits: ResourceLimits, host: Arc<dyn ProcessHost>) -> Self {
        Self { limits, host }
    }

    /// Check one sample and, with protection on, pull a drifted priority back to normal
    pub fn inspect(
        &self,
        instance: InstanceId,
        pid: u32,
        usage: &ResourceUsage,
        protection_enabled: bool,
    ) -> GovernorVerdict {
        let breaches = check_limits(instance, usage, &self.limits);
        for breach in &breaches {
            warn!(
                "Instance {} (PID {}) over {:?} ceiling: {:.1} > {:.1}",
                instance, pid, breach.resource, breach.observed, breach.limit
            );
        }

        let mut priority_normalized = false;
        if protection_enabled {
            match self.host.priority(pid) {
                Some(current) if current != NORMAL_PRIORITY => {
                    match self.host.set_priority(pid, NORMAL_PRIORITY) {
                        Ok(()) => {
                            info!("Normalized priority of PID {} ({} -> {})", pid, current, NORMAL_PRIORITY);
                            priority_normalized = true;
                        }
                        Err(e) => warn!("Could not normalize priority of PID {}: {}", pid, e),
                    }
                }
                Some(_) => {}
                None => debug!("Priority of PID {} unavailable", pid),
            }
        }

        GovernorVerdict {
            breaches,
            priority_normalized,
        }
    }
}

/// Compare a sample against the ceilings; each resource is judged independently
pub fn check_limits(
    instance: InstanceId,
    usage: &ResourceUsage,
    limits: &ResourceLimits,
) -> Vec<ProtectionBreach> {
    let mut breaches = Vec::new();
    if usage.cpu_percent > limits.cpu_percent {
        breaches.push(ProtectionBreach {
            instance,
            resource: ResourceKind::Cpu,
            observed: usage.cpu_percent as f64,
            limit: limits.cpu_percent as f64,
        });
    }
    if usage.memory_mb > limits.memory_mb {
        breaches.push(ProtectionBreach {
            instance,
            resource: ResourceKind::Memory,
            observed: usage.memory_mb,
            limit: limits.memory_mb,
        });
    }
    breaches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resource::SystemLoad;
    use std::sync::Mutex;

    struct PriorityHost {
        priority: Mutex<i32>,
        refuse: bool,
        terminated: Mutex<bool>,
    }

    impl PriorityHost {
        fn new(priority: i32, refuse: bool) -> Self {
            Self {
                priority: Mutex::new(priority),
                refuse,
                terminated: Mutex::new(false),
            }
        }
    }

    impl ProcessHost for PriorityHost {
        fn sample(&self, _pid: u32) -> Option<ResourceUsage> {
            None
        }
        fn is_running(&self, _pid: u32) -> bool {
            true
        }
        fn terminate(&self, _pid: u32) -> anyhow::Result<()> {
            *self.terminated.lock().unwrap() = true;
            Ok(())
        }
        fn kill(&self, _pid: u32) -> anyhow::Result<()> {
            *self.terminated.lock().unwrap() = true;
            Ok(())
        }
        fn priority(&self, _pid: u32) -> Option<i32> {
            Some(*self.priority.lock().unwrap())
        }
        fn set_priority(&self, _pid: u32, priority: i32) -> anyhow::Result<()> {
            if self.refuse {
                anyhow::bail!("permission denied");
            }
            *self.priority.lock().unwrap() = priority;
            Ok(())
        }
        fn system_load(&self) -> SystemLoad {
            SystemLoad::default()
        }
    }

    fn usage(cpu: f32, mem: f64) -> ResourceUsage {
        ResourceUsage {
            cpu_percent: cpu,
            memory_mb: mem,
            gpu_percent: 0.0,
        }
    }

    #[test]
    fn cpu_and_memory_breach_independently() {
        let id = InstanceId::new();
        let limits = ResourceLimits::default();

        assert!(check_limits(id, &usage(10.0, 100.0), &limits).is_empty());

        let cpu_only = check_limits(id, &usage(30.0, 100.0), &limits);
        assert_eq!(cpu_only.len(), 1);
        assert_eq!(cpu_only[0].resource, ResourceKind::Cpu);

        let both = check_limits(id, &usage(99.0, 4096.0), &limits);
        let kinds: Vec<_> = both.iter().map(|b| b.resource).collect();
        assert_eq!(kinds, vec![ResourceKind::Cpu, ResourceKind::Memory]);
        assert_eq!(both[1].limit, 2048.0);
    }

    #[test]
    fn drifted_priority_is_normalized_without_stopping() {
        let host = Arc::new(PriorityHost::new(10, false));
        let governor = Governor::new(ResourceLimits::default(), host.clone());

        let verdict = governor.inspect(InstanceId::new(), 7, &usage(80.0, 3000.0), true);
        assert_eq!(verdict.breaches.len(), 2);
        assert!(verdict.priority_normalized);
        assert_eq!(*host.priority.lock().unwrap(), 0);
        assert!(!*host.terminated.lock().unwrap());
    }

    #[test]
    fn protection_off_leaves_priority_alone() {
        let host = Arc::new(PriorityHost::new(10, false));
        let governor = Governor::new(ResourceLimits::default(), host.clone());
        let verdict = governor.inspect(InstanceId::new(), 7, &usage(1.0, 1.0), false);
        assert!(!verdict.priority_normalized);
        assert_eq!(*host.priority.lock().unwrap(), 10);
    }

    #[test]
    fn normalization_failure_is_not_fatal() {
        let host = Arc::new(PriorityHost::new(-5, true));
        let governor = Governor::new(ResourceLimits::default(), host);
        let verdict = governor.inspect(InstanceId::new(), 7, &usage(1.0, 1.0), true);
        assert!(!verdict.priority_normalized);
        assert!(verdict.breaches.is_empty());
    }
}

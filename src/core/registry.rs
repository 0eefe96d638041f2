//! Instance registry - Single writer for instance state
//!
//! Structural changes to the instance map happen only here: in `launch`, `stop` and the
//! event loop that consumes monitor reports.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::bypass::BypassController;
use super::error::{FleetError, FleetResult};
use super::governor::Governor;
use super::instance::{Instance, InstanceId, InstanceStatus, LaunchTarget};
use super::monitor::{spawn_monitor, MonitorContext, MonitorEvent, MonitorHandle};
use super::process::{LaunchRequest, Launcher, ProcessHost};
use super::resource::ResourceLimits;
use super::settings::Settings;
use crate::persistence::{AccountStore, Database, InstanceEvent};

/// Interval between liveness checks while waiting for a graceful stop
const STOP_POLL: Duration = Duration::from_millis(250);

/// Registry tuning taken from settings
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// 0 = unlimited
    pub max_instances: u32,
    pub monitor_interval: Duration,
    pub stop_grace: Duration,
    pub protection_enabled: bool,
    pub resource_limits: ResourceLimits,
}

impl RegistryConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_instances: settings.max_instances,
            monitor_interval: settings.monitor_interval(),
            stop_grace: settings.stop_grace(),
            protection_enabled: settings.protection_enabled,
            resource_limits: settings.resource_limits,
        }
    }
}

/// Collaborators the registry drives
pub struct RegistryDeps {
    pub accounts: Arc<AccountStore>,
    pub bypass: Arc<BypassController>,
    pub primary: Arc<dyn Launcher>,
    pub fallback: Arc<dyn Launcher>,
    pub host: Arc<dyn ProcessHost>,
    pub history: Option<Arc<Database>>,
}

pub struct Registry {
    instances: RwLock<HashMap<InstanceId, Instance>>,
    monitors: Mutex<HashMap<InstanceId, MonitorHandle>>,
    accounts: Arc<AccountStore>,
    bypass: Arc<BypassController>,
    primary: Arc<dyn Launcher>,
    fallback: Arc<dyn Launcher>,
    host: Arc<dyn ProcessHost>,
    governor: Arc<Governor>,
    history: Option<Arc<Database>>,
    config: RegistryConfig,
    events: mpsc::UnboundedSender<MonitorEvent>,
}

impl Registry {
    /// Create the registry and spawn its event loop; must run inside a tokio runtime
    pub fn start(config: RegistryConfig, deps: RegistryDeps) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let governor = Arc::new(Governor::new(config.resource_limits, deps.host.clone()));

        let registry = Arc::new(Self {
            instances: RwLock::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            accounts: deps.accounts,
            bypass: deps.bypass,
            primary: deps.primary,
            fallback: deps.fallback,
            host: deps.host,
            governor,
            history: deps.history,
            config,
            events,
        });

        tokio::spawn(event_loop(Arc::downgrade(&registry), rx));
        registry
    }

    pub fn accounts(&self) -> &Arc<AccountStore> {
        &self.accounts
    }

    /// Launch one instance for `account`, primary path first, fallback on any error
    pub async fn launch(&self, account: &str, target: LaunchTarget) -> FleetResult<InstanceId> {
        if !self.accounts.contains(account) {
            return Err(FleetError::AccountNotFound(account.to_string()));
        }
        if let Some(existing) = self.accounts.active_instance(account) {
            return Err(FleetError::AccountBusy {
                account: account.to_string(),
                instance: existing,
            });
        }
        if self.config.max_instances > 0 && self.live_count().await >= self.config.max_instances as usize {
            return Err(FleetError::InstanceLimitReached(self.config.max_instances));
        }
        if !self.bypass.is_active().await {
            self.bypass.activate().await?;
        }

        let mut instance = Instance::new(account, target.clone());
        instance.protection_enabled = self.config.protection_enabled;
        let id = instance.id;

        // Linking first keeps a concurrent launch for the same account out
        self.accounts.attach_instance(account, id)?;
        self.instances.write().await.insert(id, instance);
        info!("Launching instance {} for {}", id, account);

        let request = LaunchRequest {
            instance_name: format!("{}-{}", account, &id.to_string()[..8]),
            account: account.to_string(),
            target,
            limits: self.config.resource_limits,
        };

        let outcome = match self.primary.launch(&request).await {
            Ok(outcome) => Ok(outcome),
            Err(primary) => {
                warn!(
                    "{} launch failed for {}: {:#}; trying {}",
                    self.primary.name(),
                    account,
                    primary,
                    self.fallback.name()
                );
                self.fallback
                    .launch(&request)
                    .await
                    .map_err(|fallback| (primary, fallback))
            }
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err((primary, fallback)) => {
                if let Some(mut instance) = self.instances.write().await.remove(&id) {
                    instance.mark_failed();
                }
                self.accounts.detach_instance(account, id);
                let err = FleetError::LaunchFailure {
                    account: account.to_string(),
                    primary: format!("{:#}", primary),
                    fallback: format!("{:#}", fallback),
                };
                error!("{}", err);
                self.record(Some(id), account, InstanceEvent::LaunchFailed, Some(&err.to_string()));
                return Err(err);
            }
        };

        // The monitor handle is registered under the instance lock so a concurrent stop
        // always finds it
        let running = {
            let mut instances = self.instances.write().await;
            match instances.get_mut(&id) {
                Some(instance) if instance.status == InstanceStatus::Launching => {
                    instance.mark_running(outcome.method, outcome.pid);
                    if let Some(pid) = outcome.pid {
                        let handle =
                            spawn_monitor(id, pid, instance.protection_enabled, self.monitor_context());
                        self.monitors.lock().await.insert(id, handle);
                    }
                    true
                }
                _ => false,
            }
        };

        if !running {
            warn!("Instance {} was stopped during launch", id);
            if let Some(pid) = outcome.pid {
                if let Err(e) = self.host.kill(pid) {
                    warn!("Failed to kill orphaned PID {}: {}", pid, e);
                }
            }
            return Err(FleetError::LaunchAborted(id));
        }

        match outcome.pid {
            Some(pid) => info!("Instance {} running via {} (PID {})", id, outcome.method.label(), pid),
            None => info!(
                "Instance {} running via {} (untracked, no PID)",
                id,
                outcome.method.label()
            ),
        }

        if let Err(e) = self.accounts.record_session_start(account) {
            warn!("Failed to record session for {}: {}", account, e);
        }
        self.record(Some(id), account, InstanceEvent::Launched, Some(outcome.method.label()));
        Ok(id)
    }

    /// Stop an instance; `false` if it is unknown or already stopping
    pub async fn stop(&self, id: InstanceId) -> bool {
        let (account, pid) = {
            let mut instances = self.instances.write().await;
            match instances.get_mut(&id) {
                Some(instance)
                    if !matches!(
                        instance.status,
                        InstanceStatus::Stopping | InstanceStatus::Stopped
                    ) =>
                {
                    instance.mark_stopping();
                    (instance.account.clone(), instance.pid)
                }
                _ => return false,
            }
        };

        info!("Stopping instance {} ({})", id, account);
        if let Some(handle) = self.monitors.lock().await.remove(&id) {
            handle.cancel();
        }

        if let Some(pid) = pid {
            self.terminate(pid).await;
        }

        let session = {
            let mut instances = self.instances.write().await;
            instances.remove(&id).map(|mut instance| {
                instance.mark_stopped();
                (instance.session_secs(), instance.uptime_string())
            })
        };
        let (session_secs, uptime) = session.unwrap_or_else(|| (0, "0s".to_string()));

        self.release_account(&account, id, session_secs);
        self.record(Some(id), &account, InstanceEvent::Stopped, Some(&uptime));
        info!("Instance {} stopped after {}", id, uptime);
        true
    }

    /// Stop every instance; returns how many were stopped
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<InstanceId> = self.instances.read().await.keys().copied().collect();
        join_all(ids.into_iter().map(|id| self.stop(id)))
            .await
            .into_iter()
            .filter(|stopped| *stopped)
            .count()
    }

    /// Snapshot of all instances, oldest first
    pub async fn list_instances(&self) -> Vec<Instance> {
        let mut list: Vec<Instance> = self.instances.read().await.values().cloned().collect();
        list.sort_by_key(|i| i.created_at);
        list
    }

    pub async fn get(&self, id: InstanceId) -> Option<Instance> {
        self.instances.read().await.get(&id).cloned()
    }

    pub async fn instance_for_account(&self, username: &str) -> Option<Instance> {
        let id = self.accounts.active_instance(username)?;
        self.get(id).await
    }

    /// Instances in Launching or Running
    pub async fn live_count(&self) -> usize {
        self.instances
            .read()
            .await
            .values()
            .filter(|i| i.status.is_active())
            .count()
    }

    /// Record externally reported fps/ping
    pub async fn update_telemetry(&self, id: InstanceId, fps: u32, ping_ms: u32) -> bool {
        match self.instances.write().await.get_mut(&id) {
            Some(instance) => {
                instance.fps = fps;
                instance.ping_ms = ping_ms;
                true
            }
            None => false,
        }
    }

    /// Flag the account's instance as taking part in coordination
    pub async fn set_automation(&self, username: &str, enabled: bool) -> bool {
        let Some(id) = self.accounts.active_instance(username) else {
            return false;
        };
        match self.instances.write().await.get_mut(&id) {
            Some(instance) => {
                instance.automation_enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub async fn clear_automation(&self) {
        for instance in self.instances.write().await.values_mut() {
            instance.automation_enabled = false;
        }
    }

    pub async fn automation_count(&self) -> usize {
        self.instances
            .read()
            .await
            .values()
            .filter(|i| i.automation_enabled)
            .count()
    }

    fn monitor_context(&self) -> MonitorContext {
        MonitorContext {
            interval: self.config.monitor_interval,
            host: self.host.clone(),
            governor: self.governor.clone(),
            events: self.events.clone(),
        }
    }

    /// Graceful termination, escalating to a kill after the grace period
    async fn terminate(&self, pid: u32) {
        if let Err(e) = self.host.terminate(pid) {
            debug!("Graceful termination of PID {} failed: {}", pid, e);
        }

        let deadline = Instant::now() + self.config.stop_grace;
        while self.host.is_running(pid) {
            let now = Instant::now();
            if now >= deadline {
                warn!("PID {} ignored termination, forcing kill", pid);
                if let Err(e) = self.host.kill(pid) {
                    warn!("Failed to kill PID {}: {}", pid, e);
                }
                break;
            }
            tokio::time::sleep(STOP_POLL.min(deadline - now)).await;
        }
    }

    async fn handle_event(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::Sample { id, usage, .. } => {
                if let Some(instance) = self.instances.write().await.get_mut(&id) {
                    if instance.status == InstanceStatus::Running {
                        instance.update_resource_usage(usage);
                    }
                }
            }
            MonitorEvent::ProcessLost { id } => {
                let lost = {
                    let mut instances = self.instances.write().await;
                    match instances.get(&id).map(|i| i.status) {
                        // stop() owns the instance and finishes the cleanup
                        Some(InstanceStatus::Stopping) | None => None,
                        Some(_) => instances.remove(&id).map(|mut instance| {
                            instance.mark_stopped();
                            instance
                        }),
                    }
                };
                let Some(instance) = lost else {
                    return;
                };

                self.monitors.lock().await.remove(&id);
                warn!("Instance {} ({}) exited on its own", id, instance.account);
                self.release_account(&instance.account, id, instance.session_secs());
                self.record(Some(id), &instance.account, InstanceEvent::ProcessLost, None);
            }
        }
    }

    /// Clear the account link once and credit the session time
    fn release_account(&self, account: &str, id: InstanceId, session_secs: u64) {
        if self.accounts.detach_instance(account, id) {
            if let Err(e) = self.accounts.add_playtime(account, session_secs) {
                warn!("Failed to record playtime for {}: {}", account, e);
            }
        }
    }

    fn record(&self, id: Option<InstanceId>, account: &str, event: InstanceEvent, details: Option<&str>) {
        if let Some(history) = &self.history {
            if let Err(e) = history.record_instance_event(id, account, event, details) {
                warn!("Failed to record {:?} for {}: {}", event, account, e);
            }
        }
    }
}

async fn event_loop(registry: Weak<Registry>, mut rx: mpsc::UnboundedReceiver<MonitorEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.handle_event(event).await;
    }
    debug!("Registry event loop finished");
}

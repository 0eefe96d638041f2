//! Orchestrator - Owns every fleet component and exposes the command/query surface

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::account::Account;
use super::bypass::{BypassConfig, BypassController, BypassStatus, LockBackend};
use super::error::{FleetError, FleetResult};
use super::instance::{Instance, InstanceId, LaunchTarget};
use super::launch::{launch_batch, BatchOutcome};
use super::process::{ApiLauncher, Launcher, LocalLauncher, ProcessHost, SystemProcessHost};
use super::registry::{Registry, RegistryConfig, RegistryDeps};
use super::resource::SystemPerformance;
use super::settings::Settings;
use super::sync::{
    CommandSink, DispatchReport, NoopSink, SyncCoordinator, SyncRole, SyncStatus, DEFAULT_GROUP,
};
use crate::persistence::{AccountStore, Database};
use crate::platform;

/// Bypass summary for status consumers
#[derive(Debug, Clone, Serialize)]
pub struct MutexStatus {
    pub active: bool,
    pub methods_available: Vec<&'static str>,
    pub current_method: Option<&'static str>,
    pub leases_count: usize,
}

/// Injectable collaborators
pub struct Collaborators {
    pub lock_backend: Arc<dyn LockBackend>,
    pub primary: Arc<dyn Launcher>,
    pub fallback: Arc<dyn Launcher>,
    pub host: Arc<dyn ProcessHost>,
    pub sink: Arc<dyn CommandSink>,
    pub history: Option<Arc<Database>>,
}

impl Collaborators {
    /// Real platform backends configured from settings
    pub fn system(settings: &Settings, history: Option<Arc<Database>>) -> anyhow::Result<Self> {
        let primary = ApiLauncher::new(
            settings.launch_api_url.clone(),
            Duration::from_millis(settings.launch_api_timeout_ms),
        )?;
        Ok(Self {
            lock_backend: platform::default_lock_backend(&settings.get_locks_directory()),
            primary: Arc::new(primary),
            fallback: Arc::new(LocalLauncher::new(
                settings.client_install_dirs.clone(),
                settings.client_executable.clone(),
            )),
            host: Arc::new(SystemProcessHost::new()),
            sink: Arc::new(NoopSink),
            history,
        })
    }
}

pub struct Orchestrator {
    settings: Settings,
    accounts: Arc<AccountStore>,
    bypass: Arc<BypassController>,
    registry: Arc<Registry>,
    sync: SyncCoordinator,
    host: Arc<dyn ProcessHost>,
    history: Option<Arc<Database>>,
}

impl Orchestrator {
    /// Wire the components together; must run inside a tokio runtime
    pub fn new(settings: Settings, accounts: Arc<AccountStore>, collaborators: Collaborators) -> Self {
        let bypass = Arc::new(BypassController::new(
            collaborators.lock_backend,
            BypassConfig::from_settings(&settings),
        ));

        let registry = Registry::start(
            RegistryConfig::from_settings(&settings),
            RegistryDeps {
                accounts: accounts.clone(),
                bypass: bypass.clone(),
                primary: collaborators.primary,
                fallback: collaborators.fallback,
                host: collaborators.host.clone(),
                history: collaborators.history.clone(),
            },
        );

        let sync = SyncCoordinator::new(
            accounts.clone(),
            collaborators.sink,
            settings.delivery_timeout(),
        );

        Self {
            settings,
            accounts,
            bypass,
            registry,
            sync,
            host: collaborators.host,
            history: collaborators.history,
        }
    }

    /// Load accounts from the data directory and use the real platform backends
    pub fn with_system(settings: Settings, history: Option<Arc<Database>>) -> anyhow::Result<Self> {
        let accounts_file = settings.get_accounts_file();
        let accounts = AccountStore::load(&accounts_file)
            .with_context(|| format!("Failed to load accounts from {:?}", accounts_file))?;
        let collaborators = Collaborators::system(&settings, history)?;
        Ok(Self::new(settings, Arc::new(accounts), collaborators))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // === Commands ===

    pub fn register_account(
        &self,
        username: &str,
        display_name: Option<String>,
        authenticated: bool,
    ) -> FleetResult<Account> {
        self.accounts.register(username, display_name, authenticated)
    }

    pub async fn activate_bypass(&self) -> FleetResult<BypassStatus> {
        self.bypass.activate().await
    }

    pub async fn deactivate_bypass(&self) -> BypassStatus {
        self.bypass.deactivate().await
    }

    /// Launch one instance; `url` defaults to the configured target
    pub async fn launch(&self, account: &str, url: Option<&str>) -> FleetResult<InstanceId> {
        self.registry.launch(account, self.target(url)).await
    }

    /// Launch several accounts in order; `delay` defaults to the configured launch delay
    pub async fn launch_batch(
        &self,
        accounts: &[String],
        url: Option<&str>,
        delay: Option<Duration>,
    ) -> FleetResult<BatchOutcome> {
        if !self.bypass.is_active().await {
            self.bypass.activate().await?;
        }
        let delay = delay.unwrap_or_else(|| self.settings.launch_delay());
        Ok(launch_batch(&self.registry, accounts, &self.target(url), delay).await)
    }

    pub async fn stop(&self, id: InstanceId) -> bool {
        self.registry.stop(id).await
    }

    pub async fn stop_all(&self) -> usize {
        self.registry.stop_all().await
    }

    pub async fn enable_sync(&self) {
        self.sync.enable().await;
    }

    /// Disable coordination; roles and automation flags are cleared
    pub async fn disable_sync(&self) {
        self.sync.disable().await;
        self.registry.clear_automation().await;
    }

    /// Make `leader` lead `followers` in the default group
    pub async fn set_shadow_group(&self, leader: &str, followers: &[String]) -> FleetResult<()> {
        if !self.sync.is_enabled().await {
            return Err(FleetError::SyncNotEnabled);
        }
        for account in std::iter::once(leader).chain(followers.iter().map(String::as_str)) {
            if !self.accounts.contains(account) {
                return Err(FleetError::AccountNotFound(account.to_string()));
            }
        }

        let follow_time = self.settings.max_follow_time();
        self.sync
            .set_role(leader, DEFAULT_GROUP, SyncRole::Leader, follow_time)
            .await?;
        for follower in followers {
            self.sync
                .set_role(follower, DEFAULT_GROUP, SyncRole::Follower, follow_time)
                .await?;
        }

        for account in std::iter::once(leader).chain(followers.iter().map(String::as_str)) {
            if !self.registry.set_automation(account, true).await {
                info!("{} has no running instance yet", account);
            }
        }
        info!("Shadow group: {} leads {:?}", leader, followers);
        Ok(())
    }

    /// Fan a command out to the current followers and log it
    pub async fn dispatch(&self, kind: &str, params: Map<String, Value>) -> FleetResult<DispatchReport> {
        let report = self.sync.dispatch(kind, params).await?;
        if let Some(history) = &self.history {
            if let Err(e) = history.record_command(&report) {
                warn!("Failed to log command: {}", e);
            }
        }
        Ok(report)
    }

    /// Stop everything, release the bypass and persist accounts
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let stopped = self.registry.stop_all().await;
        info!("Stopped {} instance(s)", stopped);
        self.sync.disable().await;
        self.bypass.deactivate().await;
        self.accounts.save()?;
        Ok(())
    }

    // === Queries ===

    pub async fn list_instances(&self) -> Vec<Instance> {
        self.registry.list_instances().await
    }

    pub async fn mutex_status(&self) -> MutexStatus {
        let status = self.bypass.status().await;
        let current_method = if !status.active {
            None
        } else if let Some(lease) = status.leases.first() {
            Some(lease.method.label())
        } else {
            Some("keep-alive")
        };
        MutexStatus {
            active: status.active,
            methods_available: self.bypass.methods_available(),
            current_method,
            leases_count: status.lease_count,
        }
    }

    pub async fn sync_status(&self) -> SyncStatus {
        self.sync
            .status(self.registry.automation_count().await)
            .await
    }

    /// System load plus averages over the running instances
    pub async fn system_performance(&self) -> SystemPerformance {
        let load = self.host.system_load();
        let instances = self.registry.list_instances().await;
        SystemPerformance::summarize(
            load,
            &instances,
            self.bypass.is_active().await,
            self.settings.protection_enabled,
        )
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.accounts.list()
    }

    fn target(&self, url: Option<&str>) -> LaunchTarget {
        LaunchTarget::new(url.unwrap_or(&self.settings.default_target_url))
    }
}

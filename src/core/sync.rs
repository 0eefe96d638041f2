//! Coordination bus - Leader/follower roles and command fan-out
//!
//! Roles expire `max_follow_time` after assignment. A dispatch snapshots the live followers
//! whose group still has a live leader, releases the lock, then delivers to each target
//! concurrently with its own timeout.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{FleetError, FleetResult};
use super::instance::InstanceId;
use crate::persistence::AccountStore;

/// Group used when none is given
pub const DEFAULT_GROUP: &str = "default";

/// Size of the recent-commands log
const RECENT_COMMANDS: usize = 20;

/// Deadline used when `max_follow_time` does not fit the clock
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRole {
    None,
    Leader,
    Follower,
}

/// An account's role within a coordination group
#[derive(Debug, Clone, Serialize)]
pub struct RoleAssignment {
    pub account: String,
    pub group: String,
    pub role: SyncRole,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    deadline: Instant,
}

impl RoleAssignment {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

/// Closed set of coordinated commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    MoveToArea,
    StartActivity,
    ConvertResource,
    EmergencyStop,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MoveToArea => "move_to_area",
            Self::StartActivity => "start_activity",
            Self::ConvertResource => "convert_resource",
            Self::EmergencyStop => "emergency_stop",
        }
    }
}

impl FromStr for CommandKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "move_to_area" | "gather_field" => Ok(Self::MoveToArea),
            "start_activity" | "hatch_eggs" => Ok(Self::StartActivity),
            "convert_resource" | "convert_honey" => Ok(Self::ConvertResource),
            "emergency_stop" => Ok(Self::EmergencyStop),
            _ => Err(FleetError::UnknownCommand(s.to_string())),
        }
    }
}

/// A command as dispatched; never mutated afterwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatedCommand {
    pub kind: CommandKind,
    pub params: Map<String, Value>,
    pub dispatched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DeliveryResult {
    Ok,
    Error(String),
}

impl DeliveryResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Per-target outcome of one dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    pub command: CoordinatedCommand,
    pub results: BTreeMap<String, DeliveryResult>,
}

impl DispatchReport {
    /// Accounts whose delivery failed
    pub fn failed(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, result)| !result.is_ok())
            .map(|(account, _)| account.as_str())
            .collect()
    }

    pub fn delivered_count(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }
}

/// Where a command is being delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub account: String,
    pub instance: InstanceId,
}

/// Receives coordinated commands for one instance.
///
/// The default implementation accepts every command and only logs it, so a collaborator
/// without an automation hook still participates in dispatch.
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn deliver(
        &self,
        target: &DeliveryTarget,
        command: &CoordinatedCommand,
    ) -> anyhow::Result<()> {
        debug!(
            "No command sink configured; {} for {} accepted",
            command.kind.as_str(),
            target.account
        );
        Ok(())
    }
}

/// Sink that uses the default no-op delivery
pub struct NoopSink;

impl CommandSink for NoopSink {}

/// Bus state snapshot
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub active: bool,
    pub synchronized_instance_count: usize,
    pub recent_commands: Vec<CoordinatedCommand>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

struct SyncInner {
    enabled: bool,
    /// One role per account
    roles: HashMap<String, RoleAssignment>,
    recent: VecDeque<CoordinatedCommand>,
    last_sync_time: Option<DateTime<Utc>>,
}

impl SyncInner {
    fn prune_expired(&mut self) {
        self.roles.retain(|account, role| {
            let keep = !role.is_expired();
            if !keep {
                debug!("Role of {} in '{}' expired", account, role.group);
            }
            keep
        });
    }
}

pub struct SyncCoordinator {
    accounts: Arc<AccountStore>,
    sink: Arc<dyn CommandSink>,
    delivery_timeout: Duration,
    inner: Mutex<SyncInner>,
}

impl SyncCoordinator {
    pub fn new(
        accounts: Arc<AccountStore>,
        sink: Arc<dyn CommandSink>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            accounts,
            sink,
            delivery_timeout,
            inner: Mutex::new(SyncInner {
                enabled: false,
                roles: HashMap::new(),
                recent: VecDeque::with_capacity(RECENT_COMMANDS),
                last_sync_time: None,
            }),
        }
    }

    pub async fn enable(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.enabled {
            inner.enabled = true;
            info!("Coordination enabled");
        }
    }

    /// Disable coordination and drop every role
    pub async fn disable(&self) {
        let mut inner = self.inner.lock().await;
        inner.enabled = false;
        inner.roles.clear();
        info!("Coordination disabled");
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.lock().await.enabled
    }

    /// Assign a role; a new leader demotes the previous one, `None` removes the role
    pub async fn set_role(
        &self,
        account: &str,
        group: &str,
        role: SyncRole,
        max_follow_time: Duration,
    ) -> FleetResult<()> {
        let mut inner = self.inner.lock().await;
        if !inner.enabled {
            return Err(FleetError::SyncNotEnabled);
        }

        if role == SyncRole::None {
            inner.roles.remove(account);
            debug!("Cleared role of {}", account);
            return Ok(());
        }

        if role == SyncRole::Leader {
            let previous: Vec<String> = inner
                .roles
                .values()
                .filter(|r| r.group == group && r.role == SyncRole::Leader && r.account != account)
                .map(|r| r.account.clone())
                .collect();
            for prev in previous {
                info!("Demoting previous leader {} of '{}'", prev, group);
                inner.roles.remove(&prev);
            }
        }

        let now = Instant::now();
        let deadline = now
            .checked_add(max_follow_time)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let activated_at = Utc::now();
        let expires_at = chrono::Duration::from_std(max_follow_time)
            .ok()
            .and_then(|d| activated_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        inner.roles.insert(
            account.to_string(),
            RoleAssignment {
                account: account.to_string(),
                group: group.to_string(),
                role,
                activated_at,
                expires_at,
                deadline,
            },
        );
        info!("{} is now {:?} in '{}'", account, role, group);
        Ok(())
    }

    /// Unexpired roles
    pub async fn roles(&self) -> Vec<RoleAssignment> {
        let mut inner = self.inner.lock().await;
        inner.prune_expired();
        let mut roles: Vec<_> = inner.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.account.cmp(&b.account));
        roles
    }

    pub async fn leader_of(&self, group: &str) -> Option<String> {
        let mut inner = self.inner.lock().await;
        inner.prune_expired();
        inner
            .roles
            .values()
            .find(|r| r.group == group && r.role == SyncRole::Leader)
            .map(|r| r.account.clone())
    }

    /// Fan a command out to every live follower
    pub async fn dispatch(&self, kind: &str, params: Map<String, Value>) -> FleetResult<DispatchReport> {
        let (command, targets) = {
            let mut inner = self.inner.lock().await;
            if !inner.enabled {
                return Err(FleetError::SyncNotEnabled);
            }
            let kind: CommandKind = kind.parse()?;

            inner.prune_expired();
            let followers: Vec<&RoleAssignment> = inner
                .roles
                .values()
                .filter(|r| r.role == SyncRole::Follower)
                .collect();
            if followers.is_empty() {
                return Err(FleetError::NoActiveFollowers);
            }

            let led_groups: HashSet<&str> = inner
                .roles
                .values()
                .filter(|r| r.role == SyncRole::Leader)
                .map(|r| r.group.as_str())
                .collect();

            let mut targets = Vec::new();
            for follower in followers {
                if led_groups.contains(follower.group.as_str()) {
                    targets.push(follower.account.clone());
                } else {
                    debug!("Skipping {}: no live leader in '{}'", follower.account, follower.group);
                }
            }
            targets.sort();

            let command = CoordinatedCommand {
                kind,
                params,
                dispatched_at: Utc::now(),
            };
            (command, targets)
        };

        let deliveries = targets.iter().map(|account| self.deliver_one(account, &command));
        let results: BTreeMap<String, DeliveryResult> =
            targets.iter().cloned().zip(join_all(deliveries).await).collect();

        let report = DispatchReport { command, results };
        let failed = report.failed();
        if failed.is_empty() {
            info!(
                "Dispatched {} to {} follower(s)",
                report.command.kind.as_str(),
                report.results.len()
            );
        } else {
            warn!(
                "Dispatched {}: delivery failed for {:?}",
                report.command.kind.as_str(),
                failed
            );
        }

        let mut inner = self.inner.lock().await;
        if inner.recent.len() == RECENT_COMMANDS {
            inner.recent.pop_front();
        }
        inner.recent.push_back(report.command.clone());
        inner.last_sync_time = Some(report.command.dispatched_at);
        Ok(report)
    }

    async fn deliver_one(&self, account: &str, command: &CoordinatedCommand) -> DeliveryResult {
        let Some(instance) = self.accounts.active_instance(account) else {
            return DeliveryResult::Error(format!("{} has no active instance", account));
        };
        let target = DeliveryTarget {
            account: account.to_string(),
            instance,
        };

        match tokio::time::timeout(self.delivery_timeout, self.sink.deliver(&target, command)).await {
            Ok(Ok(())) => DeliveryResult::Ok,
            Ok(Err(e)) => DeliveryResult::Error(e.to_string()),
            Err(_) => DeliveryResult::Error(format!(
                "delivery timed out after {}ms",
                self.delivery_timeout.as_millis()
            )),
        }
    }

    /// Most recent commands, oldest first
    pub async fn recent_commands(&self) -> Vec<CoordinatedCommand> {
        self.inner.lock().await.recent.iter().cloned().collect()
    }

    pub async fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().await.last_sync_time
    }

    pub async fn status(&self, synchronized_instance_count: usize) -> SyncStatus {
        let inner = self.inner.lock().await;
        SyncStatus {
            active: inner.enabled,
            synchronized_instance_count,
            recent_commands: inner.recent.iter().cloned().collect(),
            last_sync_time: inner.last_sync_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOLLOW: Duration = Duration::from_secs(900);

    struct FailingFor(&'static str);

    #[async_trait]
    impl CommandSink for FailingFor {
        async fn deliver(
            &self,
            target: &DeliveryTarget,
            _command: &CoordinatedCommand,
        ) -> anyhow::Result<()> {
            if target.account == self.0 {
                anyhow::bail!("instance unresponsive");
            }
            Ok(())
        }
    }

    struct Hanging;

    #[async_trait]
    impl CommandSink for Hanging {
        async fn deliver(
            &self,
            _target: &DeliveryTarget,
            _command: &CoordinatedCommand,
        ) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn accounts(names: &[&str]) -> (tempfile::TempDir, Arc<AccountStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path().join("accounts.json")).unwrap();
        for name in names {
            store.register(name, None, true).unwrap();
            store.attach_instance(name, InstanceId::new()).unwrap();
        }
        (dir, Arc::new(store))
    }

    async fn group(sink: Arc<dyn CommandSink>) -> (tempfile::TempDir, SyncCoordinator) {
        let (dir, store) = accounts(&["A", "B", "C"]);
        let sync = SyncCoordinator::new(store, sink, Duration::from_secs(5));
        sync.enable().await;
        sync.set_role("A", DEFAULT_GROUP, SyncRole::Leader, FOLLOW).await.unwrap();
        sync.set_role("B", DEFAULT_GROUP, SyncRole::Follower, FOLLOW).await.unwrap();
        sync.set_role("C", DEFAULT_GROUP, SyncRole::Follower, FOLLOW).await.unwrap();
        (dir, sync)
    }

    #[test]
    fn command_aliases_parse() {
        assert_eq!("gather_field".parse::<CommandKind>().unwrap(), CommandKind::MoveToArea);
        assert_eq!("hatch_eggs".parse::<CommandKind>().unwrap(), CommandKind::StartActivity);
        assert_eq!("convert_honey".parse::<CommandKind>().unwrap(), CommandKind::ConvertResource);
        assert_eq!("emergency_stop".parse::<CommandKind>().unwrap().as_str(), "emergency_stop");
        assert!(matches!(
            "dance".parse::<CommandKind>(),
            Err(FleetError::UnknownCommand(_))
        ));
    }

    #[tokio::test]
    async fn dispatch_requires_enabled_bus() {
        let (_dir, store) = accounts(&["A"]);
        let sync = SyncCoordinator::new(store, Arc::new(NoopSink), Duration::from_secs(5));
        assert!(matches!(
            sync.dispatch("gather_field", Map::new()).await,
            Err(FleetError::SyncNotEnabled)
        ));
        assert!(sync.recent_commands().await.is_empty());
        assert!(sync.last_sync_time().await.is_none());
    }

    #[tokio::test]
    async fn partial_failure_is_reported_per_target() {
        let (_dir, sync) = group(Arc::new(FailingFor("B"))).await;

        let report = sync.dispatch("gather_field", Map::new()).await.unwrap();
        assert_eq!(report.command.kind, CommandKind::MoveToArea);
        assert!(matches!(report.results["B"], DeliveryResult::Error(_)));
        assert_eq!(report.results["C"], DeliveryResult::Ok);
        assert!(!report.results.contains_key("A"));

        let again = sync.dispatch("hatch_eggs", Map::new()).await.unwrap();
        assert_eq!(again.results["C"], DeliveryResult::Ok);
        assert_eq!(sync.recent_commands().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_follower_is_excluded() {
        let (_dir, sync) = group(Arc::new(NoopSink)).await;
        sync.set_role("A", DEFAULT_GROUP, SyncRole::Leader, Duration::from_secs(3600))
            .await
            .unwrap();
        sync.set_role("B", DEFAULT_GROUP, SyncRole::Follower, Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let report = sync.dispatch("gather_field", Map::new()).await.unwrap();
        assert!(!report.results.contains_key("B"));
        assert!(report.results.contains_key("C"));

        tokio::time::advance(FOLLOW).await;
        assert!(matches!(
            sync.dispatch("gather_field", Map::new()).await,
            Err(FleetError::NoActiveFollowers)
        ));
    }

    #[tokio::test]
    async fn unbounded_follow_time_never_expires() {
        let (_dir, store) = accounts(&["A", "B"]);
        let sync = SyncCoordinator::new(store, Arc::new(NoopSink), Duration::from_secs(5));
        sync.enable().await;
        sync.set_role("A", DEFAULT_GROUP, SyncRole::Leader, Duration::MAX)
            .await
            .unwrap();
        sync.set_role("B", DEFAULT_GROUP, SyncRole::Follower, Duration::from_secs(u64::MAX))
            .await
            .unwrap();

        let roles = sync.roles().await;
        assert_eq!(roles.len(), 2);
        assert!(roles.iter().all(|r| r.expires_at == DateTime::<Utc>::MAX_UTC));
        assert!(roles.iter().all(|r| !r.is_expired()));

        let report = sync.dispatch("gather_field", Map::new()).await.unwrap();
        assert_eq!(report.results["B"], DeliveryResult::Ok);
    }

    #[tokio::test]
    async fn followers_without_leader_are_dropped() {
        let (_dir, sync) = group(Arc::new(NoopSink)).await;
        sync.set_role("A", DEFAULT_GROUP, SyncRole::None, FOLLOW).await.unwrap();

        let report = sync.dispatch("convert_honey", Map::new()).await.unwrap();
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn new_leader_demotes_previous() {
        let (_dir, sync) = group(Arc::new(NoopSink)).await;
        sync.set_role("C", DEFAULT_GROUP, SyncRole::Leader, FOLLOW).await.unwrap();

        assert_eq!(sync.leader_of(DEFAULT_GROUP).await.as_deref(), Some("C"));
        let leaders = sync
            .roles()
            .await
            .into_iter()
            .filter(|r| r.role == SyncRole::Leader)
            .count();
        assert_eq!(leaders, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_target_times_out() {
        let (_dir, sync) = group(Arc::new(Hanging)).await;
        let report = sync.dispatch("emergency_stop", Map::new()).await.unwrap();
        assert_eq!(report.failed(), vec!["B", "C"]);
        assert_eq!(report.delivered_count(), 0);
    }

    #[tokio::test]
    async fn recent_commands_are_bounded() {
        let (_dir, sync) = group(Arc::new(NoopSink)).await;
        for _ in 0..25 {
            sync.dispatch("start_activity", Map::new()).await.unwrap();
        }
        assert_eq!(sync.recent_commands().await.len(), RECENT_COMMANDS);
        assert!(sync.last_sync_time().await.is_some());

        sync.disable().await;
        assert!(sync.roles().await.is_empty());
        assert!(!sync.status(0).await.active);
    }
}

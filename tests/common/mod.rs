//! In-memory collaborators for fleet integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use multifleet::core::bypass::LeaseToken;
use multifleet::core::sync::{CoordinatedCommand, DeliveryTarget};
use multifleet::core::{
    Collaborators, CommandKind, CommandSink, LaunchMethod, LaunchOutcome, LaunchRequest, Launcher,
    LeaseMethod, LockBackend, Orchestrator, ProcessHost, ResourceUsage, Settings, SystemLoad,
};
use multifleet::persistence::{AccountStore, Database};

/// Named objects that always claim fresh
#[derive(Default)]
pub struct FakeLocks {
    held: Mutex<HashMap<LeaseToken, String>>,
    next: AtomicU64,
}

impl FakeLocks {
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }
}

impl LockBackend for FakeLocks {
    fn methods(&self) -> Vec<&'static str> {
        vec!["fake-mutex"]
    }

    fn claim(&self, name: &str) -> anyhow::Result<(LeaseToken, LeaseMethod)> {
        let token = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.held.lock().unwrap().insert(token, name.to_string());
        Ok((token, LeaseMethod::ClaimedNew))
    }

    fn release(&self, token: LeaseToken) -> anyhow::Result<()> {
        self.held
            .lock()
            .unwrap()
            .remove(&token)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("unknown token"))
    }

    fn create_keep_alive(&self) -> anyhow::Result<LeaseToken> {
        Ok(0)
    }

    fn destroy_keep_alive(&self, _token: LeaseToken) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Process table simulated in memory
#[derive(Default)]
pub struct FakeHost {
    alive: Mutex<HashSet<u32>>,
    /// Processes that ignore graceful termination
    stubborn: Mutex<HashSet<u32>>,
    killed: Mutex<Vec<u32>>,
}

impl FakeHost {
    pub fn spawn(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    /// The process exits on its own
    pub fn exit(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }

    pub fn make_stubborn(&self, pid: u32) {
        self.stubborn.lock().unwrap().insert(pid);
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }
}

impl ProcessHost for FakeHost {
    fn sample(&self, pid: u32) -> Option<ResourceUsage> {
        self.alive
            .lock()
            .unwrap()
            .contains(&pid)
            .then(|| ResourceUsage::from_bytes(5.0, 256 * 1024 * 1024))
    }

    fn is_running(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn terminate(&self, pid: u32) -> anyhow::Result<()> {
        if !self.stubborn.lock().unwrap().contains(&pid) {
            self.alive.lock().unwrap().remove(&pid);
        }
        Ok(())
    }

    fn kill(&self, pid: u32) -> anyhow::Result<()> {
        self.alive.lock().unwrap().remove(&pid);
        self.killed.lock().unwrap().push(pid);
        Ok(())
    }

    fn priority(&self, _pid: u32) -> Option<i32> {
        Some(0)
    }

    fn set_priority(&self, _pid: u32, _priority: i32) -> anyhow::Result<()> {
        Ok(())
    }

    fn system_load(&self) -> SystemLoad {
        SystemLoad {
            cpu_percent: 30.0,
            total_memory: 8 * 1024 * 1024 * 1024,
            used_memory: 2 * 1024 * 1024 * 1024,
        }
    }
}

/// Launcher with scripted failures; spawns into a [`FakeHost`] when it tracks processes
pub struct FakeLauncher {
    name: &'static str,
    method: LaunchMethod,
    fail_all: bool,
    fail_for: HashSet<String>,
    host: Option<Arc<FakeHost>>,
    next_pid: AtomicU32,
    calls: AtomicU32,
    /// Held launches wait here until [`FakeLauncher::release`]
    gate: Option<Notify>,
    entered: Notify,
}

impl FakeLauncher {
    fn new(name: &'static str, method: LaunchMethod, host: Option<Arc<FakeHost>>, first_pid: u32) -> Self {
        Self {
            name,
            method,
            fail_all: false,
            fail_for: HashSet::new(),
            host,
            next_pid: AtomicU32::new(first_pid),
            calls: AtomicU32::new(0),
            gate: None,
            entered: Notify::new(),
        }
    }

    pub fn failing(name: &'static str) -> Self {
        Self {
            fail_all: true,
            ..Self::new(name, LaunchMethod::Api, None, 1000)
        }
    }

    /// Launch API that reports a PID
    pub fn api(host: Arc<FakeHost>) -> Self {
        Self::new("fake-api", LaunchMethod::Api, Some(host), 5000)
    }

    /// Launch API that blocks every launch until released
    pub fn gated(host: Arc<FakeHost>) -> Self {
        Self {
            gate: Some(Notify::new()),
            ..Self::api(host)
        }
    }

    pub fn tracked(host: Arc<FakeHost>, fail_for: &[&str]) -> Self {
        Self {
            fail_for: fail_for.iter().map(|s| s.to_string()).collect(),
            ..Self::new("fake-direct", LaunchMethod::DirectProcess, Some(host), 1000)
        }
    }

    pub fn untracked() -> Self {
        Self::new("fake-protocol", LaunchMethod::ProtocolHandler, None, 1000)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Resolves once a launch is waiting at the gate
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn launch(&self, request: &LaunchRequest) -> anyhow::Result<LaunchOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            self.entered.notify_one();
            gate.notified().await;
        }
        if self.fail_all || self.fail_for.contains(&request.account) {
            anyhow::bail!("{} refused {}", self.name, request.account);
        }
        let pid = self.host.as_ref().map(|host| {
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            host.spawn(pid);
            pid
        });
        Ok(LaunchOutcome {
            method: self.method,
            pid,
        })
    }
}

/// Sink that records deliveries and fails for selected accounts
#[derive(Default)]
pub struct ScriptedSink {
    fail_for: HashSet<String>,
    delivered: Mutex<Vec<(String, CommandKind)>>,
}

impl ScriptedSink {
    pub fn failing_for(accounts: &[&str]) -> Self {
        Self {
            fail_for: accounts.iter().map(|s| s.to_string()).collect(),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn delivered(&self) -> Vec<(String, CommandKind)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandSink for ScriptedSink {
    async fn deliver(
        &self,
        target: &DeliveryTarget,
        command: &CoordinatedCommand,
    ) -> anyhow::Result<()> {
        if self.fail_for.contains(&target.account) {
            anyhow::bail!("{} did not acknowledge", target.account);
        }
        self.delivered
            .lock()
            .unwrap()
            .push((target.account.clone(), command.kind));
        Ok(())
    }
}

/// How the primary (launch API) path behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryMode {
    Failing,
    Succeeding,
    Gated,
}

/// How the test fleet should behave
pub struct FleetOptions {
    pub settings: Settings,
    pub primary: PrimaryMode,
    /// Accounts the fallback launcher refuses
    pub fallback_fails_for: Vec<&'static str>,
    /// Fallback produces no PID
    pub untracked: bool,
    pub sink_fails_for: Vec<&'static str>,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            settings: Settings {
                jitter_min_ms: 0,
                jitter_max_ms: 0,
                stop_grace_ms: 1_000,
                ..Default::default()
            },
            primary: PrimaryMode::Failing,
            fallback_fails_for: Vec::new(),
            untracked: false,
            sink_fails_for: Vec::new(),
        }
    }
}

pub struct Fleet {
    pub orchestrator: Orchestrator,
    pub primary: Arc<FakeLauncher>,
    pub fallback: Arc<FakeLauncher>,
    pub host: Arc<FakeHost>,
    pub locks: Arc<FakeLocks>,
    pub sink: Arc<ScriptedSink>,
    pub history: Arc<Database>,
    pub dir: TempDir,
}

impl Fleet {
    pub fn accounts_file(&self) -> std::path::PathBuf {
        self.dir.path().join("accounts.json")
    }
}

/// Orchestrator over in-memory collaborators; by default the primary launcher always fails,
/// so every launch takes the fallback
pub fn fleet(options: FleetOptions) -> Fleet {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = options.settings;
    settings.data_directory = Some(dir.path().to_path_buf());

    let host = Arc::new(FakeHost::default());
    let locks = Arc::new(FakeLocks::default());
    let sink = Arc::new(ScriptedSink::failing_for(&options.sink_fails_for));
    let history = Arc::new(Database::open_in_memory().unwrap());
    history.initialize().unwrap();

    let primary = Arc::new(match options.primary {
        PrimaryMode::Failing => FakeLauncher::failing("fake-api"),
        PrimaryMode::Succeeding => FakeLauncher::api(host.clone()),
        PrimaryMode::Gated => FakeLauncher::gated(host.clone()),
    });
    let fallback = Arc::new(if options.untracked {
        FakeLauncher::untracked()
    } else {
        FakeLauncher::tracked(host.clone(), &options.fallback_fails_for)
    });

    let accounts = Arc::new(AccountStore::load(settings.get_accounts_file()).unwrap());
    let orchestrator = Orchestrator::new(
        settings,
        accounts,
        Collaborators {
            lock_backend: locks.clone(),
            primary: primary.clone(),
            fallback: fallback.clone(),
            host: host.clone(),
            sink: sink.clone(),
            history: Some(history.clone()),
        },
    );

    Fleet {
        orchestrator,
        primary,
        fallback,
        host,
        locks,
        sink,
        history,
        dir,
    }
}

/// Register every name as an account
pub fn register(fleet: &Fleet, names: &[&str]) -> Vec<String> {
    names
        .iter()
        .map(|name| {
            fleet.orchestrator.register_account(name, None, true).unwrap();
            name.to_string()
        })
        .collect()
}

//! JSON-backed account store
//!
//! The whole map is rewritten on every mutation; the file is a JSON object keyed by username.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::core::account::Account;
use crate::core::error::{FleetError, FleetResult};
use crate::core::instance::InstanceId;

/// Accounts keyed by username, persisted to a single JSON file
pub struct AccountStore {
    path: PathBuf,
    accounts: RwLock<BTreeMap<String, Account>>,
}

impl AccountStore {
    /// Load the store from `path`, starting empty if the file does not exist
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let accounts = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read accounts file {:?}", path))?;
            let accounts: BTreeMap<String, Account> =
                serde_json::from_str(&raw).context("Failed to deserialize accounts")?;
            info!("Loaded {} accounts from {:?}", accounts.len(), path);
            accounts
        } else {
            debug!("No accounts file at {:?}, starting empty", path);
            BTreeMap::new()
        };

        Ok(Self {
            path,
            accounts: RwLock::new(accounts),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a new account and persist
    pub fn register(
        &self,
        username: &str,
        display_name: Option<String>,
        authenticated: bool,
    ) -> FleetResult<Account> {
        let account = {
            let mut accounts = self.write()?;
            if accounts.contains_key(username) {
                return Err(FleetError::AccountExists(username.to_string()));
            }
            let account = Account::new(username, display_name, authenticated);
            accounts.insert(username.to_string(), account.clone());
            account
        };
        self.save()?;
        info!("Registered account {} ({})", username, account.account_id);
        Ok(account)
    }

    pub fn get(&self, username: &str) -> Option<Account> {
        self.accounts.read().ok()?.get(username).cloned()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.accounts
            .read()
            .map(|a| a.contains_key(username))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<Account> {
        self.accounts
            .read()
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Active instance linked to the account, if any
    pub fn active_instance(&self, username: &str) -> Option<InstanceId> {
        self.accounts
            .read()
            .ok()?
            .get(username)
            .and_then(|a| a.active_instance)
    }

    /// Link an instance to the account; an existing link must be cleared first
    pub fn attach_instance(&self, username: &str, id: InstanceId) -> FleetResult<()> {
        let mut accounts = self.write()?;
        let account = accounts
            .get_mut(username)
            .ok_or_else(|| FleetError::AccountNotFound(username.to_string()))?;
        match account.active_instance {
            Some(existing) if existing != id => Err(FleetError::AccountBusy {
                account: username.to_string(),
                instance: existing,
            }),
            _ => {
                account.active_instance = Some(id);
                Ok(())
            }
        }
    }

    /// Clear the link only if it still points at `id`; returns whether it was cleared
    pub fn detach_instance(&self, username: &str, id: InstanceId) -> bool {
        let Ok(mut accounts) = self.accounts.write() else {
            return false;
        };
        match accounts.get_mut(username) {
            Some(account) if account.active_instance == Some(id) => {
                account.active_instance = None;
                true
            }
            _ => false,
        }
    }

    /// Count a new session and persist
    pub fn record_session_start(&self, username: &str) -> FleetResult<()> {
        self.mutate(username, |account| account.stats.total_sessions += 1)
    }

    /// Add finished session time and persist
    pub fn add_playtime(&self, username: &str, secs: u64) -> FleetResult<()> {
        self.mutate(username, |account| {
            account.stats.total_playtime = account.stats.total_playtime.saturating_add(secs)
        })
    }

    /// Bump a domain counter and persist
    pub fn increment_counter(&self, username: &str, counter: &str, by: u64) -> FleetResult<()> {
        self.mutate(username, |account| {
            *account
                .stats
                .counters
                .entry(counter.to_string())
                .or_insert(0) += by;
        })
    }

    /// Rewrite the accounts file wholesale
    pub fn save(&self) -> Result<()> {
        let json = {
            let accounts = self
                .accounts
                .read()
                .map_err(|e| anyhow::anyhow!("Accounts lock poisoned: {}", e))?;
            serde_json::to_string_pretty(&*accounts)?
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        debug!("Accounts saved to {:?}", self.path);
        Ok(())
    }

    fn mutate(&self, username: &str, f: impl FnOnce(&mut Account)) -> FleetResult<()> {
        {
            let mut accounts = self.write()?;
            let account = accounts
                .get_mut(username)
                .ok_or_else(|| FleetError::AccountNotFound(username.to_string()))?;
            f(account);
        }
        if let Err(e) = self.save() {
            warn!("Failed to persist accounts: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Account>>> {
        self.accounts
            .write()
            .map_err(|e| anyhow::anyhow!("Accounts lock poisoned: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, AccountStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::load(dir.path().join("accounts.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn save_then_load_round_trips_accounts() {
        let (dir, store) = store();
        store.register("TestUser1", Some("Test User 1".into()), true).unwrap();
        store.register("TestUser2", None, false).unwrap();
        store.record_session_start("TestUser1").unwrap();
        store.add_playtime("TestUser1", 120).unwrap();
        store.increment_counter("TestUser2", "eggs_hatched", 5).unwrap();

        let reloaded = AccountStore::load(dir.path().join("accounts.json")).unwrap();
        assert_eq!(reloaded.list(), store.list());
        let user1 = reloaded.get("TestUser1").unwrap();
        assert_eq!(user1.display_name, "Test User 1");
        assert_eq!(user1.stats.total_sessions, 1);
        assert_eq!(user1.stats.total_playtime, 120);
        assert_eq!(reloaded.get("TestUser2").unwrap().stats.counters["eggs_hatched"], 5);
    }

    #[test]
    fn file_is_keyed_by_username() {
        let (dir, store) = store();
        store.register("alice", None, false).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("accounts.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["alice"]["username"], "alice");
        assert_eq!(json["alice"]["account_id"].as_str().unwrap().len(), 8);
        assert!(json["alice"].get("active_instance").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (_dir, store) = store();
        store.register("alice", None, false).unwrap();
        assert!(matches!(
            store.register("alice", None, false),
            Err(FleetError::AccountExists(_))
        ));
    }

    #[test]
    fn instance_link_is_one_to_one() {
        let (_dir, store) = store();
        store.register("alice", None, false).unwrap();
        let first = InstanceId::new();
        let second = InstanceId::new();

        store.attach_instance("alice", first).unwrap();
        assert!(matches!(
            store.attach_instance("alice", second),
            Err(FleetError::AccountBusy { .. })
        ));

        assert!(!store.detach_instance("alice", second));
        assert!(store.detach_instance("alice", first));
        assert!(!store.detach_instance("alice", first));
        store.attach_instance("alice", second).unwrap();
        assert_eq!(store.active_instance("alice"), Some(second));
    }
}

//! Accounts - Identities that own at most one running instance

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::instance::InstanceId;

/// Counters created for every new account
const DEFAULT_COUNTERS: &[&str] = &["eggs_hatched", "chests_opened", "pets_collected"];

/// Cumulative per-account statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStats {
    #[serde(default)]
    pub total_sessions: u64,
    /// Total playtime in seconds
    #[serde(default)]
    pub total_playtime: u64,
    /// Domain-specific counters
    #[serde(flatten)]
    pub counters: BTreeMap<String, u64>,
}

impl AccountStats {
    fn seeded() -> Self {
        Self {
            counters: DEFAULT_COUNTERS
                .iter()
                .map(|name| (name.to_string(), 0))
                .collect(),
            ..Default::default()
        }
    }
}

/// An account that can be launched into an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub display_name: String,
    /// Short deterministic id derived from the username
    pub account_id: String,
    pub is_authenticated: bool,
    #[serde(default)]
    pub stats: AccountStats,
    /// Link to the running instance; resolved through the registry, never persisted
    #[serde(skip)]
    pub active_instance: Option<InstanceId>,
}

impl Account {
    pub fn new(username: impl Into<String>, display_name: Option<String>, authenticated: bool) -> Self {
        let username = username.into();
        Self {
            display_name: display_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| username.clone()),
            account_id: derive_account_id(&username),
            username,
            is_authenticated: authenticated,
            stats: AccountStats::seeded(),
            active_instance: None,
        }
    }
}

/// First 8 hex chars of SHA-256 over the username
pub fn derive_account_id(username: &str) -> String {
    let digest = Sha256::digest(username.as_bytes());
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_id_is_deterministic() {
        let a = derive_account_id("TestUser1");
        assert_eq!(a.len(), 8);
        assert_eq!(a, derive_account_id("TestUser1"));
        assert_ne!(a, derive_account_id("TestUser2"));
    }

    #[test]
    fn display_name_defaults_to_username() {
        let account = Account::new("alice", None, false);
        assert_eq!(account.display_name, "alice");
        let account = Account::new("bob", Some("  ".into()), true);
        assert_eq!(account.display_name, "bob");
        assert!(account.is_authenticated);
    }

    #[test]
    fn stats_serialize_counters_inline() {
        let mut account = Account::new("alice", Some("Alice".into()), false);
        account.stats.total_sessions = 3;
        account.active_instance = Some(InstanceId::new());

        let json = serde_json::to_value(&account).unwrap();
        assert_eq!(json["stats"]["total_sessions"], 3);
        assert_eq!(json["stats"]["eggs_hatched"], 0);
        assert!(json.get("active_instance").is_none());

        let back: Account = serde_json::from_value(json).unwrap();
        assert_eq!(back.stats, account.stats);
        assert_eq!(back.active_instance, None);
    }
}

//! Persistence - Account file and SQLite history

pub mod accounts;
pub mod database;

pub use accounts::AccountStore;
pub use database::{Database, HistoryEntry, InstanceEvent};

//! SQLite database for settings and fleet history

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::instance::InstanceId;
use crate::core::settings::Settings;
use crate::core::sync::DispatchReport;

/// Kinds of instance lifecycle events kept in history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceEvent {
    Launched,
    LaunchFailed,
    ProcessLost,
    Stopped,
}

impl InstanceEvent {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Launched => "launched",
            Self::LaunchFailed => "launch_failed",
            Self::ProcessLost => "process_lost",
            Self::Stopped => "stopped",
        }
    }
}

/// One row of instance history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub instance_id: Option<String>,
    pub account: String,
    pub event_type: String,
    pub event_time: DateTime<Utc>,
    pub details: Option<String>,
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .context(format!("Failed to open database at {:?}", path))?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        info!("Database opened at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Default database file path under the data directory
    pub fn default_path(data_dir: &Path) -> PathBuf {
        data_dir.join("multifleet.db")
    }

    /// Initialize database schema
    pub fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instance_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT,
                account TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_time TEXT NOT NULL,
                details TEXT
            );

            CREATE TABLE IF NOT EXISTS command_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                command TEXT NOT NULL,
                dispatched_at TEXT NOT NULL,
                report TEXT NOT NULL
            );
            "#,
        )?;

        info!("Database schema initialized");
        Ok(())
    }

    // === Settings ===

    /// Load settings from database
    pub fn load_settings(&self) -> Result<Option<Settings>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = 'fleet_settings'")?;
        let result: Option<String> = stmt.query_row([], |row| row.get(0)).optional()?;

        match result {
            Some(json) => {
                let mut settings: Settings =
                    serde_json::from_str(&json).context("Failed to deserialize settings")?;
                settings.validate();
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Save settings to database
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.lock()?;
        let json = serde_json::to_string(settings)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('fleet_settings', ?1)",
            params![json],
        )?;
        debug!("Settings saved");
        Ok(())
    }

    // === History ===

    /// Append an instance lifecycle event
    pub fn record_instance_event(
        &self,
        instance_id: Option<InstanceId>,
        account: &str,
        event: InstanceEvent,
        details: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO instance_history (instance_id, account, event_type, event_time, details)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                instance_id.map(|id| id.to_string()),
                account,
                event.as_str(),
                Utc::now().to_rfc3339(),
                details,
            ],
        )?;
        Ok(())
    }

    /// Most recent instance events, newest first
    pub fn recent_instance_events(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT instance_id, account, event_type, event_time, details
             FROM instance_history ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            let event_time: String = row.get(3)?;
            Ok(HistoryEntry {
                instance_id: row.get(0)?,
                account: row.get(1)?,
                event_type: row.get(2)?,
                event_time: DateTime::parse_from_rfc3339(&event_time)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                details: row.get(4)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Append a dispatched command with its per-target report
    pub fn record_command(&self, report: &DispatchReport) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO command_log (command, dispatched_at, report) VALUES (?1, ?2, ?3)",
            params![
                report.command.kind.as_str(),
                report.command.dispatched_at.to_rfc3339(),
                serde_json::to_string(report)?,
            ],
        )?;
        Ok(())
    }

    pub fn command_count(&self) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM command_log", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }
}

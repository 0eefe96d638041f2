//! Singleton bypass - Holds the named objects a client uses to enforce a single instance
//!
//! While this process owns (or has opened) every singleton object the client checks for,
//! additional clients start normally. A keep-alive handle ties the leases to the lifetime of
//! this process. Releasing the leases lets the client's own enforcement resume, which can
//! terminate the secondary instances, so deactivation is only safe once they are gone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{FleetError, FleetResult};
use super::settings::Settings;

/// Opaque handle value issued by a [`LockBackend`]
pub type LeaseToken = u64;

/// How a lease was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaseMethod {
    /// We created the object and own it
    ClaimedNew,
    /// The object already existed (the client holds it); we opened a handle to it
    OpenedExisting,
}

impl LeaseMethod {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ClaimedNew => "claimed-new",
            Self::OpenedExisting => "opened-existing",
        }
    }
}

/// A held singleton object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutexLease {
    pub name: String,
    pub method: LeaseMethod,
    pub acquired_at: DateTime<Utc>,
    #[serde(skip)]
    token: LeaseToken,
}

/// OS primitives needed by the bypass
pub trait LockBackend: Send + Sync {
    /// Human-readable names of the techniques this backend provides
    fn methods(&self) -> Vec<&'static str>;

    /// Create-and-own the named object, or open it when it already exists
    fn claim(&self, name: &str) -> anyhow::Result<(LeaseToken, LeaseMethod)>;

    fn release(&self, token: LeaseToken) -> anyhow::Result<()>;

    /// Create the inert handle that keeps the owning process, and its leases, alive
    fn create_keep_alive(&self) -> anyhow::Result<LeaseToken>;

    fn destroy_keep_alive(&self, token: LeaseToken) -> anyhow::Result<()>;
}

/// Bypass lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BypassState {
    Inactive,
    Activating,
    Active,
    Deactivating,
}

/// Snapshot returned by [`BypassController::status`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassStatus {
    pub state: BypassState,
    pub active: bool,
    pub lease_count: usize,
    pub leases: Vec<MutexLease>,
    pub keep_alive: bool,
}

/// Bypass tuning taken from settings
#[derive(Debug, Clone)]
pub struct BypassConfig {
    pub mutex_names: Vec<String>,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl BypassConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            mutex_names: settings.mutex_names.clone(),
            jitter_min: Duration::from_millis(settings.jitter_min_ms),
            jitter_max: Duration::from_millis(settings.jitter_max_ms),
        }
    }

    /// Random delay in `[jitter_min, jitter_max)`, zero when the range is empty
    fn jitter(&self) -> Duration {
        if self.jitter_max <= self.jitter_min {
            return self.jitter_min;
        }
        let min = self.jitter_min.as_millis() as u64;
        let max = self.jitter_max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..max))
    }
}

struct BypassInner {
    state: BypassState,
    /// Leases in acquisition order
    leases: Vec<MutexLease>,
    keep_alive: Option<LeaseToken>,
}

/// Owns the lease set; activate/deactivate are the only transitions
pub struct BypassController {
    backend: Arc<dyn LockBackend>,
    config: BypassConfig,
    inner: Mutex<BypassInner>,
}

impl BypassController {
    pub fn new(backend: Arc<dyn LockBackend>, config: BypassConfig) -> Self {
        Self {
            backend,
            config,
            inner: Mutex::new(BypassInner {
                state: BypassState::Inactive,
                leases: Vec::new(),
                keep_alive: None,
            }),
        }
    }

    pub fn methods_available(&self) -> Vec<&'static str> {
        self.backend.methods()
    }

    /// Claim every configured name and the keep-alive handle
    pub async fn activate(&self) -> FleetResult<BypassStatus> {
        let mut inner = self.inner.lock().await;
        if inner.state == BypassState::Active {
            debug!("Bypass already active");
            return Ok(snapshot(&inner));
        }

        inner.state = BypassState::Activating;
        info!("Activating singleton bypass");
        tokio::time::sleep(self.config.jitter()).await;

        if inner.keep_alive.is_none() {
            match self.backend.create_keep_alive() {
                Ok(token) => {
                    debug!("Keep-alive handle created");
                    inner.keep_alive = Some(token);
                }
                Err(e) => warn!("Failed to create keep-alive handle: {}", e),
            }
        }

        let mut failures = Vec::new();
        for name in &self.config.mutex_names {
            if let Err(e) = self.claim_locked(&mut inner, name) {
                warn!("Failed to claim '{}': {}", name, e);
                failures.push(format!("{}: {}", name, e));
            }
        }

        tokio::time::sleep(self.config.jitter()).await;

        if inner.leases.is_empty() && inner.keep_alive.is_none() {
            inner.state = BypassState::Inactive;
            let reason = if failures.is_empty() {
                "no singleton names configured and no keep-alive handle".to_string()
            } else {
                failures.join("; ")
            };
            return Err(FleetError::AcquisitionFailure(reason));
        }

        inner.state = BypassState::Active;
        info!(
            "Singleton bypass active ({} leases, keep-alive: {})",
            inner.leases.len(),
            inner.keep_alive.is_some()
        );
        Ok(snapshot(&inner))
    }

    /// Claim one additional name while active; an already-held name returns its lease
    pub async fn claim(&self, name: &str) -> FleetResult<MutexLease> {
        let mut inner = self.inner.lock().await;
        self.claim_locked(&mut inner, name)
            .map_err(|e| FleetError::AcquisitionFailure(format!("{}: {}", name, e)))
    }

    /// Release every lease in reverse order and destroy the keep-alive handle.
    ///
    /// Secondary instances may terminate once the client's own enforcement resumes.
    pub async fn deactivate(&self) -> BypassStatus {
        let mut inner = self.inner.lock().await;
        if inner.state == BypassState::Inactive {
            return snapshot(&inner);
        }

        warn!("Deactivating singleton bypass - secondary instances may terminate");
        inner.state = BypassState::Deactivating;

        while let Some(lease) = inner.leases.pop() {
            match self.backend.release(lease.token) {
                Ok(()) => debug!("Released lease '{}'", lease.name),
                Err(e) => warn!("Failed to release lease '{}': {}", lease.name, e),
            }
        }

        if let Some(token) = inner.keep_alive.take() {
            if let Err(e) = self.backend.destroy_keep_alive(token) {
                warn!("Failed to destroy keep-alive handle: {}", e);
            }
        }

        inner.state = BypassState::Inactive;
        info!("Singleton bypass deactivated");
        snapshot(&inner)
    }

    pub async fn status(&self) -> BypassStatus {
        snapshot(&*self.inner.lock().await)
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.state == BypassState::Active
    }

    fn claim_locked(&self, inner: &mut BypassInner, name: &str) -> anyhow::Result<MutexLease> {
        if let Some(existing) = inner.leases.iter().find(|l| l.name == name) {
            return Ok(existing.clone());
        }

        let (token, method) = self.backend.claim(name)?;
        let lease = MutexLease {
            name: name.to_string(),
            method,
            acquired_at: Utc::now(),
            token,
        };
        info!("Lease '{}' obtained ({})", name, method.label());
        inner.leases.push(lease.clone());
        Ok(lease)
    }
}

fn snapshot(inner: &BypassInner) -> BypassStatus {
    BypassStatus {
        state: inner.state,
        active: inner.state == BypassState::Active,
        lease_count: inner.leases.len(),
        leases: inner.leases.clone(),
        keep_alive: inner.keep_alive.is_some(),
    }
}

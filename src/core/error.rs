//! Error taxonomy for fleet operations

use thiserror::Error;

use super::instance::InstanceId;

/// Errors surfaced to callers of the orchestrator
#[derive(Debug, Error)]
pub enum FleetError {
    /// No lease and no keep-alive handle could be obtained
    #[error("singleton bypass unavailable: {0}")]
    AcquisitionFailure(String),

    /// Both the primary and the fallback launch paths failed
    #[error("launch failed for account '{account}': primary: {primary}; fallback: {fallback}")]
    LaunchFailure {
        account: String,
        primary: String,
        fallback: String,
    },

    /// `stop` took the instance while its launch was still in flight
    #[error("instance {0} was stopped before its launch completed")]
    LaunchAborted(InstanceId),

    #[error("coordination is not enabled")]
    SyncNotEnabled,

    #[error("no active followers to dispatch to")]
    NoActiveFollowers,

    #[error("unknown command type: {0}")]
    UnknownCommand(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("account already exists: {0}")]
    AccountExists(String),

    #[error("account '{account}' is already linked to instance {instance}")]
    AccountBusy {
        account: String,
        instance: InstanceId,
    },

    #[error("instance limit of {0} reached")]
    InstanceLimitReached(u32),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;

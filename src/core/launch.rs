//! Batch launching - Sequential launches with a fixed delay between them

use std::time::Duration;

use tracing::{info, warn};

use super::error::FleetError;
use super::instance::{InstanceId, LaunchTarget};
use super::registry::Registry;

/// Result of a batch; failures never roll back earlier successes
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<InstanceId>,
    pub failed: Vec<(String, FleetError)>,
}

impl BatchOutcome {
    pub fn launched_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_accounts(&self) -> Vec<&str> {
        self.failed.iter().map(|(account, _)| account.as_str()).collect()
    }
}

/// Launch each account in order, sleeping `delay` between consecutive launches
pub async fn launch_batch(
    registry: &Registry,
    accounts: &[String],
    target: &LaunchTarget,
    delay: Duration,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    info!("Launching batch of {} account(s)", accounts.len());

    for (index, account) in accounts.iter().enumerate() {
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match registry.launch(account, target.clone()).await {
            Ok(id) => outcome.succeeded.push(id),
            Err(e) => {
                warn!("Batch launch for {} failed: {}", account, e);
                outcome.failed.push((account.clone(), e));
            }
        }
    }

    info!(
        "Batch finished: {} launched, {} failed",
        outcome.launched_count(),
        outcome.failed.len()
    );
    outcome
}

//! MultiFleet - Headless fleet orchestrator
//!
//! Activates the singleton bypass, launches any accounts given on the command line and keeps
//! the fleet supervised until Ctrl+C.

use std::sync::Arc;

use anyhow::Result;
use single_instance::SingleInstance;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use multifleet::core::{Orchestrator, Settings};
use multifleet::persistence::Database;
use multifleet::{APP_NAME, APP_VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    // Settings live in the database, so it is opened before logging is configured
    let data_dir = Settings::default().get_data_directory();
    let db = Database::open(&Database::default_path(&data_dir))?;
    db.initialize()?;
    let settings = match db.load_settings()? {
        Some(settings) => settings,
        None => {
            let settings = Settings::default();
            db.save_settings(&settings)?;
            settings
        }
    };

    init_logging(settings.debug_logging);
    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    // Ensure only one orchestrator is running
    let instance = SingleInstance::new(APP_NAME)?;
    if !instance.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        return Ok(());
    }

    let orchestrator = Orchestrator::with_system(settings, Some(Arc::new(db)))?;

    let status = orchestrator.activate_bypass().await?;
    info!(
        "Bypass active with {} lease(s) via {:?}",
        status.lease_count,
        orchestrator.mutex_status().await.methods_available
    );

    let accounts: Vec<String> = std::env::args().skip(1).collect();
    if !accounts.is_empty() {
        for account in &accounts {
            if !orchestrator.accounts().iter().any(|a| &a.username == account) {
                orchestrator.register_account(account, None, false)?;
            }
        }
        let outcome = orchestrator.launch_batch(&accounts, None, None).await?;
        for (account, e) in &outcome.failed {
            warn!("{}: {}", account, e);
        }
        info!("{} of {} instance(s) launched", outcome.launched_count(), accounts.len());

        let perf = orchestrator.system_performance().await;
        info!(
            "System CPU {:.1}%, memory {:.1}% of {:.1} GB; {} running",
            perf.system_cpu, perf.system_memory_percent, perf.system_memory_total_gb, perf.total_instances
        );
    }

    info!("Running; press Ctrl+C to stop the fleet");
    tokio::signal::ctrl_c().await?;

    info!("{} shutting down", APP_NAME);
    orchestrator.shutdown().await?;
    Ok(())
}

/// Initialize the logging system
fn init_logging(debug: bool) {
    let default = if debug { "multifleet=debug" } else { "multifleet=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

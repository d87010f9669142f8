//! recur scheduler
//!
//! Standalone controller process. Schedules are loaded from the seed file
//! into an in-memory store and runs are handed to the mock executor.

use std::sync::Arc;

use anyhow::Result;
use recur_scheduler::{
    config::{self, Config},
    Clock, Controller, InMemoryStore, MockExecutor, SystemClock, TracingEventSink,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to RECUR_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting recur scheduler");
    info!(
        workers = config.workers,
        resync_interval_secs = config.resync_interval.as_secs(),
        max_catchup = config.max_catchup,
        "Configuration loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryStore::new(Arc::clone(&clock)));

    if let Some(path) = &config.schedules_file {
        let seeds = match config::load_seeds(path) {
            Ok(seeds) => seeds,
            Err(e) => {
                error!(error = %e, path = %path.display(), "Failed to load schedules");
                return Err(e);
            }
        };
        for (key, spec) in seeds {
            if let Err(e) = spec.validate() {
                // Still applied so the controller surfaces it as an invalid schedule.
                warn!(schedule = %key, error = %e, "Schedule spec is invalid");
            }
            store.apply_schedule(key, spec);
        }
        info!(path = %path.display(), "Schedules loaded");
    } else {
        warn!("RECUR_SCHEDULES_FILE not set, starting with no schedules");
    }

    let (executor, notifications) = MockExecutor::new();
    let executor = executor.with_auto_complete(config.simulated_run);

    let controller = Controller::new(
        store,
        Arc::new(executor),
        Arc::new(TracingEventSink),
        clock,
        config.controller(),
    );
    let metrics = controller.metrics();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut controller_handle = tokio::spawn(controller.run(notifications, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
            info!(metrics = ?metrics.snapshot(), "Controller exited");
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for controller to shut down...");
    let shutdown_timeout = config.shutdown_grace * 2;
    if let Err(e) = tokio::time::timeout(shutdown_timeout, controller_handle).await {
        warn!(error = %e, "Controller did not shut down in time");
    }

    info!(metrics = ?metrics.snapshot(), "Scheduler shutdown complete");
    Ok(())
}

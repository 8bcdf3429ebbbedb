//! connector-vault - host process
//!
//! Wires the key manager, credential store, accessor, registry and
//! orchestrator together and runs until SIGINT or SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use connector_vault::config::Config;
use connector_vault::security::{InMemoryCredentialBackend, KeyEvent, ScheduledRotation};
use connector_vault::{
    ConnectorRegistry, CredentialStore, KeyManager, LifecycleOrchestrator,
    SecureCredentialAccessor, VaultError,
};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "connector_vault=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    info!(
        rotation_interval_days = config.keys.rotation_interval_days,
        automatic_rotation = config.keys.automatic_rotation,
        "Loaded configuration"
    );

    let keys = Arc::new(KeyManager::new(config.keys.clone())?);
    log_key_events(keys.subscribe());
    let key_id = keys.generate_key().await?;
    info!(key_id = %key_id, "Initial encryption key generated");

    let store = Arc::new(CredentialStore::new(
        keys.clone(),
        Arc::new(InMemoryCredentialBackend::new()),
        config.store.clone(),
    ));
    let accessor = Arc::new(SecureCredentialAccessor::new(
        store.clone(),
        config.accessor.clone(),
    ));
    let registry = ConnectorRegistry::new(accessor, config.registry.clone());
    log_lifecycle_events(&registry);
    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        registry,
        config.lifecycle.clone(),
    ));

    let rotation = if config.keys.automatic_rotation {
        let target: Arc<dyn ScheduledRotation> = store.clone();
        Some(keys.spawn_rotation_schedule(target, ROTATION_CHECK_INTERVAL))
    } else {
        None
    };
    let monitor = orchestrator.start_monitoring();
    info!("Connector vault running");

    shutdown_signal().await;
    info!("Shutdown signal received");

    let report = match orchestrator.shutdown().await {
        Ok(report) => Some(report),
        Err(VaultError::ShutdownTimeout { report, .. }) => {
            error!("Lifecycle shutdown incomplete");
            Some(*report)
        }
        Err(e) => {
            error!(error = %e, "Lifecycle shutdown failed");
            None
        }
    };
    for (id, reason) in report.iter().flat_map(|r| &r.failed) {
        warn!(connector_id = %id, error = %reason, "Connector did not stop cleanly");
    }
    keys.shutdown().await;

    let _ = monitor.await;
    if let Some(rotation) = rotation {
        let _ = rotation.await;
    }
    info!("Connector vault stopped");
    Ok(())
}

fn log_key_events(mut events: broadcast::Receiver<KeyEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(event = event.name(), "Key event"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Key event listener lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn log_lifecycle_events(registry: &ConnectorRegistry) {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => info!(
                    connector_id = %event.connector_id(),
                    event = event.name(),
                    "Lifecycle event"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Lifecycle event listener lagged")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

//! Connector registry: the catalogue of connector instances and the
//! authoritative state machine for each.
//!
//! Operations on the same connector id are serialized by a per-slot lock, so
//! a health-triggered restart and a manual restart never interleave, while
//! unrelated connectors never wait on each other. Each slot owns a health
//! timer whose cancellation token is a child of the registry's root token.

pub mod events;
pub mod types;

pub use events::LifecycleEvent;
pub use types::{
    BulkOperation, BulkResult, ConnectorConfig, ConnectorEntry, ConnectorHealth,
    ConnectorStatus, HealthState, MultiResult, RegistryStatistics,
};

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RegistryConfig;
use crate::error::{Result, VaultError};
use crate::security::{CredentialRecord, SecureCredentialAccessor};
use crate::util::push_bounded;

/// The contract every connector implementation satisfies.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: Option<&CredentialRecord>) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
    async fn health(&self) -> anyhow::Result<ConnectorHealth>;
}

struct SlotState {
    status: ConnectorStatus,
    is_enabled: bool,
    last_activity: Option<DateTime<Utc>>,
    health_history: VecDeque<ConnectorHealth>,
    /// Set by `unregister`; operations queued behind it must not revive the slot.
    removed: bool,
}

struct ConnectorSlot {
    connector: Arc<dyn Connector>,
    config: ConnectorConfig,
    health_interval: Duration,
    registered_at: DateTime<Utc>,
    state: RwLock<SlotState>,
    /// Held for the whole of start/stop/restart/unregister on this id.
    op_lock: Mutex<()>,
    cancel: CancellationToken,
}

struct RegistryInner {
    slots: RwLock<HashMap<String, Arc<ConnectorSlot>>>,
    accessor: Arc<SecureCredentialAccessor>,
    config: RegistryConfig,
    events: broadcast::Sender<LifecycleEvent>,
    shutdown: CancellationToken,
}

/// Shared handle to the registry. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectorRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectorRegistry {
    pub fn new(accessor: Arc<SecureCredentialAccessor>, config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(RegistryInner {
                slots: RwLock::new(HashMap::new()),
                accessor,
                config,
                events,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn slot(&self, id: &str) -> Result<Arc<ConnectorSlot>> {
        self.inner
            .slots
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| VaultError::ConnectorNotFound(id.to_string()))
    }

    /// Add a connector in the `registered` state.
    ///
    /// Starts its health timer when monitoring is enabled and auto-starts it
    /// when `auto_start && is_enabled`. An auto-start failure is logged and
    /// leaves the connector in `error`; registration itself still succeeds.
    pub async fn register(&self, connector: Arc<dyn Connector>, config: ConnectorConfig) -> Result<()> {
        if config.id.trim().is_empty() {
            return Err(VaultError::Validation(vec!["connector id is required".to_string()]));
        }
        let id = config.id.clone();
        let health_interval = Duration::from_millis(
            config
                .health_check_interval_ms
                .unwrap_or(self.inner.config.default_health_check_interval_ms)
                .max(1),
        );
        let slot = Arc::new(ConnectorSlot {
            connector,
            health_interval,
            registered_at: Utc::now(),
            state: RwLock::new(SlotState {
                status: ConnectorStatus::Registered,
                is_enabled: config.is_enabled,
                last_activity: None,
                health_history: VecDeque::new(),
                removed: false,
            }),
            op_lock: Mutex::new(()),
            cancel: self.inner.shutdown.child_token(),
            config,
        });

        {
            let mut slots = self.inner.slots.write().await;
            if slots.contains_key(&id) {
                return Err(VaultError::ConnectorExists(id));
            }
            slots.insert(id.clone(), slot.clone());
        }

        tracing::info!(
            connector_id = %id,
            connector_type = %slot.config.connector_type,
            "Registered connector"
        );
        self.emit(LifecycleEvent::ConnectorRegistered {
            connector_id: id.clone(),
            timestamp: Utc::now(),
        });

        if self.inner.config.health_monitoring {
            self.spawn_health_timer(&slot);
        }

        if slot.config.auto_start && slot.config.is_enabled {
            if let Err(e) = self.start(&id).await {
                tracing::error!(connector_id = %id, error = %e, "Auto-start failed");
            }
        }
        Ok(())
    }

    /// Connect a connector. No-op if already running.
    pub async fn start(&self, id: &str) -> Result<()> {
        let slot = self.slot(id).await?;
        let _op = slot.op_lock.lock().await;
        self.start_locked(&slot).await
    }

    /// Disconnect a running connector. No-op otherwise.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let slot = self.slot(id).await?;
        let _op = slot.op_lock.lock().await;
        self.stop_locked(&slot).await
    }

    /// Stop, pause briefly, then start, all under the connector's lock.
    pub async fn restart(&self, id: &str) -> Result<()> {
        let slot = self.slot(id).await?;
        let _op = slot.op_lock.lock().await;
        tracing::info!(connector_id = %id, "Restarting connector");
        self.stop_locked(&slot).await?;
        tokio::time::sleep(self.inner.config.restart_pause()).await;
        self.start_locked(&slot).await
    }

    async fn start_locked(&self, slot: &ConnectorSlot) -> Result<()> {
        let id = slot.config.id.as_str();
        {
            let mut state = slot.state.write().await;
            if state.removed {
                return Err(VaultError::ConnectorNotFound(id.to_string()));
            }
            if !state.is_enabled {
                return Err(VaultError::ConnectorDisabled(id.to_string()));
            }
            if state.status == ConnectorStatus::Running {
                return Ok(());
            }
            transition(id, &mut state, ConnectorStatus::Starting)?;
        }
        tracing::debug!(connector_id = %id, "Starting connector");

        let credentials = match self.fetch_credentials(slot).await {
            Ok(credentials) => credentials,
            Err(e) => return Err(self.fail(slot, e.to_string()).await),
        };

        match slot.connector.connect(credentials.as_ref()).await {
            Ok(()) => {
                let mut state = slot.state.write().await;
                if let Err(e) = transition(id, &mut state, ConnectorStatus::Running) {
                    drop(state);
                    if let Err(d) = slot.connector.disconnect().await {
                        tracing::warn!(connector_id = %id, error = %d, "Disconnect after aborted start failed");
                    }
                    return Err(e);
                }
                state.last_activity = Some(Utc::now());
                drop(state);
                tracing::info!(connector_id = %id, "Connector running");
                self.emit(LifecycleEvent::ConnectorStarted {
                    connector_id: id.to_string(),
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Err(e) => Err(self.fail(slot, format!("{:#}", e)).await),
        }
    }

    async fn fetch_credentials(&self, slot: &ConnectorSlot) -> Result<Option<CredentialRecord>> {
        let Some(credential_id) = &slot.config.credential_id else {
            return Ok(None);
        };
        let access = self.inner.accessor.get_credentials(credential_id).await?;
        match access.record {
            Some(record) => Ok(Some(record)),
            None if access.is_expired => Err(VaultError::Connector {
                id: slot.config.id.clone(),
                message: format!("credential {} has expired", credential_id),
            }),
            None => Err(VaultError::CredentialNotFound(credential_id.clone())),
        }
    }

    async fn stop_locked(&self, slot: &ConnectorSlot) -> Result<()> {
        let id = slot.config.id.as_str();
        {
            let mut state = slot.state.write().await;
            if state.removed {
                return Err(VaultError::ConnectorNotFound(id.to_string()));
            }
            if state.status != ConnectorStatus::Running {
                return Ok(());
            }
            transition(id, &mut state, ConnectorStatus::Stopping)?;
        }
        tracing::debug!(connector_id = %id, "Stopping connector");

        match slot.connector.disconnect().await {
            Ok(()) => {
                let mut state = slot.state.write().await;
                transition(id, &mut state, ConnectorStatus::Stopped)?;
                state.last_activity = Some(Utc::now());
                drop(state);
                tracing::info!(connector_id = %id, "Connector stopped");
                self.emit(LifecycleEvent::ConnectorStopped {
                    connector_id: id.to_string(),
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Err(e) => Err(self.fail(slot, format!("{:#}", e)).await),
        }
    }

    /// Move to `error`, emit `connector_failed`, and build the error to return.
    async fn fail(&self, slot: &ConnectorSlot, message: String) -> VaultError {
        let id = slot.config.id.clone();
        {
            let mut state = slot.state.write().await;
            if state.status.can_transition_to(ConnectorStatus::Error) {
                state.status = ConnectorStatus::Error;
            }
        }
        tracing::error!(connector_id = %id, error = %message, "Connector failed");
        self.emit(LifecycleEvent::ConnectorFailed {
            connector_id: id.clone(),
            error: message.clone(),
            timestamp: Utc::now(),
        });
        VaultError::Connector { id, message }
    }

    /// External error signal. Only legal while running: a start or stop in
    /// flight owns the state until it settles.
    pub async fn mark_error(&self, id: &str, reason: &str) -> Result<()> {
        let slot = self.slot(id).await?;
        {
            let mut state = slot.state.write().await;
            if state.status != ConnectorStatus::Running {
                return Err(VaultError::InvalidTransition {
                    id: id.to_string(),
                    from: state.status,
                    to: ConnectorStatus::Error,
                });
            }
            transition(id, &mut state, ConnectorStatus::Error)?;
        }
        tracing::warn!(connector_id = %id, reason = %reason, "Connector marked as errored");
        self.emit(LifecycleEvent::ConnectorFailed {
            connector_id: id.to_string(),
            error: reason.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Enable or disable future starts. A running connector keeps running.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let slot = self.slot(id).await?;
        slot.state.write().await.is_enabled = enabled;
        tracing::info!(connector_id = %id, enabled, "Connector enablement changed");
        Ok(())
    }

    /// Cancel the health timer, force-stop if running, and remove the entry.
    pub async fn unregister(&self, id: &str) -> Result<()> {
        let slot = self.slot(id).await?;
        slot.cancel.cancel();
        let _op = slot.op_lock.lock().await;
        if slot.state.read().await.removed {
            return Err(VaultError::ConnectorNotFound(id.to_string()));
        }
        if let Err(e) = self.stop_locked(&slot).await {
            tracing::warn!(connector_id = %id, error = %e, "Disconnect failed during unregister");
        }
        slot.state.write().await.removed = true;
        {
            let mut slots = self.inner.slots.write().await;
            if slots.get(id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                slots.remove(id);
            }
        }
        tracing::info!(connector_id = %id, "Unregistered connector");
        self.emit(LifecycleEvent::ConnectorUnregistered {
            connector_id: id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Probe health and apply the registry's auto-restart policy.
    ///
    /// A failed probe is recorded as an `offline` sample, not returned as an
    /// error. An `unhealthy` report while running triggers a restart when
    /// `auto_restart_unhealthy` is set.
    pub async fn check_health(&self, id: &str) -> Result<ConnectorHealth> {
        let slot = self.slot(id).await?;
        let (sample, status) = self.sample_health(&slot).await;

        if sample.status == HealthState::Unhealthy
            && status == ConnectorStatus::Running
            && self.inner.config.auto_restart_unhealthy
        {
            tracing::warn!(connector_id = %id, "Connector unhealthy; restarting");
            if let Err(e) = self.restart(id).await {
                tracing::error!(connector_id = %id, error = %e, "Health-triggered restart failed");
            }
        }
        Ok(sample)
    }

    /// Probe health and record the sample without any restart policy.
    pub async fn probe_health(&self, id: &str) -> Result<ConnectorHealth> {
        let slot = self.slot(id).await?;
        Ok(self.sample_health(&slot).await.0)
    }

    async fn sample_health(&self, slot: &ConnectorSlot) -> (ConnectorHealth, ConnectorStatus) {
        let id = slot.config.id.as_str();
        let sample = match slot.connector.health().await {
            Ok(health) => health,
            Err(e) => {
                tracing::warn!(connector_id = %id, error = %e, "Health probe failed");
                ConnectorHealth::offline()
            }
        };

        let status = {
            let mut state = slot.state.write().await;
            push_bounded(
                &mut state.health_history,
                sample.clone(),
                self.inner.config.health_history_capacity,
            );
            state.status
        };

        tracing::debug!(connector_id = %id, health = ?sample.status, "Health sample recorded");
        self.emit(LifecycleEvent::ConnectorHealthUpdate {
            connector_id: id.to_string(),
            health: sample.clone(),
        });
        (sample, status)
    }

    fn spawn_health_timer(&self, slot: &Arc<ConnectorSlot>) {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let token = slot.cancel.clone();
        let id = slot.config.id.clone();
        let period = slot.health_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = registry.upgrade() else {
                    break;
                };
                let registry = ConnectorRegistry { inner };
                if let Err(e) = registry.check_health(&id).await {
                    tracing::debug!(connector_id = %id, error = %e, "Health timer stopping");
                    break;
                }
            }
            tracing::debug!(connector_id = %id, "Health timer cancelled");
        });
    }

    /// Run `op` against each running connector concurrently.
    ///
    /// Ids that are unknown or not running are reported as failures.
    pub async fn execute_multi<T, F, Fut>(&self, ids: &[String], op: F) -> MultiResult<T>
    where
        F: Fn(String, Arc<dyn Connector>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let tasks = ids.iter().map(|id| {
            let op = &op;
            async move {
                let slot = match self.slot(id).await {
                    Ok(slot) => slot,
                    Err(e) => return (id.clone(), Err(e.to_string())),
                };
                let status = slot.state.read().await.status;
                if status != ConnectorStatus::Running {
                    return (id.clone(), Err(format!("connector is {}", status)));
                }
                match op(id.clone(), slot.connector.clone()).await {
                    Ok(value) => {
                        slot.state.write().await.last_activity = Some(Utc::now());
                        (id.clone(), Ok(value))
                    }
                    Err(e) => (id.clone(), Err(format!("{:#}", e))),
                }
            }
        });

        let mut result = MultiResult::default();
        for (id, outcome) in join_all(tasks).await {
            match outcome {
                Ok(value) => result.succeeded.push((id, value)),
                Err(e) => result.failed.push((id, e)),
            }
        }
        result
    }

    /// Start, stop or restart many connectors concurrently.
    pub async fn bulk_operation(&self, ids: &[String], operation: BulkOperation) -> BulkResult {
        let tasks = ids.iter().map(|id| async move {
            let outcome = match operation {
                BulkOperation::Start => self.start(id).await,
                BulkOperation::Stop => self.stop(id).await,
                BulkOperation::Restart => self.restart(id).await,
            };
            (id.clone(), outcome)
        });

        let mut result = BulkResult::default();
        for (id, outcome) in join_all(tasks).await {
            match outcome {
                Ok(()) => result.succeeded.push(id),
                Err(e) => result.failed.push((id, e.to_string())),
            }
        }
        tracing::info!(
            operation = ?operation,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            "Bulk operation finished"
        );
        result
    }

    async fn snapshot(slot: &ConnectorSlot) -> ConnectorEntry {
        let state = slot.state.read().await;
        ConnectorEntry {
            connector_id: slot.config.id.clone(),
            connector_type: slot.config.connector_type.clone(),
            name: slot.config.name.clone(),
            status: state.status,
            is_enabled: state.is_enabled,
            auto_start: slot.config.auto_start,
            health_check_interval_ms: slot.health_interval.as_millis() as u64,
            max_retries: slot.config.max_retries,
            retry_delay_ms: slot.config.retry_delay_ms,
            credential_id: slot.config.credential_id.clone(),
            registered_at: slot.registered_at,
            last_activity: state.last_activity,
            latest_health: state.health_history.back().cloned(),
            health_samples: state.health_history.len(),
        }
    }

    pub async fn get(&self, id: &str) -> Option<ConnectorEntry> {
        let slot = self.slot(id).await.ok()?;
        Some(Self::snapshot(&slot).await)
    }

    /// Snapshots of every connector, ordered by id.
    pub async fn list(&self) -> Vec<ConnectorEntry> {
        let slots: Vec<Arc<ConnectorSlot>> =
            self.inner.slots.read().await.values().cloned().collect();
        let mut entries = Vec::with_capacity(slots.len());
        for slot in &slots {
            entries.push(Self::snapshot(slot).await);
        }
        entries.sort_by(|a, b| a.connector_id.cmp(&b.connector_id));
        entries
    }

    pub async fn status(&self, id: &str) -> Option<ConnectorStatus> {
        let slot = self.slot(id).await.ok()?;
        let status = slot.state.read().await.status;
        Some(status)
    }

    /// Health samples for a connector, oldest first.
    pub async fn health_history(&self, id: &str) -> Option<Vec<ConnectorHealth>> {
        let slot = self.slot(id).await.ok()?;
        let history = slot.state.read().await.health_history.iter().cloned().collect();
        Some(history)
    }

    pub async fn statistics(&self) -> RegistryStatistics {
        let entries = self.list().await;
        let mut stats = RegistryStatistics {
            total: entries.len(),
            ..RegistryStatistics::default()
        };
        let mut score_total = 0u64;
        for entry in &entries {
            *stats.by_status.entry(entry.status).or_insert(0) += 1;
            *stats
                .by_type
                .entry(entry.connector_type.clone())
                .or_insert(0) += 1;
            if entry.is_enabled {
                stats.enabled += 1;
            } else {
                stats.disabled += 1;
            }
            score_total += u64::from(
                entry
                    .latest_health
                    .as_ref()
                    .map(|h| h.status.score())
                    .unwrap_or(HealthState::Offline.score()),
            );
        }
        if !entries.is_empty() {
            stats.average_health_score = score_total as f64 / entries.len() as f64;
        }
        stats
    }

    /// Cancel every health timer. Connectors are left as they are.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        tracing::info!("Connector registry timers cancelled");
    }
}

fn transition(id: &str, state: &mut SlotState, next: ConnectorStatus) -> Result<()> {
    if !state.status.can_transition_to(next) {
        return Err(VaultError::InvalidTransition {
            id: id.to_string(),
            from: state.status,
            to: next,
        });
    }
    tracing::debug!(connector_id = %id, from = %state.status, to = %next, "State transition");
    state.status = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::test_support::{fast_registry_config, registry_fixture, MockConnector};

    #[tokio::test]
    async fn test_register_rejects_duplicate_ids() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let config = ConnectorConfig::new("conn-1", "crm", "CRM");
        registry
            .register(Arc::new(MockConnector::healthy()), config.clone())
            .await
            .unwrap();
        let err = registry
            .register(Arc::new(MockConnector::healthy()), config)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::ConnectorExists(_)));
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Registered));
    }

    #[tokio::test]
    async fn test_start_and_stop_walk_the_state_machine() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let mut events = registry.subscribe();
        let connector = Arc::new(MockConnector::healthy());
        registry
            .register(connector.clone(), ConnectorConfig::new("conn-1", "crm", "CRM"))
            .await
            .unwrap();

        registry.start("conn-1").await.unwrap();
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Running));
        assert!(registry.get("conn-1").await.unwrap().last_activity.is_some());

        // Already running: no second connect
        registry.start("conn-1").await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

        registry.stop("conn-1").await.unwrap();
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Stopped));
        // Not running: no-op
        registry.stop("conn-1").await.unwrap();
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);

        let names: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(
            names,
            vec!["connector_registered", "connector_started", "connector_stopped"]
        );
    }

    #[tokio::test]
    async fn test_disabled_connector_never_starts() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let connector = Arc::new(MockConnector::healthy());
        let config = ConnectorConfig {
            is_enabled: false,
            auto_start: true,
            ..ConnectorConfig::new("conn-1", "crm", "CRM")
        };
        registry.register(connector.clone(), config).await.unwrap();

        let err = registry.start("conn-1").await.unwrap_err();
        assert!(matches!(err, VaultError::ConnectorDisabled(_)));
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Registered));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_moves_to_error_and_can_restart() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let connector = Arc::new(MockConnector::failing_connects(1));
        registry
            .register(connector.clone(), ConnectorConfig::new("conn-1", "crm", "CRM"))
            .await
            .unwrap();

        let err = registry.start("conn-1").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Error));

        registry.start("conn-1").await.unwrap();
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Running));
    }

    #[tokio::test]
    async fn test_auto_start_on_register() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let config = ConnectorConfig {
            auto_start: true,
            ..ConnectorConfig::new("conn-1", "crm", "CRM")
        };
        registry
            .register(Arc::new(MockConnector::healthy()), config)
            .await
            .unwrap();
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Running));
    }

    #[tokio::test]
    async fn test_credentials_are_passed_to_connect() {
        let (registry, vault) = registry_fixture(fast_registry_config()).await;
        vault
            .store
            .store(&CredentialRecord {
                api_key: Some("sk-live-0123456789abcdef".to_string()),
                ..CredentialRecord::new("crm-creds", "salesforce")
            })
            .await
            .unwrap();
        let connector = Arc::new(MockConnector::healthy());
        let config = ConnectorConfig {
            credential_id: Some("crm-creds".to_string()),
            ..ConnectorConfig::new("conn-1", "salesforce", "CRM")
        };
        registry.register(connector.clone(), config).await.unwrap();
        registry.start("conn-1").await.unwrap();

        assert_eq!(
            connector.last_api_key().as_deref(),
            Some("sk-live-0123456789abcdef")
        );
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_the_start() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let connector = Arc::new(MockConnector::healthy());
        let config = ConnectorConfig {
            credential_id: Some("absent".to_string()),
            ..ConnectorConfig::new("conn-1", "crm", "CRM")
        };
        registry.register(connector.clone(), config).await.unwrap();

        assert!(registry.start("conn-1").await.is_err());
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Error));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mark_error_only_while_active() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        registry
            .register(
                Arc::new(MockConnector::healthy()),
                ConnectorConfig::new("conn-1", "crm", "CRM"),
            )
            .await
            .unwrap();

        let err = registry.mark_error("conn-1", "boom").await.unwrap_err();
        assert!(matches!(err, VaultError::InvalidTransition { .. }));

        registry.start("conn-1").await.unwrap();
        registry.mark_error("conn-1", "upstream 500s").await.unwrap();
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Error));
    }

    #[tokio::test]
    async fn test_mark_error_cannot_interrupt_a_start() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let connector = Arc::new(MockConnector::healthy().with_op_delay(Duration::from_millis(50)));
        registry
            .register(connector.clone(), ConnectorConfig::new("conn-1", "crm", "CRM"))
            .await
            .unwrap();

        let starting = tokio::spawn({
            let registry = registry.clone();
            async move { registry.start("conn-1").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Starting));
        assert!(matches!(
            registry.mark_error("conn-1", "upstream 500s").await,
            Err(VaultError::InvalidTransition { .. })
        ));

        starting.await.unwrap().unwrap();
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Running));
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_queued_behind_unregister_does_not_reconnect() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let connector = Arc::new(MockConnector::healthy().with_op_delay(Duration::from_millis(50)));
        registry
            .register(connector.clone(), ConnectorConfig::new("conn-1", "crm", "CRM"))
            .await
            .unwrap();
        registry.start("conn-1").await.unwrap();

        let unregistering = tokio::spawn({
            let registry = registry.clone();
            async move { registry.unregister("conn-1").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let restart = registry.start("conn-1").await;

        unregistering.await.unwrap().unwrap();
        assert!(matches!(restart, Err(VaultError::ConnectorNotFound(_))));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
        assert!(registry.get("conn-1").await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_force_stops_and_removes() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let connector = Arc::new(MockConnector::healthy());
        registry
            .register(connector.clone(), ConnectorConfig::new("conn-1", "crm", "CRM"))
            .await
            .unwrap();
        registry.start("conn-1").await.unwrap();

        registry.unregister("conn-1").await.unwrap();
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
        assert!(registry.get("conn-1").await.is_none());
        assert!(matches!(
            registry.start("conn-1").await,
            Err(VaultError::ConnectorNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_probe_is_recorded_as_offline() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let connector = Arc::new(MockConnector::healthy());
        connector.fail_health_probe(true);
        registry
            .register(connector.clone(), ConnectorConfig::new("conn-1", "crm", "CRM"))
            .await
            .unwrap();

        let sample = registry.check_health("conn-1").await.unwrap();
        assert_eq!(sample.status, HealthState::Offline);
        assert_eq!(registry.health_history("conn-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_running_connector_is_restarted() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let connector = Arc::new(MockConnector::healthy());
        registry
            .register(connector.clone(), ConnectorConfig::new("conn-1", "crm", "CRM"))
            .await
            .unwrap();
        registry.start("conn-1").await.unwrap();

        connector.set_health(HealthState::Unhealthy);
        registry.check_health("conn-1").await.unwrap();

        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Running));
    }

    #[tokio::test]
    async fn test_health_history_is_bounded() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        registry
            .register(
                Arc::new(MockConnector::healthy()),
                ConnectorConfig::new("conn-1", "crm", "CRM"),
            )
            .await
            .unwrap();
        for _ in 0..1_500 {
            registry.probe_health("conn-1").await.unwrap();
        }
        assert_eq!(registry.health_history("conn-1").await.unwrap().len(), 1_440);
    }

    #[tokio::test]
    async fn test_health_timer_samples_and_stops_on_unregister() {
        let (registry, _) = registry_fixture(RegistryConfig {
            health_monitoring: true,
            ..fast_registry_config()
        })
        .await;
        let config = ConnectorConfig {
            health_check_interval_ms: Some(10),
            ..ConnectorConfig::new("conn-1", "crm", "CRM")
        };
        let connector = Arc::new(MockConnector::healthy());
        registry.register(connector.clone(), config).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(connector.health_checks.load(Ordering::SeqCst) >= 2);

        registry.unregister("conn-1").await.unwrap();
        let after_unregister = connector.health_checks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.health_checks.load(Ordering::SeqCst), after_unregister);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_timers_and_enablement_gates_starts() {
        let (registry, _) = registry_fixture(RegistryConfig {
            health_monitoring: true,
            ..fast_registry_config()
        })
        .await;
        let connector = Arc::new(MockConnector::healthy());
        registry
            .register(
                connector.clone(),
                ConnectorConfig {
                    health_check_interval_ms: Some(10),
                    ..ConnectorConfig::new("conn-1", "crm", "CRM")
                },
            )
            .await
            .unwrap();
        registry.start("conn-1").await.unwrap();

        registry.set_enabled("conn-1", false).await.unwrap();
        assert_eq!(registry.status("conn-1").await, Some(ConnectorStatus::Running));
        registry.stop("conn-1").await.unwrap();
        assert!(matches!(
            registry.start("conn-1").await,
            Err(VaultError::ConnectorDisabled(_))
        ));
        registry.set_enabled("conn-1", true).await.unwrap();
        registry.start("conn-1").await.unwrap();

        registry.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let after_shutdown = connector.health_checks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.health_checks.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test]
    async fn test_restarts_on_one_id_do_not_interleave() {
        let (registry, _) = registry_fixture(RegistryConfig {
            restart_pause_ms: 20,
            ..fast_registry_config()
        })
        .await;
        let connector = Arc::new(MockConnector::healthy());
        registry
            .register(connector.clone(), ConnectorConfig::new("conn-1", "crm", "CRM"))
            .await
            .unwrap();
        registry.start("conn-1").await.unwrap();

        let (a, b) = tokio::join!(registry.restart("conn-1"), registry.restart("conn-1"));
        a.unwrap();
        b.unwrap();
        assert_eq!(connector.max_concurrent_ops.load(Ordering::SeqCst), 1);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bulk_operation_collects_per_id_results() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        registry
            .register(
                Arc::new(MockConnector::healthy()),
                ConnectorConfig::new("ok", "crm", "OK"),
            )
            .await
            .unwrap();
        registry
            .register(
                Arc::new(MockConnector::failing_connects(u32::MAX)),
                ConnectorConfig::new("bad", "crm", "Bad"),
            )
            .await
            .unwrap();

        let ids = vec!["ok".to_string(), "bad".to_string(), "ghost".to_string()];
        let result = registry.bulk_operation(&ids, BulkOperation::Start).await;
        assert_eq!(result.succeeded, vec!["ok".to_string()]);
        let failed: Vec<&str> = result.failed.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(failed, vec!["bad", "ghost"]);
    }

    #[tokio::test]
    async fn test_execute_multi_only_runs_on_running_connectors() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        for id in ["a", "b"] {
            registry
                .register(
                    Arc::new(MockConnector::healthy()),
                    ConnectorConfig::new(id, "crm", id),
                )
                .await
                .unwrap();
        }
        registry.start("a").await.unwrap();

        let ids = vec!["a".to_string(), "b".to_string()];
        let result = registry
            .execute_multi(&ids, |id, _connector| async move { Ok(format!("scanned {id}")) })
            .await;
        assert_eq!(result.succeeded, vec![("a".to_string(), "scanned a".to_string())]);
        assert_eq!(result.failed.len(), 1);
        assert!(result.failed[0].1.contains("registered"));
    }

    #[tokio::test]
    async fn test_statistics_average_latest_scores() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let healthy = Arc::new(MockConnector::healthy());
        let degraded = Arc::new(MockConnector::healthy());
        degraded.set_health(HealthState::Degraded);
        registry
            .register(healthy, ConnectorConfig::new("a", "crm", "A"))
            .await
            .unwrap();
        registry
            .register(degraded, ConnectorConfig::new("b", "erp", "B"))
            .await
            .unwrap();
        registry
            .register(
                Arc::new(MockConnector::healthy()),
                ConnectorConfig {
                    is_enabled: false,
                    ..ConnectorConfig::new("c", "crm", "C")
                },
            )
            .await
            .unwrap();
        registry.probe_health("a").await.unwrap();
        registry.probe_health("b").await.unwrap();
        registry.start("a").await.unwrap();

        let stats = registry.statistics().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.enabled, 2);
        assert_eq!(stats.disabled, 1);
        assert_eq!(stats.by_type.get("crm"), Some(&2));
        assert_eq!(stats.by_status.get(&ConnectorStatus::Running), Some(&1));
        assert_eq!(stats.by_status.get(&ConnectorStatus::Registered), Some(&2));
        // (100 + 50 + 0) / 3
        assert!((stats.average_health_score - 50.0).abs() < f64::EPSILON);
    }
}

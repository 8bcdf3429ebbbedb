//! Lifecycle policy above the connector registry.
//!
//! Adds bounded start retries, a periodic health sweep that detects
//! healthy/non-healthy transitions and applies the auto-restart policy, and
//! graceful shutdown under a deadline. Trend and attention reports are purely
//! observational.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::LifecycleConfig;
use crate::error::{Result, VaultError};
use crate::registry::{
    ConnectorEntry, ConnectorRegistry, ConnectorStatus, HealthState, LifecycleEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTrend {
    Improving,
    Degrading,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Degraded,
    Restored,
}

/// A healthy/non-healthy change observed by a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct HealthTransition {
    pub connector_id: String,
    pub kind: TransitionKind,
    pub previous: HealthState,
    pub current: HealthState,
    pub auto_restarted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttentionItem {
    pub connector_id: String,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LifecycleStatistics {
    pub total_connectors: usize,
    pub running: usize,
    pub stopped: usize,
    pub errored: usize,
    /// Connectors with a non-zero retry counter.
    pub pending_retries: usize,
    pub auto_restarts: u32,
    pub average_health_score: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub timed_out: bool,
}

#[derive(Default)]
struct PolicyState {
    /// Registration each id's counters belong to. Every other map is keyed
    /// by ids present here.
    registered: HashMap<String, DateTime<Utc>>,
    retries: HashMap<String, u32>,
    auto_restarts: HashMap<String, u32>,
    last_health: HashMap<String, HealthState>,
    /// Degraded connectors that were auto-restarted and have not recovered yet.
    restarted: HashSet<String>,
}

impl PolicyState {
    fn forget(&mut self, id: &str) {
        self.registered.remove(id);
        self.retries.remove(id);
        self.auto_restarts.remove(id);
        self.last_health.remove(id);
        self.restarted.remove(id);
    }

    /// Claim `entry`'s id for its current registration, dropping counters
    /// left over from an earlier registration under the same id.
    fn adopt(&mut self, entry: &ConnectorEntry) {
        if self.registered.get(&entry.connector_id) != Some(&entry.registered_at) {
            self.forget(&entry.connector_id);
            self.registered
                .insert(entry.connector_id.clone(), entry.registered_at);
        }
    }

    /// Drop every id that is no longer registered, then adopt the rest.
    fn reconcile(&mut self, entries: &[ConnectorEntry]) {
        let gone: Vec<String> = self
            .registered
            .keys()
            .filter(|id| !entries.iter().any(|e| &e.connector_id == *id))
            .cloned()
            .collect();
        for id in gone {
            self.forget(&id);
        }
        for entry in entries {
            self.adopt(entry);
        }
    }
}

pub struct LifecycleOrchestrator {
    registry: ConnectorRegistry,
    config: LifecycleConfig,
    state: Mutex<PolicyState>,
    shutdown: CancellationToken,
}

impl LifecycleOrchestrator {
    pub fn new(registry: ConnectorRegistry, config: LifecycleConfig) -> Self {
        Self {
            registry,
            config,
            state: Mutex::new(PolicyState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// Start a connector, retrying up to its `max_retries` attempts with
    /// `retry_delay_ms` between them.
    ///
    /// Non-transient failures (disabled, unknown id) are returned at once.
    /// When every attempt fails the retry counter is left at the attempt
    /// count; success clears it.
    pub async fn start_with_retry(&self, id: &str) -> Result<()> {
        let entry = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| VaultError::ConnectorNotFound(id.to_string()))?;
        self.state.lock().await.adopt(&entry);
        let max_attempts = entry.max_retries.max(1);
        let delay = std::time::Duration::from_millis(entry.retry_delay_ms);

        let mut last_error = String::new();
        for attempt in 1..=max_attempts {
            match self.registry.start(id).await {
                Ok(()) => {
                    self.state.lock().await.retries.remove(id);
                    if attempt > 1 {
                        tracing::info!(connector_id = %id, attempts = attempt, "Connector recovered");
                        self.registry.emit(LifecycleEvent::ConnectorRecovered {
                            connector_id: id.to_string(),
                            attempts: attempt,
                            timestamp: Utc::now(),
                        });
                    }
                    return Ok(());
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    self.state.lock().await.retries.insert(id.to_string(), attempt);
                    tracing::warn!(
                        connector_id = %id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Start attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(delay).await;
            }
        }

        tracing::error!(connector_id = %id, attempts = max_attempts, "Start retries exhausted");
        Err(VaultError::RetriesExhausted {
            id: id.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }

    pub async fn retry_statistics(&self) -> HashMap<String, u32> {
        self.state.lock().await.retries.clone()
    }

    pub async fn reset_retries(&self, id: &str) {
        self.state.lock().await.retries.remove(id);
    }

    /// Spawn the periodic health sweep. It stops on [`Self::shutdown`].
    pub fn start_monitoring(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator: Weak<Self> = Arc::downgrade(self);
        let token = self.shutdown.child_token();
        let period = self.config.health_check_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                let transitions = orchestrator.health_sweep().await;
                if !transitions.is_empty() {
                    tracing::debug!(transitions = transitions.len(), "Health sweep finished");
                }
            }
            tracing::debug!("Health sweep stopped");
        })
    }

    /// Probe every connector once and act on healthy/non-healthy transitions.
    ///
    /// Policy state for unregistered connectors is dropped first, so an id
    /// registered again starts from a clean baseline.
    pub async fn health_sweep(&self) -> Vec<HealthTransition> {
        let entries = self.registry.list().await;
        self.state.lock().await.reconcile(&entries);
        let probes = entries.iter().map(|entry| async move {
            let sample = self.registry.probe_health(&entry.connector_id).await;
            (entry, sample)
        });

        let mut transitions = Vec::new();
        for (entry, sample) in join_all(probes).await {
            // Unregistered mid-sweep
            let Ok(sample) = sample else { continue };
            if let Some(transition) = self.observe(entry, sample.status).await {
                transitions.push(transition);
            }
        }
        transitions
    }

    async fn observe(&self, entry: &ConnectorEntry, current: HealthState) -> Option<HealthTransition> {
        let id = entry.connector_id.as_str();
        let previous = self
            .state
            .lock()
            .await
            .last_health
            .insert(id.to_string(), current)?;

        let was_healthy = previous == HealthState::Healthy;
        let is_healthy = current == HealthState::Healthy;

        if was_healthy && !is_healthy {
            tracing::warn!(connector_id = %id, health = ?current, "Connector health degraded");
            self.registry.emit(LifecycleEvent::HealthDegraded {
                connector_id: id.to_string(),
                previous,
                current,
                timestamp: Utc::now(),
            });
            let auto_restarted = self.maybe_auto_restart(entry).await;
            return Some(HealthTransition {
                connector_id: id.to_string(),
                kind: TransitionKind::Degraded,
                previous,
                current,
                auto_restarted,
            });
        }

        if !was_healthy && is_healthy {
            tracing::info!(connector_id = %id, "Connector health restored");
            self.registry.emit(LifecycleEvent::HealthRestored {
                connector_id: id.to_string(),
                previous,
                current,
                timestamp: Utc::now(),
            });
            let restarted = self.state.lock().await.restarted.remove(id);
            if restarted {
                self.registry.emit(LifecycleEvent::ConnectorRecovered {
                    connector_id: id.to_string(),
                    attempts: 1,
                    timestamp: Utc::now(),
                });
            }
            return Some(HealthTransition {
                connector_id: id.to_string(),
                kind: TransitionKind::Restored,
                previous,
                current,
                auto_restarted: false,
            });
        }

        None
    }

    async fn maybe_auto_restart(&self, entry: &ConnectorEntry) -> bool {
        let id = entry.connector_id.as_str();
        if !self.config.auto_restart || entry.status != ConnectorStatus::Running {
            return false;
        }
        let used = self
            .state
            .lock()
            .await
            .auto_restarts
            .get(id)
            .copied()
            .unwrap_or(0);
        if used >= self.config.max_auto_restarts {
            tracing::warn!(
                connector_id = %id,
                max_auto_restarts = self.config.max_auto_restarts,
                "Auto-restart limit reached"
            );
            return false;
        }

        match self.registry.restart(id).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                *state.auto_restarts.entry(id.to_string()).or_insert(0) += 1;
                state.restarted.insert(id.to_string());
                tracing::info!(connector_id = %id, "Auto-restarted degraded connector");
                true
            }
            Err(e) => {
                tracing::error!(connector_id = %id, error = %e, "Auto-restart failed");
                false
            }
        }
    }

    /// Direction of each connector's last two health samples.
    pub async fn health_trends(&self) -> HashMap<String, HealthTrend> {
        let mut trends = HashMap::new();
        for entry in self.registry.list().await {
            let history = self
                .registry
                .health_history(&entry.connector_id)
                .await
                .unwrap_or_default();
            let trend = match history.as_slice() {
                [.., earlier, latest] => {
                    match latest.status.score().cmp(&earlier.status.score()) {
                        std::cmp::Ordering::Greater => HealthTrend::Improving,
                        std::cmp::Ordering::Less => HealthTrend::Degrading,
                        std::cmp::Ordering::Equal => HealthTrend::Stable,
                    }
                }
                _ => HealthTrend::Stable,
            };
            trends.insert(entry.connector_id, trend);
        }
        trends
    }

    /// Connectors an operator should look at. Takes no action.
    pub async fn attention_list(&self) -> Vec<AttentionItem> {
        let retries = self.state.lock().await.retries.clone();
        let mut items = Vec::new();
        for entry in self.registry.list().await {
            let mut reasons = Vec::new();
            match entry.latest_health.as_ref().map(|h| h.status) {
                Some(HealthState::Unhealthy) => reasons.push("unhealthy".to_string()),
                Some(HealthState::Degraded) => reasons.push("degraded".to_string()),
                Some(HealthState::Offline) if entry.is_enabled => {
                    reasons.push("offline while enabled".to_string())
                }
                _ => {}
            }
            if entry.status == ConnectorStatus::Error && entry.is_enabled {
                reasons.push("in error state".to_string());
            }
            let attempts = retries.get(&entry.connector_id).copied().unwrap_or(0);
            if attempts > 0 && attempts + 1 >= entry.max_retries {
                reasons.push(format!(
                    "retries at {}/{}",
                    attempts, entry.max_retries
                ));
            }
            if !reasons.is_empty() {
                items.push(AttentionItem {
                    connector_id: entry.connector_id,
                    reasons,
                });
            }
        }
        items
    }

    pub async fn lifecycle_statistics(&self) -> LifecycleStatistics {
        let registry_stats = self.registry.statistics().await;
        let count = |status: ConnectorStatus| registry_stats.by_status.get(&status).copied().unwrap_or(0);
        let state = self.state.lock().await;
        LifecycleStatistics {
            total_connectors: registry_stats.total,
            running: count(ConnectorStatus::Running),
            stopped: count(ConnectorStatus::Stopped),
            errored: count(ConnectorStatus::Error),
            pending_retries: state.retries.values().filter(|n| **n > 0).count(),
            auto_restarts: state.auto_restarts.values().sum(),
            average_health_score: registry_stats.average_health_score,
        }
    }

    /// Stop every running connector concurrently within the graceful deadline.
    ///
    /// Timers are released whether or not the deadline holds. Individual stop
    /// failures are reported in the returned [`ShutdownReport`]. Exceeding the
    /// deadline returns `ShutdownTimeout` carrying a report with `timed_out`
    /// set and every unsettled connector listed as failed.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        self.shutdown.cancel();
        let deadline = self.config.graceful_shutdown_timeout();

        let running: Vec<String> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|e| e.status == ConnectorStatus::Running)
            .map(|e| e.connector_id)
            .collect();
        tracing::info!(connectors = running.len(), "Stopping connectors");

        let mut stops: FuturesUnordered<_> = running
            .iter()
            .map(|id| async move { (id.clone(), self.registry.stop(id).await) })
            .collect();
        let mut report = ShutdownReport::default();
        let outcome = tokio::time::timeout(deadline, async {
            while let Some((id, result)) = stops.next().await {
                match result {
                    Ok(()) => report.stopped.push(id),
                    Err(e) => report.failed.push((id, e.to_string())),
                }
            }
        })
        .await;
        drop(stops);
        self.registry.shutdown();

        if outcome.is_err() {
            for id in running {
                let settled = report.stopped.contains(&id)
                    || report.failed.iter().any(|(failed, _)| *failed == id);
                if !settled {
                    report.failed.push((id, "did not stop before the deadline".to_string()));
                }
            }
            report.timed_out = true;
            tracing::error!(
                timeout = ?deadline,
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                "Graceful shutdown timed out"
            );
            return Err(VaultError::ShutdownTimeout {
                timeout: deadline,
                report: Box::new(report),
            });
        }
        tracing::info!(
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "Lifecycle shutdown complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    use crate::registry::ConnectorConfig;
    use crate::test_support::{fast_registry_config, registry_fixture, MockConnector};

    fn fast_lifecycle() -> LifecycleConfig {
        LifecycleConfig {
            health_check_interval_ms: 10,
            graceful_shutdown_timeout_ms: 1_000,
            ..LifecycleConfig::default()
        }
    }

    async fn orchestrator() -> Arc<LifecycleOrchestrator> {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        Arc::new(LifecycleOrchestrator::new(registry, fast_lifecycle()))
    }

    fn retrying(id: &str, max_retries: u32) -> ConnectorConfig {
        ConnectorConfig {
            max_retries,
            retry_delay_ms: 1,
            ..ConnectorConfig::new(id, "crm", id)
        }
    }

    #[tokio::test]
    async fn test_retry_ceiling_is_exact() {
        let orchestrator = orchestrator().await;
        let connector = Arc::new(MockConnector::failing_connects(u32::MAX));
        orchestrator
            .registry()
            .register(connector.clone(), retrying("conn-1", 2))
            .await
            .unwrap();

        let err = orchestrator.start_with_retry("conn-1").await.unwrap_err();
        assert!(matches!(err, VaultError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(orchestrator.retry_statistics().await.get("conn-1"), Some(&2));

        orchestrator.reset_retries("conn-1").await;
        assert!(orchestrator.retry_statistics().await.is_empty());
    }

    #[tokio::test]
    async fn test_success_after_failure_clears_counter_and_emits_recovered() {
        let orchestrator = orchestrator().await;
        let mut events = orchestrator.registry().subscribe();
        orchestrator
            .registry()
            .register(Arc::new(MockConnector::failing_connects(1)), retrying("conn-1", 3))
            .await
            .unwrap();

        assert_ok!(orchestrator.start_with_retry("conn-1").await);
        assert!(orchestrator.retry_statistics().await.is_empty());

        let recovered = std::iter::from_fn(|| events.try_recv().ok()).find_map(|e| match e {
            LifecycleEvent::ConnectorRecovered { attempts, .. } => Some(attempts),
            _ => None,
        });
        assert_eq!(recovered, Some(2));
    }

    #[tokio::test]
    async fn test_disabled_connector_is_not_retried() {
        let orchestrator = orchestrator().await;
        let connector = Arc::new(MockConnector::healthy());
        orchestrator
            .registry()
            .register(
                connector.clone(),
                ConnectorConfig {
                    is_enabled: false,
                    ..retrying("conn-1", 5)
                },
            )
            .await
            .unwrap();

        let err = orchestrator.start_with_retry("conn-1").await.unwrap_err();
        assert!(matches!(err, VaultError::ConnectorDisabled(_)));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert!(orchestrator.retry_statistics().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_detects_degrade_restarts_and_restores() {
        let orchestrator = orchestrator().await;
        let mut events = orchestrator.registry().subscribe();
        let connector = Arc::new(MockConnector::healthy());
        orchestrator
            .registry()
            .register(connector.clone(), retrying("conn-1", 3))
            .await
            .unwrap();
        orchestrator.start_with_retry("conn-1").await.unwrap();

        // First sample only establishes a baseline
        assert!(orchestrator.health_sweep().await.is_empty());

        connector.set_health(HealthState::Degraded);
        let transitions = orchestrator.health_sweep().await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].kind, TransitionKind::Degraded);
        assert!(transitions[0].auto_restarted);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

        connector.set_health(HealthState::Healthy);
        let transitions = orchestrator.health_sweep().await;
        assert_eq!(transitions[0].kind, TransitionKind::Restored);

        let names: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name())
            .filter(|n| {
                matches!(
                    *n,
                    "health_degraded" | "health_restored" | "connector_recovered"
                )
            })
            .collect();
        assert_eq!(
            names,
            vec!["health_degraded", "health_restored", "connector_recovered"]
        );
        assert_eq!(orchestrator.lifecycle_statistics().await.auto_restarts, 1);
    }

    #[tokio::test]
    async fn test_reregistered_id_starts_with_clean_policy_state() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let orchestrator = LifecycleOrchestrator::new(
            registry.clone(),
            LifecycleConfig {
                max_auto_restarts: 1,
                ..fast_lifecycle()
            },
        );
        let first = Arc::new(MockConnector::failing_connects(1));
        registry.register(first.clone(), retrying("conn-1", 3)).await.unwrap();
        orchestrator.start_with_retry("conn-1").await.unwrap();
        orchestrator.health_sweep().await;
        first.set_health(HealthState::Degraded);
        assert!(orchestrator.health_sweep().await[0].auto_restarted);

        registry.unregister("conn-1").await.unwrap();
        assert!(orchestrator.health_sweep().await.is_empty());
        assert_eq!(orchestrator.lifecycle_statistics().await.auto_restarts, 0);

        let second = Arc::new(MockConnector::healthy());
        registry.register(second.clone(), retrying("conn-1", 3)).await.unwrap();
        registry.start("conn-1").await.unwrap();
        // No stale `degraded` baseline, so no false restore
        assert!(orchestrator.health_sweep().await.is_empty());

        second.set_health(HealthState::Degraded);
        let transitions = orchestrator.health_sweep().await;
        assert!(transitions[0].auto_restarted);
        assert_eq!(second.connects.load(Ordering::SeqCst), 2);
        assert!(orchestrator.retry_statistics().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_retry_counter_is_dropped_on_reregistration() {
        let orchestrator = orchestrator().await;
        let registry = orchestrator.registry().clone();
        registry
            .register(Arc::new(MockConnector::failing_connects(u32::MAX)), retrying("conn-1", 2))
            .await
            .unwrap();
        let _ = orchestrator.start_with_retry("conn-1").await;
        assert_eq!(orchestrator.retry_statistics().await.get("conn-1"), Some(&2));

        registry.unregister("conn-1").await.unwrap();
        orchestrator.health_sweep().await;
        assert!(orchestrator.retry_statistics().await.is_empty());
    }

    #[tokio::test]
    async fn test_auto_restart_respects_limit() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let orchestrator = LifecycleOrchestrator::new(
            registry,
            LifecycleConfig {
                max_auto_restarts: 0,
                ..fast_lifecycle()
            },
        );
        let connector = Arc::new(MockConnector::healthy());
        orchestrator
            .registry()
            .register(connector.clone(), retrying("conn-1", 3))
            .await
            .unwrap();
        orchestrator.start_with_retry("conn-1").await.unwrap();
        orchestrator.health_sweep().await;

        connector.set_health(HealthState::Unhealthy);
        let transitions = orchestrator.health_sweep().await;
        assert!(!transitions[0].auto_restarted);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_trends_and_attention_list() {
        let orchestrator = orchestrator().await;
        let steady = Arc::new(MockConnector::healthy());
        let sinking = Arc::new(MockConnector::healthy());
        let registry = orchestrator.registry().clone();
        registry.register(steady.clone(), retrying("steady", 3)).await.unwrap();
        registry.register(sinking.clone(), retrying("sinking", 3)).await.unwrap();

        registry.probe_health("steady").await.unwrap();
        registry.probe_health("sinking").await.unwrap();
        sinking.set_health(HealthState::Unhealthy);
        registry.probe_health("steady").await.unwrap();
        registry.probe_health("sinking").await.unwrap();

        let trends = orchestrator.health_trends().await;
        assert_eq!(trends.get("steady"), Some(&HealthTrend::Stable));
        assert_eq!(trends.get("sinking"), Some(&HealthTrend::Degrading));

        let attention = orchestrator.attention_list().await;
        assert_eq!(attention.len(), 1);
        assert_eq!(attention[0].connector_id, "sinking");
        assert_eq!(attention[0].reasons, vec!["unhealthy".to_string()]);
    }

    #[tokio::test]
    async fn test_attention_flags_connectors_near_retry_ceiling() {
        let orchestrator = orchestrator().await;
        orchestrator
            .registry()
            .register(
                Arc::new(MockConnector::failing_connects(u32::MAX)),
                retrying("flaky", 2),
            )
            .await
            .unwrap();
        let _ = orchestrator.start_with_retry("flaky").await;

        let attention = orchestrator.attention_list().await;
        assert_eq!(attention.len(), 1);
        assert!(attention[0].reasons.contains(&"in error state".to_string()));
        assert!(attention[0].reasons.contains(&"retries at 2/2".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_connectors() {
        let orchestrator = orchestrator().await;
        let registry = orchestrator.registry().clone();
        let ok = Arc::new(MockConnector::healthy());
        let stubborn = Arc::new(MockConnector::healthy());
        stubborn.fail_disconnect(true);
        registry.register(ok.clone(), retrying("ok", 1)).await.unwrap();
        registry.register(stubborn.clone(), retrying("stubborn", 1)).await.unwrap();
        registry.register(Arc::new(MockConnector::healthy()), retrying("idle", 1)).await.unwrap();
        registry.start("ok").await.unwrap();
        registry.start("stubborn").await.unwrap();

        let report = orchestrator.shutdown().await.unwrap();
        assert_eq!(report.stopped, vec!["ok".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "stubborn");
        assert!(!report.timed_out);
        assert_eq!(registry.status("ok").await, Some(ConnectorStatus::Stopped));
        assert_eq!(registry.status("stubborn").await, Some(ConnectorStatus::Error));
    }

    #[tokio::test]
    async fn test_shutdown_deadline_is_enforced() {
        let (registry, _) = registry_fixture(fast_registry_config()).await;
        let orchestrator = LifecycleOrchestrator::new(
            registry.clone(),
            LifecycleConfig {
                graceful_shutdown_timeout_ms: 20,
                ..fast_lifecycle()
            },
        );
        let slow = Arc::new(MockConnector::healthy().with_op_delay(Duration::from_millis(10)));
        registry.register(slow.clone(), retrying("slow", 1)).await.unwrap();
        registry.start("slow").await.unwrap();

        let slow_stop = Arc::new(MockConnector::healthy().with_op_delay(Duration::from_millis(500)));
        registry.register(slow_stop.clone(), retrying("slower", 1)).await.unwrap();
        // Connect also takes 500ms here
        registry.start("slower").await.unwrap();

        let started = std::time::Instant::now();
        let err = assert_err!(orchestrator.shutdown().await);
        assert!(started.elapsed() < Duration::from_millis(400));
        let VaultError::ShutdownTimeout { report, .. } = err else {
            panic!("expected a shutdown timeout, got {err:?}");
        };
        assert!(report.timed_out);
        assert_eq!(report.stopped, vec!["slow".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "slower");
    }

    #[tokio::test]
    async fn test_monitoring_loop_runs_sweeps_until_shutdown() {
        let orchestrator = orchestrator().await;
        let connector = Arc::new(MockConnector::healthy());
        orchestrator
            .registry()
            .register(connector.clone(), retrying("conn-1", 1))
            .await
            .unwrap();

        let handle = orchestrator.start_monitoring();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(connector.health_checks.load(Ordering::SeqCst) >= 2);

        orchestrator.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

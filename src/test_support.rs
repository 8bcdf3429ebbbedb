//! Shared fixtures and mock collaborators for unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::{AccessorConfig, CredentialStoreConfig, RegistryConfig, RotationPolicy};
use crate::registry::{Connector, ConnectorHealth, ConnectorRegistry, HealthState};
use crate::security::{
    CredentialRecord, CredentialStore, InMemoryCredentialBackend, KeyManager, RefreshedToken,
    SecureCredentialAccessor, TokenRefresher,
};

pub(crate) struct VaultFixture {
    pub keys: Arc<KeyManager>,
    pub backend: Arc<InMemoryCredentialBackend>,
    pub store: Arc<CredentialStore>,
    pub accessor: Arc<SecureCredentialAccessor>,
}

/// Key manager with one active key, an in-memory store with cheap key
/// derivation, and an accessor without a refresher.
pub(crate) async fn vault_fixture(retain_old_versions: usize) -> VaultFixture {
    let keys = Arc::new(
        KeyManager::new(RotationPolicy {
            retain_old_versions,
            ..RotationPolicy::default()
        })
        .unwrap(),
    );
    keys.generate_key().await.unwrap();
    let backend = Arc::new(InMemoryCredentialBackend::new());
    let store = Arc::new(CredentialStore::new(
        keys.clone(),
        backend.clone(),
        CredentialStoreConfig {
            kdf_iterations: 1_000,
            ..CredentialStoreConfig::default()
        },
    ));
    let accessor = Arc::new(SecureCredentialAccessor::new(
        store.clone(),
        AccessorConfig {
            refresh_backoff_base_ms: 1,
            ..AccessorConfig::default()
        },
    ));
    VaultFixture {
        keys,
        backend,
        store,
        accessor,
    }
}

/// Registry settings with millisecond pauses and no background timers.
pub(crate) fn fast_registry_config() -> RegistryConfig {
    RegistryConfig {
        health_monitoring: false,
        default_health_check_interval_ms: 20,
        restart_pause_ms: 1,
        ..RegistryConfig::default()
    }
}

pub(crate) async fn registry_fixture(config: RegistryConfig) -> (ConnectorRegistry, VaultFixture) {
    let vault = vault_fixture(5).await;
    let registry = ConnectorRegistry::new(vault.accessor.clone(), config);
    (registry, vault)
}

/// Refresher that fails a fixed number of times before succeeding.
pub(crate) struct MockRefresher {
    failures_left: AtomicU32,
    pub calls: AtomicU32,
}

impl MockRefresher {
    /// `u32::MAX` never succeeds.
    pub fn failing_times(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TokenRefresher for MockRefresher {
    async fn refresh(&self, _credentials: &CredentialRecord) -> anyhow::Result<RefreshedToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if consume_failure(&self.failures_left) {
            anyhow::bail!("token endpoint returned 503");
        }
        Ok(RefreshedToken {
            access_token: "at-refreshed".to_string(),
            refresh_token: Some("rt-refreshed".to_string()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            token_type: "Bearer".to_string(),
        })
    }
}

/// Decrement a failure budget. `u32::MAX` is an unlimited budget.
fn consume_failure(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
            0 => None,
            u32::MAX => Some(u32::MAX),
            n => Some(n - 1),
        })
        .is_ok()
}

/// Scriptable connector that counts calls and tracks overlapping operations.
pub(crate) struct MockConnector {
    connect_failures: AtomicU32,
    disconnect_fails: AtomicBool,
    health_fails: AtomicBool,
    health: Mutex<HealthState>,
    op_delay: Duration,
    last_api_key: Mutex<Option<String>>,
    in_flight: AtomicU32,
    pub connects: AtomicU32,
    pub disconnects: AtomicU32,
    pub health_checks: AtomicU32,
    pub max_concurrent_ops: AtomicU32,
}

impl MockConnector {
    pub fn healthy() -> Self {
        Self::failing_connects(0)
    }

    /// `u32::MAX` fails every connect.
    pub fn failing_connects(failures: u32) -> Self {
        Self {
            connect_failures: AtomicU32::new(failures),
            disconnect_fails: AtomicBool::new(false),
            health_fails: AtomicBool::new(false),
            health: Mutex::new(HealthState::Healthy),
            op_delay: Duration::from_millis(1),
            last_api_key: Mutex::new(None),
            in_flight: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            health_checks: AtomicU32::new(0),
            max_concurrent_ops: AtomicU32::new(0),
        }
    }

    /// Delay applied to every connect and disconnect.
    pub fn with_op_delay(mut self, delay: Duration) -> Self {
        self.op_delay = delay;
        self
    }

    pub fn set_health(&self, state: HealthState) {
        *self.health.lock().unwrap() = state;
    }

    pub fn fail_health_probe(&self, fail: bool) {
        self.health_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.disconnect_fails.store(fail, Ordering::SeqCst);
    }

    pub fn last_api_key(&self) -> Option<String> {
        self.last_api_key.lock().unwrap().clone()
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_ops.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, credentials: Option<&CredentialRecord>) -> anyhow::Result<()> {
        self.enter();
        tokio::time::sleep(self.op_delay).await;
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_api_key.lock().unwrap() = credentials.and_then(|c| c.api_key.clone());
        let fail = consume_failure(&self.connect_failures);
        self.exit();
        if fail {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.enter();
        tokio::time::sleep(self.op_delay).await;
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.exit();
        if self.disconnect_fails.load(Ordering::SeqCst) {
            anyhow::bail!("socket already closed");
        }
        Ok(())
    }

    async fn health(&self) -> anyhow::Result<ConnectorHealth> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        if self.health_fails.load(Ordering::SeqCst) {
            anyhow::bail!("health endpoint timed out");
        }
        let status = *self.health.lock().unwrap();
        Ok(ConnectorHealth {
            response_time_ms: 12,
            uptime_secs: 60,
            ..ConnectorHealth::new(status)
        })
    }
}

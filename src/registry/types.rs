//! Connector registry types and data structures.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a registered connector.
///
/// ```text
/// registered ─┐
/// stopped ────┼─► starting ─► running ─► stopping ─► stopped
/// error ──────┘       │          │           │
///                     └──────────┴───────────┴─► error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorStatus {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn can_transition_to(self, next: ConnectorStatus) -> bool {
        use ConnectorStatus::*;
        matches!(
            (self, next),
            (Registered | Stopped | Error, Starting)
                | (Starting, Running | Error)
                | (Running, Stopping | Error)
                | (Stopping, Stopped | Error)
        )
    }
}

impl std::fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health as reported by a connector's probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Offline,
}

impl HealthState {
    pub fn score(&self) -> u32 {
        match self {
            Self::Healthy => 100,
            Self::Degraded => 50,
            Self::Unhealthy => 25,
            Self::Offline => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorHealth {
    pub status: HealthState,
    pub last_check: DateTime<Utc>,
    pub response_time_ms: u64,
    /// Fraction of failed operations, 0.0 to 1.0.
    pub error_rate: f64,
    pub uptime_secs: u64,
}

impl ConnectorHealth {
    pub fn new(status: HealthState) -> Self {
        Self {
            status,
            last_check: Utc::now(),
            response_time_ms: 0,
            error_rate: 0.0,
            uptime_secs: 0,
        }
    }

    /// Sample recorded when the probe itself fails.
    pub fn offline() -> Self {
        Self {
            error_rate: 1.0,
            ..Self::new(HealthState::Offline)
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

/// Registration settings for one connector instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub id: String,
    pub connector_type: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub auto_start: bool,
    /// Falls back to the registry default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_interval_ms: Option<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Credential handed to `connect`. Connectors without one get `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
}

impl ConnectorConfig {
    pub fn new(
        id: impl Into<String>,
        connector_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            connector_type: connector_type.into(),
            name: name.into(),
            is_enabled: true,
            auto_start: false,
            health_check_interval_ms: None,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            credential_id: None,
        }
    }
}

/// Read-only snapshot of a registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorEntry {
    pub connector_id: String,
    pub connector_type: String,
    pub name: String,
    pub status: ConnectorStatus,
    pub is_enabled: bool,
    pub auto_start: bool,
    pub health_check_interval_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub credential_id: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    pub latest_health: Option<ConnectorHealth>,
    pub health_samples: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStatistics {
    pub total: usize,
    pub by_status: HashMap<ConnectorStatus, usize>,
    pub by_type: HashMap<String, usize>,
    pub enabled: usize,
    pub disabled: usize,
    /// Mean of each connector's latest health score; connectors never
    /// sampled count as offline.
    pub average_health_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperation {
    Start,
    Stop,
    Restart,
}

/// Per-id outcome of a fan-out operation. One failure never aborts the rest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Outcome of [`super::ConnectorRegistry::execute_multi`], carrying each value.
#[derive(Debug, Clone)]
pub struct MultiResult<T> {
    pub succeeded: Vec<(String, T)>,
    pub failed: Vec<(String, String)>,
}

impl<T> Default for MultiResult<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

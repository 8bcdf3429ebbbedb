use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{ConnectorHealth, HealthState};

/// Lifecycle and health notifications for connectors.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ConnectorRegistered {
        connector_id: String,
        timestamp: DateTime<Utc>,
    },
    ConnectorUnregistered {
        connector_id: String,
        timestamp: DateTime<Utc>,
    },
    ConnectorStarted {
        connector_id: String,
        timestamp: DateTime<Utc>,
    },
    ConnectorStopped {
        connector_id: String,
        timestamp: DateTime<Utc>,
    },
    ConnectorFailed {
        connector_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// Back up after failed start attempts or after an auto-restart.
    ConnectorRecovered {
        connector_id: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    HealthDegraded {
        connector_id: String,
        previous: HealthState,
        current: HealthState,
        timestamp: DateTime<Utc>,
    },
    HealthRestored {
        connector_id: String,
        previous: HealthState,
        current: HealthState,
        timestamp: DateTime<Utc>,
    },
    ConnectorHealthUpdate {
        connector_id: String,
        health: ConnectorHealth,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectorRegistered { .. } => "connector_registered",
            Self::ConnectorUnregistered { .. } => "connector_unregistered",
            Self::ConnectorStarted { .. } => "connector_started",
            Self::ConnectorStopped { .. } => "connector_stopped",
            Self::ConnectorFailed { .. } => "connector_failed",
            Self::ConnectorRecovered { .. } => "connector_recovered",
            Self::HealthDegraded { .. } => "health_degraded",
            Self::HealthRestored { .. } => "health_restored",
            Self::ConnectorHealthUpdate { .. } => "connector_health_update",
        }
    }

    pub fn connector_id(&self) -> &str {
        match self {
            Self::ConnectorRegistered { connector_id, .. }
            | Self::ConnectorUnregistered { connector_id, .. }
            | Self::ConnectorStarted { connector_id, .. }
            | Self::ConnectorStopped { connector_id, .. }
            | Self::ConnectorFailed { connector_id, .. }
            | Self::ConnectorRecovered { connector_id, .. }
            | Self::HealthDegraded { connector_id, .. }
            | Self::HealthRestored { connector_id, .. }
            | Self::ConnectorHealthUpdate { connector_id, .. } => connector_id,
        }
    }
}

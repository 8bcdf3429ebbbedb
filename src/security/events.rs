use chrono::{DateTime, Utc};
use serde::Serialize;

/// Key-management notifications broadcast by the key manager.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyEvent {
    /// A new key became active.
    KeyGenerated {
        key_id: String,
        version: u32,
        timestamp: DateTime<Utc>,
    },
    /// The active key was replaced by rotation.
    KeyRotated {
        new_key_id: String,
        previous_key_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A retired key fell outside the retention window and was purged.
    KeyDeleted {
        key_id: String,
        version: u32,
        timestamp: DateTime<Utc>,
    },
    /// Rotation aborted; the previous key is still active.
    KeyRotationFailed {
        active_key_id: Option<String>,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// The rotation policy changed.
    RotationPolicyUpdated {
        rotation_interval_days: u32,
        retain_old_versions: usize,
        automatic_rotation: bool,
        timestamp: DateTime<Utc>,
    },
}

impl KeyEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::KeyGenerated { .. } => "key_generated",
            Self::KeyRotated { .. } => "key_rotated",
            Self::KeyDeleted { .. } => "key_deleted",
            Self::KeyRotationFailed { .. } => "key_rotation_failed",
            Self::RotationPolicyUpdated { .. } => "rotation_policy_updated",
        }
    }
}

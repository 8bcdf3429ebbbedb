//! Error types for the credential vault and connector lifecycle.
//!
//! Distinguishes between transient errors (retried by policy) and errors that
//! must surface immediately (validation, corruption, exhausted entropy).

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::ShutdownReport;
use crate::registry::ConnectorStatus;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Credential not found: {0}")]
    CredentialNotFound(String),

    #[error("Credential already exists: {0}")]
    CredentialExists(String),

    #[error("Connector not found: {0}")]
    ConnectorNotFound(String),

    #[error("Connector already registered: {0}")]
    ConnectorExists(String),

    #[error("Connector {0} is disabled")]
    ConnectorDisabled(String),

    #[error("Illegal state transition for connector {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ConnectorStatus,
        to: ConnectorStatus,
    },

    #[error("Connector {id} failed: {message}")]
    Connector { id: String, message: String },

    #[error("Connector {id} failed to start after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Token refresh for credential {id} failed after {attempts} attempts: {last_error}")]
    RefreshFailed {
        id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Credential {0} failed authentication: ciphertext, IV or salt was modified")]
    Tampered(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Key version {0} is no longer retained")]
    KeyVersionUnavailable(u32),

    #[error("No active encryption key")]
    NoActiveKey,

    #[error("Entropy source failure: {0}")]
    Entropy(String),

    #[error("Key rotation failed: {0}")]
    RotationFailed(String),

    #[error("Invalid rotation policy: {0}")]
    InvalidPolicy(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// `report` covers the connectors that settled before the deadline; the
    /// rest are listed as failed.
    #[error("Shutdown did not complete within {timeout:?}")]
    ShutdownTimeout {
        timeout: Duration,
        report: Box<ShutdownReport>,
    },
}

impl VaultError {
    /// Whether the failure may clear up on its own and is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connector { .. } | Self::RefreshFailed { .. } | Self::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VaultError>;

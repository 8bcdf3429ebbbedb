//! # Connector Vault
//!
//! Encrypted credential storage with versioned key rotation, audited
//! credential access, and lifecycle orchestration for external-service
//! connectors.
//!
//! ## Architecture
//!
//! ```text
//!   LifecycleOrchestrator   retries, health sweep, graceful shutdown
//!            │
//!            ▼
//!   ConnectorRegistry       per-connector state machine + health timers
//!            │
//!            ▼
//!   SecureCredentialAccessor   audit log, expiry check, token refresh
//!            │
//!            ▼
//!   CredentialStore         AES-256-GCM records behind a CredentialBackend
//!            │
//!            ▼
//!   KeyManager              versioned keys, rotation, retention
//! ```
//!
//! ## Modules
//! - `security`: key management, encrypted storage and credential access
//! - `registry`: connector catalogue and state machine
//! - `lifecycle`: policy layer above the registry
//! - `config`: environment and YAML configuration

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod security;
pub mod util;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{Result, VaultError};
pub use lifecycle::{LifecycleOrchestrator, LifecycleStatistics, ShutdownReport};
pub use registry::{Connector, ConnectorConfig, ConnectorRegistry, ConnectorStatus, LifecycleEvent};
pub use security::{
    CredentialRecord, CredentialStore, KeyManager, SecureCredentialAccessor, TokenRefresher,
};

//! Credential encryption, key management and audited credential access.

pub mod accessor;
pub mod backend;
pub mod credential_store;
pub mod crypto;
pub mod events;
pub mod key_manager;
pub mod types;

pub use accessor::{
    AccessResult, AccessStatistics, ConnectivityResult, RefreshedToken, SecureCredentialAccessor,
    TokenRefresher,
};
pub use backend::{CredentialBackend, FileCredentialBackend, InMemoryCredentialBackend};
pub use credential_store::{validate_record, CredentialStore};
pub use events::KeyEvent;
pub use key_manager::{
    ActiveKey, KeyManager, KeyMetadata, KeyStatistics, ScheduledRotation, StagedKey,
};
pub use types::{
    CredentialMetadata, CredentialRecord, CredentialStatistics, CredentialUpdate,
    EncryptedCredential, RotationReport, ValidationResult,
};

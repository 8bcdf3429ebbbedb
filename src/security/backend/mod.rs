//! Storage for encrypted credentials with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, the default)
//! - `file`: JSON snapshot file, rewritten atomically on every change
//!
//! Backends only ever see [`EncryptedCredential`]s; plaintext never reaches
//! this layer.

mod file;
mod memory;

pub use file::FileCredentialBackend;
pub use memory::InMemoryCredentialBackend;

use async_trait::async_trait;

use super::types::EncryptedCredential;
use crate::error::Result;

#[async_trait]
pub trait CredentialBackend: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<EncryptedCredential>>;

    /// Insert or replace the record with the same id.
    async fn save(&self, credential: EncryptedCredential) -> Result<()>;

    /// Returns `false` if the id was not present.
    async fn remove(&self, id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<EncryptedCredential>>;

    /// Swap the whole record set in one step. Used to commit a key rotation.
    async fn replace_all(&self, credentials: Vec<EncryptedCredential>) -> Result<()>;
}

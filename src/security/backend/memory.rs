//! In-memory credential backend (non-persistent).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CredentialBackend;
use crate::error::Result;
use crate::security::types::EncryptedCredential;

#[derive(Clone, Default)]
pub struct InMemoryCredentialBackend {
    credentials: Arc<RwLock<HashMap<String, EncryptedCredential>>>,
}

impl InMemoryCredentialBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialBackend for InMemoryCredentialBackend {
    async fn load(&self, id: &str) -> Result<Option<EncryptedCredential>> {
        Ok(self.credentials.read().await.get(id).cloned())
    }

    async fn save(&self, credential: EncryptedCredential) -> Result<()> {
        self.credentials
            .write()
            .await
            .insert(credential.id.clone(), credential);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.credentials.write().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<EncryptedCredential>> {
        let mut credentials: Vec<EncryptedCredential> =
            self.credentials.read().await.values().cloned().collect();
        credentials.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(credentials)
    }

    async fn replace_all(&self, credentials: Vec<EncryptedCredential>) -> Result<()> {
        let replacement = credentials
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect::<HashMap<_, _>>();
        *self.credentials.write().await = replacement;
        Ok(())
    }
}

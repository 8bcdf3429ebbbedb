//! JSON file-based credential backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

use super::CredentialBackend;
use crate::error::{Result, VaultError};
use crate::security::types::EncryptedCredential;

#[derive(Debug, Deserialize, Default)]
struct CredentialSnapshot {
    credentials: HashMap<String, EncryptedCredential>,
}

#[derive(Serialize)]
struct CredentialSnapshotRef<'a> {
    credentials: &'a HashMap<String, EncryptedCredential>,
}

#[derive(Clone)]
pub struct FileCredentialBackend {
    path: PathBuf,
    credentials: Arc<RwLock<HashMap<String, EncryptedCredential>>>,
    persist_lock: Arc<Mutex<()>>,
}

impl FileCredentialBackend {
    /// Open (or create) `credentials.json` under `base_dir`.
    ///
    /// A snapshot that exists but cannot be parsed is an error: starting empty
    /// would silently drop every stored credential on the next write.
    pub async fn open(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| VaultError::Storage(format!("Failed to create store dir: {}", e)))?;
        let path = base_dir.join("credentials.json");
        let snapshot = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<CredentialSnapshot>(&bytes).map_err(|e| {
                VaultError::Storage(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => CredentialSnapshot::default(),
            Err(err) => {
                return Err(VaultError::Storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    err
                )))
            }
        };
        tracing::debug!(
            path = %path.display(),
            records = snapshot.credentials.len(),
            "Opened credential file"
        );

        Ok(Self {
            path,
            credentials: Arc::new(RwLock::new(snapshot.credentials)),
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Apply `change` to a copy of the record set, persist the copy, and only
    /// then swap it in. A failed write leaves memory and disk as they were.
    async fn commit<T>(
        &self,
        change: impl FnOnce(&mut HashMap<String, EncryptedCredential>) -> T,
    ) -> Result<T> {
        let _guard = self.persist_lock.lock().await;
        let mut candidate = self.credentials.read().await.clone();
        let outcome = change(&mut candidate);
        self.persist(&candidate).await?;
        *self.credentials.write().await = candidate;
        Ok(outcome)
    }

    async fn persist(&self, credentials: &HashMap<String, EncryptedCredential>) -> Result<()> {
        let snapshot = CredentialSnapshotRef { credentials };
        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| VaultError::Storage(format!("Failed to serialize store: {}", e)))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, data)
            .await
            .map_err(|e| VaultError::Storage(format!("Failed to write store: {}", e)))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| VaultError::Storage(format!("Failed to finalize store: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl CredentialBackend for FileCredentialBackend {
    async fn load(&self, id: &str) -> Result<Option<EncryptedCredential>> {
        Ok(self.credentials.read().await.get(id).cloned())
    }

    async fn save(&self, credential: EncryptedCredential) -> Result<()> {
        self.commit(|map| {
            map.insert(credential.id.clone(), credential);
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        if !self.credentials.read().await.contains_key(id) {
            return Ok(false);
        }
        self.commit(|map| map.remove(id).is_some()).await
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
        self.commit(|map| *map = replacement).await
    }
}

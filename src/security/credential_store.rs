//! Envelope-encrypted credential storage.
//!
//! Each record gets a fresh salt and IV on every write. The per-record AES key
//! is derived from the active master key and the salt with PBKDF2. The record
//! id, connector type and expiry are bound as additional authenticated data,
//! so ciphertexts cannot be moved between ids and the clear metadata cannot
//! be edited at rest.
//!
//! Key rotation is eager: `rotate_keys` re-encrypts every record under a
//! staged key and commits the key only after the whole record set has been
//! swapped in. Writes and reads share `rotation_lock`; rotation takes it
//! exclusively, so a write that starts first is included in the pass and one
//! that starts later lands under the new key.
//!
//! Rotating the [`KeyManager`] directly bypasses re-encryption. Records keep
//! decrypting while their version is retained and fail with
//! `KeyVersionUnavailable` once it is purged.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use url::Url;
use zeroize::Zeroize;

use super::backend::CredentialBackend;
use super::crypto::{self, SecureKey, SALT_LENGTH};
use super::key_manager::{KeyManager, ScheduledRotation, StagedKey};
use super::types::{
    CredentialMetadata, CredentialRecord, CredentialStatistics, CredentialUpdate,
    EncryptedCredential, RotationReport, SensitiveFields, ValidationResult,
};
use crate::config::CredentialStoreConfig;
use crate::error::{Result, VaultError};

/// API keys shorter than this draw a warning.
const MIN_API_KEY_LENGTH: usize = 16;
/// `additional_config.timeout` values above this (ms) draw a warning.
const MAX_REASONABLE_TIMEOUT_MS: f64 = 60_000.0;

pub struct CredentialStore {
    keys: Arc<KeyManager>,
    backend: Arc<dyn CredentialBackend>,
    config: CredentialStoreConfig,
    rotation_lock: RwLock<()>,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(
        keys: Arc<KeyManager>,
        backend: Arc<dyn CredentialBackend>,
        config: CredentialStoreConfig,
    ) -> Self {
        Self {
            keys,
            backend,
            config,
            rotation_lock: RwLock::new(()),
            write_lock: Mutex::new(()),
        }
    }

    /// Encrypt and store a new credential under the active key.
    ///
    /// Fails with `Validation` listing every problem, or `CredentialExists`
    /// if the id is taken. Warnings are logged but never block storage.
    pub async fn store(&self, record: &CredentialRecord) -> Result<String> {
        let validation = validate_record(record, Utc::now());
        if !validation.is_valid {
            return Err(VaultError::Validation(validation.errors));
        }
        log_warnings(&record.id, &validation.warnings);

        let _rotation = self.rotation_lock.read().await;
        let _write = self.write_lock.lock().await;

        if self.backend.load(&record.id).await?.is_some() {
            return Err(VaultError::CredentialExists(record.id.clone()));
        }

        let active = self.keys.get_active_key().await.ok_or(VaultError::NoActiveKey)?;
        let now = Utc::now();
        let encrypted = self
            .encrypt_record(record, &active.key, active.metadata.version, now, now)
            .await?;
        self.backend.save(encrypted).await?;

        tracing::info!(
            credential_id = %record.id,
            connector_type = %record.connector_type,
            key_version = active.metadata.version,
            "Stored credential"
        );
        Ok(record.id.clone())
    }

    /// Decrypt a credential.
    ///
    /// Unknown and expired ids return `None`. A failed authentication check
    /// is `Tampered`, never `None`.
    pub async fn retrieve(&self, id: &str) -> Result<Option<CredentialRecord>> {
        let _rotation = self.rotation_lock.read().await;
        let Some(encrypted) = self.backend.load(id).await? else {
            return Ok(None);
        };
        if encrypted.is_expired_at(Utc::now()) {
            tracing::debug!(credential_id = %id, "Credential expired; not returned");
            return Ok(None);
        }
        self.decrypt_record(&encrypted).await.map(Some)
    }

    /// Merge `update` onto the stored record and re-encrypt under the active key.
    pub async fn update(&self, id: &str, update: CredentialUpdate) -> Result<()> {
        let _rotation = self.rotation_lock.read().await;
        let _write = self.write_lock.lock().await;

        let existing = self
            .backend
            .load(id)
            .await?
            .ok_or_else(|| VaultError::CredentialNotFound(id.to_string()))?;
        let mut record = self.decrypt_record(&existing).await?;
        record.merge(update);

        let validation = validate_record(&record, Utc::now());
        if !validation.is_valid {
            return Err(VaultError::Validation(validation.errors));
        }
        log_warnings(id, &validation.warnings);

        let active = self.keys.get_active_key().await.ok_or(VaultError::NoActiveKey)?;
        let encrypted = self
            .encrypt_record(
                &record,
                &active.key,
                active.metadata.version,
                existing.created_at,
                Utc::now(),
            )
            .await?;
        self.backend.save(encrypted).await?;

        tracing::info!(
            credential_id = %id,
            key_version = active.metadata.version,
            "Updated credential"
        );
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let _rotation = self.rotation_lock.read().await;
        let _write = self.write_lock.lock().await;
        if !self.backend.remove(id).await? {
            return Err(VaultError::CredentialNotFound(id.to_string()));
        }
        tracing::info!(credential_id = %id, "Deleted credential");
        Ok(())
    }

    /// Re-encrypt every record under a new master key.
    ///
    /// All records are decrypted and re-encrypted under a staged key first.
    /// Only when that succeeds for every record is the new set written and the
    /// key committed; any failure leaves both the key and the records as they
    /// were and emits `key_rotation_failed`.
    pub async fn rotate_keys(&self) -> Result<RotationReport> {
        let _rotation = self.rotation_lock.write().await;

        let previous_version = self
            .keys
            .get_active_key()
            .await
            .map(|active| active.metadata.version);
        let records = self.backend.list().await?;

        let result = self.reencrypt_all(&records).await;
        let (staged, reencrypted) = match result {
            Ok(pair) => pair,
            Err(e) => return Err(self.fail_rotation(e).await),
        };
        let count = reencrypted.len();

        if let Err(e) = self.backend.replace_all(reencrypted).await {
            return Err(self.abort_rotation(records, e).await);
        }

        let new_version = staged.version();
        let new_key_id = match self.keys.commit_rotation(staged).await {
            Ok(key_id) => key_id,
            Err(e) => return Err(self.abort_rotation(records, e).await),
        };

        tracing::info!(
            previous_version = ?previous_version,
            key_version = new_version,
            reencrypted = count,
            "Credential store rotated to new master key"
        );
        Ok(RotationReport {
            previous_version,
            new_version,
            new_key_id,
            reencrypted: count,
        })
    }

    async fn reencrypt_all(
        &self,
        records: &[EncryptedCredential],
    ) -> Result<(StagedKey, Vec<EncryptedCredential>)> {
        let staged = self.keys.prepare_rotation().await?;
        let mut reencrypted = Vec::with_capacity(records.len());
        for encrypted in records {
            let record = self.decrypt_record(encrypted).await?;
            reencrypted.push(
                self.encrypt_record(
                    &record,
                    staged.key(),
                    staged.version(),
                    encrypted.created_at,
                    encrypted.updated_at,
                )
                .await?,
            );
        }
        Ok((staged, reencrypted))
    }

    /// Put the pre-rotation records back after a failure past the re-encrypt
    /// step. A backend may have applied part of a failed `replace_all`.
    async fn abort_rotation(&self, records: Vec<EncryptedCredential>, error: VaultError) -> VaultError {
        if let Err(restore) = self.backend.replace_all(records).await {
            tracing::error!(
                error = %restore,
                "Failed to restore credentials after aborted rotation"
            );
            return self
                .fail_rotation(VaultError::Storage(format!(
                    "rotation aborted ({}) and restore failed: {}",
                    error, restore
                )))
                .await;
        }
        self.fail_rotation(error).await
    }

    async fn fail_rotation(&self, error: VaultError) -> VaultError {
        self.keys.report_rotation_failure(&error).await;
        match error {
            VaultError::RotationFailed(_) => error,
            other => VaultError::RotationFailed(other.to_string()),
        }
    }

    /// Metadata for every record. Never decrypts.
    pub async fn list(&self) -> Result<Vec<CredentialMetadata>> {
        let now = Utc::now();
        Ok(self
            .backend
            .list()
            .await?
            .iter()
            .map(|c| c.metadata(now))
            .collect())
    }

    pub async fn get_metadata(&self, id: &str) -> Result<Option<CredentialMetadata>> {
        Ok(self
            .backend
            .load(id)
            .await?
            .map(|c| c.metadata(Utc::now())))
    }

    pub fn validate_credentials(&self, record: &CredentialRecord) -> ValidationResult {
        validate_record(record, Utc::now())
    }

    pub async fn statistics(&self) -> Result<CredentialStatistics> {
        let now = Utc::now();
        let horizon = now + chrono::Duration::hours(24);
        let mut stats = CredentialStatistics::default();
        for credential in self.backend.list().await? {
            stats.total += 1;
            match credential.expires_at {
                Some(at) if at <= now => stats.expired += 1,
                Some(at) if at <= horizon => stats.expiring_within_24h += 1,
                _ => {}
            }
            *stats
                .by_connector_type
                .entry(credential.connector_type.clone())
                .or_insert(0) += 1;
            *stats.by_key_version.entry(credential.key_version).or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn record_key(&self, master: &SecureKey, salt: &[u8]) -> Result<SecureKey> {
        let master = master.clone();
        let salt = salt.to_vec();
        let iterations = self.config.kdf_iterations;
        let digest = self.config.kdf_digest;
        tokio::task::spawn_blocking(move || {
            crypto::derive_record_key(&master, &salt, iterations, digest)
        })
        .await
        .map_err(|e| VaultError::Crypto(format!("Key derivation task failed: {}", e)))
    }

    async fn encrypt_record(
        &self,
        record: &CredentialRecord,
        master: &SecureKey,
        key_version: u32,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Result<EncryptedCredential> {
        let salt = crypto::random_bytes(SALT_LENGTH)?;
        let record_key = self.record_key(master, &salt).await?;

        let mut plaintext = serde_json::to_vec(&record.sensitive())
            .map_err(|e| VaultError::Crypto(format!("Failed to serialize credential: {}", e)))?;
        let aad = record_aad(&record.id, &record.connector_type, record.expires_at);
        let sealed = crypto::seal(&record_key, &plaintext, &aad);
        plaintext.zeroize();
        let (iv, ciphertext) = sealed?;

        Ok(EncryptedCredential {
            id: record.id.clone(),
            connector_type: record.connector_type.clone(),
            ciphertext,
            iv,
            salt,
            key_version,
            created_at,
            updated_at,
            expires_at: record.expires_at,
        })
    }

    async fn decrypt_record(&self, encrypted: &EncryptedCredential) -> Result<CredentialRecord> {
        let master = self.keys.key_for_version(encrypted.key_version).await?;
        let record_key = self.record_key(&master, &encrypted.salt).await?;

        let aad = record_aad(&encrypted.id, &encrypted.connector_type, encrypted.expires_at);
        let mut plaintext = crypto::decrypt(&record_key, &encrypted.iv, &encrypted.ciphertext, &aad)
        .map_err(|_| {
            tracing::error!(
                credential_id = %encrypted.id,
                key_version = encrypted.key_version,
                "Credential failed authentication"
            );
            VaultError::Tampered(encrypted.id.clone())
        })?;
        let fields = serde_json::from_slice::<SensitiveFields>(&plaintext);
        plaintext.zeroize();
        let fields = fields
            .map_err(|e| VaultError::Crypto(format!("Malformed credential payload: {}", e)))?;

        Ok(CredentialRecord::from_parts(
            encrypted.id.clone(),
            encrypted.connector_type.clone(),
            encrypted.expires_at,
            fields,
        ))
    }
}

#[async_trait]
impl ScheduledRotation for CredentialStore {
    async fn rotate_scheduled(&self) -> Result<String> {
        if !self.keys.scheduled_rotation_due().await {
            return self.keys.active_key_id().await.ok_or(VaultError::NoActiveKey);
        }
        self.rotate_keys().await.map(|report| report.new_key_id)
    }
}

/// Additional authenticated data for a record: its id plus the fields stored
/// beside the ciphertext in clear, so none of them can be edited at rest.
fn record_aad(id: &str, connector_type: &str, expires_at: Option<DateTime<Utc>>) -> Vec<u8> {
    let expiry = expires_at.map_or_else(|| "-".to_string(), |at| at.timestamp_micros().to_string());
    [id, connector_type, expiry.as_str()].join("\0").into_bytes()
}

fn log_warnings(id: &str, warnings: &[String]) {
    for warning in warnings {
        tracing::warn!(credential_id = %id, "{}", warning);
    }
}

fn non_empty(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

/// Structural validation of a credential record.
///
/// Errors make the record unstorable; warnings are advisory.
pub fn validate_record(record: &CredentialRecord, now: DateTime<Utc>) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if record.id.trim().is_empty() {
        errors.push("id is required".to_string());
    }
    if record.connector_type.trim().is_empty() {
        errors.push("connector_type is required".to_string());
    }

    let has_auth = non_empty(&record.api_key)
        || non_empty(&record.access_token)
        || (non_empty(&record.client_id) && non_empty(&record.client_secret));
    if !has_auth {
        errors.push(
            "at least one authentication method is required \
             (api_key, access_token, or client_id + client_secret)"
                .to_string(),
        );
    }

    if let Some(endpoint) = &record.endpoint {
        match Url::parse(endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
            Ok(url) => errors.push(format!(
                "endpoint must be an http or https URL, got scheme '{}'",
                url.scheme()
            )),
            Err(e) => errors.push(format!("endpoint is not a valid URL: {}", e)),
        }
    }

    if let Some(api_key) = &record.api_key {
        if api_key.chars().count() < MIN_API_KEY_LENGTH {
            warnings.push(format!(
                "API key is shorter than {} characters",
                MIN_API_KEY_LENGTH
            ));
        }
    }
    if let Some(timeout) = record.additional_config.get("timeout").and_then(|v| v.as_f64()) {
        if timeout > MAX_REASONABLE_TIMEOUT_MS {
            warnings.push(format!("timeout of {} ms is unusually high", timeout));
        }
    }
    if record.is_expired_at(now) {
        warnings.push("credential is already expired".to_string());
    }

    ValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

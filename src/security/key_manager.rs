//! Master key lifecycle: generation, versioning, rotation, retention.
//!
//! Exactly one key is active at a time. Retired keys keep their material so
//! ciphertexts written under them stay readable until they fall outside the
//! retention window (`retain_old_versions`, newest first), at which point they
//! are purged and a `key_deleted` event is emitted.
//!
//! Rotation is two-phase so callers that must re-protect data can do so
//! before the new key becomes active:
//!
//! ```text
//! prepare_rotation() ──► StagedKey ──► (re-encrypt under staged key) ──► commit_rotation()
//!                              │
//!                              └── dropped on failure: nothing changes
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::crypto::{self, KdfParams, SecureKey};
use super::events::KeyEvent;
use crate::config::RotationPolicy;
use crate::error::{Result, VaultError};

/// Fixed plaintext used by [`KeyManager::validate_integrity`].
const INTEGRITY_PROBE: &[u8] = b"connector-vault integrity probe";

/// Public view of a key. Never carries key material.
#[derive(Debug, Clone, Serialize)]
pub struct KeyMetadata {
    pub key_id: String,
    pub version: u32,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub rotation_count: u32,
    /// Key check value recorded at generation time.
    pub fingerprint: String,
}

struct KeyRecord {
    metadata: KeyMetadata,
    material: SecureKey,
}

/// The current active key, handed to the credential store for encryption.
#[derive(Debug, Clone)]
pub struct ActiveKey {
    pub key_id: String,
    pub key: SecureKey,
    pub metadata: KeyMetadata,
}

/// A freshly generated key that is not yet active.
///
/// Produced by [`KeyManager::prepare_rotation`]; becomes active only through
/// [`KeyManager::commit_rotation`]. Dropping it discards (and zeroizes) the key.
#[derive(Debug)]
pub struct StagedKey {
    key_id: String,
    version: u32,
    material: SecureKey,
    fingerprint: String,
}

impl StagedKey {
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn key(&self) -> &SecureKey {
        &self.material
    }
}

/// Snapshot of key-management state for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatistics {
    pub total_keys: usize,
    pub active_key_id: Option<String>,
    pub active_version: Option<u32>,
    pub active_key_age_days: Option<i64>,
    pub rotation_due: bool,
    pub next_rotation_at: Option<DateTime<Utc>>,
    pub automatic_rotation: bool,
    pub total_rotations: u64,
}

/// Something the rotation schedule can rotate.
///
/// Implemented by the key manager itself and by the credential store, whose
/// rotation re-encrypts every record under the new key.
#[async_trait]
pub trait ScheduledRotation: Send + Sync {
    async fn rotate_scheduled(&self) -> Result<String>;
}

struct KeyState {
    /// Newest first; index 0 is the active key once one exists.
    keys: Vec<KeyRecord>,
    next_version: u32,
    total_rotations: u64,
}

pub struct KeyManager {
    state: RwLock<KeyState>,
    policy: RwLock<RotationPolicy>,
    events: broadcast::Sender<KeyEvent>,
    schedule: Mutex<Option<CancellationToken>>,
    shutdown: CancellationToken,
}

impl KeyManager {
    pub fn new(policy: RotationPolicy) -> Result<Self> {
        policy.validate().map_err(VaultError::InvalidPolicy)?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            state: RwLock::new(KeyState {
                keys: Vec::new(),
                next_version: 1,
                total_rotations: 0,
            }),
            policy: RwLock::new(policy),
            events,
            schedule: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Subscribe to key-management notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: KeyEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Generate a new 256-bit key and make it active.
    ///
    /// The previously active key is deactivated (its material is retained) and
    /// keys beyond the retention window are purged.
    pub async fn generate_key(&self) -> Result<String> {
        let staged = self.prepare_rotation().await?;
        let (key_id, _) = self.install(staged, false).await?;
        Ok(key_id)
    }

    /// Replace the active key.
    ///
    /// On failure the previous key stays active and `key_rotation_failed` is
    /// emitted before the error is returned.
    pub async fn rotate(&self) -> Result<String> {
        let result = match self.prepare_rotation().await {
            Ok(staged) => self.commit_rotation(staged).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            self.report_rotation_failure(e).await;
        }
        result
    }

    /// Generate the next key without activating it.
    pub async fn prepare_rotation(&self) -> Result<StagedKey> {
        let material = SecureKey::generate()?;
        let fingerprint = crypto::fingerprint(&material)?;
        let version = self.state.read().await.next_version;
        Ok(StagedKey {
            key_id: Uuid::new_v4().to_string(),
            version,
            material,
            fingerprint,
        })
    }

    /// Activate a staged key as a rotation of the current one.
    pub async fn commit_rotation(&self, staged: StagedKey) -> Result<String> {
        let (key_id, previous) = self.install(staged, true).await?;
        tracing::info!(
            key_id = %key_id,
            previous_key_id = previous.as_deref().unwrap_or("none"),
            "Master key rotated"
        );
        self.emit(KeyEvent::KeyRotated {
            new_key_id: key_id.clone(),
            previous_key_id: previous,
            timestamp: Utc::now(),
        });
        Ok(key_id)
    }

    /// Emit `key_rotation_failed` for a rotation aborted outside the manager.
    pub async fn report_rotation_failure(&self, error: &VaultError) {
        let active_key_id = self.active_key_id().await;
        tracing::error!(
            active_key_id = active_key_id.as_deref().unwrap_or("none"),
            error = %error,
            "Key rotation failed; previous key remains active"
        );
        self.emit(KeyEvent::KeyRotationFailed {
            active_key_id,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }

    async fn install(&self, staged: StagedKey, rotation: bool) -> Result<(String, Option<String>)> {
        let policy = self.policy.read().await.clone();
        let mut state = self.state.write().await;

        if staged.version != state.next_version {
            return Err(VaultError::RotationFailed(format!(
                "staged key version {} was superseded by version {}",
                staged.version, state.next_version
            )));
        }

        let previous = state
            .keys
            .iter_mut()
            .find(|k| k.metadata.active)
            .map(|k| {
                k.metadata.active = false;
                k.metadata.key_id.clone()
            });

        if rotation {
            for key in state.keys.iter_mut() {
                key.metadata.rotation_count = key.metadata.rotation_count.saturating_add(1);
            }
            state.total_rotations += 1;
        }

        let now = Utc::now();
        let metadata = KeyMetadata {
            key_id: staged.key_id.clone(),
            version: staged.version,
            algorithm: policy.algorithm.clone(),
            created_at: now,
            expires_at: now + chrono::Duration::days(i64::from(policy.rotation_interval_days)),
            active: true,
            rotation_count: 0,
            fingerprint: staged.fingerprint.clone(),
        };
        state.keys.insert(
            0,
            KeyRecord {
                metadata,
                material: staged.material.clone(),
            },
        );
        state.next_version += 1;

        let purged = Self::purge_beyond(&mut state, policy.retain_old_versions);
        drop(state);

        tracing::info!(
            key_id = %staged.key_id,
            key_version = staged.version,
            "Generated new master key"
        );
        self.emit(KeyEvent::KeyGenerated {
            key_id: staged.key_id.clone(),
            version: staged.version,
            timestamp: now,
        });
        self.emit_purged(purged);

        Ok((staged.key_id.clone(), previous))
    }

    /// Drop keys beyond `retain` inactive versions (the tail of the list).
    fn purge_beyond(state: &mut KeyState, retain: usize) -> Vec<KeyMetadata> {
        let limit = retain + 1;
        if state.keys.len() <= limit {
            return Vec::new();
        }
        state
            .keys
            .drain(limit..)
            .map(|record| record.metadata.clone())
            .collect()
    }

    fn emit_purged(&self, purged: Vec<KeyMetadata>) {
        for metadata in purged {
            tracing::info!(
                key_id = %metadata.key_id,
                key_version = metadata.version,
                "Purged retired master key"
            );
            self.emit(KeyEvent::KeyDeleted {
                key_id: metadata.key_id,
                version: metadata.version,
                timestamp: Utc::now(),
            });
        }
    }

    /// The current active key, or `None` before the first generation.
    pub async fn get_active_key(&self) -> Option<ActiveKey> {
        let state = self.state.read().await;
        state
            .keys
            .iter()
            .find(|k| k.metadata.active)
            .map(|k| ActiveKey {
                key_id: k.metadata.key_id.clone(),
                key: k.material.clone(),
                metadata: k.metadata.clone(),
            })
    }

    pub async fn active_key_id(&self) -> Option<String> {
        let state = self.state.read().await;
        state
            .keys
            .iter()
            .find(|k| k.metadata.active)
            .map(|k| k.metadata.key_id.clone())
    }

    /// Key material for a (possibly retired) version.
    pub async fn key_for_version(&self, version: u32) -> Result<SecureKey> {
        let state = self.state.read().await;
        state
            .keys
            .iter()
            .find(|k| k.metadata.version == version)
            .map(|k| k.material.clone())
            .ok_or(VaultError::KeyVersionUnavailable(version))
    }

    /// All retained keys, newest first.
    pub async fn list_keys(&self) -> Vec<KeyMetadata> {
        let state = self.state.read().await;
        state.keys.iter().map(|k| k.metadata.clone()).collect()
    }

    /// Password-based key derivation. Pure; touches no manager state.
    pub fn derive_key(master: &[u8], params: &KdfParams) -> Vec<u8> {
        crypto::derive_key(master, params)
    }

    /// Whether the active key has reached the rotation interval.
    ///
    /// Also true when no key has been generated yet.
    pub async fn check_rotation_needed(&self) -> bool {
        let interval_days = self.policy.read().await.rotation_interval_days;
        let state = self.state.read().await;
        match state.keys.iter().find(|k| k.metadata.active) {
            Some(active) => {
                Utc::now() - active.metadata.created_at
                    >= chrono::Duration::days(i64::from(interval_days))
            }
            None => true,
        }
    }

    /// Round-trip a probe through every retained key and compare key check values.
    ///
    /// `false` means the key material is corrupt, not that it needs rotating.
    pub async fn validate_integrity(&self) -> HashMap<String, bool> {
        let state = self.state.read().await;
        let mut results = HashMap::with_capacity(state.keys.len());
        for record in &state.keys {
            let key_id = &record.metadata.key_id;
            let fingerprint_ok = crypto::fingerprint(&record.material)
                .map(|fp| fp == record.metadata.fingerprint)
                .unwrap_or(false);
            let roundtrip_ok = crypto::seal(&record.material, INTEGRITY_PROBE, key_id.as_bytes())
                .and_then(|(nonce, ciphertext)| {
                    crypto::decrypt(&record.material, &nonce, &ciphertext, key_id.as_bytes())
                })
                .map(|plaintext| plaintext == INTEGRITY_PROBE)
                .unwrap_or(false);
            let valid = fingerprint_ok && roundtrip_ok;
            if !valid {
                tracing::error!(
                    key_id = %key_id,
                    key_version = record.metadata.version,
                    "Key failed integrity validation"
                );
            }
            results.insert(key_id.clone(), valid);
        }
        results
    }

    pub async fn rotation_policy(&self) -> RotationPolicy {
        self.policy.read().await.clone()
    }

    /// Replace the rotation policy. Invalid policies leave state untouched.
    pub async fn update_rotation_policy(&self, policy: RotationPolicy) -> Result<()> {
        policy.validate().map_err(VaultError::InvalidPolicy)?;

        let purged = {
            let mut current = self.policy.write().await;
            let mut state = self.state.write().await;
            *current = policy.clone();
            Self::purge_beyond(&mut state, policy.retain_old_versions)
        };
        self.emit_purged(purged);

        tracing::info!(
            rotation_interval_days = policy.rotation_interval_days,
            retain_old_versions = policy.retain_old_versions,
            automatic_rotation = policy.automatic_rotation,
            "Rotation policy updated"
        );
        self.emit(KeyEvent::RotationPolicyUpdated {
            rotation_interval_days: policy.rotation_interval_days,
            retain_old_versions: policy.retain_old_versions,
            automatic_rotation: policy.automatic_rotation,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    pub async fn key_statistics(&self) -> KeyStatistics {
        let policy = self.policy.read().await.clone();
        let rotation_due = self.check_rotation_needed().await;
        let state = self.state.read().await;
        let active = state.keys.iter().find(|k| k.metadata.active);
        KeyStatistics {
            total_keys: state.keys.len(),
            active_key_id: active.map(|k| k.metadata.key_id.clone()),
            active_version: active.map(|k| k.metadata.version),
            active_key_age_days: active.map(|k| (Utc::now() - k.metadata.created_at).num_days()),
            rotation_due,
            next_rotation_at: active.map(|k| {
                k.metadata.created_at
                    + chrono::Duration::days(i64::from(policy.rotation_interval_days))
            }),
            automatic_rotation: policy.automatic_rotation,
            total_rotations: state.total_rotations,
        }
    }

    /// Start the background rotation schedule.
    ///
    /// Every `check_every` the task checks whether automatic rotation is
    /// enabled and the active key has reached the rotation interval, and if so
    /// rotates through `target`. Starting a new schedule cancels the previous one.
    pub fn spawn_rotation_schedule(
        &self,
        target: Arc<dyn ScheduledRotation>,
        check_every: Duration,
    ) -> JoinHandle<()> {
        let token = self.shutdown.child_token();
        {
            let mut schedule = self.schedule.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = schedule.replace(token.clone()) {
                previous.cancel();
            }
        }

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_every);
            // First tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match target.rotate_scheduled().await {
                    Ok(key_id) => tracing::debug!(key_id = %key_id, "Scheduled rotation pass"),
                    Err(e) => tracing::warn!(error = %e, "Scheduled key rotation failed"),
                }
            }
            tracing::debug!("Key rotation schedule stopped");
        })
    }

    /// Whether a scheduled pass should rotate right now.
    pub async fn scheduled_rotation_due(&self) -> bool {
        self.policy.read().await.automatic_rotation && self.check_rotation_needed().await
    }

    /// Cancel the rotation schedule and wipe all key material.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut state = self.state.write().await;
        let count = state.keys.len();
        // SecureKey zeroizes on drop
        state.keys.clear();
        tracing::info!(keys_dropped = count, "Key manager shut down");
    }

    #[cfg(test)]
    pub(crate) async fn backdate_active_key(&self, by: chrono::Duration) {
        let mut state = self.state.write().await;
        if let Some(active) = state.keys.iter_mut().find(|k| k.metadata.active) {
            active.metadata.created_at = active.metadata.created_at - by;
        }
    }

    #[cfg(test)]
    pub(crate) async fn corrupt_key(&self, version: u32) {
        let mut state = self.state.write().await;
        if let Some(record) = state.keys.iter_mut().find(|k| k.metadata.version == version) {
            record.material.as_bytes_mut()[0] ^= 0xff;
        }
    }
}

#[async_trait]
impl ScheduledRotation for KeyManager {
    async fn rotate_scheduled(&self) -> Result<String> {
        if !self.scheduled_rotation_due().await {
            return self.active_key_id().await.ok_or(VaultError::NoActiveKey);
        }
        self.rotate().await
    }
}

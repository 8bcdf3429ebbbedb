//! Audited read path for credentials.
//!
//! Every read is logged to a bounded per-id ring buffer and checked against
//! simple rate heuristics. Those checks only produce warnings; they never
//! deny access. Credentials close to expiry are refreshed through a
//! caller-supplied [`TokenRefresher`] with bounded exponential backoff, and a
//! refresh that keeps failing degrades to returning the current record.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use super::credential_store::{validate_record, CredentialStore};
use super::types::{CredentialRecord, CredentialUpdate, ValidationResult};
use crate::config::AccessorConfig;
use crate::error::{Result, VaultError};
use crate::util::push_bounded;

/// More accesses than this within a minute is suspicious.
const MAX_ACCESSES_PER_MINUTE: usize = 10;
/// More accesses than this within an hour is suspicious.
const MAX_ACCESSES_PER_HOUR: usize = 100;
/// Minimum samples before interval analysis applies.
const MIN_INTERVAL_SAMPLES: usize = 10;
/// Interval analysis applies only to ids normally read less often than this.
const MIN_AVERAGE_INTERVAL_SECS: f64 = 10.0;
/// A latest interval below this fraction of the average is suspicious.
const BURST_RATIO: f64 = 0.1;

/// New token material returned by a refresh callback.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub token_type: String,
}

/// Exchanges a credential's refresh material for a new token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, credentials: &CredentialRecord) -> anyhow::Result<RefreshedToken>;
}

#[derive(Debug, Clone)]
pub struct AccessResult {
    pub record: Option<CredentialRecord>,
    pub access_time: DateTime<Utc>,
    pub key_version: Option<u32>,
    pub is_expired: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityResult {
    pub can_access: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AccessStatistics {
    /// Accesses currently retained in the log.
    pub total_accesses: usize,
    pub last_access: Option<DateTime<Utc>>,
    pub accesses_last_minute: usize,
    pub accesses_last_hour: usize,
    pub average_interval_secs: Option<f64>,
}

pub struct SecureCredentialAccessor {
    store: Arc<CredentialStore>,
    config: AccessorConfig,
    refresher: Option<Arc<dyn TokenRefresher>>,
    access_log: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl SecureCredentialAccessor {
    pub fn new(store: Arc<CredentialStore>, config: AccessorConfig) -> Self {
        Self {
            store,
            config,
            refresher: None,
            access_log: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Read a credential with auditing and refresh-on-demand.
    ///
    /// Unknown and expired ids yield `record: None`. Integrity failures are
    /// errors.
    pub async fn get_credentials(&self, id: &str) -> Result<AccessResult> {
        let access_time = Utc::now();
        let metadata = self.store.get_metadata(id).await?;

        // Reads of unknown ids are not logged, so the log stays bounded by the store
        let mut warnings = match metadata {
            Some(_) => self.record_access(id, access_time).await,
            None => Vec::new(),
        };
        for warning in &warnings {
            tracing::warn!(credential_id = %id, "Suspicious access: {}", warning);
        }
        let mut key_version = metadata.as_ref().map(|m| m.key_version);
        let is_expired = metadata.as_ref().is_some_and(|m| m.is_expired);

        let mut record = self.store.retrieve(id).await?;

        if let Some(current) = &record {
            if self.needs_refresh(current, access_time) {
                match self.refresh_with_retry(current).await {
                    Ok(refreshed) => {
                        key_version = self
                            .store
                            .get_metadata(id)
                            .await?
                            .map(|m| m.key_version);
                        record = Some(refreshed);
                    }
                    Err(e) => {
                        tracing::warn!(credential_id = %id, error = %e, "Token refresh failed");
                        warnings.push(format!("token refresh failed: {}", e));
                    }
                }
            }
        }

        tracing::debug!(
            credential_id = %id,
            found = record.is_some(),
            is_expired,
            "Credential accessed"
        );
        Ok(AccessResult {
            record,
            access_time,
            key_version,
            is_expired,
            warnings,
        })
    }

    fn needs_refresh(&self, record: &CredentialRecord, now: DateTime<Utc>) -> bool {
        if !self.config.auto_refresh || self.refresher.is_none() {
            return false;
        }
        let threshold = chrono::Duration::minutes(self.config.refresh_threshold_minutes);
        record.expires_at.is_some_and(|at| at - now <= threshold)
    }

    /// Call the refresher up to `max_refresh_attempts` times, sleeping
    /// `base * 2^attempt` between attempts, then persist the new token.
    async fn refresh_with_retry(&self, record: &CredentialRecord) -> Result<CredentialRecord> {
        let Some(refresher) = &self.refresher else {
            return Err(VaultError::RefreshFailed {
                id: record.id.clone(),
                attempts: 0,
                last_error: "no refresher configured".to_string(),
            });
        };

        let attempts = self.config.max_refresh_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 0..attempts {
            match refresher.refresh(record).await {
                Ok(token) => {
                    tracing::info!(
                        credential_id = %record.id,
                        attempt = attempt + 1,
                        "Refreshed credential token"
                    );
                    return self.write_back(record, token).await;
                }
                Err(e) => {
                    tracing::debug!(
                        credential_id = %record.id,
                        attempt = attempt + 1,
                        error = %e,
                        "Refresh attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.backoff_for(attempt)).await;
            }
        }

        Err(VaultError::RefreshFailed {
            id: record.id.clone(),
            attempts,
            last_error,
        })
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        self.config
            .refresh_backoff_base()
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    async fn write_back(
        &self,
        record: &CredentialRecord,
        token: RefreshedToken,
    ) -> Result<CredentialRecord> {
        let mut extra = HashMap::new();
        extra.insert(
            "token_type".to_string(),
            serde_json::Value::String(token.token_type),
        );
        self.store
            .update(
                &record.id,
                CredentialUpdate {
                    access_token: Some(token.access_token),
                    refresh_token: token.refresh_token,
                    expires_at: Some(token.expires_at),
                    additional_config: Some(extra),
                    ..CredentialUpdate::default()
                },
            )
            .await?;
        self.store
            .retrieve(&record.id)
            .await?
            .ok_or_else(|| VaultError::RefreshFailed {
                id: record.id.clone(),
                attempts: 1,
                last_error: "refreshed token is already expired".to_string(),
            })
    }

    async fn record_access(&self, id: &str, at: DateTime<Utc>) -> Vec<String> {
        let mut log = self.access_log.lock().await;
        let entries = log.entry(id.to_string()).or_default();
        push_bounded(entries, at, self.config.access_log_capacity);
        detect_suspicious(entries, at)
    }

    /// Structural checks plus an expiry-proximity warning.
    ///
    /// Unknown or expired ids come back invalid rather than as errors.
    pub async fn validate_credentials(&self, id: &str) -> Result<ValidationResult> {
        let now = Utc::now();
        let Some(record) = self.store.retrieve(id).await? else {
            let reason = match self.store.get_metadata(id).await? {
                Some(_) => "credential has expired",
                None => "credential not found",
            };
            return Ok(ValidationResult {
                is_valid: false,
                errors: vec![reason.to_string()],
                warnings: Vec::new(),
            });
        };

        let mut result = validate_record(&record, now);
        if let Some(expires_at) = record.expires_at {
            let remaining = expires_at - now;
            if remaining < chrono::Duration::hours(24) {
                result.warnings.push(format!(
                    "credential expires in {} hours",
                    remaining.num_hours()
                ));
            }
        }
        Ok(result)
    }

    /// Existence and expiry probe. Makes no network call and is not audited.
    pub async fn test_connectivity(&self, id: &str) -> ConnectivityResult {
        let started = Instant::now();
        let outcome = match self.store.retrieve(id).await {
            Ok(Some(_)) => None,
            Ok(None) => match self.store.get_metadata(id).await {
                Ok(Some(_)) => Some("credential has expired".to_string()),
                Ok(None) => Some("credential not found".to_string()),
                Err(e) => Some(e.to_string()),
            },
            Err(e) => Some(e.to_string()),
        };
        ConnectivityResult {
            can_access: outcome.is_none(),
            response_time_ms: started.elapsed().as_millis() as u64,
            error: outcome,
        }
    }

    pub async fn access_statistics(&self, id: &str) -> AccessStatistics {
        let now = Utc::now();
        let log = self.access_log.lock().await;
        let Some(entries) = log.get(id) else {
            return AccessStatistics::default();
        };
        AccessStatistics {
            total_accesses: entries.len(),
            last_access: entries.back().copied(),
            accesses_last_minute: count_since(entries, now - chrono::Duration::seconds(60)),
            accesses_last_hour: count_since(entries, now - chrono::Duration::hours(1)),
            average_interval_secs: average_interval_secs(entries),
        }
    }

    pub async fn clear_access_log(&self, id: &str) {
        if self.access_log.lock().await.remove(id).is_some() {
            tracing::debug!(credential_id = %id, "Cleared access log");
        }
    }
}

fn count_since(entries: &VecDeque<DateTime<Utc>>, since: DateTime<Utc>) -> usize {
    entries.iter().filter(|at| **at > since).count()
}

fn intervals_secs(entries: &VecDeque<DateTime<Utc>>) -> Vec<f64> {
    entries
        .iter()
        .zip(entries.iter().skip(1))
        .map(|(a, b)| (*b - *a).num_milliseconds() as f64 / 1000.0)
        .collect()
}

fn average_interval_secs(entries: &VecDeque<DateTime<Utc>>) -> Option<f64> {
    let intervals = intervals_secs(entries);
    if intervals.is_empty() {
        return None;
    }
    Some(intervals.iter().sum::<f64>() / intervals.len() as f64)
}

/// Advisory access-pattern checks over one id's log (oldest first).
fn detect_suspicious(entries: &VecDeque<DateTime<Utc>>, now: DateTime<Utc>) -> Vec<String> {
    let mut warnings = Vec::new();

    let last_minute = count_since(entries, now - chrono::Duration::seconds(60));
    if last_minute > MAX_ACCESSES_PER_MINUTE {
        warnings.push(format!("{} accesses in the last minute", last_minute));
    }
    let last_hour = count_since(entries, now - chrono::Duration::hours(1));
    if last_hour > MAX_ACCESSES_PER_HOUR {
        warnings.push(format!("{} accesses in the last hour", last_hour));
    }

    if entries.len() >= MIN_INTERVAL_SAMPLES {
        let intervals = intervals_secs(entries);
        if let (Some(average), Some(latest)) = (average_interval_secs(entries), intervals.last()) {
            if average > MIN_AVERAGE_INTERVAL_SECS && *latest < average * BURST_RATIO {
                warnings.push(format!(
                    "access interval of {:.1}s is far below the usual {:.1}s",
                    latest, average
                ));
            }
        }
    }

    warnings
}

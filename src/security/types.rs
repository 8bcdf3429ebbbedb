//! Credential records, their encrypted form, and report structures.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Decrypted view of a credential.
///
/// Exists only for the duration of a retrieval; callers must not cache it.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    pub connector_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub additional_config: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialRecord {
    pub fn new(id: impl Into<String>, connector_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            connector_type: connector_type.into(),
            ..Self::default()
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Apply the fields present in `update`; absent fields are kept.
    pub fn merge(&mut self, update: CredentialUpdate) {
        if let Some(connector_type) = update.connector_type {
            self.connector_type = connector_type;
        }
        if let Some(v) = update.api_key {
            self.api_key = Some(v);
        }
        if let Some(v) = update.client_id {
            self.client_id = Some(v);
        }
        if let Some(v) = update.client_secret {
            self.client_secret = Some(v);
        }
        if let Some(v) = update.access_token {
            self.access_token = Some(v);
        }
        if let Some(v) = update.refresh_token {
            self.refresh_token = Some(v);
        }
        if let Some(v) = update.endpoint {
            self.endpoint = Some(v);
        }
        if let Some(config) = update.additional_config {
            self.additional_config.extend(config);
        }
        if let Some(expires_at) = update.expires_at {
            self.expires_at = Some(expires_at);
        }
    }

    pub(crate) fn sensitive(&self) -> SensitiveFields {
        SensitiveFields {
            api_key: self.api_key.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            access_token: self.access_token.clone(),
            refresh_token: self.refresh_token.clone(),
            endpoint: self.endpoint.clone(),
            additional_config: self.additional_config.clone(),
        }
    }

    pub(crate) fn from_parts(
        id: String,
        connector_type: String,
        expires_at: Option<DateTime<Utc>>,
        fields: SensitiveFields,
    ) -> Self {
        Self {
            id,
            connector_type,
            api_key: fields.api_key,
            client_id: fields.client_id,
            client_secret: fields.client_secret,
            access_token: fields.access_token,
            refresh_token: fields.refresh_token,
            endpoint: fields.endpoint,
            additional_config: fields.additional_config,
            expires_at,
        }
    }
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn redact(value: &Option<String>) -> &'static str {
            if value.is_some() {
                "[REDACTED]"
            } else {
                "None"
            }
        }
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("connector_type", &self.connector_type)
            .field("api_key", &redact(&self.api_key))
            .field("client_id", &self.client_id)
            .field("client_secret", &redact(&self.client_secret))
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("endpoint", &self.endpoint)
            .field("additional_config_keys", &self.additional_config.keys().collect::<Vec<_>>())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Partial update merged onto an existing record.
#[derive(Debug, Clone, Default)]
pub struct CredentialUpdate {
    pub connector_type: Option<String>,
    pub api_key: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub endpoint: Option<String>,
    /// Merged key by key into the existing map.
    pub additional_config: Option<HashMap<String, serde_json::Value>>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The portion of a record that is encrypted.
#[derive(Serialize, Deserialize)]
pub(crate) struct SensitiveFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub additional_config: HashMap<String, serde_json::Value>,
}

/// A credential as held at rest.
///
/// `ciphertext` carries the GCM tag and is bound to `id`, `connector_type`
/// and `expires_at` as additional authenticated data. Byte fields serialize
/// as base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedCredential {
    pub id: String,
    pub connector_type: String,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl EncryptedCredential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn metadata(&self, now: DateTime<Utc>) -> CredentialMetadata {
        CredentialMetadata {
            id: self.id.clone(),
            connector_type: self.connector_type.clone(),
            key_version: self.key_version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            is_expired: self.is_expired_at(now),
        }
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Non-sensitive description of a stored credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialMetadata {
    pub id: String,
    pub connector_type: String,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
}

/// Outcome of credential validation. Warnings never block storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CredentialStatistics {
    pub total: usize,
    pub expired: usize,
    pub expiring_within_24h: usize,
    pub by_connector_type: HashMap<String, usize>,
    pub by_key_version: HashMap<u32, usize>,
}

/// Result of re-encrypting the store under a new master key.
#[derive(Debug, Clone, Serialize)]
pub struct RotationReport {
    pub previous_version: Option<u32>,
    pub new_version: u32,
    pub new_key_id: String,
    pub reencrypted: usize,
}

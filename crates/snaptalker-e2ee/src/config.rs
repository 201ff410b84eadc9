use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backup::{MAX_BACKUP_ITERATIONS, MIN_BACKUP_ITERATIONS};
use crate::error::CryptoError;
use crate::prekeys::DEFAULT_ONE_TIME_PREKEY_COUNT;
use crate::queue::MAX_DELIVERY_ATTEMPTS;

/// Engine tunables. Every field has a default, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Size of the one-time prekey pool published at registration.
    #[serde(default = "default_one_time_prekey_count")]
    pub one_time_prekey_count: u32,
    /// Publish a fresh batch once the local pool drops below this.
    #[serde(default = "default_replenish_threshold")]
    pub replenish_threshold: u32,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    /// Peer bundles older than this are rejected.
    #[serde(default = "default_max_bundle_age_days")]
    pub max_bundle_age_days: u32,
    /// PBKDF2 rounds for backups. Can only be raised above the default.
    #[serde(default = "default_backup_iterations")]
    pub backup_iterations: u32,
    /// Refuse handshakes against bundles without a one-time prekey.
    #[serde(default)]
    pub require_one_time_prekey: bool,
}

fn default_one_time_prekey_count() -> u32 {
    DEFAULT_ONE_TIME_PREKEY_COUNT
}

fn default_replenish_threshold() -> u32 {
    10
}

fn default_max_delivery_attempts() -> u32 {
    MAX_DELIVERY_ATTEMPTS
}

fn default_max_bundle_age_days() -> u32 {
    30
}

fn default_backup_iterations() -> u32 {
    MIN_BACKUP_ITERATIONS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            one_time_prekey_count: default_one_time_prekey_count(),
            replenish_threshold: default_replenish_threshold(),
            max_delivery_attempts: default_max_delivery_attempts(),
            max_bundle_age_days: default_max_bundle_age_days(),
            backup_iterations: default_backup_iterations(),
            require_one_time_prekey: false,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.one_time_prekey_count == 0 {
            return Err(CryptoError::Serialization(
                "oneTimePrekeyCount must be at least 1".into(),
            ));
        }
        if self.replenish_threshold > self.one_time_prekey_count {
            return Err(CryptoError::Serialization(
                "replenishThreshold cannot exceed oneTimePrekeyCount".into(),
            ));
        }
        if self.max_delivery_attempts == 0 {
            return Err(CryptoError::Serialization(
                "maxDeliveryAttempts must be at least 1".into(),
            ));
        }
        if self.max_bundle_age_days == 0 {
            return Err(CryptoError::Serialization(
                "maxBundleAgeDays must be at least 1".into(),
            ));
        }
        if !(MIN_BACKUP_ITERATIONS..=MAX_BACKUP_ITERATIONS).contains(&self.backup_iterations) {
            return Err(CryptoError::Serialization(format!(
                "backupIterations must be between {MIN_BACKUP_ITERATIONS} and {MAX_BACKUP_ITERATIONS}"
            )));
        }
        Ok(())
    }

    pub fn max_bundle_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_bundle_age_days) * 24 * 60 * 60)
    }
}

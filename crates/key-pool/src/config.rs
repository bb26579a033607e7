//! Pool policy configuration
//!
//! Every field has a default so an empty `[pool]` TOML table is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which cooling key to hand out when none is currently eligible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Earliest `failed_at`: the key failing longest is assumed closest to recovering.
    #[default]
    OldestFailure,
    /// Earliest `cooldown_until`.
    SoonestRecovery,
}

/// Cooldown and persistence policy for a [`crate::KeyPool`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Cooldown for a 429 without a usable `retry-after` header.
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
    /// Cooldown for 5xx, network errors, and anything unclassifiable.
    #[serde(default = "default_transient_cooldown_secs")]
    pub transient_cooldown_secs: u64,
    #[serde(default)]
    pub fallback: FallbackPolicy,
    /// Storage key the pool snapshot is written under.
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

fn default_rate_limit_cooldown_secs() -> u64 {
    300
}

fn default_transient_cooldown_secs() -> u64 {
    30
}

fn default_storage_key() -> String {
    "key-pool/state".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            transient_cooldown_secs: default_transient_cooldown_secs(),
            fallback: FallbackPolicy::default(),
            storage_key: default_storage_key(),
        }
    }
}

impl PoolConfig {
    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }

    pub fn transient_cooldown(&self) -> Duration {
        Duration::from_secs(self.transient_cooldown_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_key.trim().is_empty() {
            return Err(Error::Configuration(
                "storage_key must not be empty".into(),
            ));
        }
        Ok(())
    }
}

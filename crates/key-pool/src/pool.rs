//! Pool state machine and round-robin key selection
//!
//! The pool holds one record per configured key and hands keys out round-robin.
//! All records and the rotation cursor live behind a single mutex: selection
//! reads every record's state together with the cursor, so a key marked dead by
//! one thread can never be handed out by another in the same instant.
//!
//! Cooldown expiry is lazy: a CoolingDown key whose window has passed becomes
//! Healthy only when a `get_key()` scan reaches it. There is no timer.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use common::Secret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::classify::{Classification, ErrorResponse, classify};
use crate::clock::{Clock, SystemClock};
use crate::config::{FallbackPolicy, PoolConfig};
use crate::error::{Error, Result};
use crate::metrics;
use crate::snapshot::{PersistedKey, Persister, PoolSnapshot, SNAPSHOT_VERSION};
use crate::storage::Storage;

/// Usability of a single key.
///
/// Transitions:
/// - Healthy → CoolingDown (rate limited or transient failure)
/// - Healthy → Dead (401/403)
/// - CoolingDown → Healthy (cooldown elapsed and scanned, or success reported)
/// - CoolingDown → Dead (401/403)
/// - Dead → (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Healthy,
    CoolingDown,
    Dead,
}

impl KeyState {
    /// Status label for health/logging.
    pub fn label(&self) -> &'static str {
        match self {
            KeyState::Healthy => "healthy",
            KeyState::CoolingDown => "cooling_down",
            KeyState::Dead => "dead",
        }
    }
}

/// Key counts by last-known state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub healthy: usize,
    pub cooling_down: usize,
    pub dead: usize,
}

/// Log-safe identifier for a credential: 12 bytes of SHA-256, base64url.
pub fn fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..12])
}

#[derive(Debug)]
struct KeyRecord {
    key: Secret<String>,
    fingerprint: String,
    state: KeyState,
    failed_at: Option<u64>,
    cooldown_until: Option<u64>,
    consecutive_failures: u32,
    last_used_at: Option<u64>,
}

impl KeyRecord {
    fn new(key: String) -> Self {
        let fingerprint = fingerprint(&key);
        Self {
            key: Secret::new(key),
            fingerprint,
            state: KeyState::Healthy,
            failed_at: None,
            cooldown_until: None,
            consecutive_failures: 0,
            last_used_at: None,
        }
    }

    /// Whether normal rotation may hand this key out, promoting an expired
    /// cooldown to Healthy on the way.
    fn take_if_eligible(&mut self, now: u64) -> bool {
        match self.state {
            KeyState::Healthy => true,
            KeyState::CoolingDown => {
                let expired = self.cooldown_until.is_none_or(|until| until <= now);
                if expired {
                    info!(key = %self.fingerprint, "cooldown expired, key available again");
                    self.state = KeyState::Healthy;
                    self.failed_at = None;
                    self.cooldown_until = None;
                }
                expired
            }
            KeyState::Dead => false,
        }
    }

    fn persisted(&self) -> PersistedKey {
        PersistedKey {
            state: self.state,
            failed_at: self.failed_at,
            cooldown_until: self.cooldown_until,
            consecutive_failures: self.consecutive_failures,
            last_used_at: self.last_used_at,
        }
    }

    fn restore(&mut self, persisted: &PersistedKey) {
        self.state = persisted.state;
        (self.failed_at, self.cooldown_until) = match persisted.state {
            KeyState::Healthy => (None, None),
            KeyState::CoolingDown => (persisted.failed_at, persisted.cooldown_until),
            KeyState::Dead => (persisted.failed_at, None),
        };
        self.consecutive_failures = persisted.consecutive_failures;
        self.last_used_at = persisted.last_used_at;
    }
}

struct PoolState {
    records: Vec<KeyRecord>,
    /// Index of the last key returned by normal rotation.
    cursor: Option<usize>,
}

impl PoolState {
    fn find_mut(&mut self, key: &str) -> Option<&mut KeyRecord> {
        self.records.iter_mut().find(|r| r.key.matches(key))
    }

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for record in &self.records {
            match record.state {
                KeyState::Healthy => stats.healthy += 1,
                KeyState::CoolingDown => stats.cooling_down += 1,
                KeyState::Dead => stats.dead += 1,
            }
        }
        stats
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            version: SNAPSHOT_VERSION,
            cursor: self
                .cursor
                .map(|idx| self.records[idx].fingerprint.clone()),
            keys: self
                .records
                .iter()
                .map(|r| (r.fingerprint.clone(), r.persisted()))
                .collect(),
        }
    }

    fn restore(&mut self, snapshot: &PoolSnapshot) -> usize {
        let mut restored = 0;
        for record in &mut self.records {
            if let Some(persisted) = snapshot.keys.get(&record.fingerprint) {
                record.restore(persisted);
                restored += 1;
            }
        }
        self.cursor = snapshot
            .cursor
            .as_ref()
            .and_then(|fp| self.records.iter().position(|r| &r.fingerprint == fp));
        restored
    }
}

/// Credential pool rotating among interchangeable API keys.
///
/// Shared between request workers via `Arc<KeyPool>`. Every state-reading or
/// state-mutating operation takes the one pool lock; `classify_error` takes none.
/// State changes are written behind to the storage collaborator.
pub struct KeyPool {
    state: Mutex<PoolState>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    persister: Persister,
}

impl KeyPool {
    /// Create a pool with the default policy and the system clock.
    pub fn new(keys: Vec<String>, storage: Arc<dyn Storage>) -> Result<Self> {
        Self::with_options(keys, storage, PoolConfig::default(), Arc::new(SystemClock))
    }

    /// Create a pool from an ordered, non-empty list of distinct keys.
    ///
    /// State previously persisted under `config.storage_key` is restored for
    /// keys still present in `keys`. An unreadable snapshot is logged and the
    /// pool starts fresh.
    pub fn with_options(
        keys: Vec<String>,
        storage: Arc<dyn Storage>,
        config: PoolConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        validate_keys(&keys)?;

        let mut state = PoolState {
            records: keys.into_iter().map(KeyRecord::new).collect(),
            cursor: None,
        };
        restore_from(&mut state, storage.as_ref(), &config.storage_key);

        let persister = Persister::spawn(storage, config.storage_key.clone())?;

        let stats = state.stats();
        metrics::record_state_counts(&stats);
        info!(
            keys = state.records.len(),
            healthy = stats.healthy,
            cooling_down = stats.cooling_down,
            dead = stats.dead,
            "key pool initialized"
        );

        Ok(Self {
            state: Mutex::new(state),
            config,
            clock,
            persister,
        })
    }

    /// Total number of keys, whatever their state.
    pub fn key_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Select the key for the next outbound request.
    ///
    /// Scans round-robin from just after the last returned key, promoting
    /// expired cooldowns. If nothing is eligible, falls back to a cooling key
    /// chosen by the configured [`FallbackPolicy`] without moving the cursor.
    /// Returns `None` only when every key is dead.
    pub fn get_key(&self) -> Option<String> {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        let n = state.records.len();
        let start = state.cursor.map_or(0, |c| (c + 1) % n);

        for offset in 0..n {
            let idx = (start + offset) % n;
            let record = &mut state.records[idx];
            let was_cooling = record.state == KeyState::CoolingDown;
            if !record.take_if_eligible(now) {
                continue;
            }
            record.last_used_at = Some(now);
            let key = record.key.expose().clone();
            debug!(key = %record.fingerprint, "key selected");
            state.cursor = Some(idx);
            metrics::record_selection("rotation");
            if was_cooling {
                metrics::record_state_counts(&state.stats());
            }
            self.persist(&state);
            return Some(key);
        }

        let fallback = self.fallback_index(&state);
        let Some(idx) = fallback else {
            warn!(keys = n, "all keys dead, pool exhausted");
            metrics::record_selection("exhausted");
            return None;
        };

        let record = &mut state.records[idx];
        record.last_used_at = Some(now);
        let key = record.key.expose().clone();
        info!(
            key = %record.fingerprint,
            policy = ?self.config.fallback,
            "no key eligible, using fallback"
        );
        metrics::record_selection("fallback");
        self.persist(&state);
        Some(key)
    }

    /// Classify an upstream failure under this pool's cooldown policy.
    pub fn classify_error(&self, response: &ErrorResponse) -> Classification {
        classify(response, &self.config)
    }

    /// Apply a failure classification to `key`.
    ///
    /// Unknown keys and keys already dead are ignored. A repeated failure while
    /// cooling refreshes `failed_at` and extends, never shortens, the cooldown.
    pub fn mark_failed(&self, key: &str, classification: &Classification) {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        let Some(record) = state.find_mut(key) else {
            warn!(key = %fingerprint(key), "failure reported for unknown key, ignoring");
            return;
        };

        if record.state == KeyState::Dead {
            debug!(key = %record.fingerprint, reason = %classification.reason, "key already dead, ignoring failure");
            return;
        }

        record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        if classification.is_dead {
            record.state = KeyState::Dead;
            record.cooldown_until = None;
            record.failed_at.get_or_insert(now);
            warn!(
                key = %record.fingerprint,
                reason = %classification.reason,
                "key marked dead"
            );
        } else {
            let until = now.saturating_add(classification.cooldown_ms);
            record.state = KeyState::CoolingDown;
            record.failed_at = Some(now);
            record.cooldown_until = Some(record.cooldown_until.map_or(until, |u| u.max(until)));
            info!(
                key = %record.fingerprint,
                reason = %classification.reason,
                cooldown_ms = classification.cooldown_ms,
                consecutive_failures = record.consecutive_failures,
                "key entering cooldown"
            );
        }

        metrics::record_failure(classification.reason);
        metrics::record_state_counts(&state.stats());
        self.persist(&state);
    }

    /// Report a successful request on `key`, returning it to Healthy.
    ///
    /// Dead keys stay dead. Calling this repeatedly is equivalent to calling
    /// it once.
    pub fn mark_success(&self, key: &str) {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        let Some(record) = state.find_mut(key) else {
            warn!(key = %fingerprint(key), "success reported for unknown key, ignoring");
            return;
        };

        if record.state == KeyState::Dead {
            debug!(key = %record.fingerprint, "success reported for dead key, ignoring");
            return;
        }

        if record.state != KeyState::Healthy {
            info!(key = %record.fingerprint, "key recovered");
        }
        record.state = KeyState::Healthy;
        record.consecutive_failures = 0;
        record.failed_at = None;
        record.cooldown_until = None;
        record.last_used_at = Some(now);

        metrics::record_state_counts(&state.stats());
        self.persist(&state);
    }

    /// Counts by last-known state. Expired cooldowns still count as cooling
    /// until a `get_key()` scan promotes them.
    pub fn stats(&self) -> PoolStats {
        self.lock().stats()
    }

    /// Pool health summary with per-key status, keyed by fingerprint.
    ///
    /// Status mapping: all healthy → healthy, all dead → unhealthy,
    /// anything in between → degraded.
    pub fn health(&self) -> serde_json::Value {
        let now = self.clock.now_millis();
        let state = self.lock();
        let stats = state.stats();
        let total = state.records.len();

        let keys: Vec<serde_json::Value> = state
            .records
            .iter()
            .map(|r| {
                let mut entry = serde_json::json!({
                    "fingerprint": r.fingerprint,
                    "status": r.state.label(),
                    "consecutive_failures": r.consecutive_failures,
                });
                if let (KeyState::CoolingDown, Some(until)) = (r.state, r.cooldown_until) {
                    entry["cooldown_remaining_secs"] =
                        serde_json::json!(until.saturating_sub(now).div_ceil(1000));
                }
                entry
            })
            .collect();

        let status = if stats.healthy == total {
            "healthy"
        } else if stats.dead == total {
            "unhealthy"
        } else {
            "degraded"
        };

        serde_json::json!({
            "status": status,
            "keys_total": total,
            "keys_healthy": stats.healthy,
            "keys_cooling_down": stats.cooling_down,
            "keys_dead": stats.dead,
            "fallback": self.config.fallback,
            "keys": keys,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Block until all state changes so far have reached storage.
    pub fn flush(&self) {
        self.persister.flush();
    }

    /// Clear the storage collaborator. In-memory state is left as is.
    ///
    /// The clear is ordered after every change made before this call. Changes
    /// made while it runs are persisted after it.
    pub fn reset(&self) -> Result<()> {
        let pending = {
            let _state = self.lock();
            self.persister.queue_clear()
        };
        pending.wait()
    }

    fn fallback_index(&self, state: &PoolState) -> Option<usize> {
        let live = state
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state != KeyState::Dead);
        // min_by_key keeps the first of equal minima, so ties go to pool order.
        let chosen = match self.config.fallback {
            FallbackPolicy::OldestFailure => {
                live.min_by_key(|(_, r)| r.failed_at.unwrap_or(u64::MAX))
            }
            FallbackPolicy::SoonestRecovery => {
                live.min_by_key(|(_, r)| r.cooldown_until.unwrap_or(u64::MAX))
            }
        };
        chosen.map(|(idx, _)| idx)
    }

    fn persist(&self, state: &PoolState) {
        self.persister.submit(state.snapshot());
    }

    // Every mutation leaves PoolState consistent, so a poisoned lock is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn validate_keys(keys: &[String]) -> Result<()> {
    if keys.is_empty() {
        return Err(Error::Configuration("key list must not be empty".into()));
    }
    let mut seen = HashSet::with_capacity(keys.len());
    for (idx, key) in keys.iter().enumerate() {
        if key.trim().is_empty() {
            return Err(Error::Configuration(format!(
                "key at position {idx} is empty"
            )));
        }
        if !seen.insert(key.as_str()) {
            return Err(Error::Configuration(format!(
                "duplicate key at position {idx} (fingerprint {})",
                fingerprint(key)
            )));
        }
    }
    Ok(())
}

fn restore_from(state: &mut PoolState, storage: &dyn Storage, storage_key: &str) {
    let json = match storage.get_item(storage_key) {
        Ok(Some(json)) => json,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "failed to read persisted key pool state, starting fresh");
            return;
        }
    };
    match PoolSnapshot::from_json(&json) {
        Ok(snapshot) => {
            let restored = state.restore(&snapshot);
            info!(restored, "restored persisted key pool state");
        }
        Err(e) => warn!(error = %e, "ignoring unreadable key pool snapshot"),
    }
}

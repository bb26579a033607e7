//! Pool metrics
//!
//! Emitted through the `metrics` facade; they are no-ops until the host
//! process installs a recorder.
//!
//! - `key_pool_selections_total` (counter): label `outcome` = rotation | fallback | exhausted
//! - `key_pool_failures_total` (counter): label `reason`
//! - `key_pool_keys` (gauge): label `state`
//! - `key_pool_persist_failures_total` (counter)

use crate::classify::FailureReason;
use crate::pool::PoolStats;

pub(crate) fn record_selection(outcome: &'static str) {
    metrics::counter!("key_pool_selections_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_failure(reason: FailureReason) {
    metrics::counter!("key_pool_failures_total", "reason" => reason.as_str()).increment(1);
}

pub(crate) fn record_state_counts(stats: &PoolStats) {
    metrics::gauge!("key_pool_keys", "state" => "healthy").set(stats.healthy as f64);
    metrics::gauge!("key_pool_keys", "state" => "cooling_down").set(stats.cooling_down as f64);
    metrics::gauge!("key_pool_keys", "state" => "dead").set(stats.dead as f64);
}

pub(crate) fn record_persist_failure() {
    metrics::counter!("key_pool_persist_failures_total").increment(1);
}

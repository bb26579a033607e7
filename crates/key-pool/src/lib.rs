//! Credential pool for interchangeable API keys
//!
//! Rotates among a fixed set of keys round-robin, classifies upstream failures,
//! and applies per-key cooldown and termination policy so callers never stall on
//! an exhausted or revoked credential. The pool performs no network calls: the
//! caller asks for a key, makes its request, and reports the outcome back.
//!
//! Key lifecycle:
//! 1. Pool constructed from the configured keys → every key `Healthy`
//! 2. `get_key()` hands out the next usable key round-robin
//! 3. Upstream 429 or transient failure → `CoolingDown` for the classified duration
//! 4. Upstream 401/403 → `Dead` permanently
//! 5. Cooldown elapses → promoted back to `Healthy` the next time a scan touches it
//! 6. State is written behind to the storage collaborator and restored on startup

pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
mod metrics;
pub mod pool;
pub mod snapshot;
pub mod storage;

pub use classify::{Classification, ErrorResponse, FailureReason, classify};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FallbackPolicy, PoolConfig};
pub use error::{Error, Result};
pub use pool::{KeyPool, KeyState, PoolStats, fingerprint};
pub use storage::{FileStorage, MemoryStorage, Storage};

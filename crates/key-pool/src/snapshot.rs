//! Persisted pool state and the write-behind writer
//!
//! The pool is saved as one JSON document under `PoolConfig::storage_key`.
//! Credentials are recorded only by fingerprint. Snapshots are built under the
//! pool lock (preserving mutation order) and handed to a dedicated writer
//! thread, so key selection never waits on storage I/O. Runs of consecutive
//! snapshots are coalesced: only the newest one is written.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pool::KeyState;
use crate::storage::Storage;

/// Snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persisted state of a single key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedKey {
    pub state: KeyState,
    #[serde(default)]
    pub failed_at: Option<u64>,
    #[serde(default)]
    pub cooldown_until: Option<u64>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_used_at: Option<u64>,
}

/// Whole-pool snapshot, keyed by fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub version: u32,
    /// Fingerprint of the key the rotation cursor points at.
    pub cursor: Option<String>,
    pub keys: BTreeMap<String, PersistedKey>,
}

impl PoolSnapshot {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Snapshot(format!("serializing: {e}")))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: PoolSnapshot =
            serde_json::from_str(json).map_err(|e| Error::Snapshot(format!("parsing: {e}")))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Snapshot(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }
}

enum WriteOp {
    Put(PoolSnapshot),
    Clear(Sender<Result<()>>),
    Flush(Sender<()>),
}

/// Handle to the writer thread. Dropping it drains the queue and joins.
pub(crate) struct Persister {
    tx: Option<Sender<WriteOp>>,
    handle: Option<JoinHandle<()>>,
}

impl Persister {
    pub(crate) fn spawn(storage: Arc<dyn Storage>, storage_key: String) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("key-pool-writer".into())
            .spawn(move || run_writer(storage.as_ref(), &storage_key, rx))
            .map_err(|e| Error::Storage(format!("spawning writer thread: {e}")))?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue a snapshot. Never blocks.
    pub(crate) fn submit(&self, snapshot: PoolSnapshot) {
        self.send(WriteOp::Put(snapshot));
    }

    /// Queue a clear behind every write submitted so far. Never blocks.
    pub(crate) fn queue_clear(&self) -> PendingClear {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(WriteOp::Clear(ack_tx));
        PendingClear(ack_rx)
    }

    /// Block until every write queued before this call has been attempted.
    pub(crate) fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(WriteOp::Flush(ack_tx));
        let _ = ack_rx.recv();
    }

    fn send(&self, op: WriteOp) {
        let delivered = self.tx.as_ref().is_some_and(|tx| tx.send(op).is_ok());
        if !delivered {
            warn!("key pool writer thread unavailable, write dropped");
        }
    }
}

/// A queued clear; `wait` blocks until the writer has run it.
pub(crate) struct PendingClear(Receiver<Result<()>>);

impl PendingClear {
    pub(crate) fn wait(self) -> Result<()> {
        self.0
            .recv()
            .map_err(|_| Error::Storage("writer thread stopped before clearing".into()))?
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        // Closing the channel ends the writer loop once the queue is drained.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("key pool writer thread panicked");
            }
        }
    }
}

fn run_writer(storage: &dyn Storage, storage_key: &str, rx: Receiver<WriteOp>) {
    let mut next = rx.recv().ok();
    while let Some(op) = next.take() {
        match op {
            WriteOp::Put(mut latest) => {
                loop {
                    match rx.try_recv() {
                        Ok(WriteOp::Put(newer)) => latest = newer,
                        Ok(other) => {
                            next = Some(other);
                            break;
                        }
                        Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                    }
                }
                write_snapshot(storage, storage_key, &latest);
            }
            WriteOp::Clear(ack) => {
                let result = storage.clear();
                if let Err(e) = &result {
                    warn!(error = %e, "failed to clear key pool storage");
                }
                let _ = ack.send(result);
            }
            WriteOp::Flush(ack) => {
                let _ = ack.send(());
            }
        }
        if next.is_none() {
            next = rx.recv().ok();
        }
    }
    debug!("key pool writer stopped");
}

fn write_snapshot(storage: &dyn Storage, storage_key: &str, snapshot: &PoolSnapshot) {
    let result = snapshot
        .to_json()
        .and_then(|json| storage.set_item(storage_key, &json));
    match result {
        Ok(()) => debug!(keys = snapshot.keys.len(), "persisted key pool snapshot"),
        Err(e) => {
            crate::metrics::record_persist_failure();
            warn!(error = %e, "failed to persist key pool snapshot");
        }
    }
}

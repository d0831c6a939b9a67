//! Mempool: admitted but not-yet-committed audits, deduplicated by `req_id`.
//!
//! Holds at most one copy of each request id. Snapshot order is first-append
//! order of the surviving entries, so a leader draining the pool into a block
//! orders audits deterministically from a given pool state. Durability is not
//! required here; gossip keeps retransmitting until commit evicts.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::ledger::audit::Audit;

/// Extension trait that recovers from poisoned RwLocks gracefully.
trait PoisonRecover<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T>;
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> PoisonRecover<T> for RwLock<T> {
    fn read_or_recover(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|poisoned| {
            tracing::error!("🚨 mempool RwLock was poisoned (read) — recovering");
            poisoned.into_inner()
        })
    }
    fn write_or_recover(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|poisoned| {
            tracing::error!("🚨 mempool RwLock was poisoned (write) — recovering");
            poisoned.into_inner()
        })
    }
}

#[derive(Default)]
struct MempoolInner {
    /// req_ids in first-append order; the snapshot iteration order.
    order: Vec<String>,
    entries: HashMap<String, Audit>,
}

/// Thread-safe pending-audit set. All operations are atomic with respect to
/// each other.
#[derive(Default)]
pub struct Mempool {
    inner: RwLock<MempoolInner>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert by `req_id`. A second append with the same id is a no-op;
    /// returns whether the audit was newly admitted.
    pub fn append(&self, audit: Audit) -> bool {
        let mut inner = self.inner.write_or_recover();
        if inner.entries.contains_key(&audit.req_id) {
            tracing::debug!(req_id = %audit.req_id, "duplicate audit ignored");
            return false;
        }
        inner.order.push(audit.req_id.clone());
        inner.entries.insert(audit.req_id.clone(), audit);
        true
    }

    /// Atomically remove every entry whose `req_id` is in `ids`.
    pub fn remove_batch(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        let mut inner = self.inner.write_or_recover();
        for id in ids {
            inner.entries.remove(id);
        }
        let entries = std::mem::take(&mut inner.entries);
        inner.order.retain(|id| entries.contains_key(id));
        inner.entries = entries;
    }

    /// Stable snapshot in first-append order of the surviving entries.
    pub fn load_all(&self) -> Vec<Audit> {
        let inner = self.inner.read_or_recover();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read_or_recover().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, req_id: &str) -> bool {
        self.inner.read_or_recover().entries.contains_key(req_id)
    }
}

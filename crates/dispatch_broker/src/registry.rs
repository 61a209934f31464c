//! Worker registry: tracks the set of currently-live workers and hands
//! them out one at a time for dispatch.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
}

#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub identity: Vec<u8>,
    pub worker_id: String,
    pub state: WorkerState,
    pub last_seen: Instant,
    pub capabilities: Vec<String>,
}

/// A scoped handle to a checked-out worker, returned by `checkout` and
/// consumed by `release`. Never outlives the dispatch holding it.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub identity: Vec<u8>,
    pub worker_id: String,
}

pub enum ReleaseOutcome {
    Ok,
    Evict,
}

#[derive(Default)]
struct Inner {
    workers: HashMap<Vec<u8>, WorkerRecord>,
}

/// Thread-safe registry of live workers.
///
/// Realized as a single mutex around a map plus a condition variable
/// signaling "a worker became idle" (chosen over a channel-based queue,
/// since `delete`/`snapshot` need to observe state outside of the
/// checkout/release pair).
pub struct Registry {
    inner: Mutex<Inner>,
    idle_available: Condvar,
    max_workers: usize,
}

impl Registry {
    pub fn new(max_workers: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            idle_available: Condvar::new(),
            max_workers,
        }
    }

    /// Insert a worker in state IDLE. Idempotent: a second call with the same
    /// identity refreshes `last_seen` but does not duplicate the record.
    /// Returns `false` (without touching the registry) if this would be a new
    /// worker and the registry is already at `max_workers` capacity.
    pub fn add(&self, identity: Vec<u8>, worker_id: String, capabilities: Vec<String>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.workers.get_mut(&identity) {
            Some(existing) => {
                existing.last_seen = Instant::now();
            }
            None => {
                if inner.workers.len() >= self.max_workers {
                    return false;
                }
                inner.workers.insert(
                    identity.clone(),
                    WorkerRecord {
                        identity,
                        worker_id,
                        state: WorkerState::Idle,
                        last_seen: Instant::now(),
                        capabilities,
                    },
                );
            }
        }
        drop(inner);
        self.idle_available.notify_all();
        true
    }

    /// Refresh `last_seen` for a known worker. Returns false if unknown.
    pub fn touch(&self, identity: &[u8]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.workers.get_mut(identity) {
            Some(record) => {
                record.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove a worker unconditionally. If a dispatch holds it, the dispatch
    /// must fail its call on its own next interaction with the registry.
    pub fn delete(&self, identity: &[u8]) -> Option<WorkerRecord> {
        self.inner.lock().unwrap().workers.remove(identity)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically choose one IDLE worker and mark it BUSY. Blocks up to
    /// `deadline`; fails `NoWorker` if none becomes idle in time.
    pub fn checkout(&self, deadline: Duration) -> Result<WorkerHandle> {
        let start = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        loop {
            if let Some(record) = inner
                .workers
                .values_mut()
                .find(|w| w.state == WorkerState::Idle)
            {
                record.state = WorkerState::Busy;
                return Ok(WorkerHandle {
                    identity: record.identity.clone(),
                    worker_id: record.worker_id.clone(),
                });
            }

            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return Err(BrokerError::NoWorker);
            }

            let (guard, wait_result) = self
                .idle_available
                .wait_timeout(inner, deadline - elapsed)
                .unwrap();
            inner = guard;

            if wait_result.timed_out()
                && !inner.workers.values().any(|w| w.state == WorkerState::Idle)
                && start.elapsed() >= deadline
            {
                return Err(BrokerError::NoWorker);
            }
        }
    }

    /// Return a checked-out worker to IDLE, or evict it outright.
    pub fn release(&self, handle: WorkerHandle, outcome: ReleaseOutcome) {
        let mut inner = self.inner.lock().unwrap();
        match outcome {
            ReleaseOutcome::Ok => {
                if let Some(record) = inner.workers.get_mut(&handle.identity) {
                    record.state = WorkerState::Idle;
                    record.last_seen = Instant::now();
                }
            }
            ReleaseOutcome::Evict => {
                inner.workers.remove(&handle.identity);
            }
        }
        drop(inner);
        self.idle_available.notify_all();
    }

    /// Diagnostic snapshot. DEAD is never observable: eviction removes the
    /// record outright rather than marking it dead.
    pub fn snapshot(&self) -> Vec<WorkerRecord> {
        self.inner
            .lock()
            .unwrap()
            .workers
            .values()
            .cloned()
            .collect()
    }

    /// Remove workers whose `last_seen` has aged past `timeout`, returning
    /// the removed records so the caller can fail any job that was in flight.
    pub fn evict_stale(&self, timeout: Duration) -> Vec<WorkerRecord> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let stale_ids: Vec<Vec<u8>> = inner
            .workers
            .iter()
            .filter(|(_, w)| now.saturating_duration_since(w.last_seen) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = Vec::with_capacity(stale_ids.len());
        for id in stale_ids {
            if let Some(record) = inner.workers.remove(&id) {
                removed.push(record);
            }
        }
        removed
    }
}

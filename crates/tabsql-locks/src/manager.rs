//! Named asynchronous advisory locks.
//!
//! This is the mutual-exclusion primitive everything else builds on: a
//! registry of named locks with shared/exclusive modes, FIFO waiters, and
//! scoped release. It is advisory (nothing stops a caller from touching data
//! without holding a lock) and instance-scoped (two managers know nothing of
//! each other — contexts that must coordinate share one manager).
//!
//! Acquisition returns a [`LockGuard`]; dropping the guard releases the lock
//! on every exit path, including cancellation and panics. A waiter whose
//! future is dropped before the grant arrives is detected through its closed
//! grant channel and passed over, so abandoned requests never wedge the
//! queue. The grant channel carries the guard itself: a grant that races a
//! cancellation (timeout fires after the guard was sent but before the
//! waiter polled it) is released by the unclaimed guard's own drop.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use tabsql_error::{Result, TabsqlError};

/// Acquisition mode for a named lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Held concurrently by any number of readers.
    Shared,
    /// Held by exactly one owner.
    Exclusive,
}

/// A held lock visible through [`LockManager::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    /// Lock name.
    pub name: String,
    /// Mode it is currently held in.
    pub mode: LockMode,
    /// Number of concurrent holders (1 unless shared).
    pub holders: u32,
}

struct Waiter {
    mode: LockMode,
    grant: oneshot::Sender<LockGuard>,
}

#[derive(Default)]
struct LockRecord {
    /// Mode of the current holders; meaningless when `holders == 0`.
    mode: Option<LockMode>,
    holders: u32,
    waiters: VecDeque<Waiter>,
}

impl LockRecord {
    /// Drop waiters whose requesting future has been dropped.
    fn sweep_dead(&mut self) {
        while let Some(front) = self.waiters.front() {
            if front.grant.is_closed() {
                self.waiters.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether a new request can be granted immediately, preserving FIFO
    /// order (a shared request must not overtake a queued exclusive one).
    fn grantable(&self, mode: LockMode) -> bool {
        if !self.waiters.is_empty() {
            return false;
        }
        match self.mode {
            None => true,
            Some(LockMode::Shared) => mode == LockMode::Shared && self.holders > 0,
            Some(LockMode::Exclusive) => self.holders == 0,
        }
    }

    /// Grant as many queued waiters as compatibility allows.
    ///
    /// A failed send means the requester vanished between the closed-check
    /// and the grant; its guard is returned so the caller can drop it after
    /// releasing the registry mutex (the drop re-enters `release`).
    fn grant_queued(&mut self, manager: &LockManager, name: &str) -> Vec<LockGuard> {
        let mut unclaimed = Vec::new();
        loop {
            self.sweep_dead();
            let Some(front) = self.waiters.front() else {
                break;
            };
            let compatible = self.holders == 0
                || (front.mode == LockMode::Shared && self.mode == Some(LockMode::Shared));
            if !compatible {
                break;
            }
            let waiter = self.waiters.pop_front().expect("front checked above");
            self.holders += 1;
            self.mode = Some(waiter.mode);
            if let Err(guard) = waiter.grant.send(manager.guard(name, waiter.mode)) {
                unclaimed.push(guard);
                continue;
            }
            if waiter.mode == LockMode::Exclusive {
                break;
            }
        }
        unclaimed
    }
}

#[derive(Default)]
struct ManagerInner {
    records: HashMap<String, LockRecord>,
}

/// Registry of named advisory locks.
///
/// Cheap to clone; clones share the registry. One manager instance stands in
/// for one coordination domain (an "origin" of cooperating contexts).
#[derive(Clone, Default)]
pub struct LockManager {
    inner: Arc<Mutex<ManagerInner>>,
}

impl LockManager {
    /// Create an empty lock registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().expect("lock manager poisoned")
    }

    /// Acquire `name` in `mode`, waiting as long as it takes.
    ///
    /// Waiters are served in FIFO order; consecutive shared requests are
    /// granted together.
    pub async fn request(&self, name: &str, mode: LockMode) -> LockGuard {
        let rx = {
            let mut inner = self.lock_inner();
            let record = inner.records.entry(name.to_owned()).or_default();
            record.sweep_dead();
            if record.grantable(mode) {
                record.holders += 1;
                record.mode = Some(mode);
                return self.guard(name, mode);
            }
            let (tx, rx) = oneshot::channel();
            record.waiters.push_back(Waiter { mode, grant: tx });
            rx
        };

        // The sender is only dropped if the manager itself is torn down.
        match rx.await {
            Ok(guard) => guard,
            Err(_) => unreachable!("lock manager dropped a queued waiter"),
        }
    }

    /// Acquire `name` in `mode` only if it is available right now.
    #[must_use]
    pub fn try_request(&self, name: &str, mode: LockMode) -> Option<LockGuard> {
        let mut inner = self.lock_inner();
        let record = inner.records.entry(name.to_owned()).or_default();
        record.sweep_dead();
        if record.grantable(mode) {
            record.holders += 1;
            record.mode = Some(mode);
            drop(inner);
            Some(self.guard(name, mode))
        } else {
            None
        }
    }

    /// Acquire with an optional deadline. Expiry cancels the pending waiter
    /// and surfaces busy, leaving the queue clean.
    pub async fn request_timeout(
        &self,
        name: &str,
        mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<LockGuard> {
        match timeout {
            None => Ok(self.request(name, mode).await),
            Some(limit) => tokio::time::timeout(limit, self.request(name, mode))
                .await
                .map_err(|_| TabsqlError::Busy),
        }
    }

    /// Snapshot of all currently held locks. Non-mutating introspection;
    /// pending waiters are not reported.
    #[must_use]
    pub fn query(&self) -> Vec<HeldLock> {
        let inner = self.lock_inner();
        let mut held: Vec<HeldLock> = inner
            .records
            .iter()
            .filter(|(_, r)| r.holders > 0)
            .map(|(name, r)| HeldLock {
                name: name.clone(),
                mode: r.mode.expect("holders > 0 implies a mode"),
                holders: r.holders,
            })
            .collect();
        held.sort_by(|a, b| a.name.cmp(&b.name));
        held
    }

    /// Mode `name` is currently held in, if held at all.
    #[must_use]
    pub fn held_mode(&self, name: &str) -> Option<LockMode> {
        let inner = self.lock_inner();
        inner
            .records
            .get(name)
            .filter(|r| r.holders > 0)
            .and_then(|r| r.mode)
    }

    fn guard(&self, name: &str, mode: LockMode) -> LockGuard {
        LockGuard {
            manager: self.clone(),
            name: name.to_owned(),
            mode,
        }
    }

    fn release(&self, name: &str, _mode: LockMode) {
        let unclaimed = {
            let mut inner = self.lock_inner();
            let Some(record) = inner.records.get_mut(name) else {
                return;
            };
            record.holders = record.holders.saturating_sub(1);
            if record.holders == 0 {
                record.mode = None;
            }
            let unclaimed = record.grant_queued(self, name);
            if record.holders == 0 && record.waiters.is_empty() {
                inner.records.remove(name);
            }
            unclaimed
        };
        // Dropping an unclaimed guard re-enters release, so the registry
        // mutex must not be held here.
        drop(unclaimed);
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("LockManager")
            .field("records", &inner.records.len())
            .finish_non_exhaustive()
    }
}

/// Scoped ownership of a named lock. Dropping the guard releases the lock.
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard {
    manager: LockManager,
    name: String,
    mode: LockMode,
}

impl LockGuard {
    /// Name of the held lock.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mode the lock is held in.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(&self.name, self.mode);
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

//! The synchronous/asynchronous impedance bridge.
//!
//! The SQL engine calls the VFS with blocking semantics; everything below
//! the VFS (block store flushes, lock acquisitions) is asynchronous. This
//! module is the single place that mismatch is bridged: a dedicated
//! current-thread runtime whose `block_on` parks the one engine thread until
//! the operation resolves.
//!
//! Ordering invariant: all calls enter through [`SyncBridge::run`] from the
//! single engine thread, so operation N's suspension point is registered
//! before operation N+1 can be dispatched — results cannot be delivered out
//! of order. Timers still fire and other tasks spawned onto this runtime
//! still make progress while the caller is parked.

use std::future::Future;
use std::sync::Arc;

use tabsql_error::Result;

/// Runs async operations to completion for a synchronous caller.
///
/// Cheap to clone; clones share the runtime. Must not be entered from async
/// context (the engine never does — it is synchronous by construction).
#[derive(Clone)]
pub struct SyncBridge {
    rt: Arc<tokio::runtime::Runtime>,
}

impl SyncBridge {
    /// Build a bridge with its own current-thread runtime.
    pub fn new() -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        Ok(Self { rt: Arc::new(rt) })
    }

    /// Run `fut` to completion, blocking the calling thread.
    pub fn run<F: Future>(&self, fut: F) -> F::Output {
        self.rt.block_on(fut)
    }
}

impl std::fmt::Debug for SyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBridge").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_futures_to_completion() {
        let bridge = SyncBridge::new().unwrap();
        let out = bridge.run(async { 40 + 2 });
        assert_eq!(out, 42);
    }

    #[test]
    fn preserves_call_order() {
        let bridge = SyncBridge::new().unwrap();
        let mut log = Vec::new();
        for i in 0..5 {
            let v = bridge.run(async move {
                tokio::task::yield_now().await;
                i
            });
            log.push(v);
        }
        assert_eq!(log, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn timers_fire_while_parked() {
        let bridge = SyncBridge::new().unwrap();
        bridge.run(async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        });
    }
}

//! Five-level lock state machine over named advisory locks.
//!
//! Lock hierarchy: `None < Shared < Reserved < Pending < Exclusive`, with
//! `Pending` only ever observed as the transient middle of a
//! SHARED→EXCLUSIVE upgrade. Legal transitions follow the engine's
//! adjacency graph; anything else is a protocol fault reported without
//! mutating state.
//!
//! Two interchangeable strategies implement the remote-lock choreography:
//!
//! - [`ExclusiveStrategy`] — single-owner: one context holds any lock on the
//!   file at a time. Used when the backing store itself only supports one
//!   live writer.
//! - [`SharedStrategy`] — multi-reader, single-writer: readers coexist; a
//!   would-be writer arbitrates through a non-blocking outer-lock loop with
//!   exponential backoff, failing fast when a confirmed reservation holder
//!   exists.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use tabsql_error::{Result, TabsqlError};
use tabsql_types::LockLevel;

use crate::manager::{LockGuard, LockManager, LockMode};
use crate::retry::RetryPolicy;

/// Per-file lock configuration.
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// Bound on every blocking primitive acquisition; expiry surfaces Busy.
    /// `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Backoff schedule for the multi-reader write-arbitration loop.
    pub retry: RetryPolicy,
}

/// The six primitive transitions plus reservation introspection.
///
/// Composite transitions (SHARED→EXCLUSIVE, EXCLUSIVE→SHARED, ...) are
/// assembled from these by [`FileLocks`]; strategies only implement the
/// adjacent steps.
#[async_trait]
pub trait LockStrategy: Send + Sync {
    async fn none_to_shared(&self) -> Result<()>;
    async fn shared_to_reserved(&self) -> Result<()>;
    async fn reserved_to_exclusive(&self) -> Result<()>;
    async fn exclusive_to_reserved(&self) -> Result<()>;
    async fn reserved_to_shared(&self) -> Result<()>;
    async fn shared_to_none(&self) -> Result<()>;

    /// Whether any context (including this one) currently holds RESERVED or
    /// higher on this file. Non-mutating.
    async fn is_somewhere_reserved(&self) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Strategy A — single-owner exclusive
// ---------------------------------------------------------------------------

/// Single-owner strategy: the "outer" lock is held exclusively for the whole
/// NONE→SHARED..NONE lifetime, so only one context ever touches the file.
pub struct ExclusiveStrategy {
    manager: LockManager,
    outer_name: String,
    reserved_name: String,
    timeout: Option<Duration>,
    outer: Mutex<Option<LockGuard>>,
    reserved: Mutex<Option<LockGuard>>,
}

impl ExclusiveStrategy {
    /// Build the strategy for `name` on `manager`.
    #[must_use]
    pub fn new(manager: LockManager, name: &str, opts: &LockOptions) -> Self {
        Self {
            manager,
            outer_name: format!("{name}-outer"),
            reserved_name: format!("{name}-reserved"),
            timeout: opts.timeout,
            outer: Mutex::new(None),
            reserved: Mutex::new(None),
        }
    }

    fn stash(slot: &Mutex<Option<LockGuard>>, guard: LockGuard) {
        *slot.lock().expect("guard slot poisoned") = Some(guard);
    }

    fn clear(slot: &Mutex<Option<LockGuard>>) {
        let guard = slot.lock().expect("guard slot poisoned").take();
        drop(guard);
    }
}

#[async_trait]
impl LockStrategy for ExclusiveStrategy {
    async fn none_to_shared(&self) -> Result<()> {
        let guard = self
            .manager
            .request_timeout(&self.outer_name, LockMode::Exclusive, self.timeout)
            .await?;
        Self::stash(&self.outer, guard);
        Ok(())
    }

    async fn shared_to_reserved(&self) -> Result<()> {
        let guard = self
            .manager
            .request_timeout(&self.reserved_name, LockMode::Exclusive, self.timeout)
            .await?;
        Self::stash(&self.reserved, guard);
        Ok(())
    }

    async fn reserved_to_exclusive(&self) -> Result<()> {
        // The outer lock is already exclusive; nothing more to take.
        Ok(())
    }

    async fn exclusive_to_reserved(&self) -> Result<()> {
        Ok(())
    }

    async fn reserved_to_shared(&self) -> Result<()> {
        Self::clear(&self.reserved);
        Ok(())
    }

    async fn shared_to_none(&self) -> Result<()> {
        Self::clear(&self.outer);
        Ok(())
    }

    async fn is_somewhere_reserved(&self) -> Result<bool> {
        Ok(self.manager.held_mode(&self.reserved_name) == Some(LockMode::Exclusive))
    }
}

// ---------------------------------------------------------------------------
// Strategy B — multi-reader, single-writer
// ---------------------------------------------------------------------------

/// Multi-reader strategy.
///
/// Readers hold "inner" shared; the brief shared hold of "outer" during
/// NONE→SHARED lets a would-be writer detect active readers without blocking
/// new ones indefinitely. A writer in RESERVED+ holds "outer" exclusive and
/// escalates by taking "inner" exclusive.
pub struct SharedStrategy {
    manager: LockManager,
    outer_name: String,
    inner_name: String,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    outer: Mutex<Option<LockGuard>>,
    inner: Mutex<Option<LockGuard>>,
}

impl SharedStrategy {
    /// Build the strategy for `name` on `manager`.
    #[must_use]
    pub fn new(manager: LockManager, name: &str, opts: &LockOptions) -> Self {
        Self {
            manager,
            outer_name: format!("{name}-outer"),
            inner_name: format!("{name}-inner"),
            timeout: opts.timeout,
            retry: opts.retry.clone(),
            outer: Mutex::new(None),
            inner: Mutex::new(None),
        }
    }

    fn stash(slot: &Mutex<Option<LockGuard>>, guard: LockGuard) {
        *slot.lock().expect("guard slot poisoned") = Some(guard);
    }

    fn clear(slot: &Mutex<Option<LockGuard>>) {
        let guard = slot.lock().expect("guard slot poisoned").take();
        drop(guard);
    }
}

#[async_trait]
impl LockStrategy for SharedStrategy {
    async fn none_to_shared(&self) -> Result<()> {
        let outer = self
            .manager
            .request_timeout(&self.outer_name, LockMode::Shared, self.timeout)
            .await?;
        let inner = match self
            .manager
            .request_timeout(&self.inner_name, LockMode::Shared, self.timeout)
            .await
        {
            Ok(inner) => inner,
            Err(err) => {
                drop(outer);
                return Err(err);
            }
        };
        Self::stash(&self.inner, inner);
        drop(outer);
        Ok(())
    }

    async fn shared_to_reserved(&self) -> Result<()> {
        let mut attempt = 0_u32;
        let outer = loop {
            if let Some(guard) = self.manager.try_request(&self.outer_name, LockMode::Exclusive) {
                break guard;
            }
            if self.is_somewhere_reserved().await? {
                // Someone else holds a reservation; retrying cannot succeed
                // while they do.
                return Err(TabsqlError::Busy);
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
            attempt = attempt.saturating_add(1);
        };
        Self::stash(&self.outer, outer);
        Self::clear(&self.inner);
        Ok(())
    }

    async fn reserved_to_exclusive(&self) -> Result<()> {
        let inner = self
            .manager
            .request_timeout(&self.inner_name, LockMode::Exclusive, self.timeout)
            .await?;
        Self::stash(&self.inner, inner);
        Ok(())
    }

    async fn exclusive_to_reserved(&self) -> Result<()> {
        Self::clear(&self.inner);
        Ok(())
    }

    async fn reserved_to_shared(&self) -> Result<()> {
        // Inner (shared) is taken before outer is released: reservation
        // state stays observable until the reader foothold is in place.
        let inner = self.manager.request(&self.inner_name, LockMode::Shared).await;
        Self::stash(&self.inner, inner);
        Self::clear(&self.outer);
        Ok(())
    }

    async fn shared_to_none(&self) -> Result<()> {
        Self::clear(&self.inner);
        Ok(())
    }

    async fn is_somewhere_reserved(&self) -> Result<bool> {
        Ok(self.manager.held_mode(&self.outer_name) == Some(LockMode::Exclusive))
    }
}

// ---------------------------------------------------------------------------
// FileLocks — transition dispatch
// ---------------------------------------------------------------------------

/// Per-file lock state machine.
///
/// All lock/unlock requests on the file run through a fair async mutex so
/// overlapping calls never interleave; they execute strictly in arrival
/// order.
pub struct FileLocks {
    strategy: Arc<dyn LockStrategy>,
    state: Mutex<LockLevel>,
    serial: tokio::sync::Mutex<()>,
}

impl FileLocks {
    /// State machine over Strategy A (single-owner exclusive).
    #[must_use]
    pub fn exclusive(manager: LockManager, name: &str, opts: &LockOptions) -> Self {
        Self::with_strategy(Arc::new(ExclusiveStrategy::new(manager, name, opts)))
    }

    /// State machine over Strategy B (multi-reader, single-writer).
    #[must_use]
    pub fn shared(manager: LockManager, name: &str, opts: &LockOptions) -> Self {
        Self::with_strategy(Arc::new(SharedStrategy::new(manager, name, opts)))
    }

    /// State machine over a caller-provided strategy.
    #[must_use]
    pub fn with_strategy(strategy: Arc<dyn LockStrategy>) -> Self {
        Self {
            strategy,
            state: Mutex::new(LockLevel::None),
            serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Current lock level.
    #[must_use]
    pub fn level(&self) -> LockLevel {
        *self.state.lock().expect("lock level poisoned")
    }

    fn set_level(&self, level: LockLevel) {
        *self.state.lock().expect("lock level poisoned") = level;
    }

    /// Escalate to `target`.
    ///
    /// Busy outcomes leave the state where it was (a half-done
    /// SHARED→EXCLUSIVE upgrade is unwound back to SHARED); illegal targets
    /// fault without touching anything.
    pub async fn lock(&self, target: LockLevel) -> Result<()> {
        let _serial = self.serial.lock().await;
        let current = self.level();
        if current == target {
            return Ok(());
        }

        match (current, target) {
            (LockLevel::None, LockLevel::Shared) => {
                self.strategy.none_to_shared().await?;
            }
            (LockLevel::Shared, LockLevel::Reserved) => {
                self.strategy.shared_to_reserved().await?;
            }
            (LockLevel::Shared, LockLevel::Exclusive) => {
                self.strategy.shared_to_reserved().await?;
                self.set_level(LockLevel::Pending);
                if let Err(err) = self.strategy.reserved_to_exclusive().await {
                    match self.strategy.reserved_to_shared().await {
                        Ok(()) => self.set_level(LockLevel::Shared),
                        Err(unwind) => {
                            warn!(error = %unwind, "failed to unwind half-done lock upgrade");
                            self.set_level(LockLevel::Reserved);
                        }
                    }
                    return Err(err);
                }
            }
            (LockLevel::Reserved, LockLevel::Exclusive) => {
                self.strategy.reserved_to_exclusive().await?;
            }
            (from, to) => {
                return Err(TabsqlError::LockProtocol {
                    from: from.name(),
                    to: to.name(),
                });
            }
        }

        self.set_level(target);
        Ok(())
    }

    /// Downgrade to `target`.
    ///
    /// Composite downgrades run stage by stage; if a stage fails the state
    /// records the level actually reached, so held primitives and the state
    /// machine never disagree.
    pub async fn unlock(&self, target: LockLevel) -> Result<()> {
        let _serial = self.serial.lock().await;
        let current = self.level();
        if current == target {
            return Ok(());
        }

        let legal = matches!(
            (current, target),
            (
                LockLevel::Exclusive,
                LockLevel::Reserved | LockLevel::Shared | LockLevel::None
            ) | (LockLevel::Reserved, LockLevel::Shared | LockLevel::None)
                | (LockLevel::Shared, LockLevel::None)
        );
        if !legal {
            return Err(TabsqlError::LockProtocol {
                from: current.name(),
                to: target.name(),
            });
        }

        let mut reached = current;
        let mut failure: Option<TabsqlError> = None;

        if reached == LockLevel::Exclusive && target < LockLevel::Exclusive {
            match self.strategy.exclusive_to_reserved().await {
                Ok(()) => reached = LockLevel::Reserved,
                Err(err) => failure = Some(err),
            }
        }
        if failure.is_none() && reached == LockLevel::Reserved && target < LockLevel::Reserved {
            match self.strategy.reserved_to_shared().await {
                Ok(()) => reached = LockLevel::Shared,
                Err(err) => failure = Some(err),
            }
        }
        if failure.is_none() && reached == LockLevel::Shared && target < LockLevel::Shared {
            match self.strategy.shared_to_none().await {
                Ok(()) => reached = LockLevel::None,
                Err(err) => failure = Some(err),
            }
        }

        self.set_level(reached);
        match failure {
            None => Ok(()),
            Some(err) => {
                warn!(error = %err, reached = %reached, "unlock stopped mid-downgrade");
                Err(err)
            }
        }
    }

    /// Whether any context holds RESERVED or higher on this file.
    pub async fn is_somewhere_reserved(&self) -> Result<bool> {
        self.strategy.is_somewhere_reserved().await
    }
}

impl std::fmt::Debug for FileLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLocks")
            .field("level", &self.level())
            .finish_non_exhaustive()
    }
}

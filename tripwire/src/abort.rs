//! Deadlines and cancellation for bounded guardrail work.
//!
//! An [`AbortScope`] bounds one operation (a single guardrail, or a whole
//! parallel batch) to a deadline and owns the cancellation token for it.
//! Scopes created under a caller token are linked to it: cancelling the
//! caller cancels the scope.
//!
//! Scopes come from an [`AbortPool`]. Tokens cannot be un-cancelled, so the
//! pool only recycles roots that were never cancelled and never linked to a
//! caller token; everything else is dropped on release. Work running inside
//! a scope only ever receives *child* tokens, so a recycled root cannot be
//! cancelled by a stale holder from a previous operation.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default number of idle tokens an [`AbortPool`] retains.
pub const DEFAULT_POOL_CAPACITY: usize = 32;

/// Why a bounded operation did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupt {
    /// The deadline elapsed first. Carries the configured timeout.
    #[error("deadline of {}ms elapsed", .0.as_millis())]
    Elapsed(Duration),

    /// The scope (or its caller) was cancelled first.
    #[error("operation cancelled")]
    Cancelled,
}

/// Run `fut` until it completes, `deadline` passes, or `cancel` fires.
///
/// Cancellation is checked first, so an already-cancelled token resolves
/// immediately without polling `fut`.
///
/// # Errors
///
/// Returns [`Interrupt::Cancelled`] or [`Interrupt::Elapsed`].
pub async fn run_with_deadline<F: Future>(
    fut: F,
    deadline: Instant,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Interrupt::Cancelled),
        res = tokio::time::timeout_at(deadline, fut) => res.map_err(|_| Interrupt::Elapsed(timeout)),
    }
}

/// Run `fut` to completion unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`Interrupt::Cancelled`] if the token fires first.
pub async fn cancellable<F: Future>(fut: F, cancel: &CancellationToken) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Interrupt::Cancelled),
        out = fut => Ok(out),
    }
}

/// Sleep for `duration` unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`Interrupt::Cancelled`] if the token fires before the sleep ends.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> Result<(), Interrupt> {
    if cancel.is_cancelled() {
        return Err(Interrupt::Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Interrupt::Cancelled),
        () = tokio::time::sleep(duration) => Ok(()),
    }
}

/// A cancellation token plus a deadline, owned by one operation.
#[derive(Debug)]
pub struct AbortScope {
    token: CancellationToken,
    timeout: Duration,
    deadline: Instant,
    linked: bool,
}

/// Deadlines past the clock's range are clamped to roughly thirty years out.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

impl AbortScope {
    /// Create an unpooled scope expiring `timeout` from now.
    #[must_use]
    pub fn new(timeout: Duration, parent: Option<&CancellationToken>) -> Self {
        match parent {
            Some(parent) => Self::with_token(parent.child_token(), timeout, true),
            None => Self::with_token(CancellationToken::new(), timeout, false),
        }
    }

    fn with_token(token: CancellationToken, timeout: Duration, linked: bool) -> Self {
        Self {
            token,
            timeout,
            deadline: deadline_after(timeout),
            linked,
        }
    }

    /// A token that fires when this scope is cancelled.
    ///
    /// Always a child: cancelling it does not affect the scope.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// The configured timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// When this scope expires.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the scope (or its caller) has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether this scope is linked to a caller token.
    #[must_use]
    pub const fn is_linked(&self) -> bool {
        self.linked
    }

    /// Cancel the scope and every token derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Run a task under this scope's deadline.
    ///
    /// The task receives its own child token. If the deadline elapses or the
    /// scope is cancelled, that child is cancelled so cooperative work stops;
    /// sibling tasks sharing the scope are unaffected by a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Interrupt`] when the task did not finish in time.
    pub async fn run<F, T>(&self, task: T) -> Result<F::Output, Interrupt>
    where
        T: FnOnce(CancellationToken) -> F,
        F: Future,
    {
        let child = self.token.child_token();
        let outcome =
            run_with_deadline(task(child.clone()), self.deadline, self.timeout, &self.token).await;
        if outcome.is_err() {
            child.cancel();
        }
        outcome
    }
}

/// A pool of reusable root cancellation tokens.
#[derive(Debug)]
pub struct AbortPool {
    idle: Mutex<Vec<CancellationToken>>,
    capacity: usize,
    created: AtomicUsize,
    reused: AtomicUsize,
}

impl Default for AbortPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl AbortPool {
    /// Create a pool retaining at most `capacity` idle tokens.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            created: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        }
    }

    /// Acquire a scope expiring `timeout` from now.
    ///
    /// With a `parent`, the scope is linked to it and never recycled.
    #[must_use]
    pub fn acquire(&self, timeout: Duration, parent: Option<&CancellationToken>) -> AbortScope {
        if let Some(parent) = parent {
            self.created.fetch_add(1, Ordering::Relaxed);
            return AbortScope::with_token(parent.child_token(), timeout, true);
        }

        let recycled = {
            let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
            idle.pop()
        };
        match recycled {
            Some(token) if !token.is_cancelled() => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                AbortScope::with_token(token, timeout, false)
            }
            _ => {
                self.created.fetch_add(1, Ordering::Relaxed);
                AbortScope::with_token(CancellationToken::new(), timeout, false)
            }
        }
    }

    /// Return a finished scope.
    ///
    /// Returns `true` if its token was recycled. Cancelled and linked tokens
    /// are terminal and are dropped instead.
    pub fn release(&self, scope: AbortScope) -> bool {
        if scope.linked || scope.token.is_cancelled() {
            trace!(linked = scope.linked, "abort scope dropped");
            return false;
        }
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() >= self.capacity {
            return false;
        }
        idle.push(scope.token);
        true
    }

    /// Number of idle tokens ready for reuse.
    #[must_use]
    pub fn available(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of tokens created so far.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Number of acquisitions served from the pool.
    #[must_use]
    pub fn reused(&self) -> usize {
        self.reused.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_before_deadline() {
        let scope = AbortScope::new(Duration::from_millis(100), None);
        let out = scope.run(|_| async { 7 }).await;
        assert_eq!(out, Ok(7));
        assert!(!scope.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_does_not_overflow() {
        let scope = AbortScope::new(Duration::MAX, None);
        assert!(scope.remaining() > Duration::from_secs(86_400));
        let out = scope.run(|_| async { "done" }).await;
        assert_eq!(out, Ok("done"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out_and_cancels_child_only() {
        let scope = AbortScope::new(Duration::from_millis(50), None);
        let mut seen = None;
        let out = scope
            .run(|token| {
                seen = Some(token.clone());
                async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
            })
            .await;

        assert_eq!(out, Err(Interrupt::Elapsed(Duration::from_millis(50))));
        assert!(seen.unwrap().is_cancelled());
        assert!(!scope.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation_resolves_immediately() {
        let parent = CancellationToken::new();
        let scope = AbortScope::new(Duration::from_secs(30), Some(&parent));
        let trigger = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let out = scope
            .run(|_| tokio::time::sleep(Duration::from_secs(20)))
            .await;
        assert_eq!(out, Err(Interrupt::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellable_sleep() {
        let token = CancellationToken::new();
        assert!(cancellable_sleep(Duration::from_millis(10), &token).await.is_ok());

        token.cancel();
        assert_eq!(
            cancellable_sleep(Duration::from_secs(5), &token).await,
            Err(Interrupt::Cancelled)
        );
        assert_eq!(
            cancellable_sleep(Duration::ZERO, &token).await,
            Err(Interrupt::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_recycles_only_clean_unlinked_tokens() {
        let pool = AbortPool::new(4);

        let clean = pool.acquire(Duration::from_secs(1), None);
        assert!(pool.release(clean));
        assert_eq!(pool.available(), 1);

        let reused = pool.acquire(Duration::from_secs(1), None);
        assert_eq!(pool.reused(), 1);
        assert!(!reused.is_cancelled());
        reused.cancel();
        assert!(!pool.release(reused));
        assert_eq!(pool.available(), 0);

        let parent = CancellationToken::new();
        let linked = pool.acquire(Duration::from_secs(1), Some(&parent));
        assert!(linked.is_linked());
        assert!(!pool.release(linked));
        assert_eq!(pool.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_scope_does_not_inherit_stale_child_cancellation() {
        let pool = AbortPool::new(4);
        let first = pool.acquire(Duration::from_secs(1), None);
        let stale = first.token();
        assert!(pool.release(first));

        let second = pool.acquire(Duration::from_secs(1), None);
        stale.cancel();
        assert!(!second.is_cancelled());
    }

    #[test]
    fn test_pool_respects_capacity() {
        let pool = AbortPool::new(1);
        let a = AbortScope::new(Duration::from_secs(1), None);
        let b = AbortScope::new(Duration::from_secs(1), None);
        assert!(pool.release(a));
        assert!(!pool.release(b));
    }
}

//! Per-call context carried through resolution and scatter.
//!
//! A `CallContext` identifies one gateway call in logs and bounds how long
//! its shard calls may run. Cancelling a context cancels every child derived
//! from it; children share the parent's deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, ErrorCode};

/// Global monotonic request ID counter.
static GLOBAL_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a new unique request ID.
pub fn next_request_id() -> u64 {
    GLOBAL_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Why a context stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    Cancelled,
    DeadlineExceeded,
}

impl DoneReason {
    /// The shard error reported for calls abandoned because of this reason.
    pub fn to_backend_error(self) -> BackendError {
        match self {
            DoneReason::Cancelled => {
                BackendError::fatal_with_code(ErrorCode::Cancelled, "context canceled")
            }
            DoneReason::DeadlineExceeded => BackendError::fatal_with_code(
                ErrorCode::DeadlineExceeded,
                "context deadline exceeded",
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: u64,
    pub started_at: Instant,
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            request_id: next_request_id(),
            started_at: Instant::now(),
            deadline: None,
            token: CancellationToken::new(),
        }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.with_deadline(deadline)
    }

    /// Set a deadline. An earlier existing deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A context that is cancelled with this one but can also be cancelled alone.
    pub fn child(&self) -> Self {
        Self {
            request_id: self.request_id,
            started_at: self.started_at,
            deadline: self.deadline,
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Reason this context is done, if it is.
    pub fn done_reason(&self) -> Option<DoneReason> {
        if self.is_cancelled() {
            Some(DoneReason::Cancelled)
        } else if self.is_expired() {
            Some(DoneReason::DeadlineExceeded)
        } else {
            None
        }
    }

    pub fn is_done(&self) -> bool {
        self.done_reason().is_some()
    }

    /// Resolves when the context is cancelled or its deadline passes.
    /// Never resolves for a context with neither.
    pub async fn done(&self) -> DoneReason {
        match self.deadline {
            Some(deadline) => {
                let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
                tokio::select! {
                    _ = self.token.cancelled() => DoneReason::Cancelled,
                    _ = sleep => DoneReason::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                DoneReason::Cancelled
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    pub fn as_context_str(&self) -> String {
        match self.deadline {
            Some(d) => format!(
                "req={} elapsed_ms={} deadline_in_ms={}",
                self.request_id,
                self.elapsed_ms(),
                d.saturating_duration_since(Instant::now()).as_millis()
            ),
            None => format!("req={} elapsed_ms={}", self.request_id, self.elapsed_ms()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = CallContext::new();
        let b = CallContext::new();
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.child().request_id, a.request_id);
    }

    #[test]
    fn test_cancel_propagates_to_child_only() {
        let parent = CallContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());

        let other = parent.child();
        parent.cancel();
        assert_eq!(other.done_reason(), Some(DoneReason::Cancelled));
    }

    #[test]
    fn test_earlier_deadline_wins() {
        let ctx = CallContext::new()
            .with_timeout(Duration::from_secs(1))
            .with_timeout(Duration::from_secs(60));
        let d = ctx.deadline().unwrap();
        assert!(d <= Instant::now() + Duration::from_secs(1));
        assert!(ctx.as_context_str().contains("deadline_in_ms"));
    }

    #[tokio::test]
    async fn test_done_on_deadline() {
        let ctx = CallContext::new().with_timeout(Duration::from_millis(10));
        assert_eq!(ctx.done().await, DoneReason::DeadlineExceeded);
        assert!(ctx.is_expired());
        let err = DoneReason::DeadlineExceeded.to_backend_error();
        assert_eq!(err.message, "context deadline exceeded");
    }

    #[tokio::test]
    async fn test_done_on_cancel() {
        let ctx = CallContext::new();
        let child = ctx.child();
        let waiter = tokio::spawn(async move { child.done().await });
        ctx.cancel();
        assert_eq!(waiter.await.unwrap(), DoneReason::Cancelled);
    }
}

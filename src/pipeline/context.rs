//! Run control shared by the orchestrator, executors and retry loop: cancellation + deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::types::StopReason;

/// Cooperative cancellation flag. Clones share the flag; set from a signal handler or
/// another thread, observed between batches and before retry sleeps.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing flag (e.g. one a Ctrl+C handler sets).
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Cancellation token plus optional wall-clock deadline for one run.
#[derive(Clone, Debug)]
pub struct RunControl {
    pub cancel: CancelToken,
    pub deadline: Option<Instant>,
}

impl RunControl {
    pub fn new(cancel: CancelToken, max_run: Option<Duration>) -> Self {
        Self {
            cancel,
            deadline: max_run.map(|d| Instant::now() + d),
        }
    }

    /// No deadline, fresh token.
    pub fn unbounded() -> Self {
        Self::new(CancelToken::new(), None)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Why the run should stop now, if it should. Cancellation wins over the deadline.
    pub fn should_stop(&self) -> Option<StopReason> {
        if self.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if self.deadline_passed() {
            Some(StopReason::DeadlineExceeded)
        } else {
            None
        }
    }

    /// True if a retry may sleep for `delay`: not cancelled, and the sleep ends before the
    /// deadline.
    pub fn may_sleep(&self, delay: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.deadline {
            Some(d) => Instant::now() + delay < d,
            None => true,
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::unbounded()
    }
}

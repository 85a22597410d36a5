//! Failure handling around the processing callback: classification, retry with backoff,
//! circuit breaking and an error history for the run report.

pub mod circuit;
pub mod classify;
pub mod error_log;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use classify::{Classification, ErrorClassifier, ErrorKind, ProcessError, Severity};
pub use error_log::ErrorLog;
pub use retry::{RetryPolicy, RetryStrategy};

use log::debug;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crate::pipeline::context::RunControl;
use crate::utils::config::ERROR_HISTORY_CAP;

/// Terminal failure of one guarded call.
#[derive(Clone, Debug)]
pub struct Failure {
    pub classification: Classification,
    pub message: String,
}

/// Result of [`Resilience::call`]: outcome plus how many times the operation ran.
pub type GuardedResult<T> = (Result<T, Failure>, u32);

/// Classifier, retry policy, breakers and error history, shared by every worker of a run.
pub struct Resilience {
    pub classifier: ErrorClassifier,
    pub policy: RetryPolicy,
    pub breaker: CircuitBreaker,
    pub errors: ErrorLog,
}

impl Resilience {
    pub fn new(classifier: ErrorClassifier, policy: RetryPolicy, circuit: CircuitConfig) -> Self {
        Self {
            classifier,
            policy,
            breaker: CircuitBreaker::new(circuit),
            errors: ErrorLog::new(ERROR_HISTORY_CAP),
        }
    }

    /// Run `f` under the breaker for `op`, retrying per the classification of each failure.
    /// `context` names the logical operation (one file) for the error history.
    ///
    /// Cancellation and the deadline are checked before every retry sleep; when either
    /// fires the last failure becomes terminal.
    pub fn call<T, F>(
        &self,
        op: &str,
        context: &str,
        control: &RunControl,
        mut f: F,
    ) -> GuardedResult<T>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        let mut attempt = 0_u32;
        let mut calls = 0_u32;
        loop {
            if !self.breaker.try_acquire(op) {
                let classification = ErrorKind::CircuitOpen.classification();
                let message = format!("circuit '{op}' is open; call rejected");
                self.errors.record(context, &classification, message.clone());
                return (
                    Err(Failure {
                        classification,
                        message,
                    }),
                    calls,
                );
            }
            calls += 1;
            let err = match panic::catch_unwind(AssertUnwindSafe(|| f())) {
                Ok(Ok(value)) => {
                    self.breaker.record_success(op);
                    self.errors.resolve(context);
                    return (Ok(value), calls);
                }
                Ok(Err(err)) => err,
                Err(payload) => {
                    anyhow::anyhow!("processor panicked: {}", panic_message(&*payload))
                }
            };

            let classification = self.classifier.classify(&err);
            if self.breaker.config().counts(classification.kind) {
                self.breaker.record_failure(op);
            } else {
                self.breaker.release_trial(op);
            }
            let message = format!("{err:#}");
            self.errors.record(context, &classification, message.clone());

            if !self.policy.should_retry(&classification, attempt) {
                return (
                    Err(Failure {
                        classification,
                        message,
                    }),
                    calls,
                );
            }
            let delay = self.policy.delay_for(&classification, attempt);
            if !control.may_sleep(delay) {
                debug!("{}: not retrying, run is stopping", context);
                return (
                    Err(Failure {
                        classification,
                        message,
                    }),
                    calls,
                );
            }
            debug!(
                "{}: {:?} failure, retry {} in {:?}",
                context,
                classification.kind,
                attempt + 1,
                delay
            );
            thread::sleep(delay);
            attempt += 1;
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

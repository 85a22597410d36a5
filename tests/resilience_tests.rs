//! Guarded calls: retry, circuit breaking and error history working together.

use anyhow::anyhow;
use ingestkit::resilience::Resilience;
use ingestkit::{
    CancelToken, CircuitConfig, CircuitState, ErrorClassifier, ErrorKind, ProcessError,
    RetryPolicy, RetryStrategy, RunControl, Severity,
};
use std::cell::Cell;
use std::thread;
use std::time::Duration;

const OP: &str = "process";

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        strategy: None,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        factor: 2.0,
        max_retries,
        jitter: false,
    }
}

fn guard(max_retries: u32, threshold: u32, recovery: Duration) -> Resilience {
    Resilience::new(
        ErrorClassifier::default(),
        fast_policy(max_retries),
        CircuitConfig {
            failure_threshold: threshold,
            recovery_timeout: recovery,
            ..CircuitConfig::default()
        },
    )
}

#[test]
fn test_transient_failure_retried_until_success() {
    let r = guard(5, 10, Duration::from_secs(60));
    let calls = Cell::new(0);
    let (result, attempts) = r.call(OP, "process:/a", &RunControl::unbounded(), || {
        calls.set(calls.get() + 1);
        if calls.get() < 3 {
            Err(ProcessError::Transient("connection reset".into()).into())
        } else {
            Ok(calls.get())
        }
    });
    assert_eq!(result.unwrap(), 3);
    assert_eq!(attempts, 3);
    assert_eq!(r.breaker.state(OP), CircuitState::Closed);
    // success resolves the history for that context
    assert_eq!(r.errors.unresolved_count(), 0);
    assert!(r.errors.recent().iter().all(|e| e.resolved));
}

#[test]
fn test_data_validation_stops_after_its_cap() {
    let r = guard(5, 10, Duration::from_secs(60));
    let (result, attempts) = r.call(OP, "process:/bad", &RunControl::unbounded(), || {
        Err::<(), _>(ProcessError::InvalidData("truncated".into()).into())
    });
    let failure = result.unwrap_err();
    assert_eq!(failure.classification.kind, ErrorKind::DataValidation);
    assert_eq!(failure.classification.severity, Severity::Low);
    assert_eq!(attempts, 3);
    // every attempt counts, but three stay below the threshold
    assert_eq!(r.breaker.state(OP), CircuitState::Closed);
    assert_eq!(r.breaker.snapshot()[OP].failure_count, 3);
    let history = r.errors.recent();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].retry_count, 2);
    assert!(!history[0].resolved);
}

#[test]
fn test_policy_limit_applies_to_uncapped_kinds() {
    let r = guard(5, 100, Duration::from_secs(60));
    let (result, attempts) = r.call(OP, "process:/x", &RunControl::unbounded(), || {
        Err::<(), _>(anyhow!("something odd"))
    });
    assert_eq!(result.unwrap_err().classification.kind, ErrorKind::Unknown);
    // first call plus five retries
    assert_eq!(attempts, 6);
}

#[test]
fn test_panic_becomes_unknown_failure() {
    let r = guard(0, 10, Duration::from_secs(60));
    let (result, attempts) = r.call(OP, "process:/p", &RunControl::unbounded(), || -> anyhow::Result<()> {
        panic!("parser blew up")
    });
    let failure = result.unwrap_err();
    assert_eq!(failure.classification.kind, ErrorKind::Unknown);
    assert!(failure.message.contains("parser blew up"));
    assert_eq!(attempts, 1);
}

#[test]
fn test_cancelled_run_does_not_retry() {
    let r = guard(5, 10, Duration::from_secs(60));
    let cancel = CancelToken::new();
    cancel.cancel();
    let control = RunControl::new(cancel, None);
    let (result, attempts) = r.call(OP, "process:/c", &control, || {
        Err::<(), _>(ProcessError::Transient("timed out".into()).into())
    });
    assert!(result.is_err());
    assert_eq!(attempts, 1);
}

#[test]
fn test_retry_sleep_must_fit_before_deadline() {
    let mut policy = fast_policy(3);
    policy.base_delay = Duration::from_secs(5);
    policy.max_delay = Duration::from_secs(5);
    let r = Resilience::new(ErrorClassifier::default(), policy, CircuitConfig::default());
    let control = RunControl::new(CancelToken::new(), Some(Duration::from_secs(1)));
    let (result, attempts) = r.call(OP, "process:/d", &control, || {
        Err::<(), _>(ProcessError::Transient("busy".into()).into())
    });
    assert!(result.is_err());
    assert_eq!(attempts, 1);
}

#[test]
fn test_breaker_opens_then_recovers_through_one_trial() {
    let r = guard(0, 2, Duration::from_millis(50));
    let control = RunControl::unbounded();
    let fail = || Err::<(), _>(ProcessError::ResourceExhausted("no space left".into()).into());

    for i in 0..2 {
        let (result, attempts) = r.call(OP, &format!("process:/f{i}"), &control, fail);
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }
    assert_eq!(r.breaker.state(OP), CircuitState::Open);

    let (rejected, attempts) = r.call(OP, "process:/f2", &control, || Ok(()));
    assert_eq!(
        rejected.unwrap_err().classification.kind,
        ErrorKind::CircuitOpen
    );
    assert_eq!(attempts, 0);

    thread::sleep(Duration::from_millis(80));
    // the trial call succeeds and closes the circuit
    let (ok, attempts) = r.call(OP, "process:/f3", &control, || Ok(()));
    assert!(ok.is_ok());
    assert_eq!(attempts, 1);
    assert_eq!(r.breaker.state(OP), CircuitState::Closed);
    assert_eq!(r.breaker.snapshot()[OP].failure_count, 0);
}

#[test]
fn test_consecutive_permission_failures_open_the_circuit() {
    let r = guard(3, 3, Duration::from_secs(60));
    let control = RunControl::unbounded();
    let invoked = Cell::new(0);
    for i in 0..5 {
        let _ = r.call(OP, &format!("process:/locked{i}"), &control, || {
            invoked.set(invoked.get() + 1);
            Err::<(), _>(ProcessError::Permission("read-only share".into()).into())
        });
    }
    assert_eq!(r.breaker.state(OP), CircuitState::Open);
    assert_eq!(invoked.get(), 3);
}

#[test]
fn test_systemic_only_breaker_ignores_item_failures() {
    let r = Resilience::new(
        ErrorClassifier::default(),
        fast_policy(0),
        CircuitConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            systemic_only: true,
        },
    );
    let control = RunControl::unbounded();
    let invoked = Cell::new(0);
    for i in 0..5 {
        let _ = r.call(OP, &format!("process:/locked{i}"), &control, || {
            invoked.set(invoked.get() + 1);
            Err::<(), _>(ProcessError::Permission("read-only share".into()).into())
        });
    }
    assert_eq!(r.breaker.state(OP), CircuitState::Closed);
    assert_eq!(invoked.get(), 5);
}

#[test]
fn test_configured_strategy_drives_retry_delays() {
    let mut policy = fast_policy(3);
    policy.strategy = Some(RetryStrategy::FixedDelay);
    policy.base_delay = Duration::from_millis(30);
    policy.max_delay = Duration::from_millis(500);
    let r = Resilience::new(ErrorClassifier::default(), policy, CircuitConfig::default());
    let started = std::time::Instant::now();
    let (result, attempts) = r.call(OP, "process:/slow", &RunControl::unbounded(), || {
        Err::<(), _>(ProcessError::Transient("busy".into()).into())
    });
    assert!(result.is_err());
    assert_eq!(attempts, 4);
    // exponential would wait 30 + 60 + 120 ms
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[test]
fn test_breakers_are_per_operation() {
    let r = guard(0, 1, Duration::from_secs(60));
    let control = RunControl::unbounded();
    let (res, _) = r.call("ocr", "ocr:/a", &control, || {
        Err::<(), _>(ProcessError::Transient("timeout".into()).into())
    });
    assert!(res.is_err());
    assert_eq!(r.breaker.state("ocr"), CircuitState::Open);
    let (ok, _) = r.call("embed", "embed:/a", &control, || Ok(1));
    assert_eq!(ok.unwrap(), 1);
}

#[test]
fn test_custom_rule_takes_precedence() {
    let classifier = ErrorClassifier::default().prepend_rule(ErrorKind::Configuration, |e| {
        format!("{e:#}").contains("missing api key")
    });
    let err = anyhow!("connection refused: missing api key");
    assert_eq!(classifier.kind_of(&err), ErrorKind::Configuration);
    assert_eq!(
        ErrorClassifier::default().kind_of(&err),
        ErrorKind::Transient
    );
    assert_eq!(ErrorClassifier::empty().kind_of(&err), ErrorKind::Unknown);
}

#[test]
fn test_io_errors_classified_through_context() {
    let classifier = ErrorClassifier::default();
    let err = anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
        .context("open /srv/data/report.pdf");
    let cls = classifier.classify(&err);
    assert_eq!(cls.kind, ErrorKind::Permission);
    assert_eq!(cls.severity, Severity::High);
    assert_eq!(cls.retry_cap, Some(0));
}

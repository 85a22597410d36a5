//! Per-operation circuit breakers.
//!
//! closed → (failure_threshold failures) → open → (recovery_timeout) → half-open.
//! In half-open exactly one trial call is admitted: success closes the circuit, failure
//! re-opens it and restarts the timeout.

use log::{debug, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::classify::ErrorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    /// Count only failures that implicate the operation as a whole (transient, resource
    /// exhaustion, unknown). Off by default: every failure counts.
    pub systemic_only: bool,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            systemic_only: false,
        }
    }
}

impl CircuitConfig {
    /// Whether a failure of `kind` counts toward the threshold.
    pub fn counts(&self, kind: ErrorKind) -> bool {
        !self.systemic_only || kind.is_systemic()
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            trial_in_flight: false,
        }
    }
}

/// Reportable view of one circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Seconds since the last recorded failure, if any.
    pub secs_since_failure: Option<u64>,
}

/// Breakers keyed by operation name. Safe to share between workers.
pub struct CircuitBreaker {
    config: CircuitConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> CircuitConfig {
        self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Ask to call `op`. `false` means reject without calling. A `true` from an open circuit
    /// whose timeout has elapsed is the single half-open trial; the caller must report the
    /// result with [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn try_acquire(&self, op: &str) -> bool {
        let mut circuits = self.lock();
        let circuit = circuits.entry(op.to_string()).or_insert_with(Circuit::new);
        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    debug!("circuit '{}' half-open: admitting one trial call", op);
                    circuit.state = CircuitState::HalfOpen;
                    circuit.trial_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    false
                } else {
                    circuit.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self, op: &str) {
        let mut circuits = self.lock();
        let circuit = circuits.entry(op.to_string()).or_insert_with(Circuit::new);
        if circuit.state != CircuitState::Closed {
            debug!("circuit '{}' closed after successful trial", op);
        }
        circuit.state = CircuitState::Closed;
        circuit.failure_count = 0;
        circuit.trial_in_flight = false;
    }

    pub fn record_failure(&self, op: &str) {
        let mut circuits = self.lock();
        let circuit = circuits.entry(op.to_string()).or_insert_with(Circuit::new);
        circuit.failure_count = circuit.failure_count.saturating_add(1);
        circuit.last_failure = Some(Instant::now());
        match circuit.state {
            CircuitState::HalfOpen => {
                warn!("circuit '{}' re-opened: trial call failed", op);
                circuit.state = CircuitState::Open;
                circuit.trial_in_flight = false;
            }
            CircuitState::Closed if circuit.failure_count >= self.config.failure_threshold => {
                warn!(
                    "circuit '{}' opened after {} failures; rejecting calls for {:?}",
                    op, circuit.failure_count, self.config.recovery_timeout
                );
                circuit.state = CircuitState::Open;
            }
            _ => {}
        }
    }

    /// Release a half-open trial that ended without a verdict on the operation (a failure
    /// that does not count). The next caller gets the trial instead.
    pub fn release_trial(&self, op: &str) {
        let mut circuits = self.lock();
        if let Some(circuit) = circuits.get_mut(op)
            && circuit.state == CircuitState::HalfOpen
        {
            circuit.trial_in_flight = false;
        }
    }

    pub fn state(&self, op: &str) -> CircuitState {
        self.lock()
            .get(op)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.lock()
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    CircuitSnapshot {
                        state: c.state,
                        failure_count: c.failure_count,
                        secs_since_failure: c.last_failure.map(|t| t.elapsed().as_secs()),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(threshold: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitConfig {
            failure_threshold: threshold,
            recovery_timeout: Duration::from_millis(timeout_ms),
            ..CircuitConfig::default()
        })
    }

    #[test]
    fn opens_at_threshold() {
        let cb = breaker(3, 10_000);
        for _ in 0..2 {
            assert!(cb.try_acquire("extract"));
            cb.record_failure("extract");
        }
        assert_eq!(cb.state("extract"), CircuitState::Closed);
        assert!(cb.try_acquire("extract"));
        cb.record_failure("extract");
        assert_eq!(cb.state("extract"), CircuitState::Open);
        assert!(!cb.try_acquire("extract"));
        // other operations are unaffected
        assert!(cb.try_acquire("embed"));
    }

    #[test]
    fn success_resets_the_count() {
        let cb = breaker(2, 10_000);
        cb.record_failure("op");
        cb.record_success("op");
        cb.record_failure("op");
        assert_eq!(cb.state("op"), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_trial() {
        let cb = breaker(1, 20);
        cb.record_failure("op");
        assert!(!cb.try_acquire("op"));
        thread::sleep(Duration::from_millis(40));
        assert!(cb.try_acquire("op"));
        assert_eq!(cb.state("op"), CircuitState::HalfOpen);
        assert!(!cb.try_acquire("op"));
        cb.record_success("op");
        assert_eq!(cb.state("op"), CircuitState::Closed);
        assert!(cb.try_acquire("op"));
    }

    #[test]
    fn failed_trial_reopens() {
        let cb = breaker(1, 20);
        cb.record_failure("op");
        thread::sleep(Duration::from_millis(40));
        assert!(cb.try_acquire("op"));
        cb.record_failure("op");
        assert_eq!(cb.state("op"), CircuitState::Open);
        assert!(!cb.try_acquire("op"));
    }

    #[test]
    fn systemic_only_skips_item_local_kinds() {
        let all = CircuitConfig::default();
        assert!(all.counts(ErrorKind::Permission));
        assert!(all.counts(ErrorKind::DataValidation));
        let systemic = CircuitConfig {
            systemic_only: true,
            ..all
        };
        assert!(!systemic.counts(ErrorKind::Permission));
        assert!(!systemic.counts(ErrorKind::Configuration));
        assert!(systemic.counts(ErrorKind::Transient));
        assert!(systemic.counts(ErrorKind::Unknown));
    }
}

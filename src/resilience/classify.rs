//! Error classification: map a failure to a kind, severity and retry strategy.
//!
//! Classification is rule-based. An [`ErrorClassifier`] holds an ordered list of
//! `(predicate, ErrorKind)` rules; the first rule that matches wins and anything
//! unmatched is [`ErrorKind::Unknown`]. Processors that know what went wrong can attach a
//! [`ProcessError`] so the kind is pinned instead of inferred.

use serde::Serialize;
use std::io;
use std::sync::Arc;

use super::retry::RetryStrategy;

/// Failure taxonomy, enumerated once at the classification boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network / timeout-like; worth retrying with exponential backoff.
    Transient,
    /// Out of memory, disk full, too many open files.
    ResourceExhaustion,
    Permission,
    Configuration,
    /// The item's content is malformed.
    DataValidation,
    /// Rejected by an open circuit breaker without calling the operation.
    CircuitOpen,
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Severity plus retry recommendation for one [`ErrorKind`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub severity: Severity,
    pub strategy: RetryStrategy,
    /// Per-kind cap on retries; the policy's own `max_retries` still applies.
    pub retry_cap: Option<u32>,
}

/// Data-validation failures get this many retries before they are terminal.
pub const DATA_VALIDATION_RETRIES: u32 = 2;
/// Resource exhaustion gets a short leash: the batch sizer is the real remedy.
pub const RESOURCE_EXHAUSTION_RETRIES: u32 = 2;

impl ErrorKind {
    pub fn classification(self) -> Classification {
        let (severity, strategy, retry_cap) = match self {
            ErrorKind::Transient => (Severity::Medium, RetryStrategy::ExponentialBackoff, None),
            ErrorKind::ResourceExhaustion => (
                Severity::Critical,
                RetryStrategy::ExponentialBackoff,
                Some(RESOURCE_EXHAUSTION_RETRIES),
            ),
            ErrorKind::Permission | ErrorKind::Configuration => {
                (Severity::High, RetryStrategy::None, Some(0))
            }
            ErrorKind::DataValidation => (
                Severity::Low,
                RetryStrategy::FixedDelay,
                Some(DATA_VALIDATION_RETRIES),
            ),
            ErrorKind::CircuitOpen => (Severity::High, RetryStrategy::None, Some(0)),
            ErrorKind::Unknown => (Severity::Medium, RetryStrategy::LinearBackoff, None),
        };
        Classification {
            kind: self,
            severity,
            strategy,
            retry_cap,
        }
    }

    /// Kinds that say something about the operation as a whole rather than one item.
    /// With `systemic_only` set, only these count toward a circuit breaker's threshold.
    pub fn is_systemic(self) -> bool {
        matches!(
            self,
            ErrorKind::Transient | ErrorKind::ResourceExhaustion | ErrorKind::Unknown
        )
    }
}

/// Typed error a processor can return (inside `anyhow::Error`) to pin the kind.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("{0}")]
    Other(String),
}

impl ProcessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::Transient(_) => ErrorKind::Transient,
            ProcessError::ResourceExhausted(_) => ErrorKind::ResourceExhaustion,
            ProcessError::Permission(_) => ErrorKind::Permission,
            ProcessError::Configuration(_) => ErrorKind::Configuration,
            ProcessError::InvalidData(_) => ErrorKind::DataValidation,
            ProcessError::Other(_) => ErrorKind::Unknown,
        }
    }
}

/// Map an `io::ErrorKind` to our taxonomy. `None` when it carries no useful signal.
pub fn io_error_kind(kind: io::ErrorKind) -> Option<ErrorKind> {
    use io::ErrorKind as K;
    match kind {
        K::PermissionDenied | K::ReadOnlyFilesystem => Some(ErrorKind::Permission),
        K::TimedOut
        | K::ConnectionRefused
        | K::ConnectionReset
        | K::ConnectionAborted
        | K::NotConnected
        | K::BrokenPipe
        | K::WouldBlock
        | K::Interrupted
        | K::HostUnreachable
        | K::NetworkUnreachable
        | K::NetworkDown
        | K::ResourceBusy => Some(ErrorKind::Transient),
        K::OutOfMemory | K::StorageFull | K::QuotaExceeded => Some(ErrorKind::ResourceExhaustion),
        K::InvalidData | K::UnexpectedEof | K::NotFound | K::InvalidFilename => {
            Some(ErrorKind::DataValidation)
        }
        K::InvalidInput | K::Unsupported => Some(ErrorKind::Configuration),
        _ => None,
    }
}

type Predicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Ordered rule list. Constructed explicitly and passed to the orchestrator.
#[derive(Clone)]
pub struct ErrorClassifier {
    rules: Vec<(Predicate, ErrorKind)>,
}

impl ErrorClassifier {
    /// A classifier with no rules: everything is [`ErrorKind::Unknown`].
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule. Rules are evaluated in insertion order.
    pub fn rule<F>(mut self, kind: ErrorKind, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.rules.push((Arc::new(predicate), kind));
        self
    }

    /// Insert a rule ahead of all existing ones.
    pub fn prepend_rule<F>(mut self, kind: ErrorKind, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.rules.insert(0, (Arc::new(predicate), kind));
        self
    }

    pub fn kind_of(&self, err: &anyhow::Error) -> ErrorKind {
        self.rules
            .iter()
            .find(|(pred, _)| pred(err))
            .map(|(_, kind)| *kind)
            .unwrap_or(ErrorKind::Unknown)
    }

    pub fn classify(&self, err: &anyhow::Error) -> Classification {
        self.kind_of(err).classification()
    }
}

/// Typed errors first, then io errors anywhere in the chain, then message heuristics.
impl Default for ErrorClassifier {
    fn default() -> Self {
        let mut classifier = Self::empty();
        for kind in [
            ErrorKind::Transient,
            ErrorKind::ResourceExhaustion,
            ErrorKind::Permission,
            ErrorKind::Configuration,
            ErrorKind::DataValidation,
            ErrorKind::Unknown,
        ] {
            classifier = classifier.rule(kind, move |e| {
                e.chain()
                    .find_map(|c| c.downcast_ref::<ProcessError>())
                    .is_some_and(|pe| pe.kind() == kind)
            });
        }
        for kind in [
            ErrorKind::Permission,
            ErrorKind::Transient,
            ErrorKind::ResourceExhaustion,
            ErrorKind::DataValidation,
            ErrorKind::Configuration,
        ] {
            classifier = classifier.rule(kind, move |e| {
                e.chain()
                    .find_map(|c| c.downcast_ref::<io::Error>())
                    .and_then(|io| io_error_kind(io.kind()))
                    == Some(kind)
            });
        }
        classifier
            .rule(ErrorKind::Transient, |e| {
                message_contains(e, &["timed out", "timeout", "connection", "temporarily"])
            })
            .rule(ErrorKind::ResourceExhaustion, |e| {
                message_contains(e, &["out of memory", "no space left", "too many open files"])
            })
            .rule(ErrorKind::Permission, |e| {
                message_contains(e, &["permission denied", "access denied"])
            })
    }
}

fn message_contains(err: &anyhow::Error, needles: &[&str]) -> bool {
    let msg = format!("{err:#}").to_lowercase();
    needles.iter().any(|n| msg.contains(n))
}

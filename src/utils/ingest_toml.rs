//! Load `.ingestkit.toml` from the source root, then apply `.env` / environment overrides.
//!
//! Every field is optional; only fields present in the file override [`RunConfig`] defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pipeline::executor::ExecutorKind;
use crate::pipeline::scheduler::PriorityOrder;
use crate::resilience::RetryStrategy;
use crate::utils::config::{PackagePaths, RunConfig};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct IngestToml {
    #[serde(default)]
    settings: SettingsSection,
    #[serde(default)]
    batch: BatchSection,
    #[serde(default)]
    memory: MemorySection,
    #[serde(default)]
    retry: RetrySection,
    #[serde(default)]
    circuit_breaker: CircuitSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsSection {
    state_db: Option<String>,
    file_patterns: Option<Vec<String>>,
    exclude: Option<Vec<String>>,
    worker_count: Option<usize>,
    executor: Option<ExecutorKind>,
    max_run_duration_secs: Option<u64>,
    force_full_rescan_every_secs: Option<u64>,
    exact_checksums: Option<bool>,
    mtime_window: Option<i64>,
    follow_links: Option<bool>,
    parallel_walk: Option<bool>,
    priority_order: Option<PriorityOrder>,
    item_timeout_secs: Option<u64>,
    ledger_retention_days: Option<u64>,
    logic_version: Option<String>,
    reuse_moved_content: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchSection {
    min: Option<usize>,
    max: Option<usize>,
    step: Option<usize>,
    initial: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MemorySection {
    warning_fraction: Option<f64>,
    critical_fraction: Option<f64>,
    sample_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetrySection {
    strategy: Option<RetryStrategy>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    factor: Option<f64>,
    max_retries: Option<u32>,
    jitter: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CircuitSection {
    failure_threshold: Option<u32>,
    recovery_timeout_ms: Option<u64>,
    systemic_only: Option<bool>,
}

/// Parse a config file body.
pub(crate) fn parse_ingest_toml(s: &str) -> Result<IngestToml> {
    toml::from_str(s).context("parse config TOML")
}

/// Load the config file from `dir` if present. Missing file is not an error; a malformed
/// one is.
pub(crate) fn load_ingest_toml(dir: &Path) -> Result<Option<IngestToml>> {
    let path = dir.join(PackagePaths::get().config_filename());
    if !path.is_file() {
        return Ok(None);
    }
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("read config {}", path.display()))?;
    parse_ingest_toml(&s)
        .with_context(|| format!("in {}", path.display()))
        .map(Some)
}

/// Overwrite config field from file when present.
macro_rules! apply_file_opt {
    ($sec:expr, $cfg:expr, $sec_field:ident => $($cfg_field:ident).+) => {
        if let Some(v) = $sec.$sec_field.clone() {
            $cfg.$($cfg_field).+ = v;
        }
    };
    ($sec:expr, $cfg:expr, $sec_field:ident => $($cfg_field:ident).+, $map:expr) => {
        if let Some(v) = $sec.$sec_field.clone() {
            $cfg.$($cfg_field).+ = $map(v);
        }
    };
}

/// Apply file values onto `cfg` (only fields present in the file).
pub(crate) fn apply_file_to_config(file: &IngestToml, cfg: &mut RunConfig) {
    let s = &file.settings;
    apply_file_opt!(s, cfg, state_db => state_db, |p: String| Some(PathBuf::from(p)));
    apply_file_opt!(s, cfg, file_patterns => file_patterns);
    apply_file_opt!(s, cfg, exclude => exclude);
    apply_file_opt!(s, cfg, worker_count => worker_count);
    apply_file_opt!(s, cfg, executor => executor);
    apply_file_opt!(s, cfg, max_run_duration_secs => max_run_duration, |v| Some(Duration::from_secs(v)));
    apply_file_opt!(s, cfg, force_full_rescan_every_secs => force_full_rescan_every, |v| Some(Duration::from_secs(v)));
    apply_file_opt!(s, cfg, exact_checksums => exact_checksums);
    apply_file_opt!(s, cfg, mtime_window => mtime_window_ns, |secs: i64| secs.saturating_mul(1_000_000_000));
    apply_file_opt!(s, cfg, follow_links => follow_links);
    apply_file_opt!(s, cfg, parallel_walk => parallel_walk);
    apply_file_opt!(s, cfg, priority_order => priority_order);
    apply_file_opt!(s, cfg, item_timeout_secs => item_timeout, |v| Some(Duration::from_secs(v)));
    apply_file_opt!(s, cfg, ledger_retention_days => ledger_retention, |d: u64| Duration::from_secs(d * 86_400));
    apply_file_opt!(s, cfg, logic_version => logic_version, Some);
    apply_file_opt!(s, cfg, reuse_moved_content => reuse_moved_content);

    let b = &file.batch;
    apply_file_opt!(b, cfg, min => batch.min);
    apply_file_opt!(b, cfg, max => batch.max);
    apply_file_opt!(b, cfg, step => batch.step);
    apply_file_opt!(b, cfg, initial => batch.initial);

    let m = &file.memory;
    apply_file_opt!(m, cfg, warning_fraction => max_memory_fraction);
    apply_file_opt!(m, cfg, critical_fraction => critical_memory_fraction);
    apply_file_opt!(m, cfg, sample_interval_ms => memory_sample_interval, Duration::from_millis);

    let r = &file.retry;
    apply_file_opt!(r, cfg, strategy => retry.strategy, Some);
    apply_file_opt!(r, cfg, base_delay_ms => retry.base_delay, Duration::from_millis);
    apply_file_opt!(r, cfg, max_delay_ms => retry.max_delay, Duration::from_millis);
    apply_file_opt!(r, cfg, factor => retry.factor);
    apply_file_opt!(r, cfg, max_retries => retry.max_retries);
    apply_file_opt!(r, cfg, jitter => retry.jitter);

    let c = &file.circuit_breaker;
    apply_file_opt!(c, cfg, failure_threshold => circuit_breaker.failure_threshold);
    apply_file_opt!(c, cfg, recovery_timeout_ms => circuit_breaker.recovery_timeout, Duration::from_millis);
    apply_file_opt!(c, cfg, systemic_only => circuit_breaker.systemic_only);
}

/// `INGESTKIT_WORKERS` and `INGESTKIT_MAX_RUN_SECS` from the environment, after loading
/// `.env` in `dir` (existing variables win over `.env`).
fn apply_env_overrides(dir: &Path, cfg: &mut RunConfig) {
    let env_path = dir.join(".env");
    if env_path.is_file() {
        let _ = dotenvy::from_path(&env_path);
    }
    let paths = PackagePaths::get();
    if let Some(n) = env_parse::<usize>(&paths.env_var("WORKERS")) {
        cfg.worker_count = n;
    }
    if let Some(secs) = env_parse::<u64>(&paths.env_var("MAX_RUN_SECS")) {
        cfg.max_run_duration = Some(Duration::from_secs(secs));
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a valid number", key, raw);
            None
        }
    }
}

/// Defaults ← `.ingestkit.toml` in `root` ← `.env` / environment.
pub fn load_run_config(root: &Path) -> Result<RunConfig> {
    let mut cfg = RunConfig::new(root);
    if let Some(file) = load_ingest_toml(root)? {
        apply_file_to_config(&file, &mut cfg);
    }
    apply_env_overrides(root, &mut cfg);
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::RetryStrategy;

    #[test]
    fn only_present_fields_override() {
        let file = parse_ingest_toml(
            r#"
            [settings]
            file_patterns = ["*.md", "*.pdf"]
            executor = "tasks"

            [batch]
            max = 16

            [retry]
            strategy = "linear_backoff"
            base_delay_ms = 250
            "#,
        )
        .unwrap();
        let mut cfg = RunConfig::new("/data");
        let defaults = cfg.clone();
        apply_file_to_config(&file, &mut cfg);
        assert_eq!(cfg.file_patterns, vec!["*.md", "*.pdf"]);
        assert_eq!(cfg.executor, ExecutorKind::Tasks);
        assert_eq!(cfg.batch.max, 16);
        assert_eq!(cfg.batch.min, defaults.batch.min);
        assert_eq!(cfg.retry.strategy, Some(RetryStrategy::LinearBackoff));
        assert_eq!(cfg.retry.base_delay, Duration::from_millis(250));
        assert_eq!(cfg.retry.max_retries, defaults.retry.max_retries);
    }

    #[test]
    fn breaker_and_window_keys() {
        let file = parse_ingest_toml(
            r#"
            [settings]
            mtime_window = 9223372036854775807

            [circuit_breaker]
            systemic_only = true
            "#,
        )
        .unwrap();
        let mut cfg = RunConfig::new("/data");
        apply_file_to_config(&file, &mut cfg);
        assert_eq!(cfg.mtime_window_ns, i64::MAX);
        assert!(cfg.circuit_breaker.systemic_only);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse_ingest_toml("[settings]\nworkers = 3\n").is_err());
    }
}

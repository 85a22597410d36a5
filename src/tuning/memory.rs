//! Background memory sampler. Advisory only: it never blocks the pipeline, it logs, runs
//! reclaim hooks and leaves a reduce-batch-size hint for the orchestrator to pick up.

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use log::{debug, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use sysinfo::System;

/// One reading of host and process memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct MemorySample {
    /// Fraction of host memory in use (0..=1).
    pub used_fraction: f64,
    pub available_bytes: u64,
    pub total_bytes: u64,
    /// Resident set size of this process.
    pub process_bytes: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
}

/// Called on critical pressure to release caches.
pub type ReclaimHook = Box<dyn Fn() + Send + Sync>;

pub struct MemoryMonitor {
    warning: f64,
    critical: f64,
    interval: Duration,
    system: Mutex<System>,
    hooks: Mutex<Vec<ReclaimHook>>,
    reduce_hint: AtomicBool,
    peak_bits: AtomicU64,
    last_bits: AtomicU64,
}

impl MemoryMonitor {
    pub fn new(warning: f64, critical: f64, interval: Duration) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            warning,
            critical,
            interval,
            system: Mutex::new(system),
            hooks: Mutex::new(Vec::new()),
            reduce_hint: AtomicBool::new(false),
            peak_bits: AtomicU64::new(0f64.to_bits()),
            last_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn thresholds(&self) -> (f64, f64) {
        (self.warning, self.critical)
    }

    pub fn add_reclaim_hook(&self, hook: ReclaimHook) {
        self.hooks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(hook);
    }

    /// Read current memory. Does not react to thresholds.
    pub fn sample(&self) -> MemorySample {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_memory();
        let total = system.total_memory();
        let available = system.available_memory().min(total);
        let process_bytes = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| {
                system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
                system.process(pid).map(sysinfo::Process::memory)
            })
            .unwrap_or(0);
        let used_fraction = if total == 0 {
            0.0
        } else {
            (total - available) as f64 / total as f64
        };
        MemorySample {
            used_fraction,
            available_bytes: available,
            total_bytes: total,
            process_bytes,
        }
    }

    pub fn level_for(&self, fraction: f64) -> MemoryLevel {
        if fraction >= self.critical {
            MemoryLevel::Critical
        } else if fraction >= self.warning {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        }
    }

    /// Record `sample` and react: warning logs; critical runs reclaim hooks and sets the
    /// reduce hint.
    pub fn observe(&self, sample: MemorySample) -> MemoryLevel {
        let f = sample.used_fraction;
        self.last_bits.store(f.to_bits(), Ordering::Relaxed);
        let _ = self
            .peak_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                (f > f64::from_bits(bits)).then(|| f.to_bits())
            });
        let level = self.level_for(f);
        match level {
            MemoryLevel::Critical => {
                warn!(
                    "memory critical: {:.1}% used (threshold {:.1}%), reclaiming",
                    f * 100.0,
                    self.critical * 100.0
                );
                self.reclaim();
                self.reduce_hint.store(true, Ordering::Release);
            }
            MemoryLevel::Warning => warn!(
                "memory warning: {:.1}% used (threshold {:.1}%)",
                f * 100.0,
                self.warning * 100.0
            ),
            MemoryLevel::Normal => {}
        }
        level
    }

    /// Sample and react.
    pub fn check(&self) -> MemoryLevel {
        self.observe(self.sample())
    }

    fn reclaim(&self) {
        let hooks = self.hooks.lock().unwrap_or_else(|p| p.into_inner());
        for hook in hooks.iter() {
            hook();
        }
        debug!("ran {} reclaim hooks", hooks.len());
    }

    /// Consume the reduce-batch-size hint, if one was raised since the last call.
    pub fn take_reduce_hint(&self) -> bool {
        self.reduce_hint.swap(false, Ordering::AcqRel)
    }

    pub fn peak_fraction(&self) -> f64 {
        f64::from_bits(self.peak_bits.load(Ordering::Relaxed))
    }

    pub fn last_fraction(&self) -> f64 {
        f64::from_bits(self.last_bits.load(Ordering::Relaxed))
    }

    /// Start sampling every interval on a background thread until the handle is stopped.
    pub fn start(self: &Arc<Self>) -> MonitorHandle {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let monitor = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("ingest-memory".into())
            .spawn(move || {
                loop {
                    monitor.check();
                    match stop_rx.recv_timeout(monitor.interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
            });
        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("memory monitor not started: {}", e);
                None
            }
        };
        MonitorHandle {
            stop_tx: Some(stop_tx),
            handle,
        }
    }
}

/// Owns the sampler thread. [`MonitorHandle::stop`] (or drop) signals and joins it.
pub struct MonitorHandle {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender wakes the sampler too.
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Progress bar for batch completion (CLI verbose mode).

use kdam::{Animation, Bar, BarExt};
use std::sync::{Arc, Mutex};

use crate::pipeline::BatchProgress;

pub type ProgressBar = Arc<Mutex<Bar>>;

/// Configuration for creating a progress bar
pub struct ProgressBarConfig {
    pub total: usize,
    pub desc: &'static str,
    pub animation: Animation,
}

impl ProgressBarConfig {
    pub fn new(total: usize, desc: &'static str, animation: Animation) -> Self {
        Self {
            total,
            desc,
            animation,
        }
    }
}

pub fn create_progress_bar(config: ProgressBarConfig) -> ProgressBar {
    Arc::new(Mutex::new(kdam::tqdm!(
        total = config.total,
        desc = config.desc,
        animation = config.animation,
        unit = " files"
    )))
}

/// Update the bar's total and refresh the display.
pub fn set_bar_total(pb: &ProgressBar, total: usize) {
    if let Ok(mut bar) = pb.try_lock() {
        bar.total = total;
        let _ = bar.refresh();
    }
}

/// Advance by `n`.
pub fn update_progress_bar(pb: &ProgressBar, n: usize) {
    if let Ok(mut bar) = pb.lock() {
        let _ = bar.update(n);
    }
}

/// `on_batch` callback driving a bar: total is set from the first report, then the bar
/// advances by the items consumed since the previous batch.
pub fn batch_progress_callback(bar: ProgressBar) -> impl FnMut(&BatchProgress) {
    let mut shown = 0_usize;
    move |p: &BatchProgress| {
        if shown == 0 {
            set_bar_total(&bar, p.scheduled);
        }
        if p.done > shown {
            update_progress_bar(&bar, p.done - shown);
            shown = p.done;
        }
    }
}

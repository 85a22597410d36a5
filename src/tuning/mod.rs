//! Self-tuning: memory pressure sampling and adaptive batch sizing.

pub mod batch_sizer;
pub mod memory;

pub use batch_sizer::AdaptiveBatchSizer;
pub use memory::{MemoryLevel, MemoryMonitor, MemorySample, MonitorHandle};

//! Pipeline components: walk, scheduling, execution strategies and the run loop.

pub mod context;
pub mod executor;
pub mod orchestrator;
pub mod processor;
pub mod scheduler;
pub mod walk;

pub use context::{CancelToken, RunControl};
pub use executor::{BatchExecutor, ExecutorKind, ItemJob};
pub use orchestrator::{BatchProgress, PipelineOrchestrator};
pub use processor::{CommandProcessor, Processor};
pub use scheduler::{PriorityOrder, PriorityScheduler};
pub use walk::{Candidate, WalkOptions, collect_candidates};

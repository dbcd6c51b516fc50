pub mod engine;
pub mod queue;
pub mod worker;

pub use engine::{AnalysisEngine, EngineError, PhaseReport, StoreBackedEngine};
pub use queue::{CancelOutcome, TaskQueue};
pub use worker::{WorkerPool, WorkerPoolSettings};

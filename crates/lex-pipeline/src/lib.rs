pub mod collaborators;
pub mod orchestrator;
pub mod queue;
pub mod runner;
pub mod store;

pub use collaborators::{
    BasicPrecheckEngine, NoopSimilarCaseSource, PassthroughExtractor, PrecheckEngine,
    SimilarCaseSource, TextExtractor,
};
pub use orchestrator::{run_with_retries, AnalysisOrchestrator, DEFAULT_MANDATORY_FIELDS};
pub use queue::JobQueue;
pub use runner::run_queue;
pub use store::{AnalysisJob, DocumentStore};

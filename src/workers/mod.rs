//! Queue workers
//!
//! One handler per queue: the orchestrator drives discovery, the
//! changed-files worker stages documents, the document worker scores them,
//! and the LLM worker finishes the deferred holistic analysis.

pub mod changed_files;
pub mod document;
pub mod llm_scoring;
pub mod orchestrator;

pub use changed_files::ChangedFilesWorker;
pub use document::DocumentWorker;
pub use llm_scoring::LlmScoringWorker;
pub use orchestrator::ScanOrchestrator;

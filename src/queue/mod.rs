//! Queue fabric
//!
//! Durable work queues connecting the scan pipeline stages, plus the typed
//! envelopes that travel on them.

pub mod envelopes;
pub mod service;

pub use envelopes::{decode, ChangedFileMessage, DocProcessingTask, LlmScoringTask, ScanTask};
pub use service::{
    connect_queue_pool, create_queue_tables, Delivery, QueueHandler, QueueName, QueueService,
};

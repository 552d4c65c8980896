#![forbid(unsafe_code)]

use kiln_storage::TopicPartition;

mod accumulator;
mod batch;
mod buffer_pool;
mod cluster;
mod metrics;

pub use accumulator::{
    AccumulatorConfig, ReadyCheckResult, RecordAccumulator, RecordAppendResult,
};
pub use batch::{Callback, ProducerBatch, RecordMetadata};
pub use buffer_pool::BufferPool;
pub use cluster::Cluster;
pub use metrics::ProducerMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerError {
    /// The buffer pool stayed exhausted past the caller's deadline.
    AllocTimeout { waited_ms: u64 },
    /// A single record exceeds what the pool can ever satisfy.
    RecordTooLarge { record_bytes: usize, limit: usize },
    ProducerClosed,
    /// The batch sat unsendable past the request timeout.
    BatchExpired {
        partition: TopicPartition,
        record_count: usize,
    },
    InvalidConfiguration { message: String },
}

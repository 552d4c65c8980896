use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use kiln_storage::{LogOffsetMetadata, Record, TopicPartition};
use tracing::{debug, trace};

use crate::purgatory::DelayedOperation;

/// Per-partition errors surfaced through a fetch response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchError {
    UnknownTopicOrPartition,
    NotLeaderForPartition,
    OffsetOutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionFetchInfo {
    pub fetch_offset: i64,
    pub max_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPartitionStatus {
    /// Where the fetch starts, resolved against the log when the request
    /// arrived.
    pub start_offset_metadata: LogOffsetMetadata,
    pub fetch_info: PartitionFetchInfo,
}

/// The immutable parameters of one delayed fetch request.
#[derive(Debug, Clone)]
pub struct FetchMetadata {
    pub fetch_min_bytes: usize,
    pub fetch_only_leader: bool,
    pub fetch_only_committed: bool,
    pub is_from_follower: bool,
    pub partition_status: Vec<(TopicPartition, FetchPartitionStatus)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPartitionData {
    pub error: Option<FetchError>,
    pub high_watermark: i64,
    pub records: Vec<Record>,
}

pub type FetchResponse = Vec<(TopicPartition, FetchPartitionData)>;
pub type FetchCallback = Box<dyn FnOnce(FetchResponse) + Send>;

/// The broker-local log state a fetch reads from. Implementations resolve
/// the policy-selected end offset (high watermark for consumer fetches, log
/// end for follower fetches) and serve the actual read at completion time.
pub trait ReplicaView: Send + Sync {
    fn end_offset_metadata(
        &self,
        partition: &TopicPartition,
        fetch_only_leader: bool,
        fetch_only_committed: bool,
    ) -> Result<LogOffsetMetadata, FetchError>;

    /// Serve the fetch for one partition; failures travel inside the
    /// returned data as the per-partition error.
    fn read(
        &self,
        partition: &TopicPartition,
        offset: i64,
        max_bytes: usize,
        fetch_only_leader: bool,
        fetch_only_committed: bool,
    ) -> FetchPartitionData;
}

/// A fetch request parked until enough data accumulates, the log state
/// shifts under it, or its deadline passes.
///
/// Completion cases:
///  A. a requested partition is no longer led locally (when the fetch
///     requires the leader) — complete immediately;
///  B. a requested partition is unknown — complete immediately;
///  C. the fetch position is no longer on the log's active segment
///     (truncation happened, or a new segment rolled) — complete;
///  D. the accumulated available bytes reach `fetch_min_bytes` — complete;
///  otherwise the purgatory's expiration sweep completes it at deadline.
///
/// On completion the partitions are re-read with the original fetch
/// parameters and the response callback fires exactly once.
pub struct DelayedFetch {
    completed: AtomicBool,
    metadata: FetchMetadata,
    replica: Arc<dyn ReplicaView>,
    callback: Mutex<Option<FetchCallback>>,
}

impl DelayedFetch {
    pub fn new(
        metadata: FetchMetadata,
        replica: Arc<dyn ReplicaView>,
        callback: FetchCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            completed: AtomicBool::new(false),
            metadata,
            replica,
            callback: Mutex::new(Some(callback)),
        })
    }

    pub fn metadata(&self) -> &FetchMetadata {
        &self.metadata
    }

    /// The partitions this fetch should be watched under.
    pub fn watch_keys(&self) -> Vec<TopicPartition> {
        self.metadata
            .partition_status
            .iter()
            .map(|(partition, _)| partition.clone())
            .collect()
    }
}

impl DelayedOperation for DelayedFetch {
    fn completed_flag(&self) -> &AtomicBool {
        &self.completed
    }

    fn try_complete(&self) -> bool {
        let mut accumulated_bytes = 0_u64;
        for (partition, status) in &self.metadata.partition_status {
            let fetch_offset = status.start_offset_metadata;
            if fetch_offset.is_unknown() {
                continue;
            }
            let end_offset = match self.replica.end_offset_metadata(
                partition,
                self.metadata.fetch_only_leader,
                self.metadata.fetch_only_committed,
            ) {
                Ok(end_offset) => end_offset,
                Err(error) => {
                    // Cases A and B: the partition moved or vanished; the
                    // re-read on completion reports the error per partition.
                    debug!(%partition, ?error, "fetch partition unavailable, completing");
                    return self.force_complete();
                }
            };

            if end_offset.message_offset != fetch_offset.message_offset {
                if end_offset.on_older_segment(&fetch_offset) {
                    // Case C: the log truncated below the fetch position.
                    trace!(%partition, "log end fell below fetch position, completing");
                    return self.force_complete();
                }
                if fetch_offset.on_older_segment(&end_offset) {
                    // Case C: a new active segment rolled past the fetch
                    // position; a whole older segment is available.
                    trace!(%partition, "fetch position on older segment, completing");
                    return self.force_complete();
                }
                if fetch_offset.message_offset < end_offset.message_offset {
                    let available = end_offset.position_diff(&fetch_offset);
                    accumulated_bytes +=
                        available.min(status.fetch_info.max_bytes as u64);
                }
            }
        }

        // Case D.
        if accumulated_bytes >= self.metadata.fetch_min_bytes as u64 {
            self.force_complete()
        } else {
            false
        }
    }

    fn on_complete(&self) {
        let mut response = Vec::with_capacity(self.metadata.partition_status.len());
        for (partition, status) in &self.metadata.partition_status {
            let data = self.replica.read(
                partition,
                status.fetch_info.fetch_offset,
                status.fetch_info.max_bytes,
                self.metadata.fetch_only_leader,
                self.metadata.fetch_only_committed,
            );
            response.push((partition.clone(), data));
        }

        let callback = self
            .callback
            .lock()
            .expect("fetch callback lock poisoned")
            .take();
        if let Some(callback) = callback {
            callback(response);
        }
    }

    fn on_expiration(&self) {
        trace!(
            partitions = self.metadata.partition_status.len(),
            from_follower = self.metadata.is_from_follower,
            "delayed fetch expired"
        );
    }
}

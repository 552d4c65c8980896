use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use kiln_storage::{Log, LogOffsetMetadata, StorageError, TopicPartition};

use crate::fetch::{FetchError, FetchPartitionData, ReplicaView};

struct ReplicaState {
    log: Arc<Mutex<Log>>,
    is_leader: bool,
}

/// The broker's local partitions, keyed by topic-partition, with a leader
/// flag per entry. Serves the `ReplicaView` seam for delayed fetches.
#[derive(Default)]
pub struct LocalReplicaManager {
    replicas: Mutex<HashMap<TopicPartition, ReplicaState>>,
}

impl LocalReplicaManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, partition: TopicPartition, log: Arc<Mutex<Log>>, is_leader: bool) {
        self.lock_replicas()
            .insert(partition, ReplicaState { log, is_leader });
    }

    /// Flip leadership; returns false when the partition is unknown.
    pub fn set_leader(&self, partition: &TopicPartition, is_leader: bool) -> bool {
        match self.lock_replicas().get_mut(partition) {
            Some(state) => {
                state.is_leader = is_leader;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, partition: &TopicPartition) {
        self.lock_replicas().remove(partition);
    }

    pub fn log(&self, partition: &TopicPartition) -> Option<Arc<Mutex<Log>>> {
        self.lock_replicas()
            .get(partition)
            .map(|state| Arc::clone(&state.log))
    }

    fn lock_replicas(&self) -> MutexGuard<'_, HashMap<TopicPartition, ReplicaState>> {
        self.replicas.lock().expect("replica map lock poisoned")
    }

    fn with_log<T>(
        &self,
        partition: &TopicPartition,
        fetch_only_leader: bool,
        f: impl FnOnce(&Log) -> T,
    ) -> Result<T, FetchError> {
        let log = {
            let replicas = self.lock_replicas();
            let state = replicas
                .get(partition)
                .ok_or(FetchError::UnknownTopicOrPartition)?;
            if fetch_only_leader && !state.is_leader {
                return Err(FetchError::NotLeaderForPartition);
            }
            Arc::clone(&state.log)
        };
        let log = log.lock().expect("log lock poisoned");
        Ok(f(&log))
    }
}

impl ReplicaView for LocalReplicaManager {
    fn end_offset_metadata(
        &self,
        partition: &TopicPartition,
        fetch_only_leader: bool,
        fetch_only_committed: bool,
    ) -> Result<LogOffsetMetadata, FetchError> {
        self.with_log(partition, fetch_only_leader, |log| {
            let end_offset = if fetch_only_committed {
                log.high_watermark()
            } else {
                log.log_end_offset()
            };
            log.offset_metadata(end_offset)
                .map_err(|_| FetchError::OffsetOutOfRange)
        })?
    }

    fn read(
        &self,
        partition: &TopicPartition,
        offset: i64,
        max_bytes: usize,
        fetch_only_leader: bool,
        fetch_only_committed: bool,
    ) -> FetchPartitionData {
        let outcome = self.with_log(partition, fetch_only_leader, |log| {
            let high_watermark = log.high_watermark();
            let mut records = match log.read(offset, max_bytes) {
                Ok(records) => records,
                Err(StorageError::OffsetOutOfRange { .. }) => {
                    return FetchPartitionData {
                        error: Some(FetchError::OffsetOutOfRange),
                        high_watermark,
                        records: Vec::new(),
                    }
                }
                Err(_) => {
                    return FetchPartitionData {
                        error: Some(FetchError::UnknownTopicOrPartition),
                        high_watermark,
                        records: Vec::new(),
                    }
                }
            };
            if fetch_only_committed {
                records.retain(|record| record.offset < high_watermark);
            }
            FetchPartitionData {
                error: None,
                high_watermark,
                records,
            }
        });
        outcome.unwrap_or_else(|error| FetchPartitionData {
            error: Some(error),
            high_watermark: -1,
            records: Vec::new(),
        })
    }
}

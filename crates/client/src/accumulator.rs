use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use kiln_storage::{frame_size, Compression, TopicPartition};
use tracing::debug;

use crate::batch::{Callback, ProducerBatch};
use crate::buffer_pool::BufferPool;
use crate::cluster::Cluster;
use crate::metrics::ProducerMetrics;
use crate::ProducerError;

#[derive(Debug, Clone, PartialEq)]
pub struct AccumulatorConfig {
    /// Target buffer size per batch; a larger first record gets a larger
    /// one-off buffer.
    pub batch_size: usize,
    /// Total memory budget across all batches.
    pub total_memory: usize,
    /// Codec the dispatcher should apply when sending drained batches.
    pub compression: Compression,
    /// How long a non-full batch lingers before becoming sendable.
    pub linger_ms: i64,
    /// Minimum delay between send attempts of the same batch.
    pub retry_backoff_ms: i64,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 16 * 1024,
            total_memory: 32 * 1024 * 1024,
            compression: Compression::None,
            linger_ms: 0,
            retry_backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordAppendResult {
    pub batch_is_full: bool,
    pub new_batch_created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyCheckResult {
    pub ready_nodes: BTreeSet<i32>,
    /// Earliest time at which a currently-unsendable partition becomes
    /// sendable; `i64::MAX` when nothing is waiting.
    pub next_ready_check_delay_ms: i64,
    pub unknown_leaders_exist: bool,
}

type BatchDeque = Arc<Mutex<VecDeque<ProducerBatch>>>;
type PartitionMap = HashMap<TopicPartition, BatchDeque>;

/// A bounded-memory queue that coalesces records into per-partition batches
/// for a single dispatcher thread to drain.
///
/// The partition map is copy-on-write: lookups clone an `Arc` snapshot and
/// never block appenders; only the rare first append to a new partition
/// swaps the map. Each deque has its own lock, and no deque lock is ever
/// held across a pool allocation.
pub struct RecordAccumulator {
    config: AccumulatorConfig,
    closed: AtomicBool,
    flushes_in_progress: AtomicUsize,
    appends_in_progress: AtomicUsize,
    batches: RwLock<Arc<PartitionMap>>,
    /// Ids of batches created but not yet acknowledged.
    incomplete: Mutex<HashSet<u64>>,
    incomplete_drained: Condvar,
    free: BufferPool,
    /// Partitions with an in-flight request when ordering requires at most
    /// one; only the dispatcher thread mutates this.
    muted: Mutex<HashSet<TopicPartition>>,
    /// Rotating start position for drains, to avoid starving partitions.
    drain_index: AtomicUsize,
    next_batch_id: AtomicU64,
    metrics: ProducerMetrics,
}

impl RecordAccumulator {
    pub fn new(config: AccumulatorConfig) -> Result<Self, ProducerError> {
        if config.batch_size == 0 || config.total_memory < config.batch_size {
            return Err(ProducerError::InvalidConfiguration {
                message: "total_memory must hold at least one batch".to_string(),
            });
        }
        let metrics =
            ProducerMetrics::new().map_err(|message| ProducerError::InvalidConfiguration {
                message,
            })?;
        Ok(Self {
            free: BufferPool::new(config.total_memory, config.batch_size),
            config,
            closed: AtomicBool::new(false),
            flushes_in_progress: AtomicUsize::new(0),
            appends_in_progress: AtomicUsize::new(0),
            batches: RwLock::new(Arc::new(PartitionMap::new())),
            incomplete: Mutex::new(HashSet::new()),
            incomplete_drained: Condvar::new(),
            muted: Mutex::new(HashSet::new()),
            drain_index: AtomicUsize::new(0),
            next_batch_id: AtomicU64::new(0),
            metrics,
        })
    }

    pub fn compression(&self) -> Compression {
        self.config.compression
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.free
    }

    /// Append a record, batching it with others bound for the same
    /// partition. Blocks up to `max_block_ms` for buffer memory.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        partition: &TopicPartition,
        timestamp_ms: i64,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        callback: Option<Callback>,
        max_block_ms: u64,
        now_ms: i64,
    ) -> Result<RecordAppendResult, ProducerError> {
        // Tracked so close can keep aborting until no appender can slip a
        // new batch in behind it.
        self.appends_in_progress.fetch_add(1, Ordering::SeqCst);
        let result = self.do_append(partition, timestamp_ms, key, value, callback, max_block_ms, now_ms);
        self.appends_in_progress.fetch_sub(1, Ordering::SeqCst);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn do_append(
        &self,
        partition: &TopicPartition,
        timestamp_ms: i64,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        mut callback: Option<Callback>,
        max_block_ms: u64,
        now_ms: i64,
    ) -> Result<RecordAppendResult, ProducerError> {
        let deque = self.get_or_create_deque(partition);

        {
            let mut dq = deque.lock().expect("batch deque lock poisoned");
            if self.closed.load(Ordering::SeqCst) {
                return Err(ProducerError::ProducerClosed);
            }
            if let Some(result) = try_append_last(
                &mut dq,
                timestamp_ms,
                key.as_deref(),
                value.as_deref(),
                &mut callback,
                now_ms,
            ) {
                return Ok(result);
            }
        }

        // No room in the head batch: allocate a new buffer without holding
        // the deque lock, since the pool may block.
        let size = self.config.batch_size.max(frame_size(
            key.as_deref().map_or(0, <[u8]>::len),
            value.as_deref().map_or(0, <[u8]>::len),
        ));
        let buffer = self.free.allocate(size, max_block_ms)?;

        let mut dq = deque.lock().expect("batch deque lock poisoned");
        if self.closed.load(Ordering::SeqCst) {
            self.free.deallocate(buffer);
            return Err(ProducerError::ProducerClosed);
        }
        // Another producer may have installed a fresh batch while we were
        // allocating; prefer it and give the buffer back.
        if let Some(result) = try_append_last(
            &mut dq,
            timestamp_ms,
            key.as_deref(),
            value.as_deref(),
            &mut callback,
            now_ms,
        ) {
            self.free.deallocate(buffer);
            return Ok(result);
        }

        let id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        let mut batch = ProducerBatch::new(
            id,
            partition.clone(),
            buffer,
            self.config.batch_size,
            now_ms,
        );
        if !batch.try_append(
            timestamp_ms,
            key.as_deref(),
            value.as_deref(),
            &mut callback,
            now_ms,
        ) {
            self.free.deallocate(batch.into_buffer());
            return Err(ProducerError::RecordTooLarge {
                record_bytes: size,
                limit: self.config.total_memory,
            });
        }

        let batch_is_full = batch.is_full();
        dq.push_back(batch);
        self.incomplete
            .lock()
            .expect("incomplete set lock poisoned")
            .insert(id);
        Ok(RecordAppendResult {
            batch_is_full: dq.len() > 1 || batch_is_full,
            new_batch_created: true,
        })
    }

    /// Which nodes have sendable data, and how long until one will.
    pub fn ready(&self, cluster: &Cluster, now_ms: i64) -> ReadyCheckResult {
        let snapshot = self.snapshot();
        let muted = self.muted.lock().expect("muted set lock poisoned").clone();
        let mut ready_nodes = BTreeSet::new();
        let mut next_ready_check_delay_ms = i64::MAX;
        let mut unknown_leaders_exist = false;
        let exhausted = self.free.queued() > 0;

        for (partition, deque) in snapshot.iter() {
            let Some(leader) = cluster.leader_for(partition) else {
                let dq = deque.lock().expect("batch deque lock poisoned");
                if !dq.is_empty() {
                    unknown_leaders_exist = true;
                }
                continue;
            };
            if ready_nodes.contains(&leader) || muted.contains(partition) {
                continue;
            }

            let dq = deque.lock().expect("batch deque lock poisoned");
            let Some(batch) = dq.front() else {
                continue;
            };
            let backing_off = batch.attempts() > 0
                && batch.last_attempt_ms() + self.config.retry_backoff_ms > now_ms;
            let waited_ms = now_ms - batch.last_attempt_ms();
            let time_to_wait_ms = if backing_off {
                self.config.retry_backoff_ms
            } else {
                self.config.linger_ms
            };
            let full = dq.len() > 1 || batch.is_full();
            let expired = waited_ms >= time_to_wait_ms;
            let sendable = full
                || expired
                || exhausted
                || self.closed.load(Ordering::SeqCst)
                || self.flush_in_progress();
            if sendable && !backing_off {
                ready_nodes.insert(leader);
            } else {
                // Conservative: the partition may become sendable sooner
                // through another batch, but waking then is harmless.
                let time_left_ms = (time_to_wait_ms - waited_ms).max(0);
                next_ready_check_delay_ms = next_ready_check_delay_ms.min(time_left_ms);
            }
        }

        ReadyCheckResult {
            ready_nodes,
            next_ready_check_delay_ms,
            unknown_leaders_exist,
        }
    }

    /// Pull sendable batches for the given nodes, at most `max_size` bytes
    /// per node, rotating the starting partition to avoid starvation.
    pub fn drain(
        &self,
        cluster: &Cluster,
        nodes: &BTreeSet<i32>,
        max_size: usize,
        now_ms: i64,
    ) -> HashMap<i32, Vec<ProducerBatch>> {
        let mut drained = HashMap::new();
        if nodes.is_empty() {
            return drained;
        }
        let snapshot = self.snapshot();
        let muted = self.muted.lock().expect("muted set lock poisoned").clone();

        for node in nodes {
            let partitions = cluster.partitions_for_node(*node);
            let mut ready = Vec::new();
            if partitions.is_empty() {
                drained.insert(*node, ready);
                continue;
            }

            let mut size = 0_usize;
            let start = self.drain_index.load(Ordering::Relaxed) % partitions.len();
            let mut index = start;
            loop {
                let partition = &partitions[index];
                if !muted.contains(partition) {
                    if let Some(deque) = snapshot.get(partition) {
                        let mut dq = deque.lock().expect("batch deque lock poisoned");
                        if let Some(first) = dq.front() {
                            let backing_off = first.attempts() > 0
                                && first.last_attempt_ms() + self.config.retry_backoff_ms > now_ms;
                            if !backing_off {
                                if size + first.records_size() > max_size && !ready.is_empty() {
                                    // A single batch may exceed max_size
                                    // (e.g. one oversized record); it still
                                    // ships alone on a later pass.
                                    break;
                                }
                                let mut batch =
                                    dq.pop_front().expect("front element checked above");
                                batch.close();
                                batch.set_drained_ms(now_ms);
                                size += batch.records_size();
                                ready.push(batch);
                            }
                        }
                    }
                }
                index = (index + 1) % partitions.len();
                self.drain_index.store(index, Ordering::Relaxed);
                if index == start {
                    break;
                }
            }
            drained.insert(*node, ready);
        }
        drained
    }

    /// Put a failed batch back at the *front* of its deque so per-partition
    /// order survives retries.
    pub fn reenqueue(&self, mut batch: ProducerBatch, now_ms: i64) {
        batch.reenqueued(now_ms);
        let deque = self.get_or_create_deque(&batch.partition().clone());
        deque
            .lock()
            .expect("batch deque lock poisoned")
            .push_front(batch);
    }

    /// Expire batches stuck in the accumulator past the request timeout.
    /// Returns the number of expired batches.
    pub fn abort_expired_batches(&self, request_timeout_ms: i64, now_ms: i64) -> usize {
        let snapshot = self.snapshot();
        let muted = self.muted.lock().expect("muted set lock poisoned").clone();
        let mut expired = Vec::new();

        for (partition, deque) in snapshot.iter() {
            // Skip partitions with an in-flight batch so later batches
            // cannot expire ahead of an earlier one still in progress.
            if muted.contains(partition) {
                continue;
            }
            let mut dq = deque.lock().expect("batch deque lock poisoned");
            loop {
                let is_full = dq.len() > 1 || dq.front().is_some_and(ProducerBatch::is_full);
                let Some(first) = dq.front_mut() else {
                    break;
                };
                if first.maybe_expire(
                    request_timeout_ms,
                    self.config.retry_backoff_ms,
                    now_ms,
                    self.config.linger_ms,
                    is_full,
                ) {
                    expired.push(dq.pop_front().expect("front element checked above"));
                } else {
                    break;
                }
            }
        }

        let count = expired.len();
        for batch in expired {
            self.deallocate(batch);
        }
        if count > 0 {
            self.metrics.record_expired_batches(count);
            debug!(count, "expired batches in accumulator");
        }
        count
    }

    /// Resolve a drained batch: fire its callbacks and return its buffer to
    /// the pool.
    pub fn complete_batch(
        &self,
        mut batch: ProducerBatch,
        base_offset: i64,
        error: Option<ProducerError>,
    ) {
        batch.complete(base_offset, error);
        self.deallocate(batch);
    }

    pub fn mute_partition(&self, partition: TopicPartition) {
        self.muted
            .lock()
            .expect("muted set lock poisoned")
            .insert(partition);
    }

    pub fn unmute_partition(&self, partition: &TopicPartition) {
        self.muted
            .lock()
            .expect("muted set lock poisoned")
            .remove(partition);
    }

    /// Any record batched but not yet drained?
    pub fn has_unsent(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.values().any(|deque| {
            !deque
                .lock()
                .expect("batch deque lock poisoned")
                .is_empty()
        })
    }

    /// Make every partition immediately sendable until the matching
    /// `await_flush_completion`.
    pub fn begin_flush(&self) {
        self.flushes_in_progress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn flush_in_progress(&self) -> bool {
        self.flushes_in_progress.load(Ordering::SeqCst) > 0
    }

    /// Block until every batch created so far has been acknowledged.
    pub fn await_flush_completion(&self) {
        let mut incomplete = self.incomplete.lock().expect("incomplete set lock poisoned");
        while !incomplete.is_empty() {
            incomplete = self
                .incomplete_drained
                .wait(incomplete)
                .expect("incomplete set lock poisoned");
        }
        drop(incomplete);
        self.flushes_in_progress.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fail every queued batch. Loops until no appender thread can slip a
    /// new batch in behind the close flag.
    pub fn abort_incomplete_batches(&self) {
        loop {
            self.abort_queued_batches();
            if self.appends_in_progress.load(Ordering::SeqCst) == 0 {
                break;
            }
        }
        self.abort_queued_batches();
        let mut map = self.batches.write().expect("partition map lock poisoned");
        *map = Arc::new(PartitionMap::new());
    }

    fn abort_queued_batches(&self) {
        let snapshot = self.snapshot();
        for deque in snapshot.values() {
            loop {
                let batch = deque
                    .lock()
                    .expect("batch deque lock poisoned")
                    .pop_front();
                let Some(mut batch) = batch else {
                    break;
                };
                batch.close();
                batch.complete(-1, Some(ProducerError::ProducerClosed));
                self.deallocate(batch);
            }
        }
    }

    /// Refresh pool gauges and render all producer metrics.
    pub fn render_metrics(&self) -> Result<String, String> {
        self.metrics.observe_pool(&self.free);
        self.metrics.render_prometheus()
    }

    fn deallocate(&self, batch: ProducerBatch) {
        {
            let mut incomplete = self.incomplete.lock().expect("incomplete set lock poisoned");
            incomplete.remove(&batch.id());
            self.incomplete_drained.notify_all();
        }
        self.free.deallocate(batch.into_buffer());
    }

    fn snapshot(&self) -> Arc<PartitionMap> {
        Arc::clone(&self.batches.read().expect("partition map lock poisoned"))
    }

    fn get_or_create_deque(&self, partition: &TopicPartition) -> BatchDeque {
        {
            let map = self.batches.read().expect("partition map lock poisoned");
            if let Some(deque) = map.get(partition) {
                return Arc::clone(deque);
            }
        }
        let mut map = self.batches.write().expect("partition map lock poisoned");
        if let Some(deque) = map.get(partition) {
            return Arc::clone(deque);
        }
        let mut next = (**map).clone();
        let deque: BatchDeque = Arc::new(Mutex::new(VecDeque::new()));
        next.insert(partition.clone(), Arc::clone(&deque));
        *map = Arc::new(next);
        deque
    }
}

fn try_append_last(
    dq: &mut VecDeque<ProducerBatch>,
    timestamp_ms: i64,
    key: Option<&[u8]>,
    value: Option<&[u8]>,
    callback: &mut Option<Callback>,
    now_ms: i64,
) -> Option<RecordAppendResult> {
    let last = dq.back_mut()?;
    if last.try_append(timestamp_ms, key, value, callback, now_ms) {
        let batch_is_full = dq.len() > 1 || dq.back().expect("back exists").is_full();
        Some(RecordAppendResult {
            batch_is_full,
            new_batch_created: false,
        })
    } else {
        // The head batch is out of room; seal it so the dispatcher sees it
        // as complete.
        last.close();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulator(config: AccumulatorConfig) -> RecordAccumulator {
        RecordAccumulator::new(config).expect("accumulator")
    }

    fn tp() -> TopicPartition {
        TopicPartition::new("t", 0)
    }

    fn one_node_cluster() -> Cluster {
        let mut cluster = Cluster::new();
        cluster.set_leader(tp(), 1);
        cluster
    }

    fn append_value(acc: &RecordAccumulator, value: &[u8], now_ms: i64) -> RecordAppendResult {
        acc.append(
            &tp(),
            now_ms,
            Some(b"key".to_vec()),
            Some(value.to_vec()),
            None,
            1_000,
            now_ms,
        )
        .expect("append")
    }

    #[test]
    fn linger_delays_readiness_until_elapsed() {
        let acc = accumulator(AccumulatorConfig {
            linger_ms: 100,
            batch_size: 1024,
            ..AccumulatorConfig::default()
        });
        let cluster = one_node_cluster();
        append_value(&acc, b"0123456789", 0);

        let at_50 = acc.ready(&cluster, 50);
        assert!(at_50.ready_nodes.is_empty());
        assert_eq!(at_50.next_ready_check_delay_ms, 50);

        let at_100 = acc.ready(&cluster, 100);
        assert_eq!(at_100.ready_nodes, BTreeSet::from([1]));
    }

    #[test]
    fn full_batch_overrides_linger() {
        let acc = accumulator(AccumulatorConfig {
            linger_ms: 100,
            batch_size: 256,
            ..AccumulatorConfig::default()
        });
        let cluster = one_node_cluster();
        // Fill past one batch so the first batch seals.
        for _ in 0..8 {
            append_value(&acc, &[7_u8; 64], 25);
        }
        let result = acc.ready(&cluster, 26);
        assert_eq!(result.ready_nodes, BTreeSet::from([1]));
    }

    #[test]
    fn unknown_leader_is_flagged() {
        let acc = accumulator(AccumulatorConfig::default());
        append_value(&acc, b"v", 0);
        let empty_cluster = Cluster::new();
        let result = acc.ready(&empty_cluster, 0);
        assert!(result.unknown_leaders_exist);
        assert!(result.ready_nodes.is_empty());
    }

    #[test]
    fn drain_returns_batches_in_append_order() {
        let acc = accumulator(AccumulatorConfig {
            batch_size: 128,
            linger_ms: 0,
            ..AccumulatorConfig::default()
        });
        let cluster = one_node_cluster();
        for i in 0..12_u8 {
            append_value(&acc, &[i; 32], 0);
        }

        let mut drained_values = Vec::new();
        loop {
            let ready = acc.ready(&cluster, 1_000);
            if ready.ready_nodes.is_empty() {
                break;
            }
            let mut by_node = acc.drain(&cluster, &ready.ready_nodes, usize::MAX, 1_000);
            let batches = by_node.remove(&1).expect("node 1 batches");
            if batches.is_empty() {
                break;
            }
            for batch in batches {
                for record in batch.records().expect("decode") {
                    drained_values.push(record.value.expect("value")[0]);
                }
                acc.complete_batch(batch, 0, None);
            }
        }
        assert_eq!(drained_values, (0..12).collect::<Vec<u8>>());
        assert!(!acc.has_unsent());
    }

    #[test]
    fn reenqueued_batch_goes_to_the_front_and_backs_off() {
        let acc = accumulator(AccumulatorConfig {
            batch_size: 64,
            linger_ms: 0,
            retry_backoff_ms: 500,
            ..AccumulatorConfig::default()
        });
        let cluster = one_node_cluster();
        append_value(&acc, &[1_u8; 40], 0);
        append_value(&acc, &[2_u8; 40], 0);

        let ready = acc.ready(&cluster, 10);
        let mut drained = acc.drain(&cluster, &ready.ready_nodes, usize::MAX, 10);
        let mut batches = drained.remove(&1).expect("batches");
        let first = batches.remove(0);
        let first_value = first.records().expect("decode")[0]
            .value
            .clone()
            .expect("value");
        assert_eq!(first_value[0], 1);
        for leftover in batches {
            acc.reenqueue(leftover, 10);
        }
        acc.reenqueue(first, 10);

        // Within the backoff window nothing is sendable.
        let during_backoff = acc.ready(&cluster, 20);
        assert!(during_backoff.ready_nodes.is_empty());

        // After backoff, the retried batch drains first, preserving order.
        let after = acc.ready(&cluster, 600);
        let mut drained = acc.drain(&cluster, &after.ready_nodes, usize::MAX, 600);
        let batches = drained.remove(&1).expect("batches");
        let head_value = batches[0].records().expect("decode")[0]
            .value
            .clone()
            .expect("value");
        assert_eq!(head_value[0], 1);
        for batch in batches {
            acc.complete_batch(batch, 0, None);
        }
    }

    #[test]
    fn muted_partitions_are_skipped_by_drain() {
        let acc = accumulator(AccumulatorConfig {
            linger_ms: 0,
            ..AccumulatorConfig::default()
        });
        let cluster = one_node_cluster();
        append_value(&acc, b"v", 0);
        acc.mute_partition(tp());

        let drained = acc.drain(&cluster, &BTreeSet::from([1]), usize::MAX, 10);
        assert!(drained.get(&1).expect("node entry").is_empty());

        acc.unmute_partition(&tp());
        let drained = acc.drain(&cluster, &BTreeSet::from([1]), usize::MAX, 10);
        assert_eq!(drained.get(&1).expect("node entry").len(), 1);
    }

    #[test]
    fn expired_batches_free_their_memory() {
        let acc = accumulator(AccumulatorConfig {
            batch_size: 1024,
            total_memory: 4096,
            linger_ms: 0,
            ..AccumulatorConfig::default()
        });
        let before = acc.buffer_pool().available_memory();
        append_value(&acc, b"v", 0);
        assert!(acc.buffer_pool().available_memory() < before);

        let expired = acc.abort_expired_batches(100, 10_000);
        assert_eq!(expired, 1);
        assert_eq!(acc.buffer_pool().available_memory(), before);
        assert!(!acc.has_unsent());
    }

    #[test]
    fn closed_accumulator_rejects_appends_and_aborts_queued_batches() {
        let acc = accumulator(AccumulatorConfig::default());
        append_value(&acc, b"v", 0);
        acc.close();

        let err = acc
            .append(&tp(), 0, None, Some(b"v".to_vec()), None, 10, 0)
            .expect_err("closed");
        assert!(matches!(err, ProducerError::ProducerClosed));

        acc.abort_incomplete_batches();
        assert!(!acc.has_unsent());
        assert_eq!(
            acc.buffer_pool().available_memory(),
            acc.buffer_pool().total_memory()
        );
    }

    #[test]
    fn flush_makes_lingering_batches_sendable() {
        let acc = accumulator(AccumulatorConfig {
            linger_ms: 60_000,
            ..AccumulatorConfig::default()
        });
        let cluster = one_node_cluster();
        append_value(&acc, b"v", 0);
        assert!(acc.ready(&cluster, 1).ready_nodes.is_empty());

        acc.begin_flush();
        assert_eq!(acc.ready(&cluster, 1).ready_nodes, BTreeSet::from([1]));

        let drained = acc.drain(&cluster, &BTreeSet::from([1]), usize::MAX, 1);
        for batch in drained.into_values().flatten() {
            acc.complete_batch(batch, 0, None);
        }
        // Every batch is acknowledged, so this returns without blocking.
        acc.await_flush_completion();
    }
}

use kiln_storage::{
    decode_record_frame, encode_record_frame, frame_size, Record, StorageError, TopicPartition,
};

use crate::ProducerError;

/// Per-record completion callback, fired exactly once when the batch
/// resolves.
pub type Callback = Box<dyn FnOnce(Result<RecordMetadata, ProducerError>) + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub partition: TopicPartition,
    pub offset: i64,
    pub timestamp_ms: i64,
}

/// A callback plus the relative position of its record inside the batch.
struct Thunk {
    callback: Callback,
    relative_offset: i64,
    timestamp_ms: i64,
}

/// A batch of records bound for one partition.
///
/// Records are encoded into the pooled buffer with offsets relative to the
/// batch start; the broker's assigned base offset positions them at
/// completion time. Not thread safe: the owning deque's lock serializes all
/// access.
pub struct ProducerBatch {
    id: u64,
    partition: TopicPartition,
    buffer: Vec<u8>,
    write_limit: usize,
    record_count: usize,
    max_record_size: usize,
    attempts: u32,
    created_ms: i64,
    drained_ms: i64,
    last_attempt_ms: i64,
    last_append_ms: i64,
    retry: bool,
    closed: bool,
    completed: bool,
    thunks: Vec<Thunk>,
}

impl std::fmt::Debug for ProducerBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerBatch")
            .field("id", &self.id)
            .field("partition", &self.partition)
            .field("record_count", &self.record_count)
            .field("size", &self.buffer.len())
            .field("attempts", &self.attempts)
            .field("retry", &self.retry)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ProducerBatch {
    pub(crate) fn new(
        id: u64,
        partition: TopicPartition,
        buffer: Vec<u8>,
        write_limit: usize,
        now_ms: i64,
    ) -> Self {
        Self {
            id,
            partition,
            buffer,
            write_limit,
            record_count: 0,
            max_record_size: 0,
            attempts: 0,
            created_ms: now_ms,
            drained_ms: 0,
            last_attempt_ms: now_ms,
            last_append_ms: now_ms,
            retry: false,
            closed: false,
            completed: false,
            thunks: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn max_record_size(&self) -> usize {
        self.max_record_size
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn created_ms(&self) -> i64 {
        self.created_ms
    }

    pub fn drained_ms(&self) -> i64 {
        self.drained_ms
    }

    pub fn last_attempt_ms(&self) -> i64 {
        self.last_attempt_ms
    }

    pub fn last_append_ms(&self) -> i64 {
        self.last_append_ms
    }

    pub fn in_retry(&self) -> bool {
        self.retry
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Encoded bytes currently in the batch.
    pub fn records_size(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_full(&self) -> bool {
        self.closed || self.buffer.len() >= self.write_limit
    }

    fn has_room_for(&self, key: Option<&[u8]>, value: Option<&[u8]>) -> bool {
        if self.closed {
            return false;
        }
        let needed = frame_size(
            key.map_or(0, <[u8]>::len),
            value.map_or(0, <[u8]>::len),
        );
        if self.record_count == 0 {
            // The first record is limited only by the buffer itself, which
            // was sized to hold it.
            self.buffer.len() + needed <= self.buffer.capacity()
        } else {
            self.buffer.len() + needed <= self.write_limit
        }
    }

    /// Append one record if there is room, taking the callback only on
    /// success. Returns false when the batch is full or sealed.
    pub(crate) fn try_append(
        &mut self,
        timestamp_ms: i64,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        callback: &mut Option<Callback>,
        now_ms: i64,
    ) -> bool {
        if !self.has_room_for(key, value) {
            return false;
        }
        let relative_offset = self.record_count as i64;
        let record = Record::new(
            relative_offset,
            timestamp_ms,
            key.map(<[u8]>::to_vec),
            value.map(<[u8]>::to_vec),
        );
        let frame = encode_record_frame(&record)
            .expect("record sized by has_room_for is always encodable");
        self.max_record_size = self.max_record_size.max(frame.len());
        self.buffer.extend_from_slice(&frame);
        self.record_count += 1;
        self.last_append_ms = now_ms;
        if let Some(callback) = callback.take() {
            self.thunks.push(Thunk {
                callback,
                relative_offset,
                timestamp_ms,
            });
        }
        true
    }

    /// Seal the batch: no further appends, buffer is effectively read-only.
    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn set_drained_ms(&mut self, now_ms: i64) {
        self.drained_ms = now_ms;
    }

    /// Mark a send retry: bump the attempt counter and refresh timestamps.
    pub(crate) fn reenqueued(&mut self, now_ms: i64) {
        self.attempts += 1;
        self.last_attempt_ms = now_ms;
        self.last_append_ms = now_ms;
        self.retry = true;
    }

    /// Fire every thunk with the broker-assigned base offset (or the
    /// error). Subsequent calls are no-ops.
    pub(crate) fn complete(&mut self, base_offset: i64, error: Option<ProducerError>) {
        if self.completed {
            return;
        }
        self.completed = true;
        for thunk in self.thunks.drain(..) {
            let result = match &error {
                None => Ok(RecordMetadata {
                    partition: self.partition.clone(),
                    offset: base_offset + thunk.relative_offset,
                    timestamp_ms: thunk.timestamp_ms,
                }),
                Some(err) => Err(err.clone()),
            };
            (thunk.callback)(result);
        }
    }

    /// A batch still waiting for send capacity should expire once the
    /// request timeout has elapsed past its readiness (or past its backoff
    /// window when retrying). Expiring seals the batch and fails its
    /// callbacks.
    pub(crate) fn maybe_expire(
        &mut self,
        request_timeout_ms: i64,
        retry_backoff_ms: i64,
        now_ms: i64,
        linger_ms: i64,
        is_full: bool,
    ) -> bool {
        let expired = (!self.retry
            && is_full
            && request_timeout_ms < now_ms - self.last_append_ms)
            || (!self.retry && request_timeout_ms < now_ms - (self.created_ms + linger_ms))
            || (self.retry
                && request_timeout_ms < now_ms - (self.last_attempt_ms + retry_backoff_ms));
        if expired {
            self.close();
            self.complete(
                -1,
                Some(ProducerError::BatchExpired {
                    partition: self.partition.clone(),
                    record_count: self.record_count,
                }),
            );
        }
        expired
    }

    /// Decode the batch contents (offsets relative to the batch start).
    pub fn records(&self) -> Result<Vec<Record>, StorageError> {
        let mut out = Vec::with_capacity(self.record_count);
        let mut at = 0;
        while at < self.buffer.len() {
            match decode_record_frame(&self.buffer[at..])? {
                Some((record, consumed)) => {
                    out.push(record);
                    at += consumed;
                }
                None => {
                    return Err(StorageError::InvalidRecord {
                        message: "truncated frame in producer batch".to_string(),
                    })
                }
            }
        }
        Ok(out)
    }

    /// Surrender the backing buffer for return to the pool.
    pub(crate) fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    use super::*;

    fn batch(write_limit: usize, capacity: usize) -> ProducerBatch {
        ProducerBatch::new(
            1,
            TopicPartition::new("t", 0),
            Vec::with_capacity(capacity),
            write_limit,
            1_000,
        )
    }

    fn append(batch: &mut ProducerBatch, key: &str, value: &str, now_ms: i64) -> bool {
        let mut callback: Option<Callback> = None;
        batch.try_append(
            2_000,
            Some(key.as_bytes()),
            Some(value.as_bytes()),
            &mut callback,
            now_ms,
        )
    }

    #[test]
    fn appends_until_write_limit() {
        let mut b = batch(100, 1024);
        assert!(append(&mut b, "k", "v", 1_000));
        assert_eq!(b.record_count(), 1);
        // 35-byte frames: the second fits under the 100-byte limit, the
        // third does not.
        assert!(append(&mut b, "k", "v", 1_001));
        assert!(!append(&mut b, "k", "v", 1_002));
        assert_eq!(b.record_count(), 2);
    }

    #[test]
    fn first_record_is_bounded_by_buffer_capacity_not_limit() {
        let mut b = batch(16, 1024);
        assert!(append(&mut b, "key", "a value larger than the write limit", 1_000));
        assert!(b.is_full());
    }

    #[test]
    fn closed_batch_rejects_appends() {
        let mut b = batch(1024, 1024);
        assert!(append(&mut b, "k", "v", 1_000));
        b.close();
        assert!(!append(&mut b, "k", "v", 1_001));
    }

    #[test]
    fn records_decode_with_relative_offsets() {
        let mut b = batch(1024, 1024);
        for i in 0..3 {
            assert!(append(&mut b, "k", &format!("v-{i}"), 1_000 + i));
        }
        let records = b.records().expect("decode");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].offset, 0);
        assert_eq!(records[2].offset, 2);
        assert_eq!(records[2].value, Some(b"v-2".to_vec()));
    }

    #[test]
    fn complete_fires_callbacks_exactly_once_with_absolute_offsets() {
        let mut b = batch(1024, 1024);
        let seen = Arc::new(AtomicI64::new(-1));
        let seen_cb = Arc::clone(&seen);
        let mut callback: Option<Callback> = Some(Box::new(move |result| {
            let metadata = result.expect("success");
            seen_cb.store(metadata.offset, Ordering::SeqCst);
        }));
        assert!(b.try_append(2_000, Some(b"k"), Some(b"v"), &mut callback, 1_000));
        assert!(callback.is_none(), "callback is consumed on success");

        b.complete(100, None);
        assert_eq!(seen.load(Ordering::SeqCst), 100);

        // A second completion must not re-fire the thunks.
        b.complete(999, None);
        assert_eq!(seen.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn expiry_rules_follow_retry_and_fullness() {
        // Fresh, full batch: expires once request timeout passes since the
        // last append.
        let mut full = batch(10, 64);
        assert!(append(&mut full, "k", "v", 1_000));
        assert!(full.is_full());
        assert!(!full.maybe_expire(500, 100, 1_400, 0, true));
        assert!(full.maybe_expire(500, 100, 1_600, 0, true));

        // Fresh, non-full batch: expires via created + linger.
        let mut lingering = batch(1024, 1024);
        assert!(append(&mut lingering, "k", "v", 1_000));
        assert!(!lingering.maybe_expire(500, 100, 1_550, 100, false));
        assert!(lingering.maybe_expire(500, 100, 1_601, 100, false));

        // Retrying batch: expires via last attempt + backoff.
        let mut retrying = batch(1024, 1024);
        assert!(append(&mut retrying, "k", "v", 1_000));
        retrying.reenqueued(2_000);
        assert!(!retrying.maybe_expire(500, 100, 2_600, 0, false));
        assert!(retrying.maybe_expire(500, 100, 2_601, 0, false));
    }

    #[test]
    fn expired_batch_fails_its_callbacks() {
        let mut b = batch(1024, 1024);
        let failed = Arc::new(AtomicI64::new(0));
        let failed_cb = Arc::clone(&failed);
        let mut callback: Option<Callback> = Some(Box::new(move |result| {
            assert!(matches!(result, Err(ProducerError::BatchExpired { .. })));
            failed_cb.store(1, Ordering::SeqCst);
        }));
        assert!(b.try_append(2_000, Some(b"k"), Some(b"v"), &mut callback, 1_000));

        assert!(b.maybe_expire(10, 0, 5_000, 0, false));
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(b.is_closed());
    }
}

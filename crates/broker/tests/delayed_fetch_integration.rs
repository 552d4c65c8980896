use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use kiln_broker::{
    DelayedFetch, FetchError, FetchMetadata, FetchPartitionStatus, FetchResponse,
    LocalReplicaManager, PartitionFetchInfo, Purgatory, ReplicaView,
};
use kiln_storage::{Log, LogConfig, TopicPartition};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

struct TempDir {
    path: PathBuf,
}

impl TempDir {
    fn new(label: &str) -> Self {
        let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be after unix epoch")
            .as_millis();
        let path = std::env::temp_dir().join(format!(
            "kiln-fetch-{label}-{millis}-{}-{counter}",
            std::process::id()
        ));
        fs::create_dir_all(&path).expect("create temp dir");
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn open_log(dir: &Path, tp: &TopicPartition, segment_max_bytes: u64) -> Arc<Mutex<Log>> {
    let log_dir = dir.join(format!("{}-{}", tp.topic, tp.partition));
    let config = LogConfig {
        segment_max_bytes,
        index_interval_bytes: 1,
        ..LogConfig::default()
    };
    Arc::new(Mutex::new(Log::open(log_dir, config).expect("open log")))
}

fn produce(log: &Arc<Mutex<Log>>, value: &[u8], count: usize) {
    let mut locked = log.lock().expect("log lock");
    for _ in 0..count {
        locked
            .append(Some(b"key".to_vec()), Some(value.to_vec()), 0)
            .expect("append");
    }
    let end = locked.log_end_offset();
    locked.set_high_watermark(end);
}

struct Harness {
    _temp: TempDir,
    tp: TopicPartition,
    log: Arc<Mutex<Log>>,
    replicas: Arc<LocalReplicaManager>,
    purgatory: Purgatory<TopicPartition>,
    responses: Arc<Mutex<Vec<FetchResponse>>>,
    fired: Arc<AtomicUsize>,
}

impl Harness {
    fn new(label: &str) -> Self {
        Self::with_segment_bytes(label, u64::MAX)
    }

    fn with_segment_bytes(label: &str, segment_max_bytes: u64) -> Self {
        let temp = TempDir::new(label);
        let tp = TopicPartition::new("t", 0);
        let log = open_log(temp.path(), &tp, segment_max_bytes);
        let replicas = Arc::new(LocalReplicaManager::new());
        replicas.register(tp.clone(), Arc::clone(&log), true);
        Self {
            _temp: temp,
            tp,
            log,
            replicas,
            purgatory: Purgatory::new(),
            responses: Arc::new(Mutex::new(Vec::new())),
            fired: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Build and register a fetch of `min_bytes` from the current end of
    /// the log with the given deadline. Returns whether it completed
    /// immediately.
    fn submit_fetch(&self, min_bytes: usize, max_bytes: usize, deadline_ms: i64) -> bool {
        let (start, fetch_offset) = {
            let log = self.log.lock().expect("log lock");
            let end = log.high_watermark();
            (log.offset_metadata(end).expect("offset metadata"), end)
        };
        let metadata = FetchMetadata {
            fetch_min_bytes: min_bytes,
            fetch_only_leader: true,
            fetch_only_committed: true,
            is_from_follower: false,
            partition_status: vec![(
                self.tp.clone(),
                FetchPartitionStatus {
                    start_offset_metadata: start,
                    fetch_info: PartitionFetchInfo {
                        fetch_offset,
                        max_bytes,
                    },
                },
            )],
        };
        let responses = Arc::clone(&self.responses);
        let fired = Arc::clone(&self.fired);
        let fetch = DelayedFetch::new(
            metadata,
            Arc::clone(&self.replicas) as Arc<dyn ReplicaView>,
            Box::new(move |response| {
                fired.fetch_add(1, Ordering::SeqCst);
                responses.lock().expect("responses lock").push(response);
            }),
        );
        self.purgatory
            .try_complete_else_watch(fetch, deadline_ms, &[self.tp.clone()])
    }
}

#[test]
fn fetch_completes_when_enough_bytes_arrive() {
    let harness = Harness::new("min-bytes");
    produce(&harness.log, b"seed", 1);

    assert!(!harness.submit_fetch(1024, 4096, 500));
    assert_eq!(harness.fired.load(Ordering::SeqCst), 0);

    // A small produce is not enough to satisfy min_bytes.
    produce(&harness.log, &[1_u8; 16], 1);
    assert_eq!(harness.purgatory.check_and_complete(&harness.tp), 0);

    // Crossing the byte threshold completes the fetch without waiting for
    // the deadline.
    produce(&harness.log, &[2_u8; 600], 2);
    assert_eq!(harness.purgatory.check_and_complete(&harness.tp), 1);
    assert_eq!(harness.fired.load(Ordering::SeqCst), 1);

    let responses = harness.responses.lock().expect("responses lock");
    let (partition, data) = &responses[0][0];
    assert_eq!(*partition, harness.tp);
    assert_eq!(data.error, None);
    assert_eq!(data.records.len(), 3);

    // The deadline passing later must not re-fire the callback.
    drop(responses);
    assert_eq!(harness.purgatory.poll_expired(10_000), 0);
    assert_eq!(harness.fired.load(Ordering::SeqCst), 1);
}

#[test]
fn fetch_times_out_with_whatever_is_available() {
    let harness = Harness::new("timeout");
    produce(&harness.log, b"seed", 1);

    assert!(!harness.submit_fetch(1024, 4096, 500));

    produce(&harness.log, &[3_u8; 8], 1);
    assert_eq!(harness.purgatory.check_and_complete(&harness.tp), 0);

    assert_eq!(harness.purgatory.poll_expired(499), 0);
    assert_eq!(harness.purgatory.poll_expired(500), 1);
    assert_eq!(harness.fired.load(Ordering::SeqCst), 1);

    let responses = harness.responses.lock().expect("responses lock");
    let (_, data) = &responses[0][0];
    assert_eq!(data.error, None);
    assert_eq!(data.records.len(), 1);
}

#[test]
fn fetch_satisfied_at_submit_completes_inline() {
    let harness = Harness::new("inline");
    produce(&harness.log, b"seed", 1);

    // Record the fetch position, then produce before submitting.
    let start = {
        let log = harness.log.lock().expect("log lock");
        log.offset_metadata(log.high_watermark()).expect("metadata")
    };
    produce(&harness.log, &[4_u8; 2048], 1);

    let metadata = FetchMetadata {
        fetch_min_bytes: 1024,
        fetch_only_leader: true,
        fetch_only_committed: true,
        is_from_follower: false,
        partition_status: vec![(
            harness.tp.clone(),
            FetchPartitionStatus {
                start_offset_metadata: start,
                fetch_info: PartitionFetchInfo {
                    fetch_offset: start.message_offset,
                    max_bytes: 4096,
                },
            },
        )],
    };
    let responses = Arc::clone(&harness.responses);
    let fired = Arc::clone(&harness.fired);
    let fetch = DelayedFetch::new(
        metadata,
        Arc::clone(&harness.replicas) as Arc<dyn ReplicaView>,
        Box::new(move |response| {
            fired.fetch_add(1, Ordering::SeqCst);
            responses.lock().expect("responses lock").push(response);
        }),
    );
    assert!(harness
        .purgatory
        .try_complete_else_watch(fetch, 500, &[harness.tp.clone()]));
    assert_eq!(harness.fired.load(Ordering::SeqCst), 1);
}

#[test]
fn losing_leadership_completes_with_the_error_attached() {
    let harness = Harness::new("not-leader");
    produce(&harness.log, b"seed", 1);

    assert!(!harness.submit_fetch(1024 * 1024, 4096, 500));

    assert!(harness.replicas.set_leader(&harness.tp, false));
    assert_eq!(harness.purgatory.check_and_complete(&harness.tp), 1);

    let responses = harness.responses.lock().expect("responses lock");
    let (_, data) = &responses[0][0];
    assert_eq!(data.error, Some(FetchError::NotLeaderForPartition));
    assert!(data.records.is_empty());
}

#[test]
fn unknown_partition_completes_with_the_error_attached() {
    let harness = Harness::new("unknown");
    produce(&harness.log, b"seed", 1);

    assert!(!harness.submit_fetch(1024 * 1024, 4096, 500));

    harness.replicas.remove(&harness.tp);
    assert_eq!(harness.purgatory.check_and_complete(&harness.tp), 1);

    let responses = harness.responses.lock().expect("responses lock");
    let (_, data) = &responses[0][0];
    assert_eq!(data.error, Some(FetchError::UnknownTopicOrPartition));
    assert!(data.records.is_empty());
}

#[test]
fn truncation_below_fetch_position_completes() {
    // Small segments so truncation drops whole segments and the log end
    // lands on an older segment than the fetch position.
    let harness = Harness::with_segment_bytes("truncation", 150);
    produce(&harness.log, &[5_u8; 64], 8);

    assert!(!harness.submit_fetch(1024 * 1024, 4096, 500));

    {
        let mut log = harness.log.lock().expect("log lock");
        log.truncate_to(2).expect("truncate");
    }
    assert_eq!(harness.purgatory.check_and_complete(&harness.tp), 1);

    let responses = harness.responses.lock().expect("responses lock");
    let (_, data) = &responses[0][0];
    assert_eq!(data.error, Some(FetchError::OffsetOutOfRange));
}

#[test]
fn concurrent_triggers_fire_the_callback_exactly_once() {
    let harness = Harness::new("exactly-once");
    produce(&harness.log, b"seed", 1);

    assert!(!harness.submit_fetch(64, 4096, 500));
    produce(&harness.log, &[6_u8; 256], 1);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                harness.purgatory.check_and_complete(&harness.tp);
                harness.purgatory.poll_expired(1_000);
            });
        }
    });
    assert_eq!(harness.fired.load(Ordering::SeqCst), 1);
    assert_eq!(harness.responses.lock().expect("responses lock").len(), 1);
}

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use kiln_storage::{Log, SegmentView, TopicPartition};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointFile;
use crate::CleanerError;

/// A log shared between its appender and the cleaner.
pub type SharedLog = Arc<Mutex<Log>>;

/// Per-partition cleaning state; a partition absent from the table is idle
/// and eligible for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleaningState {
    InProgress,
    Aborted,
    Paused,
}

/// One partition picked for a cleaning cycle, with the byte accounting that
/// ranked it.
#[derive(Debug, Clone)]
pub struct LogToClean {
    pub partition: TopicPartition,
    pub log: SharedLog,
    pub data_dir: PathBuf,
    pub first_dirty_offset: i64,
    pub clean_bytes: u64,
    pub dirty_bytes: u64,
}

impl LogToClean {
    pub fn cleanable_ratio(&self) -> f64 {
        let total = self.clean_bytes + self.dirty_bytes;
        if total == 0 {
            0.0
        } else {
            self.dirty_bytes as f64 / total as f64
        }
    }
}

#[derive(Debug)]
struct ManagedLog {
    log: SharedLog,
    data_dir: PathBuf,
    compact: bool,
}

#[derive(Debug, Default)]
struct ManagerInner {
    logs: HashMap<TopicPartition, ManagedLog>,
    state: HashMap<TopicPartition, CleaningState>,
}

/// Global coordinator for the cleaner threads: owns the per-partition state
/// table and the clean-offset checkpoint files, selects the next cleaning
/// target, and cooperates with external truncation through abort-and-pause.
///
/// Lock ordering: the manager's mutex is taken before any log's mutex,
/// never the other way around.
#[derive(Debug, Default)]
pub struct CleanerManager {
    inner: Mutex<ManagerInner>,
    paused: Condvar,
}

const ABORT_WAIT_SLICE: Duration = Duration::from_millis(100);

impl CleanerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a partition's log visible to the cleaner. `compact` marks the
    /// partition's retention policy; only compacted partitions are ever
    /// selected.
    pub fn register_log(
        &self,
        partition: TopicPartition,
        log: SharedLog,
        data_dir: &Path,
        compact: bool,
    ) {
        let mut inner = self.lock_inner();
        inner.logs.insert(
            partition,
            ManagedLog {
                log,
                data_dir: data_dir.to_path_buf(),
                compact,
            },
        );
    }

    /// Pick the dirtiest eligible partition, mark it in-progress, and hand
    /// it to the caller. Returns `None` when nothing reaches the ratio
    /// threshold.
    pub fn grab_filthiest(
        &self,
        min_cleanable_ratio: f64,
    ) -> Result<Option<LogToClean>, CleanerError> {
        let mut inner = self.lock_inner();

        let mut checkpoints_by_dir: HashMap<PathBuf, BTreeMap<TopicPartition, i64>> =
            HashMap::new();
        for managed in inner.logs.values() {
            if !checkpoints_by_dir.contains_key(&managed.data_dir) {
                let entries = CheckpointFile::for_data_dir(&managed.data_dir).read()?;
                checkpoints_by_dir.insert(managed.data_dir.clone(), entries);
            }
        }

        let mut filthiest: Option<LogToClean> = None;
        for (partition, managed) in &inner.logs {
            if !managed.compact || inner.state.contains_key(partition) {
                continue;
            }

            let (views, active_base, first_base) = {
                let log = managed.log.lock().expect("log lock poisoned");
                (
                    log.segment_views(),
                    log.active_segment().base_offset(),
                    log.first_segment_base_offset(),
                )
            };

            let checkpointed = checkpoints_by_dir
                .get(&managed.data_dir)
                .and_then(|entries| entries.get(partition).copied())
                .unwrap_or(first_base);
            // A checkpoint below the first segment means truncation dropped
            // the checkpointed prefix; restart from what is actually there.
            let first_dirty_offset = if checkpointed < first_base {
                debug!(
                    %partition,
                    checkpointed,
                    first_base,
                    "resetting checkpoint below first segment"
                );
                first_base
            } else {
                checkpointed
            };

            let (clean_bytes, dirty_bytes) = section_bytes(&views, first_dirty_offset, active_base);
            if dirty_bytes == 0 {
                continue;
            }

            let candidate = LogToClean {
                partition: partition.clone(),
                log: Arc::clone(&managed.log),
                data_dir: managed.data_dir.clone(),
                first_dirty_offset,
                clean_bytes,
                dirty_bytes,
            };
            if candidate.cleanable_ratio() < min_cleanable_ratio {
                continue;
            }
            let dirtier = filthiest
                .as_ref()
                .map_or(true, |best| candidate.cleanable_ratio() > best.cleanable_ratio());
            if dirtier {
                filthiest = Some(candidate);
            }
        }

        if let Some(choice) = &filthiest {
            inner
                .state
                .insert(choice.partition.clone(), CleaningState::InProgress);
            debug!(
                partition = %choice.partition,
                first_dirty_offset = choice.first_dirty_offset,
                ratio = choice.cleanable_ratio(),
                "selected log for cleaning"
            );
        }
        Ok(filthiest)
    }

    /// Abort any in-flight cleaning of the partition and park it in
    /// `Paused` until `resume_cleaning`. Blocks until the cleaner has
    /// acknowledged the abort.
    pub fn abort_and_pause_cleaning(&self, partition: &TopicPartition) -> Result<(), CleanerError> {
        let mut inner = self.lock_inner();
        match inner.state.get(partition) {
            None => {
                inner
                    .state
                    .insert(partition.clone(), CleaningState::Paused);
            }
            Some(CleaningState::InProgress) => {
                inner
                    .state
                    .insert(partition.clone(), CleaningState::Aborted);
            }
            Some(state) => {
                return Err(CleanerError::InvalidState {
                    partition: partition.clone(),
                    message: format!("cannot abort-and-pause from {state:?}"),
                });
            }
        }

        while inner.state.get(partition) != Some(&CleaningState::Paused) {
            let (guard, _timed_out) = self
                .paused
                .wait_timeout(inner, ABORT_WAIT_SLICE)
                .expect("cleaner manager lock poisoned");
            inner = guard;
        }
        info!(%partition, "cleaning aborted and paused");
        Ok(())
    }

    /// Abort-and-pause followed by resume: the entry point for log
    /// truncation, which only needs the cleaner out of the way momentarily.
    pub fn abort_cleaning(&self, partition: &TopicPartition) -> Result<(), CleanerError> {
        self.abort_and_pause_cleaning(partition)?;
        self.resume_cleaning(partition)
    }

    /// Lift a pause installed by `abort_and_pause_cleaning`.
    pub fn resume_cleaning(&self, partition: &TopicPartition) -> Result<(), CleanerError> {
        let mut inner = self.lock_inner();
        match inner.state.get(partition) {
            Some(CleaningState::Paused) => {
                inner.state.remove(partition);
                Ok(())
            }
            other => Err(CleanerError::InvalidState {
                partition: partition.clone(),
                message: format!("cannot resume from {other:?}"),
            }),
        }
    }

    /// Close out a cleaning cycle. In `InProgress` the checkpoint advances
    /// to `end_offset` and the partition returns to idle; in `Aborted` the
    /// partition parks in `Paused` and the abort waiter is signalled.
    pub fn done_cleaning(
        &self,
        partition: &TopicPartition,
        end_offset: i64,
    ) -> Result<(), CleanerError> {
        let mut inner = self.lock_inner();
        match inner.state.get(partition) {
            Some(CleaningState::InProgress) => {
                let data_dir = inner
                    .logs
                    .get(partition)
                    .map(|managed| managed.data_dir.clone())
                    .ok_or_else(|| CleanerError::InvalidState {
                        partition: partition.clone(),
                        message: "partition is not registered".to_string(),
                    })?;
                update_checkpoint(&data_dir, partition, end_offset)?;
                inner.state.remove(partition);
                Ok(())
            }
            Some(CleaningState::Aborted) => {
                inner
                    .state
                    .insert(partition.clone(), CleaningState::Paused);
                self.paused.notify_all();
                Ok(())
            }
            other => Err(CleanerError::InvalidState {
                partition: partition.clone(),
                message: format!("done_cleaning in unexpected state {other:?}"),
            }),
        }
    }

    /// Abandon a failed cycle without touching the checkpoint. An abort
    /// that raced the failure still lands in `Paused`.
    pub fn reset_cleaning(&self, partition: &TopicPartition) {
        let mut inner = self.lock_inner();
        match inner.state.get(partition) {
            Some(CleaningState::InProgress) => {
                inner.state.remove(partition);
            }
            Some(CleaningState::Aborted) => {
                inner
                    .state
                    .insert(partition.clone(), CleaningState::Paused);
                self.paused.notify_all();
            }
            _ => {}
        }
        warn!(%partition, "cleaning cycle abandoned");
    }

    /// The cleaner's abort checkpoint: fails unless the cycle is still the
    /// table's in-progress owner.
    pub fn check_cleaning_state(&self, partition: &TopicPartition) -> Result<(), CleanerError> {
        let inner = self.lock_inner();
        match inner.state.get(partition) {
            Some(CleaningState::InProgress) => Ok(()),
            _ => Err(CleanerError::CleaningAborted {
                partition: partition.clone(),
            }),
        }
    }

    pub fn cleaning_state(&self, partition: &TopicPartition) -> Option<CleaningState> {
        self.lock_inner().state.get(partition).copied()
    }

    /// All checkpointed first-dirty offsets for one data directory.
    pub fn checkpoints(
        &self,
        data_dir: &Path,
    ) -> Result<BTreeMap<TopicPartition, i64>, CleanerError> {
        let _inner = self.lock_inner();
        CheckpointFile::for_data_dir(data_dir).read()
    }

    fn lock_inner(&self) -> MutexGuard<'_, ManagerInner> {
        self.inner.lock().expect("cleaner manager lock poisoned")
    }
}

fn update_checkpoint(
    data_dir: &Path,
    partition: &TopicPartition,
    end_offset: i64,
) -> Result<(), CleanerError> {
    let checkpoint = CheckpointFile::for_data_dir(data_dir);
    let mut entries = checkpoint.read()?;
    entries.insert(partition.clone(), end_offset);
    checkpoint.write(&entries)
}

/// Byte totals of the already-clean prefix and the dirty suffix, at segment
/// granularity.
fn section_bytes(views: &[SegmentView], first_dirty_offset: i64, active_base: i64) -> (u64, u64) {
    let clean = views
        .iter()
        .filter(|view| view.next_offset <= first_dirty_offset)
        .map(|view| view.size)
        .sum();
    let dirty = views
        .iter()
        .filter(|view| view.base_offset >= first_dirty_offset && view.base_offset < active_base)
        .map(|view| view.size)
        .sum();
    (clean, dirty)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use kiln_storage::LogConfig;

    use super::*;

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
                "kiln-manager-{label}-{millis}-{}-{counter}",
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

    fn open_log(data_dir: &Path, tp: &TopicPartition) -> SharedLog {
        let dir = data_dir.join(format!("{}-{}", tp.topic, tp.partition));
        let config = LogConfig {
            segment_max_bytes: 120,
            index_interval_bytes: 1,
            ..LogConfig::default()
        };
        Arc::new(Mutex::new(Log::open(dir, config).expect("open log")))
    }

    fn fill(log: &SharedLog, keys: &[&str]) {
        let mut log = log.lock().expect("lock");
        for (i, key) in keys.iter().enumerate() {
            log.append(
                Some(key.as_bytes().to_vec()),
                Some(b"value".to_vec()),
                i as i64,
            )
            .expect("append");
        }
    }

    #[test]
    fn grab_filthiest_selects_partition_with_highest_dirty_ratio() {
        let temp = TempDir::new("filthiest");
        let manager = CleanerManager::new();

        let tp_small = TopicPartition::new("t", 0);
        let tp_large = TopicPartition::new("t", 1);
        let small = open_log(temp.path(), &tp_small);
        let large = open_log(temp.path(), &tp_large);
        fill(&small, &["a", "a", "a", "a"]);
        fill(&large, &["a", "b", "a", "b", "a", "b", "a", "b", "a", "b"]);

        manager.register_log(tp_small.clone(), Arc::clone(&small), temp.path(), true);
        manager.register_log(tp_large.clone(), Arc::clone(&large), temp.path(), true);

        let chosen = manager
            .grab_filthiest(0.0)
            .expect("grab")
            .expect("candidate");
        // Both are fully dirty (ratio 1.0); either is acceptable, and it
        // must be marked in-progress.
        assert_eq!(
            manager.cleaning_state(&chosen.partition),
            Some(CleaningState::InProgress)
        );

        // The in-progress partition is excluded from the next grab.
        let second = manager.grab_filthiest(0.0).expect("grab");
        if let Some(second) = second {
            assert_ne!(second.partition, chosen.partition);
        }
    }

    #[test]
    fn non_compact_partitions_are_never_selected() {
        let temp = TempDir::new("non-compact");
        let manager = CleanerManager::new();
        let tp = TopicPartition::new("t", 0);
        let log = open_log(temp.path(), &tp);
        fill(&log, &["a", "a", "a", "a", "a", "a"]);
        manager.register_log(tp, log, temp.path(), false);
        assert!(manager.grab_filthiest(0.0).expect("grab").is_none());
    }

    #[test]
    fn ratio_threshold_filters_candidates() {
        let temp = TempDir::new("threshold");
        let manager = CleanerManager::new();
        let tp = TopicPartition::new("t", 0);
        let log = open_log(temp.path(), &tp);
        fill(&log, &["a", "a", "a", "a", "a", "a"]);
        manager.register_log(tp.clone(), Arc::clone(&log), temp.path(), true);

        // Everything before the active segment is dirty, so a threshold
        // above 1.0 can never match.
        assert!(manager.grab_filthiest(1.1).expect("grab").is_none());
        assert_eq!(manager.cleaning_state(&tp), None);
    }

    #[test]
    fn pause_on_idle_partition_then_resume() {
        let temp = TempDir::new("pause-idle");
        let manager = CleanerManager::new();
        let tp = TopicPartition::new("t", 0);
        let log = open_log(temp.path(), &tp);
        fill(&log, &["a", "a", "a", "a", "a", "a"]);
        manager.register_log(tp.clone(), Arc::clone(&log), temp.path(), true);

        manager.abort_and_pause_cleaning(&tp).expect("pause");
        assert_eq!(manager.cleaning_state(&tp), Some(CleaningState::Paused));

        // Paused partitions are not selectable.
        assert!(manager.grab_filthiest(0.0).expect("grab").is_none());

        manager.resume_cleaning(&tp).expect("resume");
        assert_eq!(manager.cleaning_state(&tp), None);
    }

    #[test]
    fn abort_waits_for_cleaner_acknowledgement() {
        let temp = TempDir::new("abort-ack");
        let manager = Arc::new(CleanerManager::new());
        let tp = TopicPartition::new("t", 0);
        let log = open_log(temp.path(), &tp);
        fill(&log, &["a", "a", "a", "a", "a", "a"]);
        manager.register_log(tp.clone(), Arc::clone(&log), temp.path(), true);

        let grabbed = manager
            .grab_filthiest(0.0)
            .expect("grab")
            .expect("candidate");
        assert_eq!(grabbed.partition, tp);

        // A cleaner thread parks in Aborted → Paused via done_cleaning once
        // its next check_done fails.
        let ack_manager = Arc::clone(&manager);
        let ack_tp = tp.clone();
        let acker = std::thread::spawn(move || {
            loop {
                if ack_manager.check_cleaning_state(&ack_tp).is_err() {
                    ack_manager.done_cleaning(&ack_tp, 0).expect("done");
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        manager.abort_and_pause_cleaning(&tp).expect("abort");
        assert_eq!(manager.cleaning_state(&tp), Some(CleaningState::Paused));
        acker.join().expect("acker thread");

        manager.resume_cleaning(&tp).expect("resume");
    }

    #[test]
    fn done_cleaning_writes_the_checkpoint() {
        let temp = TempDir::new("checkpoint");
        let manager = CleanerManager::new();
        let tp = TopicPartition::new("t", 0);
        let log = open_log(temp.path(), &tp);
        fill(&log, &["a", "b", "a", "b", "a", "b"]);
        manager.register_log(tp.clone(), Arc::clone(&log), temp.path(), true);

        let grabbed = manager
            .grab_filthiest(0.0)
            .expect("grab")
            .expect("candidate");
        manager.done_cleaning(&tp, 4).expect("done");
        assert_eq!(manager.cleaning_state(&tp), None);
        assert!(grabbed.first_dirty_offset <= 4);

        let checkpoints = manager.checkpoints(temp.path()).expect("read");
        assert_eq!(checkpoints.get(&tp), Some(&4));

        // Dirty more of the log; the next grab starts from the checkpoint.
        fill(&log, &["c", "c", "c", "c"]);
        let again = manager
            .grab_filthiest(0.0)
            .expect("grab")
            .expect("candidate");
        assert_eq!(again.first_dirty_offset, 4);
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let temp = TempDir::new("invalid");
        let manager = CleanerManager::new();
        let tp = TopicPartition::new("t", 0);
        let log = open_log(temp.path(), &tp);
        manager.register_log(tp.clone(), log, temp.path(), true);

        let err = manager.resume_cleaning(&tp).expect_err("resume idle");
        assert!(matches!(err, CleanerError::InvalidState { .. }));

        let err = manager.done_cleaning(&tp, 0).expect_err("done while idle");
        assert!(matches!(err, CleanerError::InvalidState { .. }));
    }
}

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use kiln_storage::{StorageError, TopicPartition};
use tracing::{info, warn};

mod checkpoint;
mod cleaner;
mod manager;
mod metrics;
mod offset_map;
mod throttler;

pub use checkpoint::{CheckpointFile, CLEANER_CHECKPOINT_FILENAME};
pub use cleaner::Cleaner;
pub use manager::{CleanerManager, CleaningState, LogToClean, SharedLog};
pub use metrics::CleanerMetrics;
pub use offset_map::OffsetMap;
pub use throttler::Throttler;

#[derive(Debug, Clone, PartialEq)]
pub struct CleanerConfig {
    pub num_threads: usize,
    /// Total memory across all cleaner threads for offset maps.
    pub dedupe_buffer_size: usize,
    /// Fill cap before an offset map declares itself full.
    pub dedupe_buffer_load_factor: f64,
    pub io_buffer_size: usize,
    /// Hard cap on I/O buffer growth; a single record beyond this is fatal.
    pub max_io_buffer_size: usize,
    /// Global read throttle shared by all cleaner threads.
    pub max_io_bytes_per_second: f64,
    /// Sleep between selection passes when nothing is cleanable.
    pub backoff_ms: u64,
    pub min_cleanable_ratio: f64,
    /// How long tombstones survive after their region is cleaned.
    pub delete_retention_ms: i64,
    /// Data-size cap when grouping source segments into one cleaned segment.
    pub segment_max_bytes: u64,
    pub max_index_size: usize,
    pub index_interval_bytes: usize,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            num_threads: 1,
            dedupe_buffer_size: 128 * 1024 * 1024,
            dedupe_buffer_load_factor: 0.9,
            io_buffer_size: 512 * 1024,
            max_io_buffer_size: kiln_storage::MAX_FRAME_BYTES,
            max_io_bytes_per_second: f64::INFINITY,
            backoff_ms: 15_000,
            min_cleanable_ratio: 0.5,
            delete_retention_ms: 24 * 60 * 60 * 1000,
            segment_max_bytes: 1024 * 1024 * 1024,
            max_index_size: 1024 * 1024,
            index_interval_bytes: 4096,
        }
    }
}

impl CleanerConfig {
    fn validate(&self) -> Result<(), CleanerError> {
        if self.num_threads == 0 {
            return Err(CleanerError::InvalidConfiguration {
                message: "num_threads must be > 0".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.dedupe_buffer_load_factor)
            || self.dedupe_buffer_load_factor == 0.0
        {
            return Err(CleanerError::InvalidConfiguration {
                message: "dedupe_buffer_load_factor must be in (0, 1]".to_string(),
            });
        }
        if self.io_buffer_size == 0 || self.io_buffer_size > self.max_io_buffer_size {
            return Err(CleanerError::InvalidConfiguration {
                message: "io_buffer_size must be in (0, max_io_buffer_size]".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanerError {
    /// Cooperative cancellation: the manager aborted this partition's cycle.
    CleaningAborted { partition: TopicPartition },
    /// The cleaner thread is shutting down.
    ThreadShutdown,
    Storage(StorageError),
    /// The dedupe buffer cannot hold even one full segment of keys.
    BufferTooSmall {
        required_slots: usize,
        available_slots: usize,
    },
    /// A single record exceeds the maximum I/O buffer size.
    MessageTooLarge {
        partition: TopicPartition,
        position: u64,
        limit: usize,
    },
    /// A state-table transition that the caller should never attempt.
    InvalidState {
        partition: TopicPartition,
        message: String,
    },
    InvalidConfiguration {
        message: String,
    },
    CorruptCheckpoint {
        path: PathBuf,
        message: String,
    },
    Io {
        operation: &'static str,
        path: PathBuf,
        message: String,
    },
}

impl CleanerError {
    pub(crate) fn io(operation: &'static str, path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

impl From<StorageError> for CleanerError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

/// Byte and record accounting for one cleaning cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CleanerStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub records_read: u64,
    pub records_retained: u64,
    pub map_utilization: f64,
}

/// The cleaner subsystem: a manager, a shared throttler, metrics, and a pool
/// of background threads each running one cleaning cycle at a time.
pub struct LogCleaner {
    config: CleanerConfig,
    manager: Arc<CleanerManager>,
    throttler: Arc<Throttler>,
    metrics: Arc<CleanerMetrics>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl LogCleaner {
    pub fn new(config: CleanerConfig) -> Result<Self, CleanerError> {
        config.validate()?;
        let metrics = CleanerMetrics::new()
            .map_err(|message| CleanerError::InvalidConfiguration { message })?;
        Ok(Self {
            throttler: Arc::new(Throttler::new(config.max_io_bytes_per_second)),
            manager: Arc::new(CleanerManager::new()),
            metrics: Arc::new(metrics),
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
            config,
        })
    }

    pub fn manager(&self) -> &Arc<CleanerManager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<CleanerMetrics> {
        &self.metrics
    }

    pub fn register_log(
        &self,
        partition: TopicPartition,
        log: SharedLog,
        data_dir: &Path,
        compact: bool,
    ) {
        self.manager.register_log(partition, log, data_dir, compact);
    }

    /// Spawn the configured number of cleaner threads.
    pub fn start(&mut self) {
        for id in 0..self.config.num_threads {
            let mut cleaner = Cleaner::new(
                id,
                self.config.clone(),
                Arc::clone(&self.manager),
                Arc::clone(&self.throttler),
                Arc::clone(&self.shutdown),
            );
            let manager = Arc::clone(&self.manager);
            let metrics = Arc::clone(&self.metrics);
            let shutdown = Arc::clone(&self.shutdown);
            let min_ratio = self.config.min_cleanable_ratio;
            let backoff = Duration::from_millis(self.config.backoff_ms);
            let handle = std::thread::Builder::new()
                .name(format!("kiln-cleaner-{id}"))
                .spawn(move || {
                    run_cleaner_thread(&mut cleaner, &manager, &metrics, &shutdown, min_ratio, backoff)
                })
                .expect("spawn cleaner thread");
            self.handles.push(handle);
        }
        info!(threads = self.config.num_threads, "log cleaner started");
    }

    /// Stop the threads and wait for them to exit.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        info!("log cleaner stopped");
    }
}

impl Drop for LogCleaner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_cleaner_thread(
    cleaner: &mut Cleaner,
    manager: &CleanerManager,
    metrics: &CleanerMetrics,
    shutdown: &AtomicBool,
    min_cleanable_ratio: f64,
    backoff: Duration,
) {
    info!(cleaner = cleaner.id(), "cleaner thread running");
    while !shutdown.load(Ordering::Relaxed) {
        match manager.grab_filthiest(min_cleanable_ratio) {
            Ok(Some(to_clean)) => {
                let partition = to_clean.partition.clone();
                match cleaner.clean(&to_clean) {
                    Ok((end_offset, stats)) => {
                        metrics.record_cycle("completed");
                        metrics.record_stats(&stats);
                        if let Err(err) = manager.done_cleaning(&partition, end_offset) {
                            warn!(%partition, ?err, "failed to record cleaning completion");
                        }
                    }
                    Err(CleanerError::CleaningAborted { .. }) => {
                        metrics.record_cycle("aborted");
                        if let Err(err) = manager.done_cleaning(&partition, 0) {
                            warn!(%partition, ?err, "failed to park aborted partition");
                        }
                    }
                    Err(CleanerError::ThreadShutdown) => {
                        manager.reset_cleaning(&partition);
                        break;
                    }
                    Err(err) => {
                        metrics.record_cycle("failed");
                        warn!(%partition, ?err, "cleaning cycle failed");
                        manager.reset_cleaning(&partition);
                    }
                }
            }
            Ok(None) => backoff_sleep(shutdown, backoff),
            Err(err) => {
                warn!(?err, "failed to select a log to clean");
                backoff_sleep(shutdown, backoff);
            }
        }
    }
    info!(cleaner = cleaner.id(), "cleaner thread exiting");
}

/// Sleep in short slices so shutdown stays responsive.
fn backoff_sleep(shutdown: &AtomicBool, backoff: Duration) {
    let slice = Duration::from_millis(50);
    let mut remaining = backoff;
    while !shutdown.load(Ordering::Relaxed) && remaining > Duration::ZERO {
        let nap = slice.min(remaining);
        std::thread::sleep(nap);
        remaining -= nap;
    }
}

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiln_storage::{
    compress_records, decode_record_frame, decompress_records, encode_record_frame, LogSegment,
    Record, SegmentConfig, SegmentReader, SegmentView, TopicPartition, CLEANED_FILE_SUFFIX,
};
use tracing::{debug, info};

use crate::manager::{CleanerManager, LogToClean};
use crate::offset_map::OffsetMap;
use crate::throttler::Throttler;
use crate::{CleanerConfig, CleanerError, CleanerStats};

/// One cleaner thread's compaction engine: an offset map plus a pair of
/// reusable I/O buffers, grown on demand and restored after each cycle.
#[derive(Debug)]
pub struct Cleaner {
    id: usize,
    config: CleanerConfig,
    manager: Arc<CleanerManager>,
    throttler: Arc<Throttler>,
    shutdown: Arc<AtomicBool>,
    offset_map: OffsetMap,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
}

impl Cleaner {
    pub fn new(
        id: usize,
        config: CleanerConfig,
        manager: Arc<CleanerManager>,
        throttler: Arc<Throttler>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let offset_map = OffsetMap::new(
            config.dedupe_buffer_size / config.num_threads.max(1),
            config.dedupe_buffer_load_factor,
        );
        let read_buffer = vec![0; config.io_buffer_size];
        let write_buffer = Vec::with_capacity(config.io_buffer_size);
        Self {
            id,
            config,
            manager,
            throttler,
            shutdown,
            offset_map,
            read_buffer,
            write_buffer,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run one full cleaning cycle over the chosen log.
    ///
    /// Returns the exclusive upper bound of the region that is now clean;
    /// the caller records it as the partition's new first dirty offset.
    pub fn clean(&mut self, to_clean: &LogToClean) -> Result<(i64, CleanerStats), CleanerError> {
        let mut stats = CleanerStats::default();
        let partition = to_clean.partition.clone();

        let (views, active_base, log_dir) = {
            let log = to_clean.log.lock().expect("log lock poisoned");
            (
                log.segment_views(),
                log.active_segment().base_offset(),
                log.dir().to_path_buf(),
            )
        };

        let first_dirty = to_clean.first_dirty_offset;
        let dirty: Vec<SegmentView> = views
            .iter()
            .filter(|view| view.base_offset >= first_dirty && view.base_offset < active_base)
            .cloned()
            .collect();
        if dirty.is_empty() {
            return Ok((first_dirty, stats));
        }

        info!(
            cleaner = self.id,
            %partition,
            first_dirty,
            upper_bound = active_base,
            "beginning cleaning cycle"
        );

        // Build the key → last-offset map over the dirty suffix.
        let end_offset = self.build_offset_map(&partition, &dirty)?;
        stats.map_utilization = self.offset_map.utilization();

        // Tombstones survive while any segment in the clean prefix is newer
        // than the horizon.
        let delete_horizon_ms = views
            .iter()
            .filter(|view| view.next_offset <= first_dirty)
            .map(|view| view.last_modified_ms)
            .max()
            .map_or(0, |newest| newest - self.config.delete_retention_ms);
        debug!(
            cleaner = self.id,
            %partition,
            end_offset,
            delete_horizon_ms,
            "offset map built"
        );

        // Group everything below the end offset so each rewritten segment
        // respects the size, index, and relative-offset bounds.
        let cleanable: Vec<SegmentView> = views
            .iter()
            .filter(|view| view.base_offset < end_offset)
            .cloned()
            .collect();
        let groups = group_segments_by_size(
            &cleanable,
            self.config.segment_max_bytes,
            self.config.max_index_size as u64,
        );

        let result: Result<(), CleanerError> = groups.iter().try_for_each(|group| {
            self.clean_segments(to_clean, &log_dir, group, delete_horizon_ms, &mut stats)
        });
        self.restore_buffers();
        result?;

        info!(
            cleaner = self.id,
            %partition,
            end_offset,
            records_read = stats.records_read,
            records_retained = stats.records_retained,
            bytes_read = stats.bytes_read,
            bytes_written = stats.bytes_written,
            "cleaning cycle complete"
        );
        Ok((end_offset, stats))
    }

    /// Index every keyed record in the dirty segments. Stops early when the
    /// map reaches its load cap; at least one full segment must fit.
    fn build_offset_map(
        &mut self,
        partition: &TopicPartition,
        dirty: &[SegmentView],
    ) -> Result<i64, CleanerError> {
        self.offset_map.clear();
        let mut end_offset = dirty[0].base_offset;
        let mut indexed_any = false;
        for view in dirty {
            if !self.index_segment(partition, view)? {
                break;
            }
            end_offset = view.next_offset;
            indexed_any = true;
        }
        if !indexed_any {
            return Err(CleanerError::BufferTooSmall {
                required_slots: self.offset_map.size() + 1,
                available_slots: self.offset_map.slots(),
            });
        }
        Ok(end_offset)
    }

    /// Returns true when the whole segment fit into the offset map.
    fn index_segment(
        &mut self,
        partition: &TopicPartition,
        view: &SegmentView,
    ) -> Result<bool, CleanerError> {
        let reader = SegmentReader::open(&view.log_path)?;
        let mut position = 0_u64;
        while position < reader.len() {
            self.check_done(partition)?;
            let read = reader.read_at(position, &mut self.read_buffer)?;
            if read == 0 {
                break;
            }
            self.throttler.maybe_throttle(read as u64);

            let mut consumed = 0_usize;
            while consumed < read {
                let Some((record, frame_len)) =
                    decode_record_frame(&self.read_buffer[consumed..read])?
                else {
                    break;
                };
                if record.is_compressed() {
                    for inner in decompress_records(&record)? {
                        if let Some(key) = &inner.key {
                            if !self.offset_map.try_put(key, inner.offset) {
                                return Ok(false);
                            }
                        }
                    }
                } else if let Some(key) = &record.key {
                    if !self.offset_map.try_put(key, record.offset) {
                        return Ok(false);
                    }
                }
                consumed += frame_len;
            }

            if consumed == 0 {
                self.grow_buffers(partition, &view.log_path, position, read)?;
                continue;
            }
            position += consumed as u64;
        }
        Ok(true)
    }

    /// Rewrite one group of segments into a `.cleaned` replacement and swap
    /// it into the log.
    fn clean_segments(
        &mut self,
        to_clean: &LogToClean,
        log_dir: &std::path::Path,
        group: &[SegmentView],
        delete_horizon_ms: i64,
        stats: &mut CleanerStats,
    ) -> Result<(), CleanerError> {
        let first = group.first().expect("groups are never empty");
        let last = group.last().expect("groups are never empty");

        remove_stale_artifacts(log_dir, first.base_offset)?;
        let mut dest = LogSegment::create_with_suffix(
            log_dir,
            first.base_offset,
            CLEANED_FILE_SUFFIX,
            SegmentConfig {
                max_index_size: self.config.max_index_size,
                index_interval_bytes: self.config.index_interval_bytes,
            },
        )?;

        let outcome = self.clean_group_into(to_clean, group, &mut dest, delete_horizon_ms, stats);
        if let Err(err) = outcome {
            // Leave nothing half-built behind; the swap never began.
            let _ = dest.delete_files();
            return Err(err);
        }

        dest.set_last_modified_ms(last.last_modified_ms);
        dest.seal()?;

        let old_bases: Vec<i64> = group.iter().map(|view| view.base_offset).collect();
        {
            let mut log = to_clean.log.lock().expect("log lock poisoned");
            log.replace_segments(dest, &old_bases)?;
        }
        debug!(
            cleaner = self.id,
            partition = %to_clean.partition,
            base_offset = first.base_offset,
            sources = old_bases.len(),
            "cleaned segment group"
        );
        Ok(())
    }

    fn clean_group_into(
        &mut self,
        to_clean: &LogToClean,
        group: &[SegmentView],
        dest: &mut LogSegment,
        delete_horizon_ms: i64,
        stats: &mut CleanerStats,
    ) -> Result<(), CleanerError> {
        for view in group {
            let retain_deletes = view.last_modified_ms > delete_horizon_ms;
            self.clean_into(to_clean, view, dest, retain_deletes, stats)?;
        }
        Ok(())
    }

    /// Copy the retained records of one source segment into `dest`.
    fn clean_into(
        &mut self,
        to_clean: &LogToClean,
        source: &SegmentView,
        dest: &mut LogSegment,
        retain_deletes: bool,
        stats: &mut CleanerStats,
    ) -> Result<(), CleanerError> {
        let partition = &to_clean.partition;
        let reader = SegmentReader::open(&source.log_path)?;
        let mut position = 0_u64;

        while position < reader.len() {
            self.check_done(partition)?;
            let read = reader.read_at(position, &mut self.read_buffer)?;
            if read == 0 {
                break;
            }
            self.throttler.maybe_throttle(read as u64);
            stats.bytes_read += read as u64;

            self.write_buffer.clear();
            let mut consumed = 0_usize;
            while consumed < read {
                let Some((record, frame_len)) =
                    decode_record_frame(&self.read_buffer[consumed..read])?
                else {
                    break;
                };
                let frame = &self.read_buffer[consumed..consumed + frame_len];
                retain_into(
                    &self.offset_map,
                    &record,
                    frame,
                    retain_deletes,
                    &mut self.write_buffer,
                    stats,
                )?;
                consumed += frame_len;
            }

            if consumed == 0 {
                self.grow_buffers(partition, &source.log_path, position, read)?;
                continue;
            }

            // Flush the retained frames of this pass into the new segment.
            let mut at = 0_usize;
            while at < self.write_buffer.len() {
                let (record, frame_len) = decode_record_frame(&self.write_buffer[at..])?
                    .expect("write buffer holds only complete frames");
                dest.append_raw(
                    record.offset,
                    record.timestamp_ms,
                    &self.write_buffer[at..at + frame_len],
                )?;
                at += frame_len;
            }
            stats.bytes_written += self.write_buffer.len() as u64;
            position += consumed as u64;
        }
        Ok(())
    }

    fn check_done(&self, partition: &TopicPartition) -> Result<(), CleanerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(CleanerError::ThreadShutdown);
        }
        self.manager.check_cleaning_state(partition)
    }

    /// Double the I/O buffers after a read that held no complete frame.
    fn grow_buffers(
        &mut self,
        partition: &TopicPartition,
        path: &std::path::Path,
        position: u64,
        read: usize,
    ) -> Result<(), CleanerError> {
        if read < self.read_buffer.len() {
            // The file ended inside a frame; sealed segments cannot be torn.
            return Err(CleanerError::Storage(kiln_storage::StorageError::CorruptData {
                path: path.to_path_buf(),
                position,
                message: "truncated frame in sealed segment".to_string(),
            }));
        }
        if self.read_buffer.len() >= self.config.max_io_buffer_size {
            return Err(CleanerError::MessageTooLarge {
                partition: partition.clone(),
                position,
                limit: self.config.max_io_buffer_size,
            });
        }
        let new_size = (self.read_buffer.len() * 2).min(self.config.max_io_buffer_size);
        debug!(cleaner = self.id, new_size, "growing cleaner I/O buffers");
        self.read_buffer.resize(new_size, 0);
        self.write_buffer.reserve(new_size.saturating_sub(self.write_buffer.capacity()));
        Ok(())
    }

    /// Shrink the buffers back to their configured size after a cycle.
    fn restore_buffers(&mut self) {
        if self.read_buffer.len() != self.config.io_buffer_size {
            self.read_buffer = vec![0; self.config.io_buffer_size];
        }
        if self.write_buffer.capacity() > self.config.io_buffer_size {
            self.write_buffer = Vec::with_capacity(self.config.io_buffer_size);
        }
    }
}

/// Decide whether `record` survives compaction and, if so, write its frame
/// into `out`. Wrapper records are re-emitted with only their retained inner
/// records, preserving the codec; a wrapper whose inner records all survive
/// is copied byte-exact.
fn retain_into(
    map: &OffsetMap,
    record: &Record,
    frame: &[u8],
    retain_deletes: bool,
    out: &mut Vec<u8>,
    stats: &mut CleanerStats,
) -> Result<(), CleanerError> {
    if !record.is_compressed() {
        stats.records_read += 1;
        if should_retain(map, retain_deletes, record) {
            out.extend_from_slice(frame);
            stats.records_retained += 1;
        }
        return Ok(());
    }

    let inner = decompress_records(record)?;
    stats.records_read += inner.len() as u64;
    let retained: Vec<Record> = inner
        .iter()
        .filter(|inner_record| should_retain(map, retain_deletes, inner_record))
        .cloned()
        .collect();

    if retained.len() == inner.len() {
        out.extend_from_slice(frame);
    } else if !retained.is_empty() {
        let wrapper = compress_records(&retained, record.compression)?;
        let new_frame = encode_record_frame(&wrapper)?;
        out.extend_from_slice(&new_frame);
    }
    stats.records_retained += retained.len() as u64;
    Ok(())
}

/// A record survives iff it has a key, no later record for that key exists,
/// and it is not an expired tombstone.
fn should_retain(map: &OffsetMap, retain_deletes: bool, record: &Record) -> bool {
    let Some(key) = &record.key else {
        return false;
    };
    let superseded = map
        .get(key)
        .is_some_and(|latest| latest > record.offset);
    if superseded {
        return false;
    }
    !(record.is_tombstone() && !retain_deletes)
}

/// Partition the cleanable segments into contiguous groups bounded by data
/// size, index size, and the 32-bit relative-offset span.
fn group_segments_by_size(
    views: &[SegmentView],
    max_size: u64,
    max_index_size: u64,
) -> Vec<Vec<SegmentView>> {
    let mut groups = Vec::new();
    let mut current: Vec<SegmentView> = Vec::new();
    let mut size = 0_u64;
    let mut index_size = 0_u64;

    for view in views {
        let span_overflow = current.first().is_some_and(|first| {
            view.next_offset - 1 - first.base_offset > i64::from(u32::MAX)
        });
        if !current.is_empty()
            && (size + view.size > max_size
                || index_size + view.index_size > max_index_size
                || span_overflow)
        {
            groups.push(std::mem::take(&mut current));
            size = 0;
            index_size = 0;
        }
        size += view.size;
        index_size += view.index_size;
        current.push(view.clone());
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

fn remove_stale_artifacts(log_dir: &std::path::Path, base_offset: i64) -> Result<(), CleanerError> {
    for name in [
        format!("{}{}", kiln_storage::log_filename(base_offset), CLEANED_FILE_SUFFIX),
        format!("{}{}", kiln_storage::index_filename(base_offset), CLEANED_FILE_SUFFIX),
    ] {
        let path: PathBuf = log_dir.join(name);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|err| CleanerError::io("remove_file", &path, err))?;
        }
    }
    Ok(())
}

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::record::{Compression, Record};
use crate::segment::{
    LogSegment, SegmentConfig, SegmentView, CLEANED_FILE_SUFFIX, LOG_FILE_SUFFIX, SWAP_FILE_SUFFIX,
};
use crate::StorageError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub base_offset: i64,
    /// Roll the active segment once its data file reaches this size.
    pub segment_max_bytes: u64,
    pub max_index_size: usize,
    pub index_interval_bytes: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            base_offset: 0,
            segment_max_bytes: 256 * 1024 * 1024,
            max_index_size: 1024 * 1024,
            index_interval_bytes: 4096,
        }
    }
}

impl LogConfig {
    fn segment_config(&self) -> SegmentConfig {
        SegmentConfig {
            max_index_size: self.max_index_size,
            index_interval_bytes: self.index_interval_bytes,
        }
    }
}

/// Position of an offset within a log: the segment holding it and the byte
/// position of its frame inside that segment's data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOffsetMetadata {
    pub message_offset: i64,
    pub segment_base_offset: i64,
    pub relative_position: u32,
}

impl LogOffsetMetadata {
    pub const UNKNOWN: Self = Self {
        message_offset: -1,
        segment_base_offset: -1,
        relative_position: 0,
    };

    pub fn is_unknown(&self) -> bool {
        self.segment_base_offset < 0
    }

    /// True when this offset sits on a segment that precedes `other`'s.
    pub fn on_older_segment(&self, other: &Self) -> bool {
        self.segment_base_offset < other.segment_base_offset
    }

    pub fn on_same_segment(&self, other: &Self) -> bool {
        self.segment_base_offset == other.segment_base_offset
    }

    /// Byte distance to `other` on the same segment.
    pub fn position_diff(&self, other: &Self) -> u64 {
        u64::from(self.relative_position.saturating_sub(other.relative_position))
    }
}

/// An append-only log of segments. The final (active) segment receives all
/// appends; older segments are immutable and may be replaced wholesale by
/// the cleaner through `replace_segments`.
#[derive(Debug)]
pub struct Log {
    dir: PathBuf,
    config: LogConfig,
    segments: BTreeMap<i64, LogSegment>,
    high_watermark: i64,
}

impl Log {
    /// Open (or create) the log at `dir`.
    ///
    /// Recovery of interrupted cleaner swaps happens here, before segments
    /// load: a `.swap` file's original is evicted and the suffix stripped
    /// (the swap had committed), while `.cleaned` orphans are deleted (the
    /// swap had not begun).
    pub fn open<P: AsRef<Path>>(dir: P, config: LogConfig) -> Result<Self, StorageError> {
        if config.segment_max_bytes == 0 {
            return Err(StorageError::InvalidConfiguration {
                message: "segment_max_bytes must be > 0".to_string(),
            });
        }
        if config.base_offset < 0 {
            return Err(StorageError::InvalidConfiguration {
                message: "base_offset must be >= 0".to_string(),
            });
        }

        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|err| StorageError::io("create_dir_all", &dir, err))?;

        recover_swap_artifacts(&dir)?;

        let mut base_offsets = collect_log_base_offsets(&dir)?;
        base_offsets.sort_unstable();
        base_offsets.dedup();

        let mut segments = BTreeMap::new();
        if base_offsets.is_empty() {
            let segment = LogSegment::create(&dir, config.base_offset, config.segment_config())?;
            segments.insert(config.base_offset, segment);
        } else {
            for base_offset in base_offsets {
                let segment = LogSegment::open(&dir, base_offset, config.segment_config())?;
                segments.insert(base_offset, segment);
            }
        }

        let mut log = Self {
            dir,
            config,
            segments,
            high_watermark: 0,
        };
        log.high_watermark = log.log_end_offset();
        Ok(log)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(
        &mut self,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
        timestamp_ms: i64,
    ) -> Result<i64, StorageError> {
        let record = Record {
            offset: self.log_end_offset(),
            timestamp_ms,
            key,
            value,
            compression: Compression::None,
        };
        self.append_record(record)
    }

    pub fn append_record(&mut self, record: Record) -> Result<i64, StorageError> {
        self.maybe_roll(record.frame_len() as u64, record.offset)?;
        let offset = record.offset;
        self.active_segment_mut().append(&record)?;
        Ok(offset)
    }

    pub fn active_segment(&self) -> &LogSegment {
        self.segments
            .values()
            .next_back()
            .expect("log always has at least one segment")
    }

    fn active_segment_mut(&mut self) -> &mut LogSegment {
        self.segments
            .values_mut()
            .next_back()
            .expect("log always has at least one segment")
    }

    /// One past the last appended offset.
    pub fn log_end_offset(&self) -> i64 {
        self.active_segment().next_offset()
    }

    pub fn first_segment_base_offset(&self) -> i64 {
        *self
            .segments
            .keys()
            .next()
            .expect("log always has at least one segment")
    }

    pub fn high_watermark(&self) -> i64 {
        self.high_watermark
    }

    /// Advance (or rewind, after truncation) the committed watermark.
    pub fn set_high_watermark(&mut self, offset: i64) {
        self.high_watermark = offset.clamp(self.first_segment_base_offset(), self.log_end_offset());
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Total data bytes across all segments.
    pub fn size(&self) -> u64 {
        self.segments.values().map(LogSegment::size).sum()
    }

    pub fn segment_views(&self) -> Vec<SegmentView> {
        self.segments.values().map(LogSegment::view).collect()
    }

    /// Force a new active segment rooted at the current end offset.
    pub fn roll(&mut self) -> Result<i64, StorageError> {
        let new_base = self.log_end_offset();
        if self.segments.contains_key(&new_base) {
            return Ok(new_base);
        }
        self.active_segment().seal()?;
        let segment = LogSegment::create(&self.dir, new_base, self.config.segment_config())?;
        self.segments.insert(new_base, segment);
        Ok(new_base)
    }

    fn maybe_roll(&mut self, incoming_bytes: u64, offset: i64) -> Result<(), StorageError> {
        let active = self.active_segment();
        let over_size =
            !active.is_empty() && active.size() + incoming_bytes > self.config.segment_max_bytes;
        // Relative offsets within a segment must fit in 32 bits.
        let offset_overflow = offset - active.base_offset() > i64::from(u32::MAX);
        if over_size || offset_overflow {
            self.roll()?;
        }
        Ok(())
    }

    /// Read records starting at `offset`, bounded by `max_bytes` of frame
    /// data (always at least one record when any is available).
    pub fn read(&self, offset: i64, max_bytes: usize) -> Result<Vec<Record>, StorageError> {
        let earliest = self.first_segment_base_offset();
        let end = self.log_end_offset();
        if offset < earliest || offset > end {
            return Err(StorageError::OffsetOutOfRange {
                requested: offset,
                earliest,
                latest: end - 1,
            });
        }
        if offset == end || max_bytes == 0 {
            return Ok(Vec::new());
        }

        let floor = self
            .segments
            .range(..=offset)
            .next_back()
            .map_or(earliest, |(base, _)| *base);

        let mut out = Vec::new();
        let mut bytes_so_far = 0_usize;
        let mut wanted = offset;
        for segment in self.segments.range(floor..).map(|(_, segment)| segment) {
            if bytes_so_far >= max_bytes {
                break;
            }
            if segment.next_offset() <= wanted {
                continue;
            }
            let records = segment.read(wanted, max_bytes - bytes_so_far)?;
            for record in records {
                bytes_so_far += record.frame_len();
                wanted = record.offset + 1;
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Locate `offset` within the log. The end offset maps to the active
    /// segment's current size.
    pub fn offset_metadata(&self, offset: i64) -> Result<LogOffsetMetadata, StorageError> {
        let earliest = self.first_segment_base_offset();
        let end = self.log_end_offset();
        if offset < earliest || offset > end {
            return Err(StorageError::OffsetOutOfRange {
                requested: offset,
                earliest,
                latest: end - 1,
            });
        }
        if offset == end {
            let active = self.active_segment();
            return Ok(LogOffsetMetadata {
                message_offset: offset,
                segment_base_offset: active.base_offset(),
                relative_position: u32::try_from(active.size()).unwrap_or(u32::MAX),
            });
        }

        let floor = self
            .segments
            .range(..=offset)
            .next_back()
            .map_or(earliest, |(base, _)| *base);
        for (base, segment) in self.segments.range(floor..) {
            if let Some(position) = segment.position_of(offset)? {
                return Ok(LogOffsetMetadata {
                    message_offset: offset,
                    segment_base_offset: *base,
                    relative_position: position,
                });
            }
        }
        Err(StorageError::OffsetOutOfRange {
            requested: offset,
            earliest,
            latest: end - 1,
        })
    }

    /// Install a cleaned segment in place of the source segments it was
    /// rebuilt from.
    ///
    /// The crash-safe sequence: rename `.cleaned` to `.swap`, install the
    /// new segment in the map, delete the sources, then strip the `.swap`
    /// suffix. `open()` completes or discards interrupted swaps.
    pub fn replace_segments(
        &mut self,
        mut new_segment: LogSegment,
        old_bases: &[i64],
    ) -> Result<(), StorageError> {
        new_segment.change_file_suffixes(CLEANED_FILE_SUFFIX, SWAP_FILE_SUFFIX)?;

        let new_base = new_segment.base_offset();
        let mut evicted = Vec::new();
        if let Some(displaced) = self.segments.insert(new_base, new_segment) {
            evicted.push(displaced);
        }
        for base in old_bases {
            if *base == new_base {
                continue;
            }
            if let Some(old) = self.segments.remove(base) {
                evicted.push(old);
            }
        }
        for segment in evicted {
            segment.delete_files()?;
        }

        let installed = self
            .segments
            .get_mut(&new_base)
            .expect("segment inserted above");
        installed.change_file_suffixes(SWAP_FILE_SUFFIX, "")?;
        info!(
            dir = %self.dir.display(),
            base_offset = new_base,
            replaced = old_bases.len(),
            "installed cleaned segment"
        );
        Ok(())
    }

    /// Drop all records at or above `offset`.
    pub fn truncate_to(&mut self, offset: i64) -> Result<(), StorageError> {
        if offset <= self.first_segment_base_offset() {
            return self.truncate_fully_and_start_at(offset.max(0));
        }

        let doomed: Vec<i64> = self
            .segments
            .range(offset..)
            .map(|(base, _)| *base)
            .collect();
        for base in &doomed {
            if let Some(segment) = self.segments.remove(base) {
                segment.delete_files()?;
            }
        }
        self.active_segment_mut().truncate_to(offset)?;
        self.high_watermark = self.high_watermark.min(offset);
        Ok(())
    }

    /// Discard everything and restart the log at `new_base`.
    pub fn truncate_fully_and_start_at(&mut self, new_base: i64) -> Result<(), StorageError> {
        warn!(
            dir = %self.dir.display(),
            new_base,
            "truncating log fully"
        );
        let old = std::mem::take(&mut self.segments);
        for (_, segment) in old {
            segment.delete_files()?;
        }
        let segment = LogSegment::create(&self.dir, new_base, self.config.segment_config())?;
        self.segments.insert(new_base, segment);
        self.high_watermark = new_base;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        for segment in self.segments.values() {
            segment.flush()?;
        }
        Ok(())
    }
}

fn collect_log_base_offsets(dir: &Path) -> Result<Vec<i64>, StorageError> {
    let mut offsets = Vec::new();
    let entries = fs::read_dir(dir).map_err(|err| StorageError::io("read_dir", dir, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| StorageError::io("read_dir_entry", dir, err))?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(prefix) = name.strip_suffix(LOG_FILE_SUFFIX) else {
            continue;
        };
        let Ok(base_offset) = prefix.parse::<i64>() else {
            continue;
        };
        offsets.push(base_offset);
    }
    Ok(offsets)
}

fn recover_swap_artifacts(dir: &Path) -> Result<(), StorageError> {
    let entries = fs::read_dir(dir).map_err(|err| StorageError::io("read_dir", dir, err))?;
    let mut swaps = Vec::new();
    let mut cleaned = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| StorageError::io("read_dir_entry", dir, err))?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if name.ends_with(SWAP_FILE_SUFFIX) {
            swaps.push(path);
        } else if name.ends_with(CLEANED_FILE_SUFFIX) {
            cleaned.push(path);
        }
    }

    // A .swap file means the install had committed: evict the original and
    // finish the rename.
    for swap_path in swaps {
        let name = swap_path
            .file_name()
            .and_then(|name| name.to_str())
            .expect("matched utf-8 suffix above");
        let original = swap_path.with_file_name(
            name.strip_suffix(SWAP_FILE_SUFFIX)
                .expect("matched suffix above"),
        );
        if original.exists() {
            fs::remove_file(&original)
                .map_err(|err| StorageError::io("remove_file", &original, err))?;
        }
        fs::rename(&swap_path, &original)
            .map_err(|err| StorageError::io("rename", &swap_path, err))?;
        info!(file = %original.display(), "completed interrupted segment swap");
    }

    // A .cleaned file means the swap never began: the artifact is garbage.
    for cleaned_path in cleaned {
        fs::remove_file(&cleaned_path)
            .map_err(|err| StorageError::io("remove_file", &cleaned_path, err))?;
        warn!(file = %cleaned_path.display(), "discarded orphaned cleaner artifact");
    }
    Ok(())
}

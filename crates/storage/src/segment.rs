use std::fs::{self, File, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::offset_index::OffsetIndex;
use crate::record::{
    decode_record_frame, encode_record_frame, Record, FRAME_HEADER_BYTES, MAX_FRAME_BYTES,
    RECORD_HEADER_BYTES,
};
use crate::StorageError;

pub const LOG_FILE_SUFFIX: &str = ".log";
pub const INDEX_FILE_SUFFIX: &str = ".index";
/// Suffix for segment files being rebuilt by the cleaner.
pub const CLEANED_FILE_SUFFIX: &str = ".cleaned";
/// Suffix for rebuilt segment files whose install has begun.
pub const SWAP_FILE_SUFFIX: &str = ".swap";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Preallocated size of each segment's offset index file.
    pub max_index_size: usize,
    /// Appended bytes between consecutive index entries.
    pub index_interval_bytes: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_index_size: 1024 * 1024,
            index_interval_bytes: 4096,
        }
    }
}

pub fn log_filename(base_offset: i64) -> String {
    format!("{base_offset:020}{LOG_FILE_SUFFIX}")
}

pub fn index_filename(base_offset: i64) -> String {
    format!("{base_offset:020}{INDEX_FILE_SUFFIX}")
}

/// A read-only snapshot of one segment's identity, taken under the log lock
/// so the cleaner can work from immutable files without holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentView {
    pub base_offset: i64,
    pub next_offset: i64,
    pub size: u64,
    pub index_size: u64,
    pub last_modified_ms: i64,
    pub log_path: PathBuf,
}

/// One segment of a log: a `.log` data file of record frames plus a sparse
/// `.index` offset index. Offsets within a segment are strictly increasing
/// but need not be contiguous (compaction leaves gaps).
#[derive(Debug)]
pub struct LogSegment {
    base_offset: i64,
    log_path: PathBuf,
    log_file: File,
    log_len: u64,
    index: OffsetIndex,
    next_offset: i64,
    last_modified_ms: i64,
    bytes_since_last_index_entry: usize,
    config: SegmentConfig,
}

impl LogSegment {
    /// Create a brand-new segment in `dir`; fails if its files exist.
    pub fn create(dir: &Path, base_offset: i64, config: SegmentConfig) -> Result<Self, StorageError> {
        Self::create_with_suffix(dir, base_offset, "", config)
    }

    /// Create a new segment whose file names carry `suffix` (e.g. `.cleaned`
    /// for a compaction artifact).
    pub fn create_with_suffix(
        dir: &Path,
        base_offset: i64,
        suffix: &str,
        config: SegmentConfig,
    ) -> Result<Self, StorageError> {
        let log_path = dir.join(format!("{}{suffix}", log_filename(base_offset)));
        let index_path = dir.join(format!("{}{suffix}", index_filename(base_offset)));

        let log_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(&log_path)
            .map_err(|err| StorageError::io("create_new", &log_path, err))?;
        let index = OffsetIndex::open(&index_path, base_offset, config.max_index_size)?;

        Ok(Self {
            base_offset,
            log_path,
            log_file,
            log_len: 0,
            index,
            next_offset: base_offset,
            last_modified_ms: 0,
            bytes_since_last_index_entry: 0,
            config,
        })
    }

    /// Open an existing segment, scanning the data file to validate frames,
    /// truncate any torn tail, and rebuild the offset index.
    pub fn open(dir: &Path, base_offset: i64, config: SegmentConfig) -> Result<Self, StorageError> {
        let log_path = dir.join(log_filename(base_offset));
        let index_path = dir.join(index_filename(base_offset));

        let mut log_file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)
            .map_err(|err| StorageError::io("open", &log_path, err))?;

        // The index is rebuilt from the data scan, so any stale or corrupt
        // index file is simply discarded.
        if index_path.exists() {
            fs::remove_file(&index_path)
                .map_err(|err| StorageError::io("remove_file", &index_path, err))?;
        }
        let index = OffsetIndex::open(&index_path, base_offset, config.max_index_size)?;

        let file_len = log_file
            .metadata()
            .map_err(|err| StorageError::io("metadata", &log_path, err))?
            .len();

        let mut position: u64 = 0;
        let mut last_offset = base_offset - 1;
        let mut next_offset = base_offset;
        let mut last_modified_ms = 0;
        let mut bytes_since_last_index_entry = 0_usize;

        while position < file_len {
            let Some((record, frame_len)) = read_frame_lenient(&log_file, &log_path, position, file_len)?
            else {
                // Torn or corrupt tail: drop everything from here on.
                truncate_to_valid_tail(&mut log_file, &log_path, position)?;
                break;
            };

            if record.offset <= last_offset {
                return Err(StorageError::CorruptData {
                    path: log_path.clone(),
                    position,
                    message: format!(
                        "non-monotonic offset {}, previous was {last_offset}",
                        record.offset
                    ),
                });
            }
            if record.offset < base_offset {
                return Err(StorageError::CorruptData {
                    path: log_path.clone(),
                    position,
                    message: format!(
                        "offset {} below segment base {base_offset}",
                        record.offset
                    ),
                });
            }

            if bytes_since_last_index_entry > config.index_interval_bytes {
                index.append(record.offset, position_as_u32(&log_path, position)?)?;
                bytes_since_last_index_entry = 0;
            }

            last_offset = record.offset;
            next_offset = record.offset + 1;
            last_modified_ms = last_modified_ms.max(record.timestamp_ms);
            bytes_since_last_index_entry += frame_len;
            position += frame_len as u64;
        }

        let log_len = position.min(file_len);
        Ok(Self {
            base_offset,
            log_path,
            log_file,
            log_len,
            index,
            next_offset,
            last_modified_ms,
            bytes_since_last_index_entry,
            config,
        })
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    /// One past the largest appended offset, or the base offset when empty.
    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    pub fn size(&self) -> u64 {
        self.log_len
    }

    pub fn is_empty(&self) -> bool {
        self.log_len == 0
    }

    /// Watermark used for retention decisions: the largest record timestamp
    /// appended to this segment (restored by the recovery scan on open).
    pub fn last_modified_ms(&self) -> i64 {
        self.last_modified_ms
    }

    pub fn set_last_modified_ms(&mut self, last_modified_ms: i64) {
        self.last_modified_ms = last_modified_ms;
    }

    pub fn index(&self) -> &OffsetIndex {
        &self.index
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn view(&self) -> SegmentView {
        SegmentView {
            base_offset: self.base_offset,
            next_offset: self.next_offset,
            size: self.log_len,
            index_size: (self.index.entries() * crate::offset_index::INDEX_ENTRY_BYTES) as u64,
            last_modified_ms: self.last_modified_ms,
            log_path: self.log_path.clone(),
        }
    }

    /// Append a record. Offsets must be strictly increasing within the
    /// segment and the delta from the base offset must fit in 32 bits.
    pub fn append(&mut self, record: &Record) -> Result<(), StorageError> {
        let frame = encode_record_frame(record)?;
        self.append_raw(record.offset, record.timestamp_ms, &frame)
    }

    /// Append an already-encoded frame byte-exactly. Used by the cleaner to
    /// carry retained frames over without re-encoding them.
    pub fn append_raw(
        &mut self,
        offset: i64,
        timestamp_ms: i64,
        frame: &[u8],
    ) -> Result<(), StorageError> {
        if self.next_offset > self.base_offset && offset < self.next_offset {
            return Err(StorageError::InvalidOffset {
                appended: offset,
                last_offset: self.next_offset - 1,
            });
        }
        let relative = offset - self.base_offset;
        if !(0..=i64::from(u32::MAX)).contains(&relative) {
            return Err(StorageError::InvalidOffset {
                appended: offset,
                last_offset: self.next_offset - 1,
            });
        }

        if self.bytes_since_last_index_entry > self.config.index_interval_bytes {
            self.index
                .append(offset, position_as_u32(&self.log_path, self.log_len)?)?;
            self.bytes_since_last_index_entry = 0;
        }

        self.log_file
            .write_all(frame)
            .map_err(|err| StorageError::io("write_all", &self.log_path, err))?;

        self.log_len += frame.len() as u64;
        self.bytes_since_last_index_entry += frame.len();
        self.next_offset = offset + 1;
        self.last_modified_ms = self.last_modified_ms.max(timestamp_ms);
        Ok(())
    }

    /// Read records starting at `start_offset`, stopping once `max_bytes` of
    /// frame data has been consumed. Always returns at least one record when
    /// any is available, even if that record alone exceeds `max_bytes`.
    pub fn read(&self, start_offset: i64, max_bytes: usize) -> Result<Vec<Record>, StorageError> {
        let mut out = Vec::new();
        let mut position = u64::from(self.index.lookup(start_offset).position);
        let mut bytes_so_far = 0_usize;

        while position < self.log_len {
            let (record, frame_len) = read_record_at(&self.log_file, &self.log_path, position)?;
            position += frame_len as u64;
            if record.offset < start_offset {
                continue;
            }
            bytes_so_far += frame_len;
            out.push(record);
            if bytes_so_far >= max_bytes {
                break;
            }
        }
        Ok(out)
    }

    /// File position of the first frame holding `offset` (or a later one),
    /// or `None` when the segment ends first.
    pub fn position_of(&self, offset: i64) -> Result<Option<u32>, StorageError> {
        let mut position = u64::from(self.index.lookup(offset).position);
        while position < self.log_len {
            let (record, frame_len) = read_record_at(&self.log_file, &self.log_path, position)?;
            if record.offset >= offset {
                return Ok(Some(position_as_u32(&self.log_path, position)?));
            }
            position += frame_len as u64;
        }
        Ok(None)
    }

    /// Drop all records with `record.offset >= offset`.
    pub fn truncate_to(&mut self, offset: i64) -> Result<(), StorageError> {
        let Some(position) = self.position_of(offset)? else {
            return Ok(());
        };
        let position = u64::from(position);
        self.log_file
            .set_len(position)
            .map_err(|err| StorageError::io("set_len", &self.log_path, err))?;
        self.log_len = position;
        self.next_offset = offset.max(self.base_offset);
        self.index.truncate_to(offset);
        self.bytes_since_last_index_entry = 0;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.log_file
            .sync_data()
            .map_err(|err| StorageError::io("sync_data", &self.log_path, err))?;
        self.index.flush()
    }

    /// Trim the index to its valid entries and flush both files; call before
    /// sealing or installing the segment.
    pub fn seal(&self) -> Result<(), StorageError> {
        self.index.close()?;
        self.log_file
            .sync_data()
            .map_err(|err| StorageError::io("sync_data", &self.log_path, err))
    }

    /// Rename both files, swapping `old_suffix` for `new_suffix` (either may
    /// be empty). Open handles stay valid across the rename.
    pub fn change_file_suffixes(
        &mut self,
        old_suffix: &str,
        new_suffix: &str,
    ) -> Result<(), StorageError> {
        let new_log = replace_suffix(&self.log_path, old_suffix, new_suffix)?;
        fs::rename(&self.log_path, &new_log)
            .map_err(|err| StorageError::io("rename", &self.log_path, err))?;
        self.log_path = new_log;

        let index_path = self.index.path();
        let new_index = replace_suffix(&index_path, old_suffix, new_suffix)?;
        self.index.rename_to(&new_index)
    }

    /// Remove both backing files.
    pub fn delete_files(self) -> Result<(), StorageError> {
        fs::remove_file(&self.log_path)
            .map_err(|err| StorageError::io("remove_file", &self.log_path, err))?;
        self.index.delete()
    }
}

/// Read-only access to a segment data file by path; the cleaner reads sealed
/// segments through this without holding the log lock.
#[derive(Debug)]
pub struct SegmentReader {
    path: PathBuf,
    file: File,
    len: u64,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let file = File::open(path).map_err(|err| StorageError::io("open", path, err))?;
        let len = file
            .metadata()
            .map_err(|err| StorageError::io("metadata", path, err))?
            .len();
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Fill as much of `buf` as the file allows starting at `position`;
    /// returns the number of bytes read (0 at end of file).
    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let available = self.len.saturating_sub(position);
        let want = (buf.len() as u64).min(available) as usize;
        if want == 0 {
            return Ok(0);
        }
        pread_exact(&self.file, &self.path, position, &mut buf[..want])?;
        Ok(want)
    }
}

fn replace_suffix(path: &Path, old: &str, new: &str) -> Result<PathBuf, StorageError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| StorageError::InvalidConfiguration {
            message: format!("segment path {} has no utf-8 file name", path.display()),
        })?;
    let stem = name
        .strip_suffix(old)
        .ok_or_else(|| StorageError::InvalidConfiguration {
            message: format!("file name {name} does not end with suffix {old:?}"),
        })?;
    Ok(path.with_file_name(format!("{stem}{new}")))
}

fn position_as_u32(path: &Path, position: u64) -> Result<u32, StorageError> {
    u32::try_from(position).map_err(|_| StorageError::CorruptData {
        path: path.to_path_buf(),
        position,
        message: "segment position exceeds 32 bits".to_string(),
    })
}

fn truncate_to_valid_tail(file: &mut File, path: &Path, len: u64) -> Result<(), StorageError> {
    file.set_len(len)
        .map_err(|err| StorageError::io("set_len", path, err))?;
    file.sync_data()
        .map_err(|err| StorageError::io("sync_data", path, err))?;
    Ok(())
}

// Uses pread(2) via FileExt::read_exact_at — reads at an arbitrary offset
// without touching the file cursor, so `&File` suffices.
#[cfg(unix)]
fn pread_exact(file: &File, path: &Path, position: u64, buf: &mut [u8]) -> Result<(), StorageError> {
    file.read_exact_at(buf, position)
        .map_err(|err| StorageError::io("read_exact_at", path, err))
}

#[cfg(not(unix))]
fn pread_exact(file: &File, path: &Path, position: u64, buf: &mut [u8]) -> Result<(), StorageError> {
    use std::io::{Read, Seek, SeekFrom};
    let mut clone = file
        .try_clone()
        .map_err(|err| StorageError::io("try_clone", path, err))?;
    clone
        .seek(SeekFrom::Start(position))
        .map_err(|err| StorageError::io("seek", path, err))?;
    clone
        .read_exact(buf)
        .map_err(|err| StorageError::io("read_exact", path, err))
}

/// Strict frame read for steady-state paths: corruption is an error.
fn read_record_at(file: &File, path: &Path, position: u64) -> Result<(Record, usize), StorageError> {
    let mut frame_header = [0_u8; FRAME_HEADER_BYTES];
    pread_exact(file, path, position, &mut frame_header)?;

    let payload_len = u32::from_be_bytes(
        frame_header[..4]
            .try_into()
            .expect("frame_len header is exactly 4 bytes"),
    ) as usize;
    if !(RECORD_HEADER_BYTES..=MAX_FRAME_BYTES).contains(&payload_len) {
        return Err(StorageError::CorruptData {
            path: path.to_path_buf(),
            position,
            message: format!("invalid frame length {payload_len}"),
        });
    }

    let mut frame = vec![0_u8; FRAME_HEADER_BYTES + payload_len];
    frame[..FRAME_HEADER_BYTES].copy_from_slice(&frame_header);
    pread_exact(
        file,
        path,
        position + FRAME_HEADER_BYTES as u64,
        &mut frame[FRAME_HEADER_BYTES..],
    )?;

    match decode_record_frame(&frame) {
        Ok(Some((record, consumed))) => Ok((record, consumed)),
        Ok(None) => Err(StorageError::CorruptData {
            path: path.to_path_buf(),
            position,
            message: "frame shorter than its declared length".to_string(),
        }),
        Err(err) => Err(err.with_location(path, position)),
    }
}

/// Lenient frame read for recovery: any torn or corrupt frame reads as
/// `None`, signalling the caller to truncate from `position`.
fn read_frame_lenient(
    file: &File,
    path: &Path,
    position: u64,
    file_len: u64,
) -> Result<Option<(Record, usize)>, StorageError> {
    if position + FRAME_HEADER_BYTES as u64 > file_len {
        return Ok(None);
    }
    let mut frame_header = [0_u8; FRAME_HEADER_BYTES];
    pread_exact(file, path, position, &mut frame_header)?;

    let payload_len = u32::from_be_bytes(
        frame_header[..4]
            .try_into()
            .expect("frame_len header is exactly 4 bytes"),
    ) as usize;
    if !(RECORD_HEADER_BYTES..=MAX_FRAME_BYTES).contains(&payload_len) {
        return Ok(None);
    }
    let frame_total = FRAME_HEADER_BYTES as u64 + payload_len as u64;
    if position + frame_total > file_len {
        return Ok(None);
    }

    let mut frame = vec![0_u8; FRAME_HEADER_BYTES + payload_len];
    frame[..FRAME_HEADER_BYTES].copy_from_slice(&frame_header);
    pread_exact(
        file,
        path,
        position + FRAME_HEADER_BYTES as u64,
        &mut frame[FRAME_HEADER_BYTES..],
    )?;

    match decode_record_frame(&frame) {
        Ok(Some((record, consumed))) => Ok(Some((record, consumed))),
        Ok(None) | Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

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
                "kiln-segment-{label}-{millis}-{}-{counter}",
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

    fn small_config() -> SegmentConfig {
        SegmentConfig {
            max_index_size: 1024,
            index_interval_bytes: 1,
        }
    }

    fn record(offset: i64, key: &str, value: &str) -> Record {
        Record::new(
            offset,
            1_000 + offset,
            Some(key.as_bytes().to_vec()),
            Some(value.as_bytes().to_vec()),
        )
    }

    #[test]
    fn append_and_read_back() {
        let temp = TempDir::new("append-read");
        let mut segment = LogSegment::create(temp.path(), 0, small_config()).expect("create");
        for i in 0..5 {
            segment.append(&record(i, "k", &format!("v-{i}"))).expect("append");
        }
        assert_eq!(segment.next_offset(), 5);

        let all = segment.read(0, usize::MAX).expect("read");
        assert_eq!(all.len(), 5);
        assert_eq!(all[4].value, Some(b"v-4".to_vec()));

        let tail = segment.read(3, usize::MAX).expect("read tail");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].offset, 3);
    }

    #[test]
    fn read_returns_at_least_one_record_over_budget() {
        let temp = TempDir::new("read-budget");
        let mut segment = LogSegment::create(temp.path(), 0, small_config()).expect("create");
        segment.append(&record(0, "k", "a-large-value")).expect("append");
        segment.append(&record(1, "k", "another")).expect("append");

        let out = segment.read(0, 1).expect("read");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].offset, 0);
    }

    #[test]
    fn append_rejects_regressing_offsets() {
        let temp = TempDir::new("regress");
        let mut segment = LogSegment::create(temp.path(), 10, small_config()).expect("create");
        segment.append(&record(10, "k", "v")).expect("append");
        let err = segment.append(&record(10, "k", "v")).expect_err("regression");
        assert!(matches!(err, StorageError::InvalidOffset { .. }));
    }

    #[test]
    fn offsets_may_have_gaps_within_a_segment() {
        let temp = TempDir::new("gaps");
        let mut segment = LogSegment::create(temp.path(), 0, small_config()).expect("create");
        segment.append(&record(1, "b", "1")).expect("append");
        segment.append(&record(5, "a", "2")).expect("append");
        segment.append(&record(9, "c", "3")).expect("append");

        let from_three = segment.read(3, usize::MAX).expect("read");
        assert_eq!(from_three.len(), 2);
        assert_eq!(from_three[0].offset, 5);
    }

    #[test]
    fn reopen_recovers_state_and_truncates_torn_tail() {
        let temp = TempDir::new("recover");
        {
            let mut segment = LogSegment::create(temp.path(), 0, small_config()).expect("create");
            for i in 0..3 {
                segment.append(&record(i, "k", "v")).expect("append");
            }
            segment.flush().expect("flush");

            let mut file = OpenOptions::new()
                .append(true)
                .open(segment.log_path())
                .expect("open for torn write");
            file.write_all(&[0xAB, 0xCD, 0xEF]).expect("torn bytes");
        }

        let reopened = LogSegment::open(temp.path(), 0, small_config()).expect("reopen");
        assert_eq!(reopened.next_offset(), 3);
        assert_eq!(reopened.last_modified_ms(), 1_002);
        let records = reopened.read(0, usize::MAX).expect("read");
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn truncate_to_drops_suffix() {
        let temp = TempDir::new("truncate");
        let mut segment = LogSegment::create(temp.path(), 0, small_config()).expect("create");
        for i in 0..6 {
            segment.append(&record(i, "k", "v")).expect("append");
        }
        segment.truncate_to(4).expect("truncate");
        assert_eq!(segment.next_offset(), 4);
        let records = segment.read(0, usize::MAX).expect("read");
        assert_eq!(records.len(), 4);
        assert_eq!(records.last().expect("non-empty").offset, 3);
    }

    #[test]
    fn suffix_rename_cycle_matches_swap_protocol() {
        let temp = TempDir::new("suffixes");
        let mut segment =
            LogSegment::create_with_suffix(temp.path(), 0, CLEANED_FILE_SUFFIX, small_config())
                .expect("create cleaned");
        segment.append(&record(0, "k", "v")).expect("append");
        segment.seal().expect("seal");

        segment
            .change_file_suffixes(CLEANED_FILE_SUFFIX, SWAP_FILE_SUFFIX)
            .expect("cleaned to swap");
        assert!(temp.path().join("00000000000000000000.log.swap").exists());

        segment
            .change_file_suffixes(SWAP_FILE_SUFFIX, "")
            .expect("swap to live");
        assert!(temp.path().join("00000000000000000000.log").exists());

        let records = segment.read(0, usize::MAX).expect("read after renames");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn segment_reader_reads_in_chunks() {
        let temp = TempDir::new("reader");
        let mut segment = LogSegment::create(temp.path(), 0, small_config()).expect("create");
        for i in 0..4 {
            segment.append(&record(i, "key", "value")).expect("append");
        }
        segment.flush().expect("flush");

        let reader = SegmentReader::open(segment.log_path()).expect("open reader");
        assert_eq!(reader.len(), segment.size());

        let mut buf = vec![0_u8; 16];
        let mut position = 0_u64;
        let mut total = 0_u64;
        loop {
            let read = reader.read_at(position, &mut buf).expect("read_at");
            if read == 0 {
                break;
            }
            position += read as u64;
            total += read as u64;
        }
        assert_eq!(total, reader.len());
    }
}

use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::mapped::MappedRegion;
use crate::StorageError;

/// Each entry packs `u32 relative_offset || u32 file_position`, big-endian.
pub const INDEX_ENTRY_BYTES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub offset: i64,
    pub position: u32,
}

/// A sparse, memory-mapped index from logical offsets to byte positions in a
/// segment file.
///
/// Entries are strictly increasing in both fields; `lookup` answers "the
/// greatest indexed offset at or below the target" with a binary search over
/// the packed region. Mutations and lookups share one `RwLock`: lookups take
/// it shared, and `resize` (unmap, change length, remap) takes it exclusive,
/// which keeps the remap sound on every platform.
#[derive(Debug)]
pub struct OffsetIndex {
    base_offset: i64,
    inner: RwLock<IndexInner>,
}

#[derive(Debug)]
struct IndexInner {
    region: MappedRegion,
    max_entries: usize,
    entries: usize,
    last_offset: i64,
}

impl OffsetIndex {
    /// Open (or create) the index file at `path`.
    ///
    /// A new file is preallocated to `max_index_size` rounded down to a whole
    /// number of entries; an existing file keeps its length and is assumed to
    /// have been trimmed to valid size when it was sealed.
    pub fn open(path: &Path, base_offset: i64, max_index_size: usize) -> Result<Self, StorageError> {
        let existed = path.exists();
        let len = if existed {
            std::fs::metadata(path)
                .map_err(|err| StorageError::io("metadata", path, err))?
                .len()
        } else {
            round_down_to_entry(max_index_size.max(INDEX_ENTRY_BYTES)) as u64
        };

        let region = MappedRegion::open(path, len)?;
        let max_entries = region.len() / INDEX_ENTRY_BYTES;
        let entries = if existed { max_entries } else { 0 };
        let last_offset = if entries > 0 {
            base_offset + i64::from(relative_offset_at(region.as_slice(), entries - 1))
        } else {
            base_offset
        };

        Ok(Self {
            base_offset,
            inner: RwLock::new(IndexInner {
                region,
                max_entries,
                entries,
                last_offset,
            }),
        })
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub fn entries(&self) -> usize {
        self.read_inner().entries
    }

    pub fn is_full(&self) -> bool {
        let inner = self.read_inner();
        inner.entries >= inner.max_entries
    }

    /// The last indexed offset, or the base offset when the index is empty.
    pub fn last_offset(&self) -> i64 {
        self.read_inner().last_offset
    }

    pub fn entry(&self, slot: usize) -> Option<IndexEntry> {
        let inner = self.read_inner();
        (slot < inner.entries).then(|| entry_at(inner.region.as_slice(), self.base_offset, slot))
    }

    /// Append an entry. The offset must be greater than the last indexed
    /// offset and its delta from the base offset must fit in 32 bits.
    pub fn append(&self, offset: i64, position: u32) -> Result<(), StorageError> {
        let mut inner = self.write_inner();
        if inner.entries >= inner.max_entries {
            return Err(StorageError::IndexFull {
                path: inner.region.path().to_path_buf(),
                entries: inner.entries,
            });
        }
        if inner.entries > 0 && offset <= inner.last_offset {
            return Err(StorageError::InvalidOffset {
                appended: offset,
                last_offset: inner.last_offset,
            });
        }
        let relative = offset - self.base_offset;
        if !(0..=i64::from(u32::MAX)).contains(&relative) {
            return Err(StorageError::InvalidOffset {
                appended: offset,
                last_offset: inner.last_offset,
            });
        }

        let at = inner.entries * INDEX_ENTRY_BYTES;
        let buf = inner.region.as_mut_slice();
        buf[at..at + 4].copy_from_slice(&(relative as u32).to_be_bytes());
        buf[at + 4..at + 8].copy_from_slice(&position.to_be_bytes());
        inner.entries += 1;
        inner.last_offset = offset;
        Ok(())
    }

    /// The greatest entry with `entry.offset <= target_offset`, or
    /// `(base_offset, 0)` when the index is empty or the target precedes the
    /// first entry.
    pub fn lookup(&self, target_offset: i64) -> IndexEntry {
        let inner = self.read_inner();
        match slot_of_last_leq(inner.region.as_slice(), inner.entries, self.base_offset, target_offset)
        {
            Some(slot) => entry_at(inner.region.as_slice(), self.base_offset, slot),
            None => IndexEntry {
                offset: self.base_offset,
                position: 0,
            },
        }
    }

    /// Remove all entries with `entry.offset >= offset`.
    pub fn truncate_to(&self, offset: i64) {
        let mut inner = self.write_inner();
        let kept = match slot_of_last_leq(
            inner.region.as_slice(),
            inner.entries,
            self.base_offset,
            offset - 1,
        ) {
            Some(slot) => slot + 1,
            None => 0,
        };
        inner.entries = kept;
        inner.last_offset = if kept > 0 {
            self.base_offset + i64::from(relative_offset_at(inner.region.as_slice(), kept - 1))
        } else {
            self.base_offset
        };
    }

    /// Remove every entry.
    pub fn truncate(&self) {
        let mut inner = self.write_inner();
        inner.entries = 0;
        inner.last_offset = self.base_offset;
    }

    /// Shrink the backing file to exactly the valid entries.
    pub fn trim_to_valid_size(&self) -> Result<(), StorageError> {
        let mut inner = self.write_inner();
        let new_len = inner.entries * INDEX_ENTRY_BYTES;
        inner.region.resize(new_len as u64)?;
        inner.max_entries = inner.entries;
        Ok(())
    }

    /// Change the backing file size, keeping existing entries that still fit.
    pub fn resize(&self, new_size: usize) -> Result<(), StorageError> {
        let mut inner = self.write_inner();
        let rounded = round_down_to_entry(new_size);
        inner.region.resize(rounded as u64)?;
        inner.max_entries = rounded / INDEX_ENTRY_BYTES;
        if inner.entries > inner.max_entries {
            inner.entries = inner.max_entries;
            inner.last_offset = if inner.entries > 0 {
                self.base_offset
                    + i64::from(relative_offset_at(inner.region.as_slice(), inner.entries - 1))
            } else {
                self.base_offset
            };
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.read_inner().region.flush()
    }

    /// Trim to valid size and flush; call before sealing a segment.
    pub fn close(&self) -> Result<(), StorageError> {
        self.trim_to_valid_size()?;
        self.flush()
    }

    pub fn rename_to(&self, new_path: &Path) -> Result<(), StorageError> {
        self.write_inner().region.rename_to(new_path)
    }

    pub fn path(&self) -> PathBuf {
        self.read_inner().region.path().to_path_buf()
    }

    pub fn delete(self) -> Result<(), StorageError> {
        let inner = self
            .inner
            .into_inner()
            .expect("offset index lock poisoned");
        inner.region.delete()
    }

    /// Verify the structural invariants of the backing file.
    pub fn sanity_check(&self) -> Result<(), StorageError> {
        let inner = self.read_inner();
        let path = inner.region.path().to_path_buf();
        if inner.region.len() % INDEX_ENTRY_BYTES != 0 {
            return Err(StorageError::CorruptIndex {
                path,
                message: format!(
                    "index file length {} is not a multiple of {INDEX_ENTRY_BYTES}",
                    inner.region.len()
                ),
            });
        }
        if inner.entries > 0 && inner.last_offset <= self.base_offset {
            return Err(StorageError::CorruptIndex {
                path,
                message: format!(
                    "last offset {} is not larger than base offset {}",
                    inner.last_offset, self.base_offset
                ),
            });
        }
        Ok(())
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, IndexInner> {
        self.inner.read().expect("offset index lock poisoned")
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().expect("offset index lock poisoned")
    }
}

fn round_down_to_entry(size: usize) -> usize {
    size / INDEX_ENTRY_BYTES * INDEX_ENTRY_BYTES
}

fn relative_offset_at(buf: &[u8], slot: usize) -> u32 {
    let at = slot * INDEX_ENTRY_BYTES;
    u32::from_be_bytes(buf[at..at + 4].try_into().expect("entry is 8 bytes"))
}

fn position_at(buf: &[u8], slot: usize) -> u32 {
    let at = slot * INDEX_ENTRY_BYTES;
    u32::from_be_bytes(buf[at + 4..at + 8].try_into().expect("entry is 8 bytes"))
}

fn entry_at(buf: &[u8], base_offset: i64, slot: usize) -> IndexEntry {
    IndexEntry {
        offset: base_offset + i64::from(relative_offset_at(buf, slot)),
        position: position_at(buf, slot),
    }
}

/// The greatest slot whose offset is `<= target`, or `None` when every entry
/// is above the target (or the index is empty).
fn slot_of_last_leq(buf: &[u8], entries: usize, base_offset: i64, target: i64) -> Option<usize> {
    if entries == 0 {
        return None;
    }
    let relative = target - base_offset;
    if relative < 0 || i64::from(relative_offset_at(buf, 0)) > relative {
        return None;
    }
    let target_relative = u64::try_from(relative).expect("non-negative checked above");

    let mut lo = 0;
    let mut hi = entries - 1;
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if u64::from(relative_offset_at(buf, mid)) <= target_relative {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Some(lo)
}

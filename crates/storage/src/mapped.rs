//! A resizable memory-mapped file region.
//!
//! Resizing a file while it is mapped is not portable: some platforms refuse
//! the length change outright. `resize` therefore always drops the mapping
//! before changing the file length and remaps afterwards; callers serialize
//! readers against `resize` with their own lock.
#![allow(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap::MmapMut;

use crate::StorageError;

#[derive(Debug)]
pub struct MappedRegion {
    file: File,
    path: PathBuf,
    map: Option<MmapMut>,
}

impl MappedRegion {
    /// Open (or create) `path` and map it at exactly `len` bytes.
    ///
    /// A zero-length region stays unmapped and reads as empty.
    pub fn open(path: &Path, len: u64) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|err| StorageError::io("open", path, err))?;
        let current = file
            .metadata()
            .map_err(|err| StorageError::io("metadata", path, err))?
            .len();
        if current != len {
            file.set_len(len)
                .map_err(|err| StorageError::io("set_len", path, err))?;
        }

        let map = Self::map(&file, path, len)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            map,
        })
    }

    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |map| map.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Some(map) => &map[..],
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.map {
            Some(map) => &mut map[..],
            None => &mut [],
        }
    }

    /// Change the file length to `new_len`, remapping the region.
    pub fn resize(&mut self, new_len: u64) -> Result<(), StorageError> {
        // Force-unmap before the length change; required on platforms that
        // refuse to resize a mapped file.
        self.map = None;
        self.file
            .set_len(new_len)
            .map_err(|err| StorageError::io("set_len", &self.path, err))?;
        self.map = Self::map(&self.file, &self.path, new_len)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        if let Some(map) = &self.map {
            map.flush()
                .map_err(|err| StorageError::io("msync", &self.path, err))?;
        }
        self.file
            .sync_data()
            .map_err(|err| StorageError::io("sync_data", &self.path, err))
    }

    pub fn rename_to(&mut self, new_path: &Path) -> Result<(), StorageError> {
        fs::rename(&self.path, new_path)
            .map_err(|err| StorageError::io("rename", &self.path, err))?;
        self.path = new_path.to_path_buf();
        Ok(())
    }

    pub fn delete(mut self) -> Result<(), StorageError> {
        self.map = None;
        fs::remove_file(&self.path).map_err(|err| StorageError::io("remove_file", &self.path, err))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn map(file: &File, path: &Path, len: u64) -> Result<Option<MmapMut>, StorageError> {
        if len == 0 {
            return Ok(None);
        }
        // SAFETY: the region is only reachable through this type; all callers
        // serialize mutation and resize behind a lock, and the file is not
        // truncated externally while mapped.
        let map = unsafe { MmapMut::map_mut(file) }
            .map_err(|err| StorageError::io("mmap", path, err))?;
        Ok(Some(map))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path(label: &str) -> PathBuf {
        let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be after unix epoch")
            .as_millis();
        std::env::temp_dir().join(format!(
            "kiln-mapped-{label}-{millis}-{}-{counter}",
            std::process::id()
        ))
    }

    #[test]
    fn write_resize_and_reopen() {
        let path = temp_path("write-resize-reopen");
        {
            let mut region = MappedRegion::open(&path, 16).expect("open");
            region.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
            region.resize(8).expect("shrink");
            assert_eq!(region.len(), 8);
            assert_eq!(&region.as_slice()[..4], &[1, 2, 3, 4]);
            region.flush().expect("flush");
        }

        let region = MappedRegion::open(&path, 8).expect("reopen");
        assert_eq!(&region.as_slice()[..4], &[1, 2, 3, 4]);
        region.delete().expect("delete");
        assert!(!path.exists());
    }

    #[test]
    fn zero_length_region_reads_as_empty() {
        let path = temp_path("zero-length");
        let mut region = MappedRegion::open(&path, 0).expect("open");
        assert!(region.is_empty());
        assert!(region.as_slice().is_empty());

        region.resize(8).expect("grow");
        assert_eq!(region.len(), 8);
        region.delete().expect("delete");
    }
}

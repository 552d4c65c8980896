use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use kiln_storage::TopicPartition;

use crate::CleanerError;

/// File name of the per-data-directory clean-offset checkpoint.
pub const CLEANER_CHECKPOINT_FILENAME: &str = "cleaner-offset-checkpoint";

const CHECKPOINT_VERSION: u32 = 0;

/// Persistent record of the first dirty offset per partition.
///
/// Format is plain text: a version line, a count line, then one
/// `topic partition offset` line per entry. Writes go through a temp file,
/// fsync, and rename, so a crash leaves either the old or the new content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFile {
    path: PathBuf,
}

impl CheckpointFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(CLEANER_CHECKPOINT_FILENAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all checkpointed offsets; a missing file reads as empty.
    pub fn read(&self) -> Result<BTreeMap<TopicPartition, i64>, CleanerError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new())
            }
            Err(err) => return Err(CleanerError::io("read_to_string", &self.path, err)),
        };

        let mut lines = content.lines();
        let version: u32 = lines
            .next()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| self.corrupt("missing version line"))?;
        if version != CHECKPOINT_VERSION {
            return Err(self.corrupt(&format!("unsupported version {version}")));
        }
        let expected: usize = lines
            .next()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| self.corrupt("missing entry count line"))?;

        let mut entries = BTreeMap::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(topic), Some(partition), Some(offset), None) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                return Err(self.corrupt(&format!("malformed entry line {line:?}")));
            };
            let partition: i32 = partition
                .parse()
                .map_err(|_| self.corrupt(&format!("bad partition in line {line:?}")))?;
            let offset: i64 = offset
                .parse()
                .map_err(|_| self.corrupt(&format!("bad offset in line {line:?}")))?;
            entries.insert(TopicPartition::new(topic, partition), offset);
        }

        if entries.len() != expected {
            return Err(self.corrupt(&format!(
                "entry count mismatch, header says {expected}, found {}",
                entries.len()
            )));
        }
        Ok(entries)
    }

    /// Atomically replace the file with the given entries.
    pub fn write(&self, entries: &BTreeMap<TopicPartition, i64>) -> Result<(), CleanerError> {
        let file_name = self
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| self.corrupt("checkpoint path has no utf-8 file name"))?;
        let tmp_path = self.path.with_file_name(format!("{file_name}.tmp"));

        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|err| CleanerError::io("open", &tmp_path, err))?;

        let mut content = format!("{CHECKPOINT_VERSION}\n{}\n", entries.len());
        for (tp, offset) in entries {
            content.push_str(&format!("{} {} {offset}\n", tp.topic, tp.partition));
        }
        tmp.write_all(content.as_bytes())
            .map_err(|err| CleanerError::io("write_all", &tmp_path, err))?;
        tmp.sync_data()
            .map_err(|err| CleanerError::io("sync_data", &tmp_path, err))?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path).map_err(|err| CleanerError::io("rename", &tmp_path, err))
    }

    fn corrupt(&self, message: &str) -> CleanerError {
        CleanerError::CorruptCheckpoint {
            path: self.path.clone(),
            message: message.to_string(),
        }
    }
}

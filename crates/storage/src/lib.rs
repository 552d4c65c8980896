#![deny(unsafe_code)]

use std::path::{Path, PathBuf};

mod log;
mod mapped;
mod offset_index;
mod record;
mod segment;

pub use log::{Log, LogConfig, LogOffsetMetadata};
pub use mapped::MappedRegion;
pub use offset_index::{IndexEntry, OffsetIndex, INDEX_ENTRY_BYTES};
pub use record::{
    compress_records, decode_record_frame, decompress_records, encode_record_frame, frame_size,
    Compression, Record, FRAME_HEADER_BYTES, MAX_FRAME_BYTES, RECORD_HEADER_BYTES,
};
pub use segment::{
    index_filename, log_filename, LogSegment, SegmentConfig, SegmentReader, SegmentView,
    CLEANED_FILE_SUFFIX, INDEX_FILE_SUFFIX, LOG_FILE_SUFFIX, SWAP_FILE_SUFFIX,
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    Io {
        operation: &'static str,
        path: PathBuf,
        message: String,
    },
    InvalidConfiguration {
        message: String,
    },
    InvalidRecord {
        message: String,
    },
    /// An append regressed below the last written offset.
    InvalidOffset {
        appended: i64,
        last_offset: i64,
    },
    /// The offset index cannot take further entries.
    IndexFull {
        path: PathBuf,
        entries: usize,
    },
    CorruptIndex {
        path: PathBuf,
        message: String,
    },
    CorruptData {
        path: PathBuf,
        position: u64,
        message: String,
    },
    OffsetOutOfRange {
        requested: i64,
        earliest: i64,
        latest: i64,
    },
}

impl StorageError {
    pub(crate) fn io(operation: &'static str, path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    /// Attach a file location to a bare codec error.
    pub(crate) fn with_location(self, path: &Path, position: u64) -> Self {
        match self {
            Self::InvalidRecord { message } => Self::CorruptData {
                path: path.to_path_buf(),
                position,
                message,
            },
            other => other,
        }
    }
}

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;

use crate::StorageError;

pub const FRAME_HEADER_BYTES: usize = 8;
pub const RECORD_HEADER_BYTES: usize = 25;
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

const NULL_LENGTH: i32 = -1;
const COMPRESSION_CODEC_MASK: u8 = 0x07;

/// Compression codec carried in the record attributes byte.
///
/// A record with a codec other than `None` is a *wrapper*: its value holds a
/// compressed concatenation of inner record frames whose offsets are relative
/// to the first inner record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn attributes(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
        }
    }

    pub fn from_attributes(attributes: u8) -> Result<Self, StorageError> {
        match attributes & COMPRESSION_CODEC_MASK {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            other => Err(StorageError::InvalidRecord {
                message: format!("unknown compression codec {other}"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    pub timestamp_ms: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub compression: Compression,
}

impl Record {
    pub fn new(
        offset: i64,
        timestamp_ms: i64,
        key: Option<Vec<u8>>,
        value: Option<Vec<u8>>,
    ) -> Self {
        Self {
            offset,
            timestamp_ms,
            key,
            value,
            compression: Compression::None,
        }
    }

    /// A record with no value deletes its key during compaction.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_compressed(&self) -> bool {
        self.compression != Compression::None
    }

    pub fn key_len(&self) -> usize {
        self.key.as_ref().map_or(0, Vec::len)
    }

    pub fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, Vec::len)
    }

    /// Total on-disk size of this record's frame, header included.
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_BYTES + RECORD_HEADER_BYTES + self.key_len() + self.value_len()
    }
}

/// On-disk frame size for a record with the given key and value lengths.
pub fn frame_size(key_len: usize, value_len: usize) -> usize {
    FRAME_HEADER_BYTES + RECORD_HEADER_BYTES + key_len + value_len
}

/// Encode one record as `[frame_len:u32][checksum:u32][payload]` where the
/// payload is `[offset:i64][timestamp:i64][attributes:u8][key_len:i32]
/// [value_len:i32][key][value]`, all big-endian. A length of -1 encodes an
/// absent key or value.
pub fn encode_record_frame(record: &Record) -> Result<Vec<u8>, StorageError> {
    let payload_len = RECORD_HEADER_BYTES
        .checked_add(record.key_len())
        .and_then(|len| len.checked_add(record.value_len()))
        .ok_or_else(|| StorageError::InvalidRecord {
            message: "record payload length overflow".to_string(),
        })?;

    if payload_len > MAX_FRAME_BYTES {
        return Err(StorageError::InvalidRecord {
            message: format!("record payload length {payload_len} exceeds max {MAX_FRAME_BYTES}"),
        });
    }

    let key_len: i32 = match &record.key {
        Some(key) => key.len().try_into().map_err(|_| StorageError::InvalidRecord {
            message: "key length exceeds i32::MAX".to_string(),
        })?,
        None => NULL_LENGTH,
    };
    let value_len: i32 = match &record.value {
        Some(value) => value
            .len()
            .try_into()
            .map_err(|_| StorageError::InvalidRecord {
                message: "value length exceeds i32::MAX".to_string(),
            })?,
        None => NULL_LENGTH,
    };

    let mut payload = Vec::with_capacity(payload_len);
    payload.extend_from_slice(&record.offset.to_be_bytes());
    payload.extend_from_slice(&record.timestamp_ms.to_be_bytes());
    payload.push(record.compression.attributes());
    payload.extend_from_slice(&key_len.to_be_bytes());
    payload.extend_from_slice(&value_len.to_be_bytes());
    if let Some(key) = &record.key {
        payload.extend_from_slice(key);
    }
    if let Some(value) = &record.value {
        payload.extend_from_slice(value);
    }

    let checksum = checksum32(&payload);

    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + payload.len());
    frame.extend_from_slice(&u32::try_from(payload_len).expect("payload_len checked above").to_be_bytes());
    frame.extend_from_slice(&checksum.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode the first frame in `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold one complete frame (the
/// caller should read more bytes), `Ok(Some((record, frame_len)))` on
/// success, and an error on structural corruption.
pub fn decode_record_frame(buf: &[u8]) -> Result<Option<(Record, usize)>, StorageError> {
    if buf.len() < FRAME_HEADER_BYTES {
        return Ok(None);
    }

    let payload_len = u32::from_be_bytes(
        buf[..4].try_into().expect("frame_len header is exactly 4 bytes"),
    ) as usize;
    let expected_checksum = u32::from_be_bytes(
        buf[4..8]
            .try_into()
            .expect("checksum header is exactly 4 bytes"),
    );

    if !(RECORD_HEADER_BYTES..=MAX_FRAME_BYTES).contains(&payload_len) {
        return Err(StorageError::InvalidRecord {
            message: format!("invalid frame length {payload_len}"),
        });
    }
    if buf.len() < FRAME_HEADER_BYTES + payload_len {
        return Ok(None);
    }

    let payload = &buf[FRAME_HEADER_BYTES..FRAME_HEADER_BYTES + payload_len];
    if checksum32(payload) != expected_checksum {
        return Err(StorageError::InvalidRecord {
            message: "checksum mismatch".to_string(),
        });
    }

    let record = decode_payload(payload)?;
    Ok(Some((record, FRAME_HEADER_BYTES + payload_len)))
}

fn decode_payload(payload: &[u8]) -> Result<Record, StorageError> {
    let offset = i64::from_be_bytes(
        payload[0..8]
            .try_into()
            .expect("offset bytes are exactly 8 bytes"),
    );
    let timestamp_ms = i64::from_be_bytes(
        payload[8..16]
            .try_into()
            .expect("timestamp bytes are exactly 8 bytes"),
    );
    let compression = Compression::from_attributes(payload[16])?;
    let key_len = i32::from_be_bytes(
        payload[17..21]
            .try_into()
            .expect("key length bytes are exactly 4 bytes"),
    );
    let value_len = i32::from_be_bytes(
        payload[21..25]
            .try_into()
            .expect("value length bytes are exactly 4 bytes"),
    );

    let key_bytes = if key_len == NULL_LENGTH {
        0
    } else {
        usize::try_from(key_len).map_err(|_| StorageError::InvalidRecord {
            message: format!("negative key length {key_len}"),
        })?
    };
    let value_bytes = if value_len == NULL_LENGTH {
        0
    } else {
        usize::try_from(value_len).map_err(|_| StorageError::InvalidRecord {
            message: format!("negative value length {value_len}"),
        })?
    };

    let expected = RECORD_HEADER_BYTES
        .checked_add(key_bytes)
        .and_then(|len| len.checked_add(value_bytes))
        .ok_or_else(|| StorageError::InvalidRecord {
            message: "payload length overflow".to_string(),
        })?;
    if payload.len() != expected {
        return Err(StorageError::InvalidRecord {
            message: format!(
                "payload length mismatch, expected {expected}, got {}",
                payload.len()
            ),
        });
    }

    let key_start = RECORD_HEADER_BYTES;
    let value_start = key_start + key_bytes;
    let key = (key_len != NULL_LENGTH).then(|| payload[key_start..value_start].to_vec());
    let value = (value_len != NULL_LENGTH).then(|| payload[value_start..].to_vec());

    Ok(Record {
        offset,
        timestamp_ms,
        key,
        value,
        compression,
    })
}

/// Build a wrapper record holding the given records compressed with `codec`.
///
/// Inner offsets are stored relative to the first record; the wrapper itself
/// carries the absolute offset of the *last* inner record, so consumers can
/// reconstruct absolute offsets even when the set has gaps.
pub fn compress_records(records: &[Record], codec: Compression) -> Result<Record, StorageError> {
    if codec == Compression::None {
        return Err(StorageError::InvalidRecord {
            message: "cannot build a wrapper with the null codec".to_string(),
        });
    }
    let (first, last) = match (records.first(), records.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            return Err(StorageError::InvalidRecord {
                message: "cannot build a wrapper around zero records".to_string(),
            })
        }
    };

    let base_offset = first.offset;
    let mut inner = Vec::new();
    let mut max_timestamp_ms = i64::MIN;
    for record in records {
        if record.is_compressed() {
            return Err(StorageError::InvalidRecord {
                message: "wrapper records cannot nest".to_string(),
            });
        }
        let relative = Record {
            offset: record.offset - base_offset,
            ..record.clone()
        };
        inner.extend_from_slice(&encode_record_frame(&relative)?);
        max_timestamp_ms = max_timestamp_ms.max(record.timestamp_ms);
    }

    let compressed = match codec {
        Compression::Gzip => gzip_compress(&inner)?,
        Compression::None => unreachable!("rejected above"),
    };

    Ok(Record {
        offset: last.offset,
        timestamp_ms: max_timestamp_ms,
        key: None,
        value: Some(compressed),
        compression: codec,
    })
}

/// Expand a wrapper record back into its inner records with absolute offsets.
pub fn decompress_records(wrapper: &Record) -> Result<Vec<Record>, StorageError> {
    if !wrapper.is_compressed() {
        return Err(StorageError::InvalidRecord {
            message: "record is not a wrapper".to_string(),
        });
    }
    let value = wrapper.value.as_ref().ok_or_else(|| StorageError::InvalidRecord {
        message: "wrapper record has no value".to_string(),
    })?;

    let raw = match wrapper.compression {
        Compression::Gzip => gzip_decompress(value)?,
        Compression::None => unreachable!("rejected above"),
    };

    let mut records = Vec::new();
    let mut position = 0;
    while position < raw.len() {
        match decode_record_frame(&raw[position..])? {
            Some((record, consumed)) => {
                if record.is_compressed() {
                    return Err(StorageError::InvalidRecord {
                        message: "nested wrapper inside a wrapper".to_string(),
                    });
                }
                records.push(record);
                position += consumed;
            }
            None => {
                return Err(StorageError::InvalidRecord {
                    message: "truncated inner record in wrapper".to_string(),
                })
            }
        }
    }

    let last_relative = records
        .last()
        .ok_or_else(|| StorageError::InvalidRecord {
            message: "wrapper holds zero inner records".to_string(),
        })?
        .offset;
    let base_offset = wrapper.offset - last_relative;
    for record in &mut records {
        record.offset += base_offset;
    }
    Ok(records)
}

fn gzip_compress(bytes: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
    encoder
        .write_all(bytes)
        .and_then(|()| encoder.finish())
        .map_err(|err| StorageError::InvalidRecord {
            message: format!("gzip compression failed: {err}"),
        })
}

fn gzip_decompress(bytes: &[u8]) -> Result<Vec<u8>, StorageError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| StorageError::InvalidRecord {
            message: format!("gzip decompression failed: {err}"),
        })?;
    Ok(out)
}

pub(crate) fn checksum32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811C_9DC5;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
